//! Handler registration and dispatch.
//!
//! Handlers are collected into an append-only list while the server is being
//! configured, then frozen into a [`HandlerRegistry`] that connection tasks
//! share through an `Arc` and read without locking.

use super::protocol::{IpcUser, JsonRpcRequest, JsonRpcResponse};
use crate::error::{IpcError, RpcError};
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Error returned by a handler.
///
/// `Rpc` errors reach the peer verbatim. Anything else is logged and
/// replaced by a generic internal error.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Rpc(RpcError),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        HandlerError::Rpc(err)
    }
}

impl From<IpcError> for HandlerError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Rpc(rpc) => HandlerError::Rpc(rpc),
            other => HandlerError::Unexpected(other.into()),
        }
    }
}

impl HandlerError {
    /// Convert into the error object sent to the peer.
    pub fn into_rpc_error(self, method: &str) -> RpcError {
        match self {
            HandlerError::Rpc(err) => err,
            HandlerError::Unexpected(err) => {
                error!("IPC handler for {} failed: {:#}", method, err);
                RpcError::internal()
            }
        }
    }
}

pub type HandlerResult = std::result::Result<Value, HandlerError>;

type HandlerFn = dyn Fn(IpcUser, JsonRpcRequest) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A method handler.
#[derive(Clone)]
pub struct IpcHandler {
    method: String,
    method_is_prefix: bool,
    handler: Arc<HandlerFn>,
}

impl std::fmt::Debug for IpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcHandler")
            .field("method", &self.method)
            .field("method_is_prefix", &self.method_is_prefix)
            .finish_non_exhaustive()
    }
}

impl IpcHandler {
    /// Handle requests whose method equals `method`.
    pub fn new<F, Fut>(method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(IpcUser, JsonRpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::build(method.into(), false, handler)
    }

    /// Handle requests whose method starts with `method`.
    pub fn prefix<F, Fut>(method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(IpcUser, JsonRpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::build(method.into(), true, handler)
    }

    fn build<F, Fut>(method: String, method_is_prefix: bool, handler: F) -> Self
    where
        F: Fn(IpcUser, JsonRpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            method,
            method_is_prefix,
            handler: Arc::new(
                move |user: IpcUser, request: JsonRpcRequest| -> BoxFuture<'static, HandlerResult> {
                    Box::pin(handler(user, request))
                },
            ),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn method_is_prefix(&self) -> bool {
        self.method_is_prefix
    }

    pub fn matches(&self, method: &str) -> bool {
        if self.method_is_prefix {
            method.starts_with(&self.method)
        } else {
            method == self.method
        }
    }

    pub async fn invoke(&self, user: IpcUser, request: JsonRpcRequest) -> HandlerResult {
        (self.handler)(user, request).await
    }
}

/// Frozen, ordered set of handlers.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: Vec<IpcHandler>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<IpcHandler>) -> Self {
        Self { handlers }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// First handler, in registration order, that matches `method`.
    pub fn find(&self, method: &str) -> Option<&IpcHandler> {
        self.handlers.iter().find(|h| h.matches(method))
    }

    /// Run the matching handler and build the response for `request`.
    ///
    /// Callers filter out notifications first; a response is always built.
    pub async fn dispatch(&self, user: &IpcUser, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        let Some(handler) = self.find(&request.method) else {
            debug!("No IPC handler for {}", request.method);
            return JsonRpcResponse::error(
                id,
                RpcError::not_found(format!("Unknown method: {}", request.method)),
            );
        };

        let method = request.method.clone();
        match handler.invoke(*user, request).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(err) => JsonRpcResponse::error(id, err.into_rpc_error(&method)),
        }
    }
}
