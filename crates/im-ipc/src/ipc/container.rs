//! Typed method groups.
//!
//! An [`IpcContainer`] names a family of related methods under one namespace
//! and hands out [`TypedIpcCall`]s that take care of (de)serializing request
//! and response bodies on both ends of the socket.

use super::client::IpcClient;
use super::handler::{HandlerError, IpcHandler};
use super::protocol::{IpcUser, JsonRpcRequest};
use crate::error::{IpcError, Result, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Namespace for a group of IPC methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcContainer {
    namespace: String,
}

impl IpcContainer {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn browse<Req, Resp>(&self) -> TypedIpcCall<Req, Resp> {
        self.update("browse")
    }

    pub fn create<Req, Resp>(&self) -> TypedIpcCall<Req, Resp> {
        self.update("create")
    }

    pub fn retrieve<Req, Resp>(&self) -> TypedIpcCall<Req, Resp> {
        self.update("retrieve")
    }

    pub fn delete<Req, Resp>(&self) -> TypedIpcCall<Req, Resp> {
        self.update("delete")
    }

    /// A call named `<namespace>.<name>`.
    pub fn update<Req, Resp>(&self, name: &str) -> TypedIpcCall<Req, Resp> {
        TypedIpcCall::new(format!("{}.{}", self.namespace, name))
    }
}

/// A method with typed request and response bodies.
pub struct TypedIpcCall<Req, Resp> {
    method: String,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> std::fmt::Debug for TypedIpcCall<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedIpcCall")
            .field("method", &self.method)
            .finish()
    }
}

impl<Req, Resp> Clone for TypedIpcCall<Req, Resp> {
    fn clone(&self) -> Self {
        Self::new(self.method.clone())
    }
}

impl<Req, Resp> TypedIpcCall<Req, Resp> {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            _types: PhantomData,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl<Req, Resp> TypedIpcCall<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    /// Build a handler that decodes `Req`, runs `f` and encodes its `Resp`.
    ///
    /// Params that do not decode are answered with a bad-request error.
    pub fn handler<F, Fut>(&self, f: F) -> IpcHandler
    where
        F: Fn(IpcUser, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        IpcHandler::new(self.method.clone(), move |user, request: JsonRpcRequest| {
            let f = f.clone();
            async move {
                let body: Req = serde_json::from_value(request.params).map_err(|e| {
                    RpcError::bad_request(format!("Invalid params for {}: {}", request.method, e))
                })?;
                let response = f(user, body).await?;
                serde_json::to_value(response).map_err(|e| HandlerError::Unexpected(e.into()))
            }
        })
    }
}

impl<Req, Resp> TypedIpcCall<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    /// Send `request` through `client` and decode the reply.
    pub async fn call<C>(&self, client: &C, request: &Req) -> Result<Resp>
    where
        C: IpcClient + ?Sized,
    {
        let params = serde_json::to_value(request)?;
        let result = client.call(&self.method, params).await?;
        serde_json::from_value(result).map_err(IpcError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcSettings;
    use crate::ipc::client::EmbeddedIpcClient;
    use crate::ipc::server::IpcServer;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct CreateJob {
        name: String,
        replicas: u32,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct JobCreated {
        id: String,
        owner: u32,
    }

    #[test]
    fn test_method_names() {
        let jobs = IpcContainer::new("jobs");
        assert_eq!(jobs.browse::<(), ()>().method(), "jobs.browse");
        assert_eq!(jobs.create::<(), ()>().method(), "jobs.create");
        assert_eq!(jobs.retrieve::<(), ()>().method(), "jobs.retrieve");
        assert_eq!(jobs.delete::<(), ()>().method(), "jobs.delete");
        assert_eq!(jobs.update::<(), ()>("suspend").method(), "jobs.suspend");
    }

    fn server_with_create() -> Arc<IpcServer> {
        let server = Arc::new(IpcServer::new(IpcSettings::default()));
        let create = IpcContainer::new("jobs").create::<CreateJob, JobCreated>();
        server
            .add_handler(create.handler(|user, req| async move {
                if req.replicas == 0 {
                    return Err(RpcError::bad_request("replicas must be positive").into());
                }
                Ok(JobCreated {
                    id: format!("{}-{}", req.name, req.replicas),
                    owner: user.uid,
                })
            }))
            .unwrap();
        server
    }

    #[tokio::test]
    async fn test_typed_call_roundtrip() {
        let client = EmbeddedIpcClient::new(server_with_create());
        let create = IpcContainer::new("jobs").create::<CreateJob, JobCreated>();

        let created = create
            .call(
                &client,
                &CreateJob {
                    name: "build".into(),
                    replicas: 3,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            created,
            JobCreated {
                id: "build-3".into(),
                owner: IpcUser::current_process().uid,
            }
        );
    }

    #[tokio::test]
    async fn test_undecodable_params_are_bad_request() {
        let client = EmbeddedIpcClient::new(server_with_create());

        match client.call("jobs.create", json!({"name": 5})).await {
            Err(IpcError::Rpc(err)) => assert_eq!(err.code, RpcError::BAD_REQUEST),
            other => panic!("Expected bad request, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_rpc_errors_reach_caller() {
        let client = EmbeddedIpcClient::new(server_with_create());
        let create = IpcContainer::new("jobs").create::<CreateJob, JobCreated>();

        let result = create
            .call(
                &client,
                &CreateJob {
                    name: "idle".into(),
                    replicas: 0,
                },
            )
            .await;
        match result {
            Err(IpcError::Rpc(err)) => {
                assert_eq!(err, RpcError::bad_request("replicas must be positive"))
            }
            other => panic!("Expected bad request, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_response_is_json_error() {
        let server = Arc::new(IpcServer::new(IpcSettings::default()));
        server
            .add_handler(IpcHandler::new("jobs.retrieve", |_, _| async {
                Ok(json!({"unexpected": true}))
            }))
            .unwrap();
        let client = EmbeddedIpcClient::new(server);
        let retrieve = IpcContainer::new("jobs").retrieve::<(), JobCreated>();

        let result = retrieve.call(&client, &()).await;
        assert!(matches!(result, Err(IpcError::Json { .. })));
    }
}
