//! Forwarding of outer calls through the privileged server.
//!
//! User-mode workers hold no credentials for the outer RPC service. They send
//! the outer call to the server inside an `ipc_proxy.call` envelope instead,
//! and the server performs it with its own [`AuthenticatedClient`]. Only calls
//! on the compiled-in [`ALLOW_LIST`] are forwarded.

use super::client::IpcClient;
use super::handler::{HandlerError, HandlerResult, IpcHandler};
use super::server::IpcServer;
use crate::config::IpcConfig;
use crate::error::{IpcError, Result, RpcError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Client for the outer RPC service, already carrying credentials.
#[async_trait]
pub trait AuthenticatedClient: Send + Sync {
    async fn call(&self, name: &str, request: Value) -> std::result::Result<Value, RpcError>;
}

/// Params of an `ipc_proxy.call` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub call: String,
    pub request: Value,
}

/// An outer call that may be forwarded.
pub trait ProxyCall: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check `request` against the call's shape, perform it and check the reply.
    fn invoke<'a>(
        &'a self,
        client: &'a dyn AuthenticatedClient,
        request: Value,
    ) -> BoxFuture<'a, HandlerResult>;
}

/// A forwardable call with typed request and response bodies.
pub struct ProxiedCall<Req, Resp> {
    name: &'static str,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> ProxiedCall<Req, Resp> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _types: PhantomData,
        }
    }
}

impl<Req, Resp> ProxyCall for ProxiedCall<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + 'static,
    Resp: Serialize + DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn invoke<'a>(
        &'a self,
        client: &'a dyn AuthenticatedClient,
        request: Value,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let typed: Req = serde_json::from_value(request).map_err(|e| {
                RpcError::bad_request(format!("Invalid request for {}: {}", self.name, e))
            })?;
            let request = serde_json::to_value(typed).map_err(|e| HandlerError::Unexpected(e.into()))?;

            let reply = client.call(self.name, request).await?;

            let typed: Resp = serde_json::from_value(reply).map_err(|e| {
                HandlerError::Unexpected(anyhow::anyhow!(
                    "{} returned an unexpected response: {}",
                    self.name,
                    e
                ))
            })?;
            serde_json::to_value(typed).map_err(|e| HandlerError::Unexpected(e.into()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindByStringId {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkRequest<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkResponse<T> {
    pub responses: Vec<T>,
}

static JOBS_RETRIEVE: ProxiedCall<FindByStringId, Value> = ProxiedCall::new("jobs.control.retrieve");
static JOBS_UPDATE: ProxiedCall<BulkRequest<Value>, Value> = ProxiedCall::new("jobs.control.update");
static JOBS_CHARGE_CREDITS: ProxiedCall<BulkRequest<Value>, BulkResponse<Value>> =
    ProxiedCall::new("jobs.control.chargeCredits");
static FILE_COLLECTIONS_RETRIEVE: ProxiedCall<FindByStringId, Value> =
    ProxiedCall::new("files.collections.control.retrieve");
static PROJECTS_RETRIEVE: ProxiedCall<FindByStringId, Value> = ProxiedCall::new("projects.v2.retrieve");

/// Outer calls that user-mode workers may make through the server.
pub static ALLOW_LIST: &[&dyn ProxyCall] = &[
    &JOBS_RETRIEVE,
    &JOBS_UPDATE,
    &JOBS_CHARGE_CREDITS,
    &FILE_COLLECTIONS_RETRIEVE,
    &PROJECTS_RETRIEVE,
];

/// Server side of the proxy.
pub struct IpcProxyServer {
    client: Arc<dyn AuthenticatedClient>,
    allow_list: &'static [&'static dyn ProxyCall],
}

impl IpcProxyServer {
    pub fn new(client: Arc<dyn AuthenticatedClient>) -> Self {
        Self {
            client,
            allow_list: ALLOW_LIST,
        }
    }

    pub fn allows(&self, call: &str) -> bool {
        find_call(self.allow_list, call).is_some()
    }

    /// Answer `ipc_proxy.call` on `server`.
    pub fn register(&self, server: &IpcServer) -> Result<()> {
        let client = self.client.clone();
        let allow_list = self.allow_list;
        server.add_handler(IpcHandler::new(IpcConfig::PROXY_METHOD, move |user, request| {
            let client = client.clone();
            async move {
                let envelope: ProxyRequest = serde_json::from_value(request.params)
                    .map_err(|e| RpcError::bad_request(format!("Invalid proxy request: {}", e)))?;

                let Some(call) = find_call(allow_list, &envelope.call) else {
                    warn!(
                        "Refusing to proxy {} for uid {}: not on the allow-list",
                        envelope.call, user.uid
                    );
                    return Err(RpcError::internal().into());
                };

                debug!("Proxying {} for uid {}", envelope.call, user.uid);
                call.invoke(client.as_ref(), envelope.request).await
            }
        }))
    }
}

fn find_call(
    allow_list: &'static [&'static dyn ProxyCall],
    call: &str,
) -> Option<&'static dyn ProxyCall> {
    allow_list.iter().copied().find(|c| c.name() == call)
}

/// Client side of the proxy: outer calls sent over IPC.
pub struct IpcProxyClient {
    ipc: Arc<dyn IpcClient>,
}

impl IpcProxyClient {
    pub fn new(ipc: Arc<dyn IpcClient>) -> Self {
        Self { ipc }
    }
}

#[async_trait]
impl AuthenticatedClient for IpcProxyClient {
    async fn call(&self, name: &str, request: Value) -> std::result::Result<Value, RpcError> {
        let envelope = ProxyRequest {
            call: name.to_string(),
            request,
        };
        let params = serde_json::to_value(envelope).map_err(|e| {
            warn!("Could not encode proxy request for {}: {}", name, e);
            RpcError::internal()
        })?;

        match self.ipc.call(IpcConfig::PROXY_METHOD, params).await {
            Ok(result) => Ok(result),
            Err(IpcError::Rpc(err)) => Err(err),
            Err(e) => {
                warn!("Proxied call {} failed: {}", name, e);
                Err(RpcError::internal())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcSettings;
    use crate::ipc::client::EmbeddedIpcClient;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every outer call and answers from a closure.
    struct RecordingClient {
        calls: Mutex<Vec<(String, Value)>>,
        reply: Box<dyn Fn(&str, &Value) -> std::result::Result<Value, RpcError> + Send + Sync>,
    }

    impl RecordingClient {
        fn new(
            reply: impl Fn(&str, &Value) -> std::result::Result<Value, RpcError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Box::new(reply),
            })
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuthenticatedClient for RecordingClient {
        async fn call(&self, name: &str, request: Value) -> std::result::Result<Value, RpcError> {
            let reply = (self.reply)(name, &request);
            self.calls.lock().unwrap().push((name.to_string(), request));
            reply
        }
    }

    fn proxied(outer: Arc<RecordingClient>) -> EmbeddedIpcClient {
        let server = Arc::new(IpcServer::new(IpcSettings::default()));
        IpcProxyServer::new(outer).register(&server).unwrap();
        EmbeddedIpcClient::new(server)
    }

    #[test]
    fn test_allow_list_names_are_unique() {
        let mut names: Vec<_> = ALLOW_LIST.iter().map(|c| c.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALLOW_LIST.len());
    }

    #[tokio::test]
    async fn test_allowed_call_is_forwarded() {
        let outer = RecordingClient::new(|_, request| Ok(json!({"job": request["id"]})));
        let ipc = proxied(outer.clone());

        let result = ipc
            .call(
                "ipc_proxy.call",
                json!({"call": "jobs.control.retrieve", "request": {"id": "42"}}),
            )
            .await
            .unwrap();

        assert_eq!(result, json!({"job": "42"}));
        assert_eq!(
            outer.calls(),
            vec![("jobs.control.retrieve".to_string(), json!({"id": "42"}))]
        );
    }

    #[tokio::test]
    async fn test_unknown_call_is_refused_without_forwarding() {
        let outer = RecordingClient::new(|_, _| Ok(json!({})));
        let ipc = proxied(outer.clone());

        let result = ipc
            .call(
                "ipc_proxy.call",
                json!({"call": "users.delete", "request": {}}),
            )
            .await;

        match result {
            Err(IpcError::Rpc(err)) => assert_eq!(err.code, RpcError::INTERNAL_SERVER_ERROR),
            other => panic!("Expected internal error, got: {:?}", other),
        }
        assert!(outer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_bad_request() {
        let outer = RecordingClient::new(|_, _| Ok(json!({})));
        let ipc = proxied(outer.clone());

        match ipc.call("ipc_proxy.call", json!({"request": {}})).await {
            Err(IpcError::Rpc(err)) => assert_eq!(err.code, RpcError::BAD_REQUEST),
            other => panic!("Expected bad request, got: {:?}", other),
        }
        assert!(outer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_request_shape_is_checked_before_forwarding() {
        let outer = RecordingClient::new(|_, _| Ok(json!({})));
        let ipc = proxied(outer.clone());

        let result = ipc
            .call(
                "ipc_proxy.call",
                json!({"call": "jobs.control.retrieve", "request": {"name": "no id"}}),
            )
            .await;

        match result {
            Err(IpcError::Rpc(err)) => assert_eq!(err.code, RpcError::BAD_REQUEST),
            other => panic!("Expected bad request, got: {:?}", other),
        }
        assert!(outer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_outer_errors_propagate() {
        let outer = RecordingClient::new(|_, _| Err(RpcError::forbidden("project is locked")));
        let ipc = proxied(outer);

        let result = ipc
            .call(
                "ipc_proxy.call",
                json!({"call": "projects.v2.retrieve", "request": {"id": "p1"}}),
            )
            .await;

        match result {
            Err(IpcError::Rpc(err)) => assert_eq!(err, RpcError::forbidden("project is locked")),
            other => panic!("Expected forbidden, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_outer_reply_is_internal_error() {
        let outer = RecordingClient::new(|_, _| Ok(json!({"not": "a bulk response"})));
        let ipc = proxied(outer);

        let result = ipc
            .call(
                "ipc_proxy.call",
                json!({"call": "jobs.control.chargeCredits", "request": {"items": []}}),
            )
            .await;

        match result {
            Err(IpcError::Rpc(err)) => assert_eq!(err.code, RpcError::INTERNAL_SERVER_ERROR),
            other => panic!("Expected internal error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_proxy_client_roundtrip() {
        let outer = RecordingClient::new(|name, request| Ok(json!({"name": name, "echo": request})));
        let ipc: Arc<dyn IpcClient> = Arc::new(proxied(outer));
        let proxy = IpcProxyClient::new(ipc);

        let result = proxy
            .call("files.collections.control.retrieve", json!({"id": "c1"}))
            .await
            .unwrap();
        assert_eq!(
            result,
            json!({"name": "files.collections.control.retrieve", "echo": {"id": "c1"}})
        );

        let refused = proxy.call("users.delete", json!({})).await;
        assert_eq!(refused.unwrap_err().code, RpcError::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_allows() {
        let server = IpcProxyServer::new(RecordingClient::new(|_, _| Ok(json!({}))));
        assert!(server.allows("jobs.control.update"));
        assert!(!server.allows("jobs.control"));
    }

    #[tokio::test]
    async fn test_handler_refuses_exactly_what_allows_refuses() {
        let outer = RecordingClient::new(|_, _| Ok(json!({})));
        let server = IpcProxyServer::new(outer.clone());
        let ipc = proxied(outer.clone());

        for name in ["jobs.control", "jobs.control.update.extra", "JOBS.CONTROL.UPDATE"] {
            assert!(!server.allows(name));
            let result = ipc
                .call("ipc_proxy.call", json!({"call": name, "request": {}}))
                .await;
            match result {
                Err(IpcError::Rpc(err)) => assert_eq!(err.code, RpcError::INTERNAL_SERVER_ERROR),
                other => panic!("Expected {} to be refused, got: {:?}", name, other),
            }
        }
        assert!(outer.calls().is_empty());
    }
}
