use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        Weak,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::{
    model::{
        CallToolRequestParam, CallToolResult, ClientCapabilities, ErrorData, GetPromptRequestParam,
        GetPromptResult, Implementation, InitializeRequestParam, InitializeResult, JsonObject,
        JsonRpcMessage, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
        ListToolsResult, ProtocolVersion, ReadResourceRequestParam, ReadResourceResult, RequestId,
        ServerCapabilities, method,
    },
    transport::{Transport, TransportError, message_handler},
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Client not initialized. Call initialize() first.")]
    NotInitialized,
    #[error("No transport connected. Call connect() first.")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Server error: {0}")]
    Server(ErrorData),
    #[error("Request timeout after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("Client disconnected before the response arrived")]
    Disconnected,
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct McpClientOptions {
    pub name: String,
    pub version: String,
    pub capabilities: ClientCapabilities,
    /// Upper bound on one request, including the transport round trip.
    pub request_timeout: Duration,
}

impl Default for McpClientOptions {
    fn default() -> Self {
        Self {
            name: "MCP Client".into(),
            version: "0.0.0".into(),
            capabilities: ClientCapabilities::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl McpClientOptions {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

type Responder = oneshot::Sender<Result<Value, ClientError>>;

#[derive(Default)]
struct ClientState {
    transport: Option<Arc<dyn Transport>>,
    server: Option<InitializeResult>,
}

struct ClientInner {
    options: McpClientOptions,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, Responder>>,
    state: RwLock<ClientState>,
}

impl ClientInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<RequestId, Responder>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle the pending request an inbound response or error answers.
    fn resolve(&self, message: JsonRpcMessage) {
        let (id, outcome) = match message {
            JsonRpcMessage::Response(response) => (response.id, Ok(response.result)),
            JsonRpcMessage::Error(error) => match error.id {
                Some(id) => (id, Err(ClientError::Server(error.error))),
                None => {
                    warn!(error = %error.error, "received error response without id");
                    return;
                }
            },
            other => {
                debug!(kind = ?other.kind(), method = ?other.method(), "ignoring inbound message");
                return;
            }
        };
        match self.pending().remove(&id) {
            Some(responder) => {
                let _ = responder.send(outcome);
            }
            None => debug!(%id, "no pending request for response"),
        }
    }
}

/// The client side correlator.
///
/// Every request gets a fresh id from a counter starting at 0 and waits for
/// the response carrying the same id, in whatever order responses arrive.
/// Notifications also take an id from the counter, so ids seen by the server
/// may skip values.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("options", &self.inner.options)
            .field("connected", &self.is_connected())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new(McpClientOptions::default())
    }
}

impl McpClient {
    pub fn new(options: McpClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                options,
                next_id: AtomicI64::new(0),
                pending: Mutex::new(HashMap::new()),
                state: RwLock::new(ClientState::default()),
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ClientState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ClientState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, ClientError> {
        self.read_state()
            .transport
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.read_state().transport.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.read_state().server.is_some()
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.read_state()
            .server
            .as_ref()
            .map(|s| s.protocol_version.clone())
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.read_state()
            .server
            .as_ref()
            .map(|s| s.server_info.clone())
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.read_state()
            .server
            .as_ref()
            .map(|s| s.capabilities.clone())
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending().len()
    }

    /// Attach `transport` and route its inbound responses to pending requests.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<(), ClientError> {
        let inner: Weak<ClientInner> = Arc::downgrade(&self.inner);
        transport.on_message(message_handler(move |message| {
            if let Some(inner) = inner.upgrade() {
                inner.resolve(message);
            }
            futures::future::ready(None)
        }));
        transport.connect().await?;
        self.write_state().transport = Some(transport);
        Ok(())
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Send a request and wait for its response, bounded by the request timeout.
    ///
    /// The pending entry is always gone when this returns.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let transport = self.transport()?;
        let id = self.next_id();
        let (responder, response) = oneshot::channel();
        self.inner.pending().insert(id.clone(), responder);
        debug!(%id, %method, "sending request");

        let message = JsonRpcMessage::request(id.clone(), method, params);
        let exchange = async {
            let send = transport.send(message);
            tokio::pin!(send);
            tokio::pin!(response);
            let mut sent = false;
            loop {
                tokio::select! {
                    result = &mut send, if !sent => {
                        if let Err(error) = result {
                            return Err(ClientError::Transport(error));
                        }
                        sent = true;
                    }
                    outcome = &mut response => {
                        return outcome.unwrap_or(Err(ClientError::Disconnected));
                    }
                }
            }
        };
        let timeout = self.inner.options.request_timeout;
        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ClientError::Timeout(timeout)),
        };
        if outcome.is_err() {
            self.inner.pending().remove(&id);
        }
        outcome
    }

    async fn typed_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fire a notification. It still consumes an id from the counter.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let transport = self.transport()?;
        let _ = self.next_id();
        transport
            .send(JsonRpcMessage::notification(method, params))
            .await?;
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), ClientError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ClientError::NotInitialized)
        }
    }

    /// Perform the handshake, proposing `protocol_version` (the newest known
    /// version when `None`).
    pub async fn initialize(
        &self,
        protocol_version: Option<ProtocolVersion>,
    ) -> Result<InitializeResult, ClientError> {
        let options = &self.inner.options;
        let param = InitializeRequestParam {
            protocol_version: protocol_version.unwrap_or_default(),
            capabilities: options.capabilities.clone(),
            client_info: Implementation::new(options.name.clone(), options.version.clone()),
        };
        let result: InitializeResult = self
            .typed_request(method::INITIALIZE, Some(serde_json::to_value(&param)?))
            .await
            .inspect_err(|error| warn!(%error, "initialization failed"))?;
        info!(
            server = %result.server_info.name,
            server_version = %result.server_info.version,
            protocol_version = %result.protocol_version,
            "initialized"
        );
        self.write_state().server = Some(result.clone());
        if let Err(error) = self.notify(method::INITIALIZED, None).await {
            warn!(%error, "failed to send initialized notification");
        }
        Ok(result)
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.ensure_initialized()?;
        self.request(method::PING, None).await.map(|_| ())
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult, ClientError> {
        self.ensure_initialized()?;
        self.typed_request(method::TOOLS_LIST, None).await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, ClientError> {
        self.ensure_initialized()?;
        let param = CallToolRequestParam {
            name: name.to_owned().into(),
            arguments,
        };
        self.typed_request(method::TOOLS_CALL, Some(serde_json::to_value(param)?))
            .await
            .inspect_err(|error| warn!(tool = %name, %error, "tool call failed"))
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult, ClientError> {
        self.ensure_initialized()?;
        self.typed_request(method::PROMPTS_LIST, None).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<GetPromptResult, ClientError> {
        self.ensure_initialized()?;
        let param = GetPromptRequestParam {
            name: name.to_owned(),
            arguments,
        };
        self.typed_request(method::PROMPTS_GET, Some(serde_json::to_value(param)?))
            .await
    }

    pub async fn list_resources(&self) -> Result<ListResourcesResult, ClientError> {
        self.ensure_initialized()?;
        self.typed_request(method::RESOURCES_LIST, None).await
    }

    pub async fn list_resource_templates(
        &self,
    ) -> Result<ListResourceTemplatesResult, ClientError> {
        self.ensure_initialized()?;
        self.typed_request(method::RESOURCES_TEMPLATES_LIST, None)
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ClientError> {
        self.ensure_initialized()?;
        let param = ReadResourceRequestParam {
            uri: uri.to_owned(),
        };
        self.typed_request(method::RESOURCES_READ, Some(serde_json::to_value(param)?))
            .await
    }

    /// Close the transport and forget the session. Requests still waiting
    /// fail with [`ClientError::Disconnected`].
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let transport = {
            let mut state = self.write_state();
            state.server = None;
            state.transport.take()
        };
        let pending: Vec<Responder> = self.inner.pending().drain().map(|(_, r)| r).collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "rejecting pending requests on disconnect");
        }
        for responder in pending {
            let _ = responder.send(Err(ClientError::Disconnected));
        }
        if let Some(transport) = transport {
            transport.close().await?;
        }
        Ok(())
    }
}
