use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use futures::{FutureExt, future::BoxFuture};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    BoxError,
    handler::server::{PromptRegistry, ResourceRegistry, ResourceRequest, ToolRegistry, Validator},
    model::{
        CallToolRequestParam, CallToolResult, ErrorData, GetPromptRequestParam, GetPromptResult,
        Implementation, InitializeRequestParam, InitializeResult, JsonRpcMessage,
        JsonRpcNotification, JsonRpcRequest, ListPromptsResult, ListResourceTemplatesResult,
        ListResourcesResult, ListToolsResult, PaginatedRequestParam, Prompt, PromptMessage,
        PromptsCapability, ProtocolVersion, ReadResourceRequestParam, ReadResourceResult,
        Resource, ResourceTemplate, ResourcesCapability, ServerCapabilities, Tool,
        ToolsCapability, method,
    },
    transport::{Transport, message_handler},
};

#[derive(Debug, Clone)]
pub struct McpServerOptions {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
    /// Configured capabilities. The `available` lists of tools, prompts and
    /// resources are always overwritten from the registries.
    pub capabilities: ServerCapabilities,
    /// Supported protocol versions, newest first.
    pub protocol_versions: Vec<ProtocolVersion>,
}

impl Default for McpServerOptions {
    fn default() -> Self {
        Self {
            name: "MCP Server".into(),
            version: "1.0.0".into(),
            instructions: None,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            protocol_versions: ProtocolVersion::KNOWN_VERSIONS.to_vec(),
        }
    }
}

impl McpServerOptions {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_protocol_versions(mut self, versions: Vec<ProtocolVersion>) -> Self {
        self.protocol_versions = versions;
        self
    }
}

#[derive(Debug, Default)]
struct ServerState {
    tools: ToolRegistry,
    prompts: PromptRegistry,
    resources: ResourceRegistry,
    capabilities: ServerCapabilities,
    protocol_version: Option<ProtocolVersion>,
    client_info: Option<Implementation>,
    client_initialized: bool,
}

impl ServerState {
    fn refresh_capabilities(&mut self, configured: &ServerCapabilities) {
        let mut capabilities = configured.clone();
        match capabilities.tools.as_mut() {
            Some(tools) => tools.available = self.tools.names(),
            None if !self.tools.is_empty() => {
                capabilities.tools = Some(ToolsCapability {
                    supported: Some(true),
                    available: self.tools.names(),
                    ..Default::default()
                })
            }
            None => {}
        }
        match capabilities.prompts.as_mut() {
            Some(prompts) => prompts.available = self.prompts.names(),
            None if !self.prompts.is_empty() => {
                capabilities.prompts = Some(PromptsCapability {
                    available: self.prompts.names(),
                    ..Default::default()
                })
            }
            None => {}
        }
        match capabilities.resources.as_mut() {
            Some(resources) => resources.available = self.resources.names(),
            None if !self.resources.is_empty() => {
                capabilities.resources = Some(ResourcesCapability {
                    available: self.resources.names(),
                    ..Default::default()
                })
            }
            None => {}
        }
        self.capabilities = capabilities;
    }
}

struct ServerInner {
    info: Implementation,
    instructions: Option<String>,
    configured_capabilities: ServerCapabilities,
    protocol_versions: Vec<ProtocolVersion>,
    state: RwLock<ServerState>,
}

/// The server side dispatcher.
///
/// Owns the tool, prompt and resource registries, answers the built-in
/// methods and routes everything else to registered handlers. Cloning is
/// cheap and clones share state.
///
/// ```rust
/// # use mcp_runtime::{McpServer, McpServerOptions, BoxError};
/// # use mcp_runtime::handler::server::AnyObjectValidator;
/// # use mcp_runtime::model::{CallToolResult, Content, Tool};
/// let server = McpServer::new(McpServerOptions::new("demo", "0.1.0"));
/// server.add_tool(Tool::new("hello"), AnyObjectValidator::default(), |_| async {
///     Ok::<_, BoxError>(CallToolResult::success(vec![Content::text("hello")]))
/// });
/// assert_eq!(server.capabilities().tools.unwrap().available, vec!["hello"]);
/// ```
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("info", &self.inner.info)
            .field("protocol_versions", &self.inner.protocol_versions)
            .finish()
    }
}

impl Default for McpServer {
    fn default() -> Self {
        Self::new(McpServerOptions::default())
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Internal error".to_owned()
    }
}

/// Await a handler, turning both errors and panics into a message.
async fn run_handler<T>(future: BoxFuture<'static, Result<T, BoxError>>) -> Result<T, String> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(error.to_string()),
        Err(panic) => Err(panic_message(panic)),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>, what: &str) -> Result<T, ErrorData> {
    let params = params.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(params).map_err(|e| {
        ErrorData::invalid_params(
            format!("Invalid {what} params"),
            Some(json!({"reason": e.to_string()})),
        )
    })
}

fn to_result<T: Serialize>(result: T) -> Result<Value, ErrorData> {
    serde_json::to_value(result).map_err(|e| {
        ErrorData::internal_error(
            "fail to serialize result",
            Some(json!({"reason": e.to_string()})),
        )
    })
}

impl McpServer {
    pub fn new(options: McpServerOptions) -> Self {
        let mut state = ServerState::default();
        state.refresh_capabilities(&options.capabilities);
        let protocol_versions = if options.protocol_versions.is_empty() {
            vec![ProtocolVersion::LATEST]
        } else {
            options.protocol_versions
        };
        Self {
            inner: Arc::new(ServerInner {
                info: Implementation::new(options.name, options.version),
                instructions: options.instructions,
                configured_capabilities: options.capabilities,
                protocol_versions,
                state: RwLock::new(state),
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ServerState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ServerState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the registries, then recompute the advertised capabilities.
    fn mutate<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        let mut state = self.write_state();
        let result = f(&mut state);
        state.refresh_capabilities(&self.inner.configured_capabilities);
        result
    }

    pub fn info(&self) -> &Implementation {
        &self.inner.info
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.read_state().capabilities.clone()
    }

    pub fn supported_protocol_versions(&self) -> &[ProtocolVersion] {
        &self.inner.protocol_versions
    }

    /// The version agreed during `initialize`, if it has happened.
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.read_state().protocol_version.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.read_state().protocol_version.is_some()
    }

    /// Whether the client has confirmed the handshake with `notifications/initialized`.
    pub fn is_client_initialized(&self) -> bool {
        self.read_state().client_initialized
    }

    pub fn client_info(&self) -> Option<Implementation> {
        self.read_state().client_info.clone()
    }

    pub fn add_tool<V, F, Fut, E>(&self, tool: Tool, validator: V, handler: F)
    where
        V: Validator,
        F: Fn(V::Output) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        debug!(tool = %tool.name, "registering tool");
        self.mutate(|state| state.tools.add(tool, validator, handler));
    }

    pub fn remove_tool(&self, name: &str) -> bool {
        self.mutate(|state| state.tools.remove(name))
    }

    pub fn get_tool(&self, name: &str) -> Option<Tool> {
        self.read_state().tools.get(name).cloned()
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        self.read_state().tools.list()
    }

    pub fn add_prompt<V, F, Fut, E>(&self, prompt: Prompt, validator: V, generator: F)
    where
        V: Validator,
        F: Fn(V::Output) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<PromptMessage>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        debug!(prompt = %prompt.name, "registering prompt");
        self.mutate(|state| state.prompts.add(prompt, validator, generator));
    }

    pub fn remove_prompt(&self, name: &str) -> bool {
        self.mutate(|state| state.prompts.remove(name))
    }

    pub fn get_prompt(&self, name: &str) -> Option<Prompt> {
        self.read_state().prompts.get(name).cloned()
    }

    pub fn list_prompts(&self) -> Vec<Prompt> {
        self.read_state().prompts.list()
    }

    pub fn add_resource<F, Fut, E>(&self, resource: Resource, reader: F)
    where
        F: Fn(ResourceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReadResourceResult, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        debug!(resource = %resource.uri, "registering resource");
        self.mutate(|state| state.resources.add_resource(resource, reader));
    }

    pub fn add_resource_template<F, Fut, E>(
        &self,
        template: ResourceTemplate,
        reader: F,
    ) -> Result<(), regex::Error>
    where
        F: Fn(ResourceRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReadResourceResult, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        debug!(template = %template.uri_template, "registering resource template");
        self.mutate(|state| state.resources.add_template(template, reader))
    }

    /// Remove a resource or resource template by name.
    pub fn remove_resource(&self, name: &str) -> bool {
        self.mutate(|state| state.resources.remove(name))
    }

    pub fn get_resource(&self, name: &str) -> Option<Resource> {
        self.read_state().resources.get_resource(name).cloned()
    }

    pub fn get_resource_template(&self, name: &str) -> Option<ResourceTemplate> {
        self.read_state().resources.get_template(name).cloned()
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.read_state().resources.list_resources()
    }

    pub fn list_resource_templates(&self) -> Vec<ResourceTemplate> {
        self.read_state().resources.list_templates()
    }

    /// Pick the version to speak: the client's if supported, else our newest.
    pub fn negotiate_protocol_version(&self, proposed: &ProtocolVersion) -> ProtocolVersion {
        if self.inner.protocol_versions.contains(proposed) {
            proposed.clone()
        } else {
            let fallback = self
                .inner
                .protocol_versions
                .first()
                .cloned()
                .unwrap_or(ProtocolVersion::LATEST);
            warn!(%proposed, %fallback, "unsupported protocol version requested, falling back");
            fallback
        }
    }

    /// Answer one request. Never fails: every error, including a panicking
    /// handler, becomes an error response carrying the request id.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcMessage {
        let id = request.id.clone();
        debug!(%id, method = %request.method, "handling request");
        match AssertUnwindSafe(self.dispatch(request)).catch_unwind().await {
            Ok(Ok(result)) => JsonRpcMessage::response(id, result),
            Ok(Err(error)) => {
                debug!(%id, %error, "request failed");
                JsonRpcMessage::error(Some(id), error)
            }
            Err(panic) => {
                let message = panic_message(panic);
                warn!(%id, %message, "request handler panicked");
                JsonRpcMessage::error(Some(id), ErrorData::internal_error(message, None))
            }
        }
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> Result<Value, ErrorData> {
        let JsonRpcRequest { method, params, .. } = request;
        match method.as_str() {
            method::PING => Ok(json!({})),
            method::INITIALIZE => to_result(self.initialize(params)?),
            method::TOOLS_LIST => {
                parse_params::<PaginatedRequestParam>(params, "pagination")?;
                to_result(ListToolsResult {
                    tools: self.list_tools(),
                    next_cursor: None,
                })
            }
            method::TOOLS_CALL => to_result(self.call_tool(params).await?),
            method::PROMPTS_LIST => {
                parse_params::<PaginatedRequestParam>(params, "pagination")?;
                to_result(ListPromptsResult {
                    prompts: self.list_prompts(),
                    next_cursor: None,
                })
            }
            method::PROMPTS_GET => to_result(self.get_prompt_result(params).await?),
            method::RESOURCES_LIST => {
                parse_params::<PaginatedRequestParam>(params, "pagination")?;
                to_result(ListResourcesResult {
                    resources: self.list_resources(),
                    next_cursor: None,
                })
            }
            method::RESOURCES_TEMPLATES_LIST => {
                parse_params::<PaginatedRequestParam>(params, "pagination")?;
                to_result(ListResourceTemplatesResult {
                    resource_templates: self.list_resource_templates(),
                    next_cursor: None,
                })
            }
            method::RESOURCES_READ => to_result(self.read_resource(params).await?),
            other => Err(ErrorData::method_not_found(other)),
        }
    }

    fn initialize(&self, params: Option<Value>) -> Result<InitializeResult, ErrorData> {
        let param: InitializeRequestParam = parse_params(params, "initialize")?;
        let protocol_version = self.negotiate_protocol_version(&param.protocol_version);
        info!(
            client = %param.client_info.name,
            client_version = %param.client_info.version,
            requested = %param.protocol_version,
            negotiated = %protocol_version,
            "initialize"
        );
        let capabilities = {
            let mut state = self.write_state();
            state.protocol_version = Some(protocol_version.clone());
            state.client_info = Some(param.client_info);
            state.capabilities.clone()
        };
        Ok(InitializeResult {
            protocol_version,
            capabilities,
            server_info: self.inner.info.clone(),
            instructions: self.inner.instructions.clone(),
        })
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<CallToolResult, ErrorData> {
        let param: CallToolRequestParam = parse_params(params, "tools/call")?;
        let route = self.read_state().tools.route(&param.name).cloned();
        let Some(route) = route else {
            return Err(ErrorData::invalid_params(
                format!("Tool \"{}\" not found", param.name),
                None,
            ));
        };
        let arguments = Value::Object(param.arguments.unwrap_or_default());
        let call = route.call(&arguments).map_err(|e| {
            ErrorData::invalid_params(
                format!("Invalid arguments for tool \"{}\": {}", param.name, e.message),
                e.detail,
            )
        })?;
        run_handler(call).await.map_err(|message| {
            warn!(tool = %param.name, %message, "tool handler failed");
            ErrorData::internal_error(message, None)
        })
    }

    async fn get_prompt_result(&self, params: Option<Value>) -> Result<GetPromptResult, ErrorData> {
        let param: GetPromptRequestParam = parse_params(params, "prompts/get")?;
        let route = self.read_state().prompts.route(&param.name).cloned();
        let Some(route) = route else {
            return Err(ErrorData::invalid_params(
                format!("Prompt \"{}\" not found", param.name),
                None,
            ));
        };
        let arguments = Value::Object(param.arguments.unwrap_or_default());
        let get = route.get(&arguments).map_err(|e| {
            ErrorData::invalid_params(
                format!("Invalid arguments for prompt \"{}\": {}", param.name, e.message),
                e.detail,
            )
        })?;
        let messages = run_handler(get).await.map_err(|message| {
            warn!(prompt = %param.name, %message, "prompt generator failed");
            ErrorData::internal_error(message, None)
        })?;
        Ok(GetPromptResult {
            description: route.attr.description.clone(),
            messages,
        })
    }

    async fn read_resource(&self, params: Option<Value>) -> Result<ReadResourceResult, ErrorData> {
        let ReadResourceRequestParam { uri } = parse_params(params, "resources/read")?;
        let read = self.read_state().resources.resolve(&uri);
        let Some(read) = read else {
            return Err(ErrorData::resource_not_found(
                format!("Resource {uri} not found"),
                Some(json!({"uri": uri})),
            ));
        };
        run_handler(read).await.map_err(|message| {
            warn!(%uri, %message, "resource reader failed");
            ErrorData::resource_not_found(message, Some(json!({"uri": uri})))
        })
    }

    /// Notifications never produce a response.
    pub async fn handle_notification(&self, notification: JsonRpcNotification) {
        info!(method = %notification.method, "received notification");
        if notification.method == method::INITIALIZED {
            self.write_state().client_initialized = true;
        }
    }

    /// The transport-facing entry point: requests yield a response,
    /// everything else yields nothing.
    pub async fn handle_message(&self, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
        match message {
            JsonRpcMessage::Request(request) => Some(self.handle_request(request).await),
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification).await;
                None
            }
            JsonRpcMessage::Response(response) => {
                debug!(id = %response.id, "ignoring response sent to server");
                None
            }
            JsonRpcMessage::Error(error) => {
                debug!(id = ?error.id, error = %error.error, "ignoring error sent to server");
                None
            }
        }
    }

    /// Install this server as `transport`'s message handler.
    ///
    /// Responses are returned to the transport, which delivers each one
    /// exactly once: inline as JSON or on the stream that carried the request.
    pub fn with_transport<T>(&self, transport: Arc<T>) -> &Self
    where
        T: Transport + ?Sized,
    {
        let server = self.clone();
        transport.on_message(message_handler(move |message| {
            let server = server.clone();
            async move { server.handle_message(message).await }
        }));
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::{
        handler::server::{AnyObjectValidator, FnValidator, ValidationError},
        model::{
            Content, ErrorCode, PromptArgument, PromptMessageRole, RequestId, ResourceContents,
        },
    };

    fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
        match JsonRpcMessage::request(id, method, Some(params)) {
            JsonRpcMessage::Request(request) => request,
            _ => unreachable!(),
        }
    }

    fn expect_result(message: JsonRpcMessage) -> Value {
        match message {
            JsonRpcMessage::Response(response) => response.result,
            other => panic!("expected response, got {other:?}"),
        }
    }

    fn expect_error(message: JsonRpcMessage) -> ErrorData {
        match message {
            JsonRpcMessage::Error(error) => error.error,
            other => panic!("expected error, got {other:?}"),
        }
    }

    fn initialize_params(version: &str) -> Value {
        json!({
            "protocolVersion": version,
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "1.0.0"}
        })
    }

    fn add_validator() -> impl Validator<Output = (f64, f64)> {
        FnValidator::new(
            json!({
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }),
            |raw: &Value| {
                let a = raw.get("a").and_then(Value::as_f64);
                let b = raw.get("b").and_then(Value::as_f64);
                match (a, b) {
                    (Some(a), Some(b)) => Ok((a, b)),
                    _ => Err(ValidationError::new("a and b must be numbers")
                        .with_detail(json!({"required": ["a", "b"]}))),
                }
            },
        )
    }

    fn calculator() -> (McpServer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = McpServer::new(McpServerOptions::new("calculator", "1.0.0"));
        server.add_tool(
            Tool::new("add").with_description("Add two numbers"),
            add_validator(),
            move |(a, b)| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(CallToolResult::success(vec![Content::text(
                        (a + b).to_string(),
                    )]))
                }
            },
        );
        (server, calls)
    }

    #[tokio::test]
    async fn test_initialize_echoes_supported_version() {
        let (server, _) = calculator();
        assert!(!server.is_initialized());
        for version in ["2025-06-18", "2025-03-26", "2024-11-05", "2025-11-25"] {
            let result = expect_result(
                server
                    .handle_request(request(1, "initialize", initialize_params(version)))
                    .await,
            );
            assert_eq!(result["protocolVersion"], version);
            assert_eq!(result["serverInfo"]["name"], "calculator");
            assert_eq!(result["capabilities"]["tools"]["available"], json!(["add"]));
        }
        assert!(server.is_initialized());
        assert_eq!(server.client_info().unwrap().name, "test-client");
    }

    #[tokio::test]
    async fn test_initialize_falls_back_to_latest() {
        let (server, _) = calculator();
        let result = expect_result(
            server
                .handle_request(request(1, "initialize", initialize_params("1999-01-01")))
                .await,
        );
        assert_eq!(result["protocolVersion"], ProtocolVersion::LATEST.as_str());
        assert_eq!(server.protocol_version(), Some(ProtocolVersion::LATEST));
    }

    #[tokio::test]
    async fn test_initialize_without_version_is_invalid_params() {
        let (server, _) = calculator();
        let error = expect_error(
            server
                .handle_request(request(
                    1,
                    "initialize",
                    json!({"capabilities": {}, "clientInfo": {"name": "c", "version": "1"}}),
                ))
                .await,
        );
        assert_eq!(error.code, ErrorCode::INVALID_PARAMS);
        assert!(!server.is_initialized());
    }

    #[tokio::test]
    async fn test_instructions_are_optional() {
        let server = McpServer::new(McpServerOptions::default().with_instructions("be nice"));
        let result = expect_result(
            server
                .handle_request(request(1, "initialize", initialize_params("2025-06-18")))
                .await,
        );
        assert_eq!(result["instructions"], "be nice");
        assert_eq!(result["serverInfo"], json!({"name": "MCP Server", "version": "1.0.0"}));

        let (server, _) = calculator();
        let result = expect_result(
            server
                .handle_request(request(1, "initialize", initialize_params("2025-06-18")))
                .await,
        );
        assert!(result.get("instructions").is_none());
    }

    #[tokio::test]
    async fn test_ping_before_initialize() {
        let server = McpServer::default();
        let message = server.handle_request(request(9, "ping", json!({}))).await;
        assert_eq!(
            message,
            JsonRpcMessage::response(RequestId::Number(9), json!({}))
        );
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let server = McpServer::default();
        let error = expect_error(server.handle_request(request(1, "bogus/method", json!({}))).await);
        assert_eq!(error.code, ErrorCode::METHOD_NOT_FOUND);
        assert!(error.message.contains("bogus/method"));
    }

    #[tokio::test]
    async fn test_tools_list_round_trip() {
        let (server, _) = calculator();
        let result = expect_result(server.handle_request(request(1, "tools/list", json!({}))).await);
        let tools = result["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "add");
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["a", "b"]));
        assert!(result.get("nextCursor").is_none());

        assert!(server.remove_tool("add"));
        let result = expect_result(
            server
                .handle_request(request(2, "tools/list", json!({"cursor": "ignored"})))
                .await,
        );
        assert_eq!(result["tools"], json!([]));
        assert_eq!(server.capabilities().tools.unwrap().available, Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_tools_call() {
        let (server, calls) = calculator();
        let result = expect_result(
            server
                .handle_request(request(
                    1,
                    "tools/call",
                    json!({"name": "add", "arguments": {"a": 5, "b": 3}}),
                ))
                .await,
        );
        assert_eq!(
            result,
            json!({"content": [{"type": "text", "text": "8"}], "isError": false})
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tools_call_invalid_arguments_skip_handler() {
        let (server, calls) = calculator();
        let error = expect_error(
            server
                .handle_request(request(
                    1,
                    "tools/call",
                    json!({"name": "add", "arguments": {"a": "five"}}),
                ))
                .await,
        );
        assert_eq!(error.code, ErrorCode::INVALID_PARAMS);
        assert!(error.message.contains("Invalid arguments for tool \"add\""));
        assert_eq!(error.data, Some(json!({"required": ["a", "b"]})));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[cfg(feature = "jsonschema")]
    #[tokio::test]
    async fn test_tools_call_checked_against_json_schema() {
        use crate::handler::server::JsonSchemaValidator;

        let server = McpServer::default();
        let validator = JsonSchemaValidator::new(json!({
            "type": "object",
            "properties": {"text": {"type": "string", "minLength": 1}},
            "required": ["text"]
        }))
        .unwrap();
        server.add_tool(Tool::new("shout"), validator, |args: Value| async move {
            let text = args["text"].as_str().unwrap_or_default().to_uppercase();
            Ok::<_, BoxError>(CallToolResult::success(vec![Content::text(text)]))
        });
        assert_eq!(
            server.get_tool("shout").unwrap().input_schema["required"],
            json!(["text"])
        );

        let result = expect_result(
            server
                .handle_request(request(
                    1,
                    "tools/call",
                    json!({"name": "shout", "arguments": {"text": "hi"}}),
                ))
                .await,
        );
        assert_eq!(result["content"][0]["text"], "HI");

        let error = expect_error(
            server
                .handle_request(request(
                    2,
                    "tools/call",
                    json!({"name": "shout", "arguments": {"text": ""}}),
                ))
                .await,
        );
        assert_eq!(error.code, ErrorCode::INVALID_PARAMS);
        assert!(error.data.unwrap()["errors"].is_array());
    }

    #[tokio::test]
    async fn test_tools_call_unknown_tool() {
        let (server, calls) = calculator();
        let error = expect_error(
            server
                .handle_request(request(1, "tools/call", json!({"name": "subtract"})))
                .await,
        );
        assert_eq!(error.code, ErrorCode::INVALID_PARAMS);
        assert_eq!(error.message, "Tool \"subtract\" not found");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let error = expect_error(server.handle_request(request(2, "tools/call", json!({}))).await);
        assert_eq!(error.code, ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_tool_failures_become_internal_errors() {
        let server = McpServer::default();
        server.add_tool(Tool::new("fail"), AnyObjectValidator::default(), |_| async {
            Err::<CallToolResult, _>("disk on fire")
        });
        server.add_tool(Tool::new("panic"), AnyObjectValidator::default(), |_| async {
            if true {
                panic!("handler exploded");
            }
            Ok::<_, BoxError>(CallToolResult::success(vec![]))
        });

        let error = expect_error(
            server
                .handle_request(request(1, "tools/call", json!({"name": "fail"})))
                .await,
        );
        assert_eq!(error.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(error.message, "disk on fire");

        let error = expect_error(
            server
                .handle_request(request(2, "tools/call", json!({"name": "panic"})))
                .await,
        );
        assert_eq!(error.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(error.message, "handler exploded");
    }

    fn with_greeting(server: &McpServer) {
        server.add_prompt(
            Prompt::new(
                "greeting",
                Some("A friendly greeting"),
                Some(vec![PromptArgument::new("name").required(true)]),
            ),
            FnValidator::new(json!({"type": "object"}), |raw: &Value| {
                raw.get("name")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| ValidationError::new("name is required"))
            }),
            |name| async move {
                Ok::<_, BoxError>(vec![PromptMessage::new_text(
                    PromptMessageRole::User,
                    format!("Hello, {name}!"),
                )])
            },
        );
    }

    #[tokio::test]
    async fn test_prompts() {
        let server = McpServer::default();
        assert!(server.capabilities().prompts.is_none());
        with_greeting(&server);
        assert_eq!(
            server.capabilities().prompts.unwrap().available,
            vec!["greeting"]
        );

        let result = expect_result(server.handle_request(request(1, "prompts/list", json!({}))).await);
        assert_eq!(result["prompts"][0]["name"], "greeting");

        let result = expect_result(
            server
                .handle_request(request(
                    2,
                    "prompts/get",
                    json!({"name": "greeting", "arguments": {"name": "Ada"}}),
                ))
                .await,
        );
        assert_eq!(result["description"], "A friendly greeting");
        assert_eq!(result["messages"][0]["content"]["text"], "Hello, Ada!");

        let error = expect_error(
            server
                .handle_request(request(3, "prompts/get", json!({"name": "greeting"})))
                .await,
        );
        assert_eq!(error.code, ErrorCode::INVALID_PARAMS);
        assert!(error.message.contains("Invalid arguments"));

        let error = expect_error(
            server
                .handle_request(request(4, "prompts/get", json!({"name": "non-existent"})))
                .await,
        );
        assert_eq!(error.code, ErrorCode::INVALID_PARAMS);
        assert!(error.message.contains("Prompt \"non-existent\" not found"));

        assert!(server.remove_prompt("greeting"));
        assert!(server.capabilities().prompts.is_none());
    }

    fn with_files(server: &McpServer) {
        server.add_resource(
            Resource::new("test://static", "test").with_mime_type("text/plain"),
            |request: ResourceRequest| async move {
                Ok::<_, BoxError>(ReadResourceResult {
                    contents: vec![ResourceContents::text("static", request.uri)],
                })
            },
        );
        server
            .add_resource_template(
                ResourceTemplate::new("file:///example/{filename}", "files"),
                |request: ResourceRequest| async move {
                    if request.variables["filename"] == "broken.txt" {
                        return Err::<ReadResourceResult, BoxError>("permission denied".into());
                    }
                    Ok(ReadResourceResult {
                        contents: vec![ResourceContents::text(
                            format!("contents of {}", request.variables["filename"]),
                            request.uri,
                        )],
                    })
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_resources() {
        let server = McpServer::default();
        with_files(&server);

        let result =
            expect_result(server.handle_request(request(1, "resources/list", json!({}))).await);
        assert_eq!(result["resources"].as_array().unwrap().len(), 1);
        assert_eq!(result["resources"][0]["uri"], "test://static");

        let result = expect_result(
            server
                .handle_request(request(2, "resources/templates/list", json!({})))
                .await,
        );
        assert_eq!(
            result["resourceTemplates"][0]["uriTemplate"],
            "file:///example/{filename}"
        );

        let result = expect_result(
            server
                .handle_request(request(
                    3,
                    "resources/read",
                    json!({"uri": "file:///example/test.txt"}),
                ))
                .await,
        );
        assert_eq!(result["contents"][0]["uri"], "file:///example/test.txt");
        assert_eq!(result["contents"][0]["text"], "contents of test.txt");

        let error = expect_error(
            server
                .handle_request(request(4, "resources/read", json!({"uri": "file:///other/x"})))
                .await,
        );
        assert_eq!(error.code, ErrorCode::RESOURCE_NOT_FOUND);
        assert_eq!(error.data, Some(json!({"uri": "file:///other/x"})));

        let error = expect_error(
            server
                .handle_request(request(
                    5,
                    "resources/read",
                    json!({"uri": "file:///example/broken.txt"}),
                ))
                .await,
        );
        assert_eq!(error.code, ErrorCode::RESOURCE_NOT_FOUND);
        assert_eq!(error.message, "permission denied");

        assert_eq!(
            server.capabilities().resources.unwrap().available,
            vec!["test", "files"]
        );
    }

    #[tokio::test]
    async fn test_notifications_never_answer() {
        let server = McpServer::default();
        let reply = server
            .handle_message(JsonRpcMessage::notification("notifications/initialized", None))
            .await;
        assert!(reply.is_none());
        assert!(server.is_client_initialized());

        let reply = server
            .handle_message(JsonRpcMessage::response(RequestId::Number(1), json!({})))
            .await;
        assert!(reply.is_none());
    }
}
