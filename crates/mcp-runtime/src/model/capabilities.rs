use serde::{Deserialize, Serialize};

use super::JsonObject;

/// Tools advertised by a server. `available` mirrors the tool registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
    #[serde(default)]
    pub available: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
    #[serde(default)]
    pub available: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
    #[serde(default)]
    pub available: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// ```rust
/// # use mcp_runtime::model::ServerCapabilities;
/// let cap = ServerCapabilities::builder()
///     .enable_logging()
///     .enable_tools()
///     .build();
/// assert!(cap.tools.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
}

impl ServerCapabilities {
    pub fn builder() -> ServerCapabilitiesBuilder {
        ServerCapabilitiesBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerCapabilitiesBuilder {
    inner: ServerCapabilities,
}

impl ServerCapabilitiesBuilder {
    pub fn enable_experimental(mut self, experimental: JsonObject) -> Self {
        self.inner.experimental = Some(experimental);
        self
    }
    pub fn enable_logging(mut self) -> Self {
        self.inner.logging = Some(JsonObject::new());
        self
    }
    pub fn enable_completions(mut self) -> Self {
        self.inner.completions = Some(JsonObject::new());
        self
    }
    pub fn enable_tasks(mut self, tasks: JsonObject) -> Self {
        self.inner.tasks = Some(tasks);
        self
    }
    pub fn enable_tools(mut self) -> Self {
        self.inner.tools = Some(ToolsCapability {
            supported: Some(true),
            ..Default::default()
        });
        self
    }
    pub fn enable_tool_list_changed(mut self) -> Self {
        self.inner.tools.get_or_insert_with(Default::default).list_changed = Some(true);
        self
    }
    pub fn enable_prompts(mut self) -> Self {
        self.inner.prompts = Some(PromptsCapability::default());
        self
    }
    pub fn enable_resources(mut self) -> Self {
        self.inner.resources = Some(ResourcesCapability::default());
        self
    }
    pub fn build(self) -> ServerCapabilities {
        self.inner
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<JsonObject>,
}
