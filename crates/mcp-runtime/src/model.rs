//! JSON-RPC envelope and the protocol payloads carried inside it.
use std::{borrow::Cow, fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize, de::Error as _};
use serde_json::Value;

mod capabilities;
mod content;
mod prompt;
mod resource;
mod tool;

pub use capabilities::*;
pub use content::*;
pub use prompt::*;
pub use resource::*;
pub use tool::*;

/// A JSON object, the shape of every params and result payload.
pub type JsonObject<F = Value> = serde_json::Map<String, F>;

/// Method names understood by the dispatcher.
pub mod method {
    pub const PING: &str = "ping";
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_READ: &str = "resources/read";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct JsonRpcVersion2_0;

impl JsonRpcVersion2_0 {
    pub const VALUE: &'static str = "2.0";
}

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version == Self::VALUE {
            Ok(JsonRpcVersion2_0)
        } else {
            Err(D::Error::custom(format!(
                "expect jsonrpc version \"2.0\", got {version:?}"
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NumberOrString {
    Number(i64),
    String(Arc<str>),
}

/// Identifier of a request, never null.
pub type RequestId = NumberOrString;

impl NumberOrString {
    pub fn into_json_value(self) -> Value {
        match self {
            NumberOrString::Number(n) => Value::Number(n.into()),
            NumberOrString::String(s) => Value::String(s.to_string()),
        }
    }

    /// Read an id from a raw JSON value, accepting only strings and integers.
    pub fn from_json_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(NumberOrString::String(s.as_str().into())),
            Value::Number(n) => n.as_i64().map(NumberOrString::Number),
            _ => None,
        }
    }
}

impl Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Number(n) => Display::fmt(n, f),
            NumberOrString::String(s) => Display::fmt(s, f),
        }
    }
}

impl From<i64> for NumberOrString {
    fn from(value: i64) -> Self {
        NumberOrString::Number(value)
    }
}

impl From<&str> for NumberOrString {
    fn from(value: &str) -> Self {
        NumberOrString::String(value.into())
    }
}

impl Serialize for NumberOrString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            NumberOrString::Number(n) => n.serialize(serializer),
            NumberOrString::String(s) => s.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for NumberOrString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value: Value = Deserialize::deserialize(deserializer)?;
        NumberOrString::from_json_value(&value).ok_or_else(|| {
            D::Error::custom(format!("request id must be a string or an integer, got {value}"))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const RESOURCE_NOT_FOUND: Self = Self(-32002);
    /// Implementation defined server error, used by the HTTP transport.
    pub const SERVER_ERROR: Self = Self(-32000);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    pub const PARSE_ERROR: Self = Self(-32700);
}

/// Error information for JSON-RPC error responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    /// The error type that occurred.
    pub code: ErrorCode,

    /// A short description of the error. The message SHOULD be limited to a concise single sentence.
    pub message: Cow<'static, str>,

    /// Additional information about the error. The value of this member is defined by the
    /// sender (e.g. detailed error information, nested errors etc.).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }
    pub fn resource_not_found(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::RESOURCE_NOT_FOUND, message, data)
    }
    pub fn parse_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, data)
    }
    pub fn invalid_request(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, data)
    }
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("Method \"{method}\" not found"),
            None,
        )
    }
    pub fn invalid_params(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, data)
    }
    pub fn internal_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, data)
    }
    pub fn server_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::SERVER_ERROR, message, data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

/// An error response. The id is `null` when the failure happened before the
/// request id could be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    #[serde(default)]
    pub id: Option<RequestId>,
    pub error: ErrorData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
    Error,
}

/// Structurally classify a decoded payload.
///
/// Returns `None` for anything that is not a well formed JSON-RPC 2.0
/// message; callers must treat that as a parse error.
pub fn classify(value: &Value) -> Option<MessageKind> {
    let object = value.as_object()?;
    if object.get("jsonrpc").and_then(Value::as_str) != Some(JsonRpcVersion2_0::VALUE) {
        return None;
    }
    let id = object.get("id");
    if let Some(method) = object.get("method") {
        method.as_str()?;
        return match id {
            None => Some(MessageKind::Notification),
            Some(id) => NumberOrString::from_json_value(id).map(|_| MessageKind::Request),
        };
    }
    if let Some(error) = object.get("error") {
        let error = error.as_object()?;
        let code_ok = error.get("code").is_some_and(|c| c.as_i64().is_some());
        let message_ok = error.get("message").is_some_and(Value::is_string);
        let id_ok = match id {
            None | Some(Value::Null) => true,
            Some(id) => NumberOrString::from_json_value(id).is_some(),
        };
        return (code_ok && message_ok && id_ok).then_some(MessageKind::Error);
    }
    if object.contains_key("result") {
        return id
            .and_then(NumberOrString::from_json_value)
            .map(|_| MessageKind::Response);
    }
    None
}

pub fn is_request(value: &Value) -> bool {
    classify(value) == Some(MessageKind::Request)
}

pub fn is_notification(value: &Value) -> bool {
    classify(value) == Some(MessageKind::Notification)
}

pub fn is_response(value: &Value) -> bool {
    classify(value) == Some(MessageKind::Response)
}

pub fn is_error_response(value: &Value) -> bool {
    classify(value) == Some(MessageKind::Error)
}

/// One JSON-RPC message, decoded once by its structural discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id: id.into(),
            method: method.into(),
            params,
        })
    }
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        })
    }
    pub fn response(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        })
    }
    pub fn error(id: Option<RequestId>, error: ErrorData) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            JsonRpcMessage::Request(_) => MessageKind::Request,
            JsonRpcMessage::Notification(_) => MessageKind::Notification,
            JsonRpcMessage::Response(_) => MessageKind::Response,
            JsonRpcMessage::Error(_) => MessageKind::Error,
        }
    }
    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }
    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Notification(_))
    }
    pub fn is_response(&self) -> bool {
        matches!(self, JsonRpcMessage::Response(_))
    }
    pub fn is_error_response(&self) -> bool {
        matches!(self, JsonRpcMessage::Error(_))
    }

    /// The id a response or error answers, if any.
    pub fn response_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Response(response) => Some(&response.id),
            JsonRpcMessage::Error(error) => error.id.as_ref(),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(request) => Some(&request.id),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(request) => Some(&request.method),
            JsonRpcMessage::Notification(notification) => Some(&notification.method),
            _ => None,
        }
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            JsonRpcMessage::Request(request) => request.serialize(serializer),
            JsonRpcMessage::Notification(notification) => notification.serialize(serializer),
            JsonRpcMessage::Response(response) => response.serialize(serializer),
            JsonRpcMessage::Error(error) => error.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        JsonRpcMessage::try_from(value).map_err(D::Error::custom)
    }
}

impl TryFrom<Value> for JsonRpcMessage {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, serde_json::Error> {
        let kind = classify(&value).ok_or_else(|| {
            serde_json::Error::custom("payload is not a valid JSON-RPC 2.0 message")
        })?;
        Ok(match kind {
            MessageKind::Request => JsonRpcMessage::Request(serde_json::from_value(value)?),
            MessageKind::Notification => {
                JsonRpcMessage::Notification(serde_json::from_value(value)?)
            }
            MessageKind::Response => JsonRpcMessage::Response(serde_json::from_value(value)?),
            MessageKind::Error => JsonRpcMessage::Error(serde_json::from_value(value)?),
        })
    }
}

/// A request body: either one message or a non-empty batch.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcPayload {
    Single(JsonRpcMessage),
    Batch(Vec<JsonRpcMessage>),
}

impl JsonRpcPayload {
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        match serde_json::from_slice::<Value>(body)? {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(serde_json::Error::custom("empty batch"));
                }
                items
                    .into_iter()
                    .map(JsonRpcMessage::try_from)
                    .collect::<Result<Vec<_>, _>>()
                    .map(JsonRpcPayload::Batch)
            }
            value => JsonRpcMessage::try_from(value).map(JsonRpcPayload::Single),
        }
    }

    pub fn into_messages(self) -> Vec<JsonRpcMessage> {
        match self {
            JsonRpcPayload::Single(message) => vec![message],
            JsonRpcPayload::Batch(messages) => messages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(Cow<'static, str>);

impl ProtocolVersion {
    pub const V_2025_11_25: Self = Self(Cow::Borrowed("2025-11-25"));
    pub const V_2025_06_18: Self = Self(Cow::Borrowed("2025-06-18"));
    pub const V_2025_03_26: Self = Self(Cow::Borrowed("2025-03-26"));
    pub const V_2024_11_05: Self = Self(Cow::Borrowed("2024-11-05"));
    pub const LATEST: Self = Self::V_2025_11_25;

    /// Every version this crate speaks, newest first.
    pub const KNOWN_VERSIONS: &'static [ProtocolVersion] = &[
        Self::V_2025_11_25,
        Self::V_2025_06_18,
        Self::V_2025_03_26,
        Self::V_2024_11_05,
    ];

    pub fn new(version: impl Into<Cow<'static, str>>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            title: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParam {
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: ProtocolVersion,
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedRequestParam {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}
