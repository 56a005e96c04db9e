//! # Transport
//! A transport moves [`JsonRpcMessage`]s between peers. Each side registers
//! exactly one [`MessageHandler`]; whatever the handler returns is the reply
//! for that inbound message, if any.
//!
//! | transport | feature | side |
//! |:-:|:-:|:-:|
//! | [`StreamableHttpServerTransport`](streamable_http_server::StreamableHttpServerTransport) | `transport-streamable-http-server` | server |
//! | [`StreamableHttpClientTransport`](streamable_http_client::StreamableHttpClientTransport) | `transport-streamable-http-client` | client |
use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;

use crate::model::JsonRpcMessage;

#[cfg(feature = "transport-streamable-http-server")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-server")))]
pub mod streamable_http_server;
#[cfg(feature = "transport-streamable-http-server")]
pub use streamable_http_server::{
    OriginPolicy, StreamableHttpServerConfig, StreamableHttpServerTransport,
};

#[cfg(feature = "transport-streamable-http-client")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-client")))]
pub mod streamable_http_client;
#[cfg(feature = "transport-streamable-http-client")]
pub use streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-ID";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
pub const JSON_MIME_TYPE: &str = "application/json";

/// The single callback a transport invokes for every inbound message.
pub type MessageHandler =
    Arc<dyn Fn(JsonRpcMessage) -> BoxFuture<'static, Option<JsonRpcMessage>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(JsonRpcMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<JsonRpcMessage>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,
    #[error("Transport closed")]
    Closed,
    #[error("Invalid url: {0}")]
    InvalidUrl(String),
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Request timeout after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("Unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
    #[error("Deserialize error: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[cfg(feature = "transport-streamable-http-client")]
    #[error("Client error: {0}")]
    Client(#[from] reqwest::Error),
    #[cfg(feature = "transport-streamable-http-client")]
    #[error("SSE error: {0}")]
    Sse(#[from] sse_stream::Error),
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Make the transport ready to carry messages.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Deliver a message to the peer.
    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError>;

    /// Register the inbound message handler, replacing any earlier one.
    fn on_message(&self, handler: MessageHandler);

    async fn close(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// The session this transport is bound to, for transports that have one.
    fn session_id(&self) -> Option<String> {
        None
    }
}
