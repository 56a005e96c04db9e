//! Client side of the streamable HTTP transport.
//!
//! Every [`send`](Transport::send) is one `POST`. Whatever the server puts
//! in the response, a JSON body or an SSE stream, is decoded and handed to
//! the registered [`MessageHandler`] before `send` returns.
use std::{
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::StreamExt;
use http::{HeaderMap, HeaderValue, header};
use reqwest::Url;
use sse_stream::SseStream;
use tracing::{debug, warn};

use super::{
    EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID, JSON_MIME_TYPE, MessageHandler, Transport,
    TransportError,
};
use crate::model::{JsonRpcMessage, JsonRpcPayload};

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

#[derive(Debug, Clone)]
pub struct StreamableHttpClientTransportConfig {
    pub uri: Arc<str>,
    /// Upper bound on one `POST`, up to the response headers for SSE bodies
    /// and the full body for JSON ones.
    pub timeout: Duration,
    /// Sent with every request.
    pub headers: HeaderMap,
}

impl StreamableHttpClientTransportConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

    pub fn with_uri(uri: impl Into<Arc<str>>) -> Self {
        Self {
            uri: uri.into(),
            timeout: Self::DEFAULT_TIMEOUT,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

#[derive(Debug)]
pub struct StreamableHttpClientTransport {
    client: reqwest::Client,
    config: StreamableHttpClientTransportConfig,
    state: RwLock<ClientTransportState>,
    connected: AtomicBool,
}

#[derive(Default)]
struct ClientTransportState {
    url: Option<Url>,
    session_id: Option<String>,
    headers: HeaderMap,
    handler: Option<MessageHandler>,
}

impl std::fmt::Debug for ClientTransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransportState")
            .field("url", &self.url)
            .field("session_id", &self.session_id)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl StreamableHttpClientTransport {
    pub fn from_uri(uri: impl Into<Arc<str>>) -> Self {
        Self::new(StreamableHttpClientTransportConfig::with_uri(uri))
    }

    pub fn new(config: StreamableHttpClientTransportConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: StreamableHttpClientTransportConfig) -> Self {
        let state = ClientTransportState {
            headers: config.headers.clone(),
            ..Default::default()
        };
        Self {
            client,
            config,
            state: RwLock::new(state),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StreamableHttpClientTransportConfig {
        &self.config
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        self.write_state().session_id = session_id;
    }

    /// Replace the extra headers sent with every request.
    pub fn set_headers(&self, headers: HeaderMap) {
        self.write_state().headers = headers;
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ClientTransportState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ClientTransportState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_parts(&self) -> Result<(Url, HeaderMap, Option<String>), TransportError> {
        let state = self.read_state();
        let url = state.url.clone().ok_or(TransportError::NotConnected)?;
        Ok((url, state.headers.clone(), state.session_id.clone()))
    }

    fn capture_session_id(&self, headers: &HeaderMap) {
        let Some(id) = headers
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut state = self.write_state();
        if state.session_id.is_none() {
            debug!(session_id = id, "session established");
            state.session_id = Some(id.to_owned());
        }
    }

    async fn deliver(&self, message: JsonRpcMessage) {
        let handler = self.read_state().handler.clone();
        match handler {
            Some(handler) => {
                if let Some(reply) = handler(message).await {
                    debug!(kind = ?reply.kind(), "handler reply not forwarded");
                }
            }
            None => debug!("no handler registered, message dropped"),
        }
    }

    async fn post(&self, message: &JsonRpcMessage) -> Result<reqwest::Response, TransportError> {
        let (url, headers, session_id) = self.request_parts()?;
        let mut request = self
            .client
            .post(url)
            .headers(headers)
            .header(header::ACCEPT, ACCEPT_BOTH)
            .header(header::CONTENT_TYPE, JSON_MIME_TYPE)
            .body(serde_json::to_vec(message)?);
        if let Some(session_id) = session_id {
            request = request.header(HEADER_SESSION_ID, session_id);
        }
        let response = tokio::time::timeout(self.config.timeout, request.send())
            .await
            .map_err(|_| TransportError::Timeout(self.config.timeout))??;
        self.capture_session_id(response.headers());
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<(), TransportError> {
        let body = tokio::time::timeout(self.config.timeout, response.bytes())
            .await
            .map_err(|_| TransportError::Timeout(self.config.timeout))??;
        if body.is_empty() {
            return Ok(());
        }
        for message in JsonRpcPayload::from_slice(&body)?.into_messages() {
            self.deliver(message).await;
        }
        Ok(())
    }

    async fn read_sse(&self, response: reqwest::Response) -> Result<(), TransportError> {
        let mut events = SseStream::from_bytes_stream(response.bytes_stream()).boxed();
        while let Some(event) = events.next().await {
            let event = event?;
            if !matches!(event.event.as_deref(), None | Some("message")) {
                continue;
            }
            let Some(data) = event.data else {
                continue;
            };
            match serde_json::from_str::<JsonRpcMessage>(&data) {
                Ok(message) => self.deliver(message).await,
                Err(error) => warn!(%error, id = ?event.id, "skipping undecodable event"),
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for StreamableHttpClientTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let url = Url::parse(&self.config.uri)
            .map_err(|error| TransportError::InvalidUrl(format!("{}: {error}", self.config.uri)))?;
        self.write_state().url = Some(url);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let response = self.post(&message).await?;
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        match content_type.as_deref() {
            Some(ct) if ct.starts_with(EVENT_STREAM_MIME_TYPE) => self.read_sse(response).await,
            Some(ct) if ct.starts_with(JSON_MIME_TYPE) => self.read_json(response).await,
            _ => {
                let body = response.bytes().await?;
                if body.is_empty() {
                    Ok(())
                } else {
                    Err(TransportError::UnexpectedContentType(content_type))
                }
            }
        }
    }

    fn on_message(&self, handler: MessageHandler) {
        self.write_state().handler = Some(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (url, headers, session_id) = {
            let mut state = self.write_state();
            state.handler = None;
            (
                state.url.clone(),
                state.headers.clone(),
                state.session_id.take(),
            )
        };
        self.connected.store(false, Ordering::SeqCst);
        if let (Some(url), Some(session_id)) = (url, session_id) {
            let mut request = self.client.delete(url).headers(headers);
            if let Ok(value) = HeaderValue::from_str(&session_id) {
                request = request.header(HEADER_SESSION_ID, value);
            }
            match tokio::time::timeout(self.config.timeout, request.send()).await {
                Ok(Ok(response)) => {
                    debug!(%session_id, status = %response.status(), "session deleted")
                }
                Ok(Err(error)) => warn!(%session_id, %error, "failed to delete session"),
                Err(_) => warn!(%session_id, "session delete timed out"),
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> Option<String> {
        self.read_state().session_id.clone()
    }
}
