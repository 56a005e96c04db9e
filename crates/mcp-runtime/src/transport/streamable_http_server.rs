//! Streamable HTTP server transport.
//!
//! One endpoint answers `POST` (client messages), `GET` (a listening SSE
//! stream) and `DELETE` (end a session). Responses to a `POST` come back
//! either as a plain JSON body or, in streaming mode, as an SSE body that
//! closes once every request in the batch has been answered.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use mcp_runtime::{McpServer, Transport};
//! # use mcp_runtime::transport::{StreamableHttpServerConfig, StreamableHttpServerTransport};
//! # async fn run() -> anyhow::Result<()> {
//! let transport = Arc::new(StreamableHttpServerTransport::new(
//!     StreamableHttpServerConfig::default().with_sessions(true),
//! ));
//! let server = McpServer::default();
//! server.with_transport(transport.clone());
//! transport.connect().await?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8000").await?;
//! axum::serve(listener, transport.router("/mcp")).await?;
//! # Ok(())
//! # }
//! ```
pub mod session;

use std::{
    convert::Infallible,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, header};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc::UnboundedReceiver};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::session::{KEEP_ALIVE_FRAME, SessionTable, StreamId};
pub use self::session::SessionId;
use super::{
    EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID, JSON_MIME_TYPE,
    MessageHandler, Transport, TransportError,
};
use crate::model::{ErrorData, JsonRpcMessage, JsonRpcPayload, method};

const SESSION_ID_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

/// Largest request body accepted on `POST`.
pub const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;

/// Which `Origin` headers are accepted. Requests without an `Origin`
/// header are always accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OriginPolicy {
    #[default]
    AllowAll,
    /// Exact, case-sensitive origin match.
    AllowList(Vec<String>),
    /// `http` or `https` origins on `localhost`, `127.0.0.1` or `[::1]`.
    Localhost,
}

impl OriginPolicy {
    pub fn allows(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        match self {
            OriginPolicy::AllowAll => true,
            OriginPolicy::AllowList(allowed) => allowed.iter().any(|a| a == origin),
            OriginPolicy::Localhost => is_localhost_origin(origin),
        }
    }
}

fn is_localhost_origin(origin: &str) -> bool {
    let Some(authority) = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
    else {
        return false;
    };
    let host = if authority.starts_with('[') {
        authority.find(']').map(|end| &authority[..=end])
    } else {
        authority.split(':').next()
    };
    matches!(host, Some("localhost" | "127.0.0.1" | "[::1]"))
}

/// Configuration for the streamable HTTP server
#[derive(Debug, Clone)]
pub struct StreamableHttpServerConfig {
    /// Create a session on `initialize` and require it for `GET`.
    pub enable_sessions: bool,
    /// Answer requests over SSE instead of a single JSON body.
    pub enable_streaming: bool,
    /// Sessions idle for longer than this are reaped.
    pub session_timeout: Duration,
    /// How often the reaper looks for idle sessions.
    pub cleanup_interval: Duration,
    pub origin_policy: OriginPolicy,
    /// The ping comment interval for SSE bodies, if any.
    pub sse_keep_alive: Option<Duration>,
}

impl StreamableHttpServerConfig {
    pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

    pub fn with_sessions(mut self, enable: bool) -> Self {
        self.enable_sessions = enable;
        self
    }
    pub fn with_streaming(mut self, enable: bool) -> Self {
        self.enable_streaming = enable;
        self
    }
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
    pub fn with_origin_policy(mut self, policy: OriginPolicy) -> Self {
        self.origin_policy = policy;
        self
    }
    pub fn with_sse_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.sse_keep_alive = interval;
        self
    }
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            enable_sessions: false,
            enable_streaming: false,
            session_timeout: Self::DEFAULT_SESSION_TIMEOUT,
            cleanup_interval: Self::DEFAULT_CLEANUP_INTERVAL,
            origin_policy: OriginPolicy::default(),
            sse_keep_alive: None,
        }
    }
}

type CloseCallback = Box<dyn FnOnce() + Send>;

struct Shared {
    config: StreamableHttpServerConfig,
    connected: AtomicBool,
    handler: RwLock<Option<MessageHandler>>,
    on_close: std::sync::Mutex<Option<CloseCallback>>,
    sessions: Mutex<SessionTable>,
    reaper: std::sync::Mutex<Option<CancellationToken>>,
}

/// Server side of the streamable HTTP transport. Clones share state.
#[derive(Clone)]
pub struct StreamableHttpServerTransport {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for StreamableHttpServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpServerTransport")
            .field("config", &self.inner.config)
            .field("connected", &self.inner.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for StreamableHttpServerTransport {
    fn default() -> Self {
        Self::new(StreamableHttpServerConfig::default())
    }
}

impl StreamableHttpServerTransport {
    pub fn new(config: StreamableHttpServerConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                connected: AtomicBool::new(false),
                handler: RwLock::new(None),
                on_close: std::sync::Mutex::new(None),
                sessions: Mutex::new(SessionTable::default()),
                reaper: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &StreamableHttpServerConfig {
        &self.inner.config
    }

    /// Run `callback` once, the next time the transport is closed.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        *self
            .inner
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    fn handler(&self) -> Option<MessageHandler> {
        self.inner
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Open SSE streams, bound to a session or not.
    pub async fn stream_count(&self) -> usize {
        self.inner.sessions.lock().await.stream_count()
    }

    pub async fn has_session(&self, id: &str) -> bool {
        self.inner.sessions.lock().await.contains(id)
    }

    /// An axum router serving this transport at `path`.
    pub fn router(&self, path: &str) -> axum::Router {
        let transport = self.clone();
        axum::Router::new().route(
            path,
            axum::routing::any(move |request: axum::extract::Request| {
                let transport = transport.clone();
                async move { transport.handle_request(request).await }
            }),
        )
    }

    /// Answer one HTTP request. Every failure is mapped to a response;
    /// nothing here returns an error.
    pub async fn handle_request(&self, request: Request<Body>) -> Response<Body> {
        let (parts, body) = request.into_parts();
        debug!(
            method = %parts.method,
            session_id = ?header_str(&parts.headers, HEADER_SESSION_ID),
            "incoming request"
        );
        let origin = header_str(&parts.headers, header::ORIGIN);
        if !self.inner.config.origin_policy.allows(origin) {
            warn!(?origin, "rejected request origin");
            return error_response(
                StatusCode::FORBIDDEN,
                ErrorData::server_error("Origin not allowed", Some(json!({ "origin": origin }))),
            );
        }
        if !self.inner.connected.load(Ordering::SeqCst) {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorData::server_error("Transport not connected", None),
            );
        }
        let Some(handler) = self.handler() else {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorData::server_error("No message handler registered", None),
            );
        };

        let session_header = header_str(&parts.headers, HEADER_SESSION_ID).map(str::to_owned);
        let mut session: Option<SessionId> = None;
        if let Some(id) = session_header.as_deref() {
            if parts.method != Method::DELETE {
                let mut sessions = self.inner.sessions.lock().await;
                if !sessions.touch(id) {
                    debug!(session_id = id, method = %parts.method, "unknown session");
                    return empty_response(StatusCode::NOT_FOUND);
                }
                session = sessions.get(id).map(|s| s.id().clone());
            }
        }

        match parts.method {
            Method::POST => self.handle_post(&parts.headers, body, session, handler).await,
            Method::GET => self.handle_get(&parts.headers, session).await,
            Method::DELETE => self.handle_delete(session_header.as_deref()).await,
            _ => {
                let mut response = empty_response(StatusCode::METHOD_NOT_ALLOWED);
                response
                    .headers_mut()
                    .insert(header::ALLOW, HeaderValue::from_static("GET, POST, DELETE"));
                response
            }
        }
    }

    async fn handle_post(
        &self,
        headers: &HeaderMap,
        body: Body,
        mut session: Option<SessionId>,
        handler: MessageHandler,
    ) -> Response<Body> {
        let accept = header_str(headers, header::ACCEPT).unwrap_or_default();
        let accepts_sse = accept.contains(EVENT_STREAM_MIME_TYPE);
        if !accept.contains(JSON_MIME_TYPE) && !accepts_sse {
            return error_response(
                StatusCode::NOT_ACCEPTABLE,
                ErrorData::invalid_request(
                    "Not Acceptable: Client must accept application/json and text/event-stream",
                    None,
                ),
            );
        }

        let payload = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
            Ok(bytes) => JsonRpcPayload::from_slice(&bytes),
            Err(error) => {
                debug!(%error, "failed to read request body");
                return parse_error_response();
            }
        };
        let messages = match payload {
            Ok(payload) => payload.into_messages(),
            Err(error) => {
                debug!(%error, "unparsable request body");
                return parse_error_response();
            }
        };

        let has_requests = messages.iter().any(JsonRpcMessage::is_request);
        let wants_session = messages
            .iter()
            .any(|m| m.is_request() && m.method() == Some(method::INITIALIZE));
        if self.inner.config.enable_sessions && session.is_none() && wants_session {
            let id = self.inner.sessions.lock().await.create();
            info!(session_id = %id, "created session");
            session = Some(id);
        }

        if !has_requests {
            for message in messages {
                handler(message).await;
            }
            return with_session(empty_response(StatusCode::ACCEPTED), session.as_ref());
        }

        if !(self.inner.config.enable_streaming && accepts_sse) {
            let mut responses = Vec::new();
            for message in messages {
                let is_request = message.is_request();
                if let Some(response) = handler(message).await {
                    if is_request {
                        responses.push(response);
                    }
                }
            }
            let response = if responses.len() == 1 {
                json_response(StatusCode::OK, &responses[0])
            } else {
                json_response(StatusCode::OK, &responses)
            };
            return with_session(response, session.as_ref());
        }

        let (stream_id, rx) = {
            let mut sessions = self.inner.sessions.lock().await;
            let (stream_id, rx) = sessions.open_stream(session.as_deref());
            if let Some(stream) = sessions.stream_mut(stream_id) {
                for id in messages.iter().filter_map(JsonRpcMessage::request_id) {
                    stream.track_request(id.clone());
                }
            }
            (stream_id, rx)
        };
        debug!(stream = stream_id, session_id = ?session, "opened response stream");
        self.spawn_keep_alive(stream_id).await;

        for message in messages {
            if message.is_request() {
                let handler = handler.clone();
                let transport = self.clone();
                tokio::spawn(async move {
                    if let Some(response) = handler(message).await {
                        transport.deliver_to_stream(stream_id, response).await;
                    }
                });
            } else {
                handler(message).await;
            }
        }
        with_session(sse_response(rx), session.as_ref())
    }

    async fn handle_get(&self, headers: &HeaderMap, session: Option<SessionId>) -> Response<Body> {
        let accept = header_str(headers, header::ACCEPT).unwrap_or_default();
        if !accept.contains(EVENT_STREAM_MIME_TYPE) {
            return empty_response(StatusCode::NOT_ACCEPTABLE);
        }
        if self.inner.config.enable_sessions && session.is_none() {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorData::server_error("Session required", None),
            );
        }

        let last_event_id = header_str(headers, HEADER_LAST_EVENT_ID);
        let (stream_id, rx) = {
            let mut sessions = self.inner.sessions.lock().await;
            let (stream_id, rx) = sessions.open_stream(session.as_deref());
            let replay = match (session.as_deref(), last_event_id) {
                (Some(session), Some(last)) => match last.trim().parse::<u64>() {
                    Ok(last) => sessions.replay_source(session, stream_id, last),
                    Err(_) => {
                        debug!(last_event_id = last, "ignoring non-numeric last event id");
                        Vec::new()
                    }
                },
                _ => Vec::new(),
            };
            if let Some(stream) = sessions.stream_mut(stream_id) {
                let replayed = stream.replay(replay);
                if replayed > 0 {
                    debug!(stream = stream_id, replayed, "replayed buffered events");
                }
            }
            (stream_id, rx)
        };
        debug!(stream = stream_id, session_id = ?session, "opened listening stream");
        self.spawn_keep_alive(stream_id).await;
        with_session(sse_response(rx), session.as_ref())
    }

    async fn handle_delete(&self, session: Option<&str>) -> Response<Body> {
        let Some(id) = session else {
            return empty_response(StatusCode::BAD_REQUEST);
        };
        if !self.inner.config.enable_sessions {
            return empty_response(StatusCode::NOT_FOUND);
        }
        match self.inner.sessions.lock().await.remove(id) {
            Some(streams) => {
                info!(session_id = id, streams, "session closed");
                empty_response(StatusCode::NO_CONTENT)
            }
            None => empty_response(StatusCode::NOT_FOUND),
        }
    }

    /// Push a response onto the stream that carried its request, closing the
    /// stream once every request it tracks has been answered.
    async fn deliver_to_stream(&self, stream_id: StreamId, response: JsonRpcMessage) {
        let Some(id) = response.response_id().cloned() else {
            debug!(stream = stream_id, "dropping error response without id");
            return;
        };
        let mut sessions = self.inner.sessions.lock().await;
        let Some(stream) = sessions.stream_mut(stream_id) else {
            debug!(stream = stream_id, %id, "response stream already closed");
            return;
        };
        if let Err(error) = stream.push(&response) {
            warn!(%error, %id, "failed to encode response");
        }
        if stream.settle(&id) {
            sessions.close_stream(stream_id);
            debug!(stream = stream_id, "all responses delivered, stream closed");
        }
    }

    /// Emit `:ping` comments on the stream until it closes. Holds only a
    /// weak sender so the body still ends when the stream is closed.
    async fn spawn_keep_alive(&self, stream_id: StreamId) {
        let Some(interval) = self.inner.config.sse_keep_alive else {
            return;
        };
        let Some(weak) = self
            .inner
            .sessions
            .lock()
            .await
            .stream_mut(stream_id)
            .map(|s| s.sender().downgrade())
        else {
            return;
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tx) = weak.upgrade() else {
                    break;
                };
                if tx.send(Bytes::from_static(KEEP_ALIVE_FRAME)).is_err() {
                    break;
                }
            }
        });
    }

    /// Close and remove every session idle for longer than the configured
    /// timeout, along with disconnected sessionless streams. Returns the
    /// removed session ids.
    pub async fn reap_idle_sessions(&self) -> Vec<SessionId> {
        let (expired, pruned) = {
            let mut sessions = self.inner.sessions.lock().await;
            let expired = sessions.remove_idle(self.inner.config.session_timeout);
            (expired, sessions.prune_unbound())
        };
        if pruned > 0 {
            debug!(streams = pruned, "pruned disconnected sessionless streams");
        }
        for id in &expired {
            info!(session_id = %id, "reaped idle session");
        }
        expired
    }

    fn start_reaper(&self) {
        let mut reaper = self.inner.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if reaper.is_some() {
            return;
        }
        let ct = CancellationToken::new();
        let weak: Weak<Shared> = Arc::downgrade(&self.inner);
        let period = self.inner.config.cleanup_interval;
        let cancelled = ct.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        StreamableHttpServerTransport { inner }.reap_idle_sessions().await;
                    }
                }
            }
            debug!("session reaper stopped");
        });
        *reaper = Some(ct);
    }

    fn stop_reaper(&self) {
        if let Some(ct) = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            ct.cancel();
        }
    }
}

#[async_trait::async_trait]
impl Transport for StreamableHttpServerTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connected.store(true, Ordering::SeqCst);
        if self.inner.config.enable_sessions {
            self.start_reaper();
        }
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let mut sessions = self.inner.sessions.lock().await;
        if message.is_response() || message.is_error_response() {
            let Some(id) = message.response_id() else {
                debug!("dropping error response without id");
                return Ok(());
            };
            let Some(stream) = sessions.stream_waiting_for(id) else {
                debug!(%id, "no stream waiting for response");
                return Ok(());
            };
            if let Err(error) = stream.push(&message) {
                warn!(%error, %id, "failed to encode response");
            }
            let stream_id = stream.id();
            if stream.settle(id) {
                sessions.close_stream(stream_id);
                debug!(stream = stream_id, "all responses delivered, stream closed");
            }
            return Ok(());
        }
        for session in sessions.sessions_mut() {
            let session_id = session.id().clone();
            let Some(stream) = session.first_stream_mut() else {
                continue;
            };
            if let Err(error) = stream.push(&message) {
                warn!(%error, %session_id, "failed to encode message");
                continue;
            }
            if let Some(id) = message.request_id() {
                stream.track_request(id.clone());
            }
        }
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.stop_reaper();
        let closed = self.inner.sessions.lock().await.clear();
        debug!(streams = closed, "transport closed");
        let callback = self
            .inner
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

fn header_str<K: header::AsHeaderName>(headers: &HeaderMap, key: K) -> Option<&str> {
    headers.get(key).and_then(|v| v.to_str().ok())
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(JSON_MIME_TYPE),
            );
            response
        }
        Err(error) => {
            warn!(%error, "failed to encode response body");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn error_response(status: StatusCode, error: ErrorData) -> Response<Body> {
    json_response(status, &JsonRpcMessage::error(None, error))
}

fn parse_error_response() -> Response<Body> {
    error_response(
        StatusCode::BAD_REQUEST,
        ErrorData::parse_error("Parse error", None),
    )
}

fn sse_response(rx: UnboundedReceiver<Bytes>) -> Response<Body> {
    let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

fn with_session(mut response: Response<Body>, session: Option<&SessionId>) -> Response<Body> {
    if let Some(value) = session.and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}
