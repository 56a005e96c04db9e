#![allow(dead_code)]
#[cfg(feature = "schemars")]
pub mod calculator;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use mcp_runtime::transport::StreamableHttpServerTransport;
use tokio_util::sync::CancellationToken;

pub const ACCEPT_BOTH: &str = "application/json, text/event-stream";
pub const ACCEPT_SSE: &str = "text/event-stream";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_runtime=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Serve `transport` on an ephemeral local port until `ct` is cancelled.
/// Returns the endpoint URL.
pub async fn serve(transport: &StreamableHttpServerTransport, ct: CancellationToken) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let router = transport.router("/mcp");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(ct.cancelled_owned())
            .await;
    });
    format!("http://{addr}/mcp")
}

/// One SSE frame read off a response body, split into its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: Option<u64>,
    pub data: String,
}

/// Accumulates body chunks and yields complete SSE frames, skipping
/// comment-only frames such as keep-alive pings.
pub struct FrameReader<S> {
    body: S,
    buffer: String,
}

impl<S> FrameReader<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    pub fn new(body: S) -> Self {
        Self {
            body,
            buffer: String::new(),
        }
    }

    /// The next frame, or `None` once the body has ended.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let raw: String = self.buffer.drain(..end + 2).collect();
                let mut frame = Frame {
                    id: None,
                    data: String::new(),
                };
                let mut has_data = false;
                for line in raw.lines() {
                    if let Some(id) = line.strip_prefix("id: ") {
                        frame.id = id.parse().ok();
                    } else if let Some(data) = line.strip_prefix("data: ") {
                        frame.data.push_str(data);
                        has_data = true;
                    }
                }
                if has_data {
                    return Some(frame);
                }
                continue;
            }
            let chunk = self.body.next().await?.ok()?;
            self.buffer.push_str(std::str::from_utf8(&chunk).ok()?);
        }
    }

    pub async fn collect_frames(mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame().await {
            frames.push(frame);
        }
        frames
    }
}

pub fn frames(response: reqwest::Response) -> FrameReader<impl Stream<Item = reqwest::Result<Bytes>> + Unpin> {
    FrameReader::new(Box::pin(response.bytes_stream()))
}
