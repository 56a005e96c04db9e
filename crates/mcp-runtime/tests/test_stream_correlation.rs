mod common;

use std::{collections::HashSet, sync::Arc, time::Duration};

use common::{ACCEPT_BOTH, frames, init_tracing, serve};
use mcp_runtime::{
    BoxError, McpServer, McpServerOptions, Transport,
    handler::server::AnyObjectValidator,
    model::{CallToolResult, Content, JsonObject, JsonRpcMessage, RequestId, Tool},
    serde_json::{Value, json},
    transport::{
        HEADER_SESSION_ID, StreamableHttpServerConfig, StreamableHttpServerTransport,
        message_handler,
    },
};
use reqwest::{StatusCode, header};
use tokio_util::sync::CancellationToken;

const N: u64 = 8;
const STEP: Duration = Duration::from_millis(25);

/// Answers `{"delay_ms": d}` requests after sleeping `d`, echoing the id.
fn delayed_echo() -> mcp_runtime::transport::MessageHandler {
    message_handler(|message: JsonRpcMessage| async move {
        let JsonRpcMessage::Request(request) = message else {
            return None;
        };
        let delay = request
            .params
            .as_ref()
            .and_then(|p| p.get("delay_ms"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Some(JsonRpcMessage::response(
            request.id.clone(),
            json!({ "echo": request.id.to_string() }),
        ))
    })
}

async fn streaming_transport(ct: CancellationToken) -> (Arc<StreamableHttpServerTransport>, String) {
    init_tracing();
    let transport = Arc::new(StreamableHttpServerTransport::new(
        StreamableHttpServerConfig::default().with_streaming(true),
    ));
    transport.on_message(delayed_echo());
    transport.connect().await.unwrap();
    let url = serve(&transport, ct).await;
    (transport, url)
}

#[tokio::test]
async fn test_batch_answered_in_reverse_completion_order() {
    let ct = CancellationToken::new();
    let (_transport, url) = streaming_transport(ct.clone()).await;

    let batch: Vec<Value> = (0..N)
        .map(|i| {
            json!({
                "jsonrpc": "2.0",
                "id": i,
                "method": "slow",
                "params": { "delay_ms": (N - i) * STEP.as_millis() as u64 }
            })
        })
        .collect();
    let response = reqwest::Client::new()
        .post(&url)
        .header(header::ACCEPT, ACCEPT_BOTH)
        .body(Value::Array(batch).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let frames = frames(response).collect_frames().await;
    assert_eq!(frames.len(), N as usize, "stream closes after the last response");

    let event_ids: Vec<u64> = frames.iter().map(|f| f.id.unwrap()).collect();
    assert_eq!(event_ids, (1..=N).collect::<Vec<_>>());

    let answered: Vec<i64> = frames
        .iter()
        .map(|f| {
            let message: Value = serde_json::from_str(&f.data).unwrap();
            assert_eq!(message["result"]["echo"], message["id"].to_string());
            message["id"].as_i64().unwrap()
        })
        .collect();
    let expected: Vec<i64> = (0..N as i64).rev().collect();
    assert_eq!(answered, expected);
    assert_eq!(answered.iter().collect::<HashSet<_>>().len(), N as usize);
    ct.cancel();
}

#[tokio::test]
async fn test_concurrent_posts_get_their_own_streams() {
    let ct = CancellationToken::new();
    let (_transport, url) = streaming_transport(ct.clone()).await;
    let http = reqwest::Client::new();

    let posts = (0..4u64).map(|i| {
        let http = http.clone();
        let url = url.clone();
        async move {
            let body = json!({
                "jsonrpc": "2.0",
                "id": format!("req-{i}"),
                "method": "slow",
                "params": { "delay_ms": (4 - i) * 30 }
            });
            let response = http
                .post(&url)
                .header(header::ACCEPT, ACCEPT_BOTH)
                .body(body.to_string())
                .send()
                .await
                .unwrap();
            (i, frames(response).collect_frames().await)
        }
    });
    for (i, frames) in futures::future::join_all(posts).await {
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, Some(1));
        let message: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(message["id"], format!("req-{i}"));
    }
    ct.cancel();
}

#[tokio::test]
async fn test_late_response_for_unknown_id_is_dropped() {
    let ct = CancellationToken::new();
    let (transport, _url) = streaming_transport(ct.clone()).await;
    transport
        .send(JsonRpcMessage::response(
            RequestId::Number(12345),
            json!({}),
        ))
        .await
        .unwrap();
    ct.cancel();
}

/// A server whose `pause` tool sleeps `delay_ms` and then answers `reply`.
fn pausing_server() -> McpServer {
    let server = McpServer::new(McpServerOptions::new("pause", "1.0.0"));
    server.add_tool(
        Tool::new("pause"),
        AnyObjectValidator::default(),
        |args: JsonObject| async move {
            let delay = args.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let reply = args.get("reply").and_then(Value::as_str).unwrap_or_default();
            Ok::<_, BoxError>(CallToolResult::success(vec![Content::text(reply)]))
        },
    );
    server
}

async fn open_session(http: &reqwest::Client, url: &str) -> String {
    let response = http
        .post(url)
        .header(header::ACCEPT, ACCEPT_BOTH)
        .body(
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": {},
                    "clientInfo": { "name": "raw", "version": "0" }
                }
            })
            .to_string(),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = response.headers()[HEADER_SESSION_ID]
        .to_str()
        .unwrap()
        .to_owned();
    let frames = frames(response).collect_frames().await;
    assert_eq!(frames.len(), 1);
    session
}

#[tokio::test]
async fn test_sessions_reusing_an_id_get_their_own_results() {
    init_tracing();
    let ct = CancellationToken::new();
    let transport = Arc::new(StreamableHttpServerTransport::new(
        StreamableHttpServerConfig::default()
            .with_sessions(true)
            .with_streaming(true),
    ));
    pausing_server().with_transport(transport.clone());
    transport.connect().await.unwrap();
    let url = serve(&transport, ct.clone()).await;
    let http = reqwest::Client::new();

    let a = open_session(&http, &url).await;
    let b = open_session(&http, &url).await;
    assert_ne!(a, b);

    let call = |session: String, delay_ms: u64, reply: &'static str| {
        let http = http.clone();
        let url = url.clone();
        async move {
            let response = http
                .post(&url)
                .header(header::ACCEPT, ACCEPT_BOTH)
                .header(HEADER_SESSION_ID, session)
                .body(
                    json!({
                        "jsonrpc": "2.0",
                        "id": 1,
                        "method": "tools/call",
                        "params": {
                            "name": "pause",
                            "arguments": { "delay_ms": delay_ms, "reply": reply }
                        }
                    })
                    .to_string(),
                )
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            frames(response).collect_frames().await
        }
    };
    let (frames_a, frames_b) = tokio::join!(call(a, 20, "A"), call(b, 300, "B"));

    for (frames, expected) in [(frames_a, "A"), (frames_b, "B")] {
        assert_eq!(frames.len(), 1, "exactly one response per stream");
        let message: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(message["id"], 1);
        assert_eq!(message["result"]["content"][0]["text"], expected);
    }
    assert_eq!(transport.stream_count().await, 0);
    ct.cancel();
}
