//! End-to-end tests against a real listening server.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use relay_client::{ChannelObserver, ClientError, ClientNotification, ClientOptions, GatewayClient};
use relay_core::protocol::{EventFrame, Frame, Hello, MAX_PROTOCOL};
use relay_runtime::{EchoExecutor, GatewayRuntime};
use relay_server::{GatewayServer, RunningServer, ServerConfig};
use relay_settings::{AuthSettings, GatewaySettings};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn boot(config: ServerConfig) -> RunningServer {
    let runtime = GatewayRuntime::new(&GatewaySettings::default(), Arc::new(EchoExecutor));
    GatewayServer::new(config, runtime).listen().await.unwrap()
}

async fn boot_default() -> RunningServer {
    boot(ServerConfig::default()).await
}

fn client_options(server: &RunningServer) -> ClientOptions {
    let mut opts = ClientOptions::new(server.url());
    opts.request_timeout = TIMEOUT;
    opts.reconnect.max_attempts = 1;
    opts
}

async fn connect_with(
    opts: ClientOptions,
) -> (GatewayClient, mpsc::UnboundedReceiver<ClientNotification>) {
    let (observer, rx) = ChannelObserver::new();
    let client = GatewayClient::with_observer(opts, Arc::new(observer)).unwrap();
    client.start();
    client.wait_connected(TIMEOUT).await.unwrap();
    (client, rx)
}

async fn connect(
    server: &RunningServer,
) -> (GatewayClient, mpsc::UnboundedReceiver<ClientNotification>) {
    connect_with(client_options(server)).await
}

async fn create_session(client: &GatewayClient, key: &str) -> String {
    let created = client
        .request("session.create", Some(json!({ "sessionKey": key })))
        .await
        .unwrap();
    created["session"]["sessionId"].as_str().unwrap().to_owned()
}

/// Collect events until one named `until` arrives.
async fn events_until(
    rx: &mut mpsc::UnboundedReceiver<ClientNotification>,
    until: &str,
) -> Vec<EventFrame> {
    let mut events = Vec::new();
    loop {
        let notification = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        if let ClientNotification::Event(event) = notification {
            let done = event.event == until;
            events.push(event);
            if done {
                return events;
            }
        }
    }
}

// ── Raw socket helpers ──────────────────────────────────────────────

fn hello(server: &RunningServer) -> Hello {
    ClientOptions::new(server.url()).hello()
}

async fn raw_connect(server: &RunningServer) -> WsStream {
    let (ws, _) = connect_async(server.url()).await.unwrap();
    ws
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) {
    ws.send(Message::Text(frame.to_json().unwrap().into()))
        .await
        .unwrap();
}

/// Next text frame, skipping control frames. `None` on close.
async fn next_frame(ws: &mut WsStream) -> Option<Frame> {
    loop {
        match timeout(TIMEOUT, ws.next()).await.unwrap()? {
            Ok(Message::Text(text)) => return Some(Frame::parse(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Read until a close frame and return its code.
async fn expect_close(ws: &mut WsStream) -> u16 {
    loop {
        match timeout(TIMEOUT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(Message::Close(None))) | None | Some(Err(_)) => {
                panic!("socket closed without a close code")
            }
            Some(Ok(_)) => {}
        }
    }
}

async fn raw_handshake(server: &RunningServer) -> WsStream {
    let mut ws = raw_connect(server).await;
    send_frame(&mut ws, &Frame::Hello(hello(server))).await;
    assert_matches!(next_frame(&mut ws).await, Some(Frame::HelloOk(_)));
    ws
}

// ── Client round trips ──────────────────────────────────────────────

#[tokio::test]
async fn ping_round_trip() {
    let server = boot_default().await;
    let (client, mut rx) = connect(&server).await;

    let hello_ok = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_matches!(hello_ok, ClientNotification::HelloOk(ok) => {
        assert_eq!(ok.protocol_version, MAX_PROTOCOL);
        assert!(ok.capabilities.iter().any(|c| c == "events"));
    });

    let pong = client.request("system.ping", None).await.unwrap();
    assert_eq!(pong["pong"], true);

    let methods = client.request("system.methods", None).await.unwrap();
    assert_eq!(methods["methods"].as_array().unwrap().len(), 17);

    client.stop();
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn run_then_wait() {
    let server = boot_default().await;
    let (client, _rx) = connect(&server).await;
    let sid = create_session(&client, "main").await;

    let started = client
        .request("agent.run", Some(json!({ "sessionId": sid, "input": { "text": "hello" } })))
        .await
        .unwrap();
    assert_eq!(started["status"], "started");

    let waited = client
        .request(
            "agent.wait",
            Some(json!({ "runId": started["runId"], "timeoutMs": 2000 })),
        )
        .await
        .unwrap();
    assert_eq!(waited["run"]["status"], "completed");
    assert_eq!(waited["run"]["result"]["text"], "hello");

    client.stop();
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn idempotent_run_submission() {
    let server = boot_default().await;
    let (client, _rx) = connect(&server).await;
    let sid = create_session(&client, "main").await;

    let params = json!({ "sessionId": sid, "input": { "delayMs": 10_000 }, "idempotencyKey": "retry-1" });
    let first = client.request("agent.run", Some(params.clone())).await.unwrap();
    let second = client.request("agent.run", Some(params)).await.unwrap();
    assert_eq!(first["status"], "started");
    assert_eq!(second["status"], "duplicate");
    assert_eq!(second["runId"], first["runId"]);
    assert_eq!(server.runtime().registry.active_run_count(), 1);

    let aborted = client
        .request("agent.abort", Some(json!({ "sessionId": sid })))
        .await
        .unwrap();
    assert_eq!(aborted["aborted"], true);

    client.stop();
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn session_events_arrive_in_sequence() {
    let server = boot_default().await;
    let (client, mut rx) = connect(&server).await;
    let sid = create_session(&client, "main").await;

    let _ = client
        .request("agent.run", Some(json!({ "sessionId": sid, "input": {} })))
        .await
        .unwrap();

    let events = events_until(&mut rx, "run.completed").await;
    let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
    assert!(names.contains(&"session.created"));
    assert!(names.contains(&"run.started"));
    for pair in events.windows(2) {
        assert_eq!(pair[1].seq, pair[0].seq + 1);
    }
    assert_eq!(events[0].seq, 1);

    client.stop();
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn unsubscribed_connection_misses_session_events() {
    let server = boot_default().await;
    let (owner, _owner_rx) = connect(&server).await;
    let (other, mut other_rx) = connect(&server).await;
    let sid = create_session(&owner, "main").await;

    let _ = owner
        .request("agent.run", Some(json!({ "sessionId": sid, "input": {} })))
        .await
        .unwrap();
    let _ = owner
        .request("approval.request", Some(json!({ "kind": "marker" })))
        .await
        .unwrap();

    // Global events still reach the other connection; session events do not.
    let events = events_until(&mut other_rx, "approval.requested").await;
    assert!(events.iter().all(|e| !e.event.starts_with("run.")));

    owner.stop();
    other.stop();
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn concurrent_requests_answered_independently() {
    let server = boot_default().await;
    let (client, _rx) = connect(&server).await;
    let sid = create_session(&client, "main").await;
    let started = client
        .request("agent.run", Some(json!({ "sessionId": sid, "input": { "delayMs": 10_000 } })))
        .await
        .unwrap();

    let slow = client.request(
        "agent.wait",
        Some(json!({ "runId": started["runId"], "timeoutMs": 3000 })),
    );
    let fast = client.request("system.ping", None);
    let ping = tokio::select! {
        _ = slow => panic!("wait finished before ping"),
        ping = fast => ping.unwrap(),
    };
    assert_eq!(ping["pong"], true);

    client.stop();
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn subagent_stop_cascades() {
    let server = boot_default().await;
    let (client, _rx) = connect(&server).await;
    let child_sid = create_session(&client, "child").await;
    let started = client
        .request(
            "agent.run",
            Some(json!({ "sessionId": child_sid, "input": { "delayMs": 10_000 } })),
        )
        .await
        .unwrap();

    for (run, child, requester) in [
        (started["runId"].as_str().unwrap(), "child", "main"),
        ("grand-run", "grandchild", "child"),
    ] {
        let _ = client
            .request(
                "subagent.register",
                Some(json!({ "runId": run, "childSessionKey": child, "requesterSessionKey": requester })),
            )
            .await
            .unwrap();
    }

    let stopped = client
        .request("subagent.stop", Some(json!({ "requesterSessionKey": "main" })))
        .await
        .unwrap();
    assert_eq!(stopped["stopped"], 2);

    let run = client
        .request("agent.wait", Some(json!({ "runId": started["runId"], "timeoutMs": 1000 })))
        .await
        .unwrap();
    assert_eq!(run["run"]["status"], "aborted");

    client.stop();
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn approval_resolved_by_another_client() {
    let server = boot_default().await;
    let (requester, _rx) = connect(&server).await;
    let (approver, _approver_rx) = connect(&server).await;

    let registered = requester
        .request("approval.request", Some(json!({ "kind": "exec", "payload": { "cmd": "rm" } })))
        .await
        .unwrap();
    let id = registered["id"].as_str().unwrap().to_owned();

    let wait = requester.request("approval.wait", Some(json!({ "id": id })));
    let resolve = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        approver
            .request("approval.resolve", Some(json!({ "id": id, "decision": "deny" })))
            .await
    };
    let (waited, resolved) = tokio::join!(wait, resolve);
    assert_eq!(resolved.unwrap()["resolved"], true);
    assert_eq!(waited.unwrap()["decision"], "deny");

    requester.stop();
    approver.stop();
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn unknown_method_rejected() {
    let server = boot_default().await;
    let (client, _rx) = connect(&server).await;

    let err = client.request("no.such.method", None).await.unwrap_err();
    assert_matches!(err, ClientError::Rejected { code, .. } if code == "METHOD_NOT_FOUND");

    let err = client
        .request("session.get", Some(json!({ "sessionId": "ghost" })))
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Rejected { code, .. } if code == "SESSION_NOT_FOUND");

    client.stop();
    let _ = server.shutdown().await;
}

// ── Handshake and lifecycle ─────────────────────────────────────────

fn with_token(token: &str) -> ServerConfig {
    ServerConfig {
        auth: AuthSettings {
            token: Some(token.into()),
            password: None,
        },
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn token_auth_accepts_and_rejects() {
    let server = boot(with_token("s3cret")).await;

    let (good, _rx) = connect_with(client_options(&server).with_token("s3cret")).await;
    assert!(good.request("system.ping", None).await.is_ok());
    good.stop();

    let (observer, _rx) = ChannelObserver::new();
    let bad = GatewayClient::with_observer(
        client_options(&server).with_token("wrong"),
        Arc::new(observer),
    )
    .unwrap();
    bad.start();
    let err = bad.wait_connected(TIMEOUT).await.unwrap_err();
    assert_matches!(err, ClientError::Auth(_));

    let mut ws = raw_connect(&server).await;
    send_frame(&mut ws, &Frame::Hello(hello(&server))).await;
    assert_eq!(expect_close(&mut ws).await, 4001);

    let _ = server.shutdown().await;
}

#[tokio::test]
async fn version_mismatch_closes_4002() {
    let server = boot_default().await;
    let mut ws = raw_connect(&server).await;
    let mut h = hello(&server);
    h.min_protocol = MAX_PROTOCOL + 1;
    h.max_protocol = MAX_PROTOCOL + 5;
    send_frame(&mut ws, &Frame::Hello(h)).await;
    assert_eq!(expect_close(&mut ws).await, 4002);
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn silent_client_closed_4003() {
    let server = boot(ServerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    })
    .await;
    let mut ws = raw_connect(&server).await;
    assert_eq!(expect_close(&mut ws).await, 4003);
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn request_before_hello_closed_4004() {
    let server = boot_default().await;
    let mut ws = raw_connect(&server).await;
    ws.send(Message::Text(
        json!({ "type": "req", "id": "r1", "method": "system.ping" }).to_string().into(),
    ))
    .await
    .unwrap();
    assert_eq!(expect_close(&mut ws).await, 4004);
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn capacity_refused_1013() {
    let server = boot(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    })
    .await;
    let _first = raw_handshake(&server).await;

    let mut second = raw_connect(&server).await;
    assert_eq!(expect_close(&mut second).await, 1013);
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn invalid_frame_with_id_gets_error_reply() {
    let server = boot_default().await;
    let mut ws = raw_handshake(&server).await;
    ws.send(Message::Text(json!({ "type": "req", "id": "bad-1" }).to_string().into()))
        .await
        .unwrap();

    let frame = next_frame(&mut ws).await.unwrap();
    assert_matches!(frame, Frame::Res(res) => {
        assert_eq!(res.id.as_str(), "bad-1");
        assert_eq!(res.error.unwrap().code, "INVALID_REQUEST");
    });
    let _ = server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_connections_1001() {
    let server = boot_default().await;
    let mut ws = raw_handshake(&server).await;
    assert_eq!(server.broadcast().connection_count().await, 1);

    let shutdown = tokio::spawn(server.shutdown());
    assert_eq!(expect_close(&mut ws).await, 1001);
    assert!(shutdown.await.unwrap());
}

#[tokio::test]
async fn health_over_http() {
    let server = boot_default().await;
    let (client, _rx) = connect(&server).await;
    let _ = create_session(&client, "main").await;

    let mut stream = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();
    let request = format!(
        "GET /health HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        server.local_addr()
    );
    tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes())
        .await
        .unwrap();
    let mut body = String::new();
    let _ = tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut body)
        .await
        .unwrap();
    let json_start = body.find('{').unwrap();
    let parsed: Value = serde_json::from_str(body[json_start..].trim()).unwrap();
    assert_eq!(parsed["status"], "ok");
    assert_eq!(parsed["connections"], 1);
    assert_eq!(parsed["active_sessions"], 1);

    client.stop();
    let _ = server.shutdown().await;
}
