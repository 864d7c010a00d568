//! Client behavior against a scripted WebSocket peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use relay_client::{
    ChannelObserver, ClientError, ClientNotification, ClientOptions, ClientState, GatewayClient,
    Gap,
};
use relay_core::backoff::ReconnectPolicy;
use relay_core::ids::ConnectionId;
use relay_core::protocol::{
    ConnectionPolicy, EventFrame, Frame, HelloOk, RequestFrame, ResponseFrame, ServerInfo,
};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

type ServerWs = WebSocketStream<TcpStream>;

fn fast_reconnect(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        initial_ms: 10,
        max_ms: 50,
        factor: 2.0,
        jitter: 0.0,
        max_attempts,
    }
}

fn options(addr: std::net::SocketAddr, max_attempts: u32) -> ClientOptions {
    let mut opts = ClientOptions::new(format!("ws://{addr}/ws"));
    opts.reconnect = fast_reconnect(max_attempts);
    opts.request_timeout = Duration::from_secs(5);
    opts
}

fn hello_ok() -> HelloOk {
    HelloOk {
        protocol_version: 3,
        connection_id: ConnectionId::new(),
        capabilities: Vec::new(),
        server: ServerInfo {
            version: "test".into(),
            host: None,
        },
        policy: ConnectionPolicy {
            heartbeat_interval_ms: 30_000,
            max_payload_bytes: 1 << 20,
        },
    }
}

async fn send_frame(ws: &mut ServerWs, frame: Frame) {
    ws.send(Message::Text(frame.to_json().unwrap().into()))
        .await
        .unwrap();
}

async fn next_frame(ws: &mut ServerWs) -> Option<Frame> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return Some(Frame::parse(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Accept one socket and complete the handshake.
async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    assert_matches!(next_frame(&mut ws).await, Some(Frame::Hello(_)));
    send_frame(&mut ws, Frame::HelloOk(hello_ok())).await;
    ws
}

async fn next_request(ws: &mut ServerWs) -> RequestFrame {
    match next_frame(ws).await {
        Some(Frame::Req(req)) => req,
        other => panic!("expected request, got {other:?}"),
    }
}

async fn recv_until<F>(
    rx: &mut mpsc::UnboundedReceiver<ClientNotification>,
    mut pred: F,
) -> ClientNotification
where
    F: FnMut(&ClientNotification) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let note = rx.recv().await.unwrap();
            if pred(&note) {
                return note;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn request_response_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = next_request(&mut ws).await;
        assert_eq!(req.method, "system.ping");
        assert_eq!(req.timeout_ms, Some(5_000));
        send_frame(
            &mut ws,
            Frame::Res(ResponseFrame::success(req.id, json!({ "pong": true }))),
        )
        .await;
        let _ = next_frame(&mut ws).await;
    });

    let client = GatewayClient::new(options(addr, 3)).unwrap();
    client.start();
    let result = client.request("system.ping", None).await.unwrap();
    assert_eq!(result, json!({ "pong": true }));

    client.stop();
    client.join().await;
    assert_eq!(client.state(), ClientState::Stopped);
    server.await.unwrap();
}

#[tokio::test]
async fn request_before_hello_ok_is_queued() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_matches!(next_frame(&mut ws).await, Some(Frame::Hello(_)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        send_frame(&mut ws, Frame::HelloOk(hello_ok())).await;
        let req = next_request(&mut ws).await;
        send_frame(&mut ws, Frame::Res(ResponseFrame::success(req.id, json!("late ok")))).await;
        let _ = next_frame(&mut ws).await;
    });

    let client = GatewayClient::new(options(addr, 3)).unwrap();
    client.start();
    assert_eq!(
        client.request("system.ping", None).await.unwrap(),
        json!("late ok")
    );
    client.stop();
    server.await.unwrap();
}

#[tokio::test]
async fn authenticating_until_hello_ok() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_matches!(next_frame(&mut ws).await, Some(Frame::Hello(_)));
        go_rx.await.unwrap();
        send_frame(&mut ws, Frame::HelloOk(hello_ok())).await;
        let _ = next_frame(&mut ws).await;
    });

    let client = GatewayClient::new(options(addr, 3)).unwrap();
    let mut states = client.subscribe_state();
    client.start();
    let _ = tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| matches!(s, ClientState::Authenticating { attempt: 0 })),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!client.state().is_connected());

    go_tx.send(()).unwrap();
    client.wait_connected(Duration::from_secs(5)).await.unwrap();
    client.stop();
    client.join().await;
    assert_eq!(client.state(), ClientState::Stopped);
    server.await.unwrap();
}

#[tokio::test]
async fn error_response_surfaces_as_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let req = next_request(&mut ws).await;
        send_frame(
            &mut ws,
            Frame::Res(ResponseFrame::failure(req.id, "NOT_FOUND", "Session not found: x")),
        )
        .await;
        let _ = next_frame(&mut ws).await;
    });

    let client = GatewayClient::new(options(addr, 3)).unwrap();
    client.start();
    let err = client
        .request("session.get", Some(json!({ "sessionId": "x" })))
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Rejected { ref code, .. } if code == "NOT_FOUND");
    client.stop();
    server.await.unwrap();
}

#[tokio::test]
async fn sequence_gap_is_reported_and_event_still_delivered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        for seq in [1, 2, 4, 4] {
            send_frame(
                &mut ws,
                Frame::Event(EventFrame {
                    event: "tick".into(),
                    payload: json!({ "seq": seq }),
                    seq,
                }),
            )
            .await;
        }
        let _ = next_frame(&mut ws).await;
    });

    let (observer, mut rx) = ChannelObserver::new();
    let client = GatewayClient::with_observer(options(addr, 3), Arc::new(observer)).unwrap();
    client.start();

    let mut delivered = Vec::new();
    let mut gaps = Vec::new();
    while delivered.len() < 3 {
        match recv_until(&mut rx, |n| {
            matches!(n, ClientNotification::Event(_) | ClientNotification::Gap(_))
        })
        .await
        {
            ClientNotification::Event(event) => delivered.push(event.seq),
            ClientNotification::Gap(gap) => gaps.push(gap),
            _ => unreachable!(),
        }
    }
    assert_eq!(delivered, vec![1, 2, 4]);
    assert_eq!(
        gaps,
        vec![Gap {
            expected: 3,
            received: 4
        }]
    );

    client.stop();
    server.await.unwrap();
}

#[tokio::test]
async fn reconnects_after_retryable_close_and_resets_sequence() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        for seq in [1, 2] {
            send_frame(
                &mut first,
                Frame::Event(EventFrame {
                    event: "tick".into(),
                    payload: json!(null),
                    seq,
                }),
            )
            .await;
        }
        first
            .close(Some(CloseFrame {
                code: 1001u16.into(),
                reason: "restarting".into(),
            }))
            .await
            .unwrap();

        let mut second = accept(&listener).await;
        send_frame(
            &mut second,
            Frame::Event(EventFrame {
                event: "tick".into(),
                payload: json!(null),
                seq: 1,
            }),
        )
        .await;
        let _ = next_frame(&mut second).await;
    });

    let (observer, mut rx) = ChannelObserver::new();
    let client = GatewayClient::with_observer(options(addr, 5), Arc::new(observer)).unwrap();
    client.start();

    let close = recv_until(&mut rx, |n| matches!(n, ClientNotification::Closed { .. })).await;
    assert_matches!(close, ClientNotification::Closed { code: 1001, .. });

    let _ = recv_until(&mut rx, |n| matches!(n, ClientNotification::HelloOk(_))).await;
    // seq 1 on the new connection is delivered, not dropped as stale
    let event = recv_until(&mut rx, |n| matches!(n, ClientNotification::Event(_))).await;
    assert_matches!(event, ClientNotification::Event(e) if e.seq == 1);

    client.stop();
    server.await.unwrap();
}

#[tokio::test]
async fn in_flight_request_fails_when_connection_drops() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let _ = next_request(&mut ws).await;
        drop(ws);
        let mut again = accept(&listener).await;
        let req = next_request(&mut again).await;
        send_frame(&mut again, Frame::Res(ResponseFrame::success(req.id, json!(2)))).await;
        let _ = next_frame(&mut again).await;
    });

    let client = GatewayClient::new(options(addr, 5)).unwrap();
    client.start();
    let err = client.request("agent.wait", None).await.unwrap_err();
    assert_matches!(err, ClientError::ConnectionLost(_));

    // The connection itself recovers.
    assert_eq!(client.request("system.ping", None).await.unwrap(), json!(2));
    client.stop();
    server.await.unwrap();
}

#[tokio::test]
async fn auth_close_is_terminal_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    let _server = tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = next_frame(&mut ws).await;
            let _ = ws
                .close(Some(CloseFrame {
                    code: 4001u16.into(),
                    reason: "bad token".into(),
                }))
                .await;
        }
    });

    let client = GatewayClient::new(options(addr, 5).with_token("wrong")).unwrap();
    client.start();
    let err = client
        .wait_connected(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Auth(ref reason) if reason == "bad token");
    assert_matches!(client.state(), ClientState::Failed(_));
    assert_matches!(client.request("system.ping", None).await, Err(ClientError::Auth(_)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_hello_close_is_terminal_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    let _server = tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = next_frame(&mut ws).await;
            let _ = ws
                .close(Some(CloseFrame {
                    code: 4004u16.into(),
                    reason: "expected hello, got req".into(),
                }))
                .await;
        }
    });

    let client = GatewayClient::new(options(addr, 5)).unwrap();
    client.start();
    let err = client
        .wait_connected(Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Protocol(ref reason) if reason == "expected hello, got req");
    assert_matches!(client.state(), ClientState::Failed(_));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    // Bind then drop to get a port nobody listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (observer, mut rx) = ChannelObserver::new();
    let client = GatewayClient::with_observer(options(addr, 2), Arc::new(observer)).unwrap();
    client.start();

    let queued = {
        let client = client.clone();
        tokio::spawn(async move { client.request("system.ping", None).await })
    };

    let terminal = recv_until(&mut rx, |n| {
        matches!(
            n,
            ClientNotification::ConnectError(ClientError::ReconnectExhausted { .. })
        )
    })
    .await;
    assert_matches!(
        terminal,
        ClientNotification::ConnectError(ClientError::ReconnectExhausted { attempts: 2 })
    );
    client.join().await;
    assert_eq!(
        client.terminal_error(),
        Some(ClientError::ReconnectExhausted { attempts: 2 })
    );
    assert_matches!(
        queued.await.unwrap(),
        Err(ClientError::ReconnectExhausted { .. })
    );
}
