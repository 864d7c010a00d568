//! Reconnecting gateway client.
//!
//! A single driver task owns the socket. Callers talk to it over an mpsc
//! command channel; each request carries a oneshot for its reply. While
//! the client is between connections, commands simply wait in the channel,
//! so requests issued before `helloOk` (or during a reconnect) are sent
//! once a connection is up. Each request's deadline runs from the moment
//! it is issued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_core::backoff::Backoff;
use relay_core::ids::{ConnectionId, RequestId};
use relay_core::protocol::{CloseCode, Frame, HelloOk, RequestFrame};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ClientError, Result};
use crate::observer::{ClientObserver, NoopObserver};
use crate::options::ClientOptions;
use crate::pending::{PendingRequests, Reply};
use crate::sequencer::{EventSequencer, SeqDecision};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Requests that may wait for a connection before callers block on send.
const COMMAND_BUFFER: usize = 256;

/// Close code reported when the socket drops without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Observable connection state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// Not started.
    Idle,
    /// Opening a socket.
    Connecting {
        /// Reconnect attempts consumed so far.
        attempt: u32,
    },
    /// `hello` sent, waiting for `helloOk`.
    Authenticating {
        /// Reconnect attempts consumed so far.
        attempt: u32,
    },
    /// Handshake complete.
    Connected {
        /// Negotiated protocol version.
        protocol_version: u32,
        /// Server-assigned connection ID.
        connection_id: ConnectionId,
    },
    /// Waiting out a backoff delay.
    Reconnecting {
        /// Attempt about to be made.
        attempt: u32,
        /// Delay before it.
        delay_ms: u64,
    },
    /// Stop requested; the close frame is being sent.
    Closing,
    /// Stopped by the caller.
    Stopped,
    /// Gave up; see [`GatewayClient::terminal_error`].
    Failed(String),
}

impl ClientState {
    /// Whether requests are flowing.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

enum Command {
    Request { frame: RequestFrame, reply: Reply },
    Cancel(RequestId),
}

/// Why a connection (or connection attempt) ended.
#[derive(Debug)]
enum Disconnect {
    Stopped,
    Closed { code: CloseCode, reason: String },
    Lost(String),
    Fatal(ClientError),
}

struct Shared {
    options: ClientOptions,
    observer: Arc<dyn ClientObserver>,
    state: watch::Sender<ClientState>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    stopped: AtomicBool,
    cancel: CancellationToken,
    terminal: Mutex<Option<ClientError>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn set_state(&self, state: ClientState) {
        let _ = self.state.send_replace(state);
    }

    /// Error for callers once the driver is gone.
    fn closed_error(&self) -> ClientError {
        self.terminal.lock().clone().unwrap_or(ClientError::Stopped)
    }
}

/// Handle to a gateway connection. Cheap to clone; all clones share one
/// socket. Call [`stop`](Self::stop) to end the driver task.
#[derive(Clone)]
pub struct GatewayClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient").finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Client without callbacks.
    pub fn new(options: ClientOptions) -> Result<Self> {
        Self::with_observer(options, Arc::new(NoopObserver))
    }

    /// Client reporting lifecycle callbacks to `observer`.
    pub fn with_observer(options: ClientOptions, observer: Arc<dyn ClientObserver>) -> Result<Self> {
        options.validate()?;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state, _) = watch::channel(ClientState::Idle);
        Ok(Self {
            shared: Arc::new(Shared {
                options,
                observer,
                state,
                commands_tx,
                commands_rx: Mutex::new(Some(commands_rx)),
                stopped: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                terminal: Mutex::new(None),
                driver: Mutex::new(None),
            }),
        })
    }

    /// Begin connecting in the background. Repeated calls are no-ops.
    pub fn start(&self) {
        if self.shared.stopped.load(Ordering::Acquire) {
            return;
        }
        let Some(commands) = self.shared.commands_rx.lock().take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(drive(shared, commands));
        *self.shared.driver.lock() = Some(handle);
    }

    /// Stop for good: close the socket and fail outstanding requests with
    /// [`ClientError::Stopped`]. Idempotent, and safe before `start`.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel.cancel();
        // Never started: nobody else will drain the queue.
        if let Some(mut commands) = self.shared.commands_rx.lock().take() {
            reject_queued(&mut commands, &ClientError::Stopped);
            self.shared.set_state(ClientState::Stopped);
        }
    }

    /// Wait for the driver task to exit.
    pub async fn join(&self) {
        let handle = self.shared.driver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        self.shared.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// The error that ended the client, if it gave up.
    pub fn terminal_error(&self) -> Option<ClientError> {
        self.shared.terminal.lock().clone()
    }

    /// Block until connected, stopped, failed, or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let wait = async {
            loop {
                match &*rx.borrow_and_update() {
                    ClientState::Connected { .. } => return Ok(()),
                    ClientState::Stopped | ClientState::Failed(_) => {
                        return Err(self.shared.closed_error());
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(self.shared.closed_error());
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or_else(|_| Err(ClientError::ConnectionLost("timed out waiting for connection".into())))
    }

    /// Call `method` with the default timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_timeout(method, params, self.shared.options.request_timeout)
            .await
    }

    /// Call `method` and deserialize the result.
    pub async fn request_as<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call `method`, failing with [`ClientError::RequestTimeout`] after
    /// `timeout`. A timeout fails only this request; a late response is
    /// discarded.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(ClientError::Stopped);
        }
        if let Some(err) = self.terminal_error() {
            return Err(err);
        }

        let id = RequestId::new();
        let timeout_ms = timeout.as_millis() as u64;
        let (reply, rx) = oneshot::channel();
        let frame = RequestFrame {
            id: id.clone(),
            method: method.to_owned(),
            params,
            timeout_ms: Some(timeout_ms),
        };

        let exchange = async {
            self.shared
                .commands_tx
                .send(Command::Request { frame, reply })
                .await
                .map_err(|_| self.shared.closed_error())?;
            rx.await.map_err(|_| self.shared.closed_error())?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                let _ = self.shared.commands_tx.try_send(Command::Cancel(id));
                Err(ClientError::RequestTimeout {
                    method: method.to_owned(),
                    timeout_ms,
                })
            }
        }
    }
}

fn reject_queued(commands: &mut mpsc::Receiver<Command>, err: &ClientError) {
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let Command::Request { reply, .. } = command {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────

async fn drive(shared: Arc<Shared>, mut commands: mpsc::Receiver<Command>) {
    let mut backoff = Backoff::new(shared.options.reconnect.clone());
    let mut sequencer = EventSequencer::new();

    let terminal = loop {
        shared.set_state(ClientState::Connecting {
            attempt: backoff.attempts(),
        });
        let attempt = tokio::select! {
            () = shared.cancel.cancelled() => break None,
            result = connect(&shared, backoff.attempts()) => result,
        };

        let disconnect = match attempt {
            Ok((ws, hello_ok)) => {
                backoff.reset();
                sequencer.reset();
                info!(
                    url = %shared.options.url,
                    conn_id = %hello_ok.connection_id,
                    protocol = hello_ok.protocol_version,
                    "connected to gateway"
                );
                shared.set_state(ClientState::Connected {
                    protocol_version: hello_ok.protocol_version,
                    connection_id: hello_ok.connection_id.clone(),
                });
                shared.observer.on_hello_ok(&hello_ok);
                match run_connection(&shared, ws, &mut commands, &mut sequencer).await {
                    Disconnect::Lost(reason) => {
                        shared.observer.on_close(ABNORMAL_CLOSURE, &reason);
                        warn!(reason, "connection lost");
                        None
                    }
                    other => Some(other),
                }
            }
            Err(Disconnect::Lost(reason)) => {
                let err = ClientError::ConnectionLost(reason);
                debug!(error = %err, "connect attempt failed");
                shared.observer.on_connect_error(&err);
                None
            }
            Err(other) => Some(other),
        };

        match disconnect {
            Some(Disconnect::Stopped) => break None,
            Some(Disconnect::Fatal(err)) => break Some(err),
            Some(Disconnect::Closed { code, reason }) => {
                shared.observer.on_close(code.code(), &reason);
                if let Some(err) = ClientError::from_terminal_close(code, &reason) {
                    break Some(err);
                }
                warn!(code = code.code(), reason, "connection closed by server");
            }
            Some(Disconnect::Lost(_)) | None => {}
        }

        if shared.cancel.is_cancelled() {
            break None;
        }
        let Some(delay) = backoff.next_delay() else {
            break Some(ClientError::ReconnectExhausted {
                attempts: backoff.attempts(),
            });
        };
        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        shared.set_state(ClientState::Reconnecting {
            attempt: backoff.attempts(),
            delay_ms,
        });
        debug!(attempt = backoff.attempts(), delay_ms, "scheduling reconnect");
        tokio::select! {
            () = shared.cancel.cancelled() => break None,
            () = tokio::time::sleep(delay) => {}
        }
    };

    match terminal {
        Some(err) => {
            error!(error = %err, "gateway client giving up");
            *shared.terminal.lock() = Some(err.clone());
            shared.observer.on_connect_error(&err);
            shared.set_state(ClientState::Failed(err.to_string()));
            reject_queued(&mut commands, &err);
        }
        None => {
            shared.set_state(ClientState::Stopped);
            reject_queued(&mut commands, &ClientError::Stopped);
        }
    }
}

/// Open a socket and complete the handshake within the handshake timeout.
async fn connect(
    shared: &Shared,
    attempt: u32,
) -> std::result::Result<(WsStream, HelloOk), Disconnect> {
    let options = &shared.options;
    let handshake = async {
        let (mut ws, _) = connect_async(options.url.as_str())
            .await
            .map_err(|e| Disconnect::Lost(format!("connect failed: {e}")))?;

        let hello = Frame::Hello(options.hello())
            .to_json()
            .map_err(|e| Disconnect::Fatal(ClientError::Serialization(e.to_string())))?;
        ws.send(Message::Text(hello.into()))
            .await
            .map_err(|e| Disconnect::Lost(e.to_string()))?;
        shared.set_state(ClientState::Authenticating { attempt });

        loop {
            match ws.next().await {
                None => return Err(Disconnect::Lost("closed during handshake".into())),
                Some(Err(e)) => return Err(Disconnect::Lost(e.to_string())),
                Some(Ok(Message::Text(text))) => {
                    return match Frame::parse(&text) {
                        Ok(Frame::HelloOk(ok)) => {
                            if ok.protocol_version < options.min_protocol
                                || ok.protocol_version > options.max_protocol
                            {
                                return Err(Disconnect::Fatal(ClientError::Protocol(format!(
                                    "server chose unsupported protocol {}",
                                    ok.protocol_version
                                ))));
                            }
                            Ok((ws, ok))
                        }
                        Ok(other) => Err(Disconnect::Fatal(ClientError::Protocol(format!(
                            "expected helloOk, got {}",
                            other.kind()
                        )))),
                        Err(e) => Err(Disconnect::Fatal(ClientError::Protocol(e.to_string()))),
                    };
                }
                Some(Ok(Message::Close(frame))) => return Err(closed(frame)),
                Some(Ok(_)) => {}
            }
        }
    };

    tokio::time::timeout(options.handshake_timeout, handshake)
        .await
        .unwrap_or_else(|_| Err(Disconnect::Lost("handshake timed out".into())))
}

/// Pump one established connection until it ends.
async fn run_connection(
    shared: &Shared,
    ws: WsStream,
    commands: &mut mpsc::Receiver<Command>,
    sequencer: &mut EventSequencer,
) -> Disconnect {
    let (mut sink, mut stream) = ws.split();
    let mut pending = PendingRequests::default();

    let disconnect = loop {
        tokio::select! {
            () = shared.cancel.cancelled() => {
                shared.set_state(ClientState::Closing);
                let frame = CloseFrame {
                    code: CloseCode::Normal.code().into(),
                    reason: "client stopped".into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break Disconnect::Stopped;
            }
            command = commands.recv() => {
                match command {
                    None => break Disconnect::Stopped,
                    Some(Command::Cancel(id)) => {
                        let _ = pending.cancel(id.as_str());
                    }
                    Some(Command::Request { frame, reply }) => {
                        // Timed out while queued.
                        if reply.is_closed() {
                            continue;
                        }
                        let id = frame.id.clone();
                        let method = frame.method.clone();
                        let text = match Frame::Req(frame).to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                let _ = reply.send(Err(ClientError::Serialization(e.to_string())));
                                continue;
                            }
                        };
                        pending.insert(id, method, reply);
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            break Disconnect::Lost(e.to_string());
                        }
                    }
                }
            }
            message = stream.next() => {
                match message {
                    None => break Disconnect::Lost("connection closed".into()),
                    Some(Err(e)) => break Disconnect::Lost(e.to_string()),
                    Some(Ok(Message::Text(text))) => {
                        handle_text(shared, &text, &mut pending, sequencer);
                    }
                    Some(Ok(Message::Close(frame))) => break closed(frame),
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    let err = match &disconnect {
        Disconnect::Stopped => ClientError::Stopped,
        Disconnect::Closed { code, reason } => {
            ClientError::ConnectionLost(format!("closed ({}): {reason}", code.code()))
        }
        Disconnect::Lost(reason) => ClientError::ConnectionLost(reason.clone()),
        Disconnect::Fatal(err) => err.clone(),
    };
    let rejected = pending.reject_all(&err);
    if rejected > 0 {
        debug!(rejected, "failed in-flight requests");
    }
    disconnect
}

fn handle_text(
    shared: &Shared,
    text: &str,
    pending: &mut PendingRequests,
    sequencer: &mut EventSequencer,
) {
    match Frame::parse(text) {
        Ok(Frame::Res(response)) => {
            let _ = pending.resolve(response);
        }
        Ok(Frame::Event(event)) => match sequencer.observe(event.seq) {
            SeqDecision::Deliver => shared.observer.on_event(&event),
            SeqDecision::DeliverWithGap(gap) => {
                warn!(expected = gap.expected, received = gap.received, "event sequence gap");
                shared.observer.on_gap(gap);
                shared.observer.on_event(&event);
            }
            SeqDecision::Drop => debug!(seq = event.seq, "dropping duplicate event"),
        },
        Ok(other) => debug!(kind = other.kind(), "ignoring unexpected frame"),
        Err(e) => warn!(error = %e, "ignoring malformed frame"),
    }
}

fn closed(frame: Option<CloseFrame>) -> Disconnect {
    match frame {
        Some(frame) => Disconnect::Closed {
            code: CloseCode::from(u16::from(frame.code)),
            reason: frame.reason.as_str().to_owned(),
        },
        None => Disconnect::Closed {
            code: CloseCode::Other(1005),
            reason: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn stop_before_start_is_safe_and_idempotent() {
        let client = GatewayClient::new(ClientOptions::new("ws://127.0.0.1:9/ws")).unwrap();
        client.stop();
        client.stop();
        client.start();
        assert_eq!(client.state(), ClientState::Stopped);
        assert_matches!(client.request("system.ping", None).await, Err(ClientError::Stopped));
        client.join().await;
    }

    #[tokio::test]
    async fn invalid_options_rejected() {
        let opts = ClientOptions::new("ws://h/ws").with_token("a").with_password("b");
        assert_matches!(GatewayClient::new(opts), Err(ClientError::InvalidConfig(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_while_queued() {
        let client = GatewayClient::new(ClientOptions::new("ws://127.0.0.1:9/ws")).unwrap();
        let err = client
            .request_with_timeout("system.ping", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_matches!(err, ClientError::RequestTimeout { timeout_ms: 50, .. });
        client.stop();
    }

    #[test]
    fn missing_close_frame_maps_to_no_status() {
        assert_matches!(
            closed(None),
            Disconnect::Closed { code: CloseCode::Other(1005), .. }
        );
    }
}
