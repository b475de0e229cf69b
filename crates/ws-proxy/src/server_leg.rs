//! Outbound session to the downstream MCP server.
//!
//! The leg owns the WebSocket to the trusted server: it connects, retries
//! with exponential backoff on unexpected closes, and queues sends while
//! disconnected. The bounded command channel IS the send queue — it is
//! sized from the configured `max_queue_size`, so that cap is the only cap:
//! a send into a full queue drops the newest message (the incoming one) and
//! logs the drop. Queued messages drain FIFO once a session is back.
//! Placeholders are re-substituted with their original secrets immediately
//! before a message leaves the trust boundary.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use message_sanitizer::Sanitizer;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration for one outbound leg.
#[derive(Debug, Clone)]
pub struct ServerLegConfig {
    /// WebSocket URL of the downstream server (`ws://...`).
    pub url: String,
    /// Capacity of the send queue used while disconnected.
    pub max_queue_size: usize,
    pub auto_reconnect: bool,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_attempts: u32,
}

/// Outbound session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLegState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// What the leg reports upward to the client leg.
#[derive(Debug)]
pub enum ServerEvent {
    /// The downstream session is (re-)established.
    Connected,
    /// A parsed message from the downstream server.
    Message(Value),
    /// Reconnect attempts are exhausted (or reconnect is disabled); the
    /// client leg should tear down.
    Closed,
}

/// Handle to the outbound session task.
pub struct ServerLeg {
    cmd_tx: mpsc::Sender<Value>,
    close: Arc<Notify>,
    state_rx: watch::Receiver<ServerLegState>,
    sanitizer: Arc<Sanitizer>,
}

impl ServerLeg {
    /// Spawn the session task. The leg starts connecting immediately.
    pub fn spawn(
        config: ServerLegConfig,
        sanitizer: Arc<Sanitizer>,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        // The command channel doubles as the bounded send queue, so the
        // configured cap is enforced at the edge rather than in a second
        // buffer behind it.
        let (cmd_tx, cmd_rx) = mpsc::channel(config.max_queue_size.max(1));
        let (event_tx, event_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ServerLegState::Idle);
        let close = Arc::new(Notify::new());

        tokio::spawn(run_leg(
            config,
            cmd_rx,
            Arc::clone(&close),
            event_tx,
            state_tx,
        ));

        (
            Self {
                cmd_tx,
                close,
                state_rx,
                sanitizer,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ServerLegState {
        *self.state_rx.borrow()
    }

    /// `true` once the leg has given up (or was explicitly closed).
    pub fn is_closed(&self) -> bool {
        self.state() == ServerLegState::Closed
    }

    /// Queue `msg` for the downstream server. Placeholders are restored to
    /// their original secrets here, on the egress edge, so the plaintext
    /// bypasses every filter and log derived from the sanitized form.
    ///
    /// When the queue is full the NEWEST message (this one) is dropped and
    /// the drop is logged; earlier queued messages keep their order.
    /// Returns `false` when the session task is gone.
    pub fn send(&self, msg: &Value) -> bool {
        let restored = self.sanitizer.resubstitute(msg);
        match self.cmd_tx.try_send(restored.message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    capacity = self.cmd_tx.max_capacity(),
                    "server send queue full, dropping newest message"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Explicit close: no reconnect is attempted.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

async fn run_leg(
    config: ServerLegConfig,
    mut cmd_rx: mpsc::Receiver<Value>,
    close: Arc<Notify>,
    event_tx: mpsc::Sender<ServerEvent>,
    state_tx: watch::Sender<ServerLegState>,
) {
    let mut attempt: u32 = 0;
    // A message that failed mid-transmit is retried first after the next
    // connect, keeping the queue's FIFO order across a connection loss.
    let mut carry: Option<Value> = None;

    loop {
        let _ = state_tx.send(ServerLegState::Connecting);

        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((ws, _)) => {
                attempt = 0;
                let _ = state_tx.send(ServerLegState::Connected);
                let _ = event_tx.send(ServerEvent::Connected).await;
                debug!(url = %config.url, "downstream connected");

                match run_session(ws, &mut carry, &mut cmd_rx, &close, &event_tx).await {
                    SessionEnd::ClosedByUs => {
                        let _ = state_tx.send(ServerLegState::Closed);
                        return;
                    }
                    SessionEnd::Lost => {
                        warn!(url = %config.url, "downstream connection lost");
                    }
                }
            }
            Err(err) => {
                warn!(url = %config.url, %err, "downstream connect failed");
            }
        }

        if !config.auto_reconnect {
            break;
        }
        attempt += 1;
        if attempt > config.reconnect_max_attempts {
            warn!(
                attempts = config.reconnect_max_attempts,
                "reconnect attempts exhausted"
            );
            break;
        }

        let delay = config.reconnect_initial_delay * 2u32.pow(attempt - 1);
        let _ = state_tx.send(ServerLegState::Reconnecting);
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        // Queued sends wait in the command channel during the backoff; only
        // an explicit close interrupts it.
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = close.notified() => {
                let _ = state_tx.send(ServerLegState::Closed);
                return;
            }
        }
    }

    let _ = state_tx.send(ServerLegState::Closed);
    let _ = event_tx.send(ServerEvent::Closed).await;
}

enum SessionEnd {
    /// Explicit `close()`; no reconnect.
    ClosedByUs,
    /// Unexpected close or transport error; reconnect applies.
    Lost,
}

async fn run_session(
    mut ws: WsStream,
    carry: &mut Option<Value>,
    cmd_rx: &mut mpsc::Receiver<Value>,
    close: &Notify,
    event_tx: &mpsc::Sender<ServerEvent>,
) -> SessionEnd {
    // Retry the message that was in flight when the last session died, so
    // it goes out before anything still queued behind it.
    if let Some(msg) = carry.take() {
        if let Err(err) = send_json(&mut ws, &msg).await {
            warn!(%err, "send failed while retrying carried message");
            *carry = Some(msg);
            return SessionEnd::Lost;
        }
    }

    loop {
        tokio::select! {
            _ = close.notified() => {
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    }))
                    .await;
                return SessionEnd::ClosedByUs;
            }
            msg = cmd_rx.recv() => match msg {
                Some(msg) => {
                    if let Err(err) = send_json(&mut ws, &msg).await {
                        warn!(%err, "downstream send failed");
                        *carry = Some(msg);
                        return SessionEnd::Lost;
                    }
                }
                // Every handle dropped; nothing more will be sent.
                None => {
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        }))
                        .await;
                    return SessionEnd::ClosedByUs;
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if event_tx.send(ServerEvent::Message(value)).await.is_err() {
                                return SessionEnd::ClosedByUs;
                            }
                        }
                        Err(err) => {
                            warn!(%err, "downstream sent invalid JSON, dropping frame");
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                Some(Ok(_)) => {
                    // Binary frames from the trusted side carry nothing we
                    // forward.
                }
                Some(Err(err)) => {
                    warn!(%err, "downstream read error");
                    return SessionEnd::Lost;
                }
            }
        }
    }
}

async fn send_json(
    ws: &mut WsStream,
    msg: &Value,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let text = serde_json::to_string(msg).expect("JSON values always serialize");
    ws.send(Message::Text(text.into())).await
}
