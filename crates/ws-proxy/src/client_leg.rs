//! Inbound session from an untrusted client.
//!
//! One client leg runs per accepted WebSocket connection. In the forwarding
//! state every text frame goes through the same pipeline: decode -> JSON
//! parse -> JSON-RPC validation -> rate-limit admission -> sanitization ->
//! forward to the server leg. Failures at any stage produce a JSON-RPC
//! error reply and preserve the connection. Messages arriving from the
//! server leg are sanitized (server-to-client) and delivered to the client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use event_log::{EventSink, SecurityEvent, SecurityEventKind};
use message_sanitizer::{Direction, Sanitizer};
use rate_guard::RateLimiter;

use crate::jsonrpc;
use crate::server_leg::{ServerEvent, ServerLeg, ServerLegConfig};

type ClientWs = WebSocketStream<TcpStream>;
type ClientSink = SplitSink<ClientWs, Message>;

/// Configuration for one inbound leg.
#[derive(Debug, Clone)]
pub struct ClientLegConfig {
    pub handshake_timeout: Duration,
    /// Raw frame size gate, applied before parsing.
    pub max_message_size: usize,
}

/// Per-connection counters, shared with the coordinator's connection table.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub violations: AtomicU64,
}

/// The inbound half of one proxied connection.
pub struct ClientLeg {
    connection_id: String,
    remote_addr: SocketAddr,
    config: ClientLegConfig,
    sanitizer: Arc<Sanitizer>,
    limiter: Arc<RateLimiter>,
    events: EventSink,
    stats: Arc<ConnectionStats>,
}

impl ClientLeg {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: impl Into<String>,
        remote_addr: SocketAddr,
        config: ClientLegConfig,
        sanitizer: Arc<Sanitizer>,
        limiter: Arc<RateLimiter>,
        events: EventSink,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            remote_addr,
            config,
            sanitizer,
            limiter,
            events,
            stats,
        }
    }

    /// Drive the connection from handshake to teardown.
    ///
    /// Messages are handled strictly one at a time per direction, so a
    /// message is forwarded or dropped before the next one is examined.
    pub async fn run(
        self,
        stream: TcpStream,
        server_config: ServerLegConfig,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        // Accepted -> Handshaking, with a bounded timeout.
        let ws = tokio::time::timeout(
            self.config.handshake_timeout,
            tokio_tungstenite::accept_async(stream),
        )
        .await
        .map_err(|_| anyhow::anyhow!("client handshake timed out"))??;

        info!(
            connection = %self.connection_id,
            remote = %self.remote_addr,
            "client connected"
        );

        // Wire the outbound leg; it starts connecting immediately.
        let (server_leg, mut server_events) =
            ServerLeg::spawn(server_config, Arc::clone(&self.sanitizer));

        let (mut sink, mut frames) = ws.split();

        // Forwarding state.
        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_client_text(&text, &mut sink, &server_leg).await?;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // One JSON-RPC text message per frame; binary is a
                        // parse error by contract.
                        self.stats.messages_in.fetch_add(1, Ordering::Relaxed);
                        reply(&mut sink, &jsonrpc::parse_error()).await?;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %self.connection_id, "client closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(connection = %self.connection_id, %err, "client read error");
                        break;
                    }
                },

                event = server_events.recv() => match event {
                    Some(ServerEvent::Connected) => {
                        debug!(connection = %self.connection_id, "server leg connected");
                    }
                    Some(ServerEvent::Message(value)) => {
                        self.handle_server_message(value, &mut sink).await?;
                    }
                    Some(ServerEvent::Closed) | None => {
                        warn!(
                            connection = %self.connection_id,
                            "downstream unavailable, tearing down"
                        );
                        let _ = reply(&mut sink, &jsonrpc::server_unavailable(Value::Null)).await;
                        break;
                    }
                },

                _ = shutdown.recv() => {
                    info!(connection = %self.connection_id, "shutdown, closing client");
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "proxy shutting down".into(),
                        })))
                        .await;
                    break;
                }
            }
        }

        // Closing -> Closed.
        server_leg.close();
        self.sanitizer.cleanup();

        info!(connection = %self.connection_id, "connection closed");
        Ok(())
    }

    /// The per-frame pipeline for client-originated text.
    async fn handle_client_text(
        &self,
        text: &str,
        sink: &mut ClientSink,
        server_leg: &ServerLeg,
    ) -> anyhow::Result<()> {
        self.stats.messages_in.fetch_add(1, Ordering::Relaxed);

        if text.len() > self.config.max_message_size {
            warn!(
                connection = %self.connection_id,
                size = text.len(),
                "oversized frame rejected"
            );
            reply(sink, &jsonrpc::invalid_request(Value::Null)).await?;
            return Ok(());
        }

        let parsed: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                debug!(connection = %self.connection_id, %err, "client sent invalid JSON");
                reply(sink, &jsonrpc::parse_error()).await?;
                return Ok(());
            }
        };

        let id = jsonrpc::id_of(&parsed);

        if let Err(violation) = jsonrpc::validate(&parsed) {
            debug!(connection = %self.connection_id, %violation, "invalid JSON-RPC message");
            reply(sink, &jsonrpc::invalid_request(id)).await?;
            return Ok(());
        }

        let method = jsonrpc::method_of(&parsed).map(str::to_string);

        if let Err(err) = self.limiter.check(&self.connection_id, method.as_deref()) {
            self.stats.violations.fetch_add(1, Ordering::Relaxed);
            self.events.try_log(
                SecurityEvent::new(
                    SecurityEventKind::RateLimitExceeded,
                    serde_json::json!({
                        "method": method,
                        "reason": err.to_string(),
                    }),
                )
                .with_connection(&self.connection_id),
            );
            reply(sink, &jsonrpc::rate_limited(id)).await?;
            return Ok(());
        }

        let outcome = match self
            .sanitizer
            .sanitize_message(&parsed, Direction::ClientToServer)
        {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(connection = %self.connection_id, %err, "unsanitizable message");
                reply(sink, &jsonrpc::invalid_request(id)).await?;
                return Ok(());
            }
        };

        if !outcome.safe {
            self.stats.violations.fetch_add(1, Ordering::Relaxed);
            self.events.try_log(
                SecurityEvent::new(
                    SecurityEventKind::SanitizationBlocked,
                    serde_json::json!({
                        "method": method,
                        "violations": outcome.violations,
                    }),
                )
                .with_connection(&self.connection_id),
            );
            reply(sink, &jsonrpc::forbidden_content(id)).await?;
            return Ok(());
        }

        if server_leg.is_closed() || !server_leg.send(&outcome.message) {
            reply(sink, &jsonrpc::server_unavailable(id)).await?;
        }
        Ok(())
    }

    /// Server-originated messages: validate, sanitize server-to-client, and
    /// deliver. Nothing on this path mines for secrets or re-substitutes.
    async fn handle_server_message(
        &self,
        value: Value,
        sink: &mut ClientSink,
    ) -> anyhow::Result<()> {
        if let Err(violation) = jsonrpc::validate(&value) {
            warn!(
                connection = %self.connection_id,
                %violation,
                "dropping invalid message from downstream"
            );
            return Ok(());
        }

        match self
            .sanitizer
            .sanitize_message(&value, Direction::ServerToClient)
        {
            Ok(outcome) => {
                if !outcome.violations.is_empty() {
                    self.stats.violations.fetch_add(1, Ordering::Relaxed);
                }
                self.stats.messages_out.fetch_add(1, Ordering::Relaxed);
                reply(sink, &outcome.message).await?;
            }
            Err(err) => {
                warn!(
                    connection = %self.connection_id,
                    %err,
                    "dropping unsanitizable message from downstream"
                );
            }
        }
        Ok(())
    }
}

async fn reply(sink: &mut ClientSink, msg: &Value) -> anyhow::Result<()> {
    let text = serde_json::to_string(msg).expect("JSON values always serialize");
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
