//! Connection acceptance and lifetime management.
//!
//! The coordinator owns the listening socket, mints connection ids, wires a
//! client leg to a server leg per accepted session, tracks the connection
//! table, and drives graceful shutdown: stop accepting, close every client
//! with a normal-closure code, and let per-connection vaults drop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use event_log::{EventSink, SecurityEvent, SecurityEventKind};
use message_sanitizer::{FilterSet, Sanitizer};
use rate_guard::RateLimiter;
use secret_vault::{SecretVault, VaultCipher, VaultConfig};

use crate::client_leg::{ClientLeg, ClientLegConfig, ConnectionStats};
use crate::server_leg::ServerLegConfig;

/// Proxy-level settings consumed by the coordinator.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// WebSocket URL of the downstream MCP server.
    pub mcp_server_url: String,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub max_queue_size: usize,
    /// Client handshake timeout.
    pub connection_timeout: Duration,
    pub auto_reconnect: bool,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_attempts: u32,
    /// Enables secret substitution on the client-to-server path.
    pub secret_protection: bool,
    pub strict_mode: bool,
}

/// One row of the connection table.
pub struct ConnectionRecord {
    pub connection_id: String,
    pub remote_addr: SocketAddr,
    pub opened_at: Instant,
    pub stats: Arc<ConnectionStats>,
}

/// Accepts sessions and couples the two legs of each connection.
pub struct ProxyCoordinator {
    config: ProxyConfig,
    filters: Arc<FilterSet>,
    vault_config: VaultConfig,
    cipher: Option<VaultCipher>,
    limiter: Arc<RateLimiter>,
    events: EventSink,
    connections: Arc<Mutex<HashMap<String, ConnectionRecord>>>,
    next_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyCoordinator {
    pub fn new(
        config: ProxyConfig,
        filters: Arc<FilterSet>,
        vault_config: VaultConfig,
        cipher: Option<VaultCipher>,
        limiter: Arc<RateLimiter>,
        events: EventSink,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            filters,
            vault_config,
            cipher,
            limiter,
            events,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "proxy listening");
        self.serve(listener).await
    }

    /// Serve an already-bound listener until shutdown is signalled.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = accepted?;
                    self.handle_accept(stream, remote_addr);
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signalled, closing listener");
                    break;
                }
            }
        }

        // The listener drops here; connections close via the broadcast.
        self.drain_connections(Duration::from_secs(5)).await;
        Ok(())
    }

    /// Number of live connections.
    pub fn active_connections(&self) -> usize {
        self.connections.lock().expect("connection table poisoned").len()
    }

    fn handle_accept(&self, stream: TcpStream, remote_addr: SocketAddr) {
        let active = self.active_connections();
        if active >= self.config.max_connections {
            warn!(
                %remote_addr,
                active,
                limit = self.config.max_connections,
                "connection limit reached, rejecting"
            );
            self.events.try_log(SecurityEvent::new(
                SecurityEventKind::ConnectionRejected,
                serde_json::json!({
                    "remote_addr": remote_addr.to_string(),
                    "active_connections": active,
                }),
            ));
            tokio::spawn(reject_connection(stream));
            return;
        }

        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let connection_id = format!("conn-{n}");

        // Per-connection vault over the shared process cipher, with its own
        // expiry sweep that dies with the vault.
        let vault = SecretVault::new(
            self.vault_config.clone(),
            self.cipher.clone(),
            self.events.clone(),
        );
        let _ = vault.spawn_sweeper();

        let sanitizer = Arc::new(Sanitizer::new(
            Arc::clone(&self.filters),
            vault,
            self.events.clone(),
            connection_id.clone(),
            self.config.strict_mode,
            self.config.secret_protection,
        ));

        let stats = Arc::new(ConnectionStats::default());
        let leg = ClientLeg::new(
            connection_id.clone(),
            remote_addr,
            ClientLegConfig {
                handshake_timeout: self.config.connection_timeout,
                max_message_size: self.config.max_message_size,
            },
            sanitizer,
            Arc::clone(&self.limiter),
            self.events.clone(),
            Arc::clone(&stats),
        );

        let server_config = ServerLegConfig {
            url: self.config.mcp_server_url.clone(),
            max_queue_size: self.config.max_queue_size,
            auto_reconnect: self.config.auto_reconnect,
            reconnect_initial_delay: self.config.reconnect_initial_delay,
            reconnect_max_attempts: self.config.reconnect_max_attempts,
        };

        self.connections
            .lock()
            .expect("connection table poisoned")
            .insert(
                connection_id.clone(),
                ConnectionRecord {
                    connection_id: connection_id.clone(),
                    remote_addr,
                    opened_at: Instant::now(),
                    stats: Arc::clone(&stats),
                },
            );

        self.events.try_log(
            SecurityEvent::new(
                SecurityEventKind::ConnectionOpened,
                serde_json::json!({"remote_addr": remote_addr.to_string()}),
            )
            .with_connection(&connection_id),
        );

        let connections = Arc::clone(&self.connections);
        let events = self.events.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if let Err(err) = leg.run(stream, server_config, shutdown_rx).await {
                warn!(connection = %connection_id, %err, "connection ended with error");
            }

            let record = connections
                .lock()
                .expect("connection table poisoned")
                .remove(&connection_id);

            let details = match record {
                Some(record) => serde_json::json!({
                    "messages_in": record.stats.messages_in.load(Ordering::Relaxed),
                    "messages_out": record.stats.messages_out.load(Ordering::Relaxed),
                    "violations": record.stats.violations.load(Ordering::Relaxed),
                    "duration_secs": record.opened_at.elapsed().as_secs(),
                }),
                None => serde_json::json!({}),
            };
            events.try_log(
                SecurityEvent::new(SecurityEventKind::ConnectionClosed, details)
                    .with_connection(&connection_id),
            );
        });
    }

    async fn drain_connections(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.active_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.active_connections();
        if remaining > 0 {
            warn!(remaining, "connections still open after drain timeout");
        } else {
            info!("all connections drained");
        }
    }
}

/// Complete the handshake, then close immediately with a policy-violation
/// code so the client learns why it was turned away.
async fn reject_connection(stream: TcpStream) {
    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
        let _ = ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "maximum connections reached".into(),
            })))
            .await;
        let _ = ws.close(None).await;
    }
}
