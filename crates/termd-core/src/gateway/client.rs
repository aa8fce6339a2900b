//! Gateway client implementation
//!
//! One outbound WebSocket shared by all terminal sessions. While the
//! connection is down, per-session state is retained but frozen: relay
//! calls are dropped (and report so), never queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::protocol::{GatewayCommand, GatewayEvent};
use crate::terminal::{TerminalRegistry, TerminalSessionInfo};

/// Outcome of relaying a command to the gateway.
///
/// Callers can tell a delivered relay from one dropped while the gateway
/// connection was down, instead of guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Delivered,
    /// Gateway connection is down; the command was dropped, not queued.
    DroppedDisconnected,
    /// The referenced terminal is not registered; idempotent no-op.
    UnknownTerminal,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway is not connected")]
    Disconnected,
    #[error("gateway create request timed out after {0:?}")]
    CreateTimeout(Duration),
    #[error("gateway rejected create: {0}")]
    Rejected(String),
}

type CreateReply = Result<u32, GatewayError>;

struct GatewayShared {
    url: String,
    reconnect_delay: Duration,
    create_timeout: Duration,
    registry: Arc<TerminalRegistry>,
    connected: AtomicBool,
    /// Guards the single pending reconnect timer.
    reconnect_pending: AtomicBool,
    outbound: RwLock<Option<mpsc::UnboundedSender<GatewayCommand>>>,
    /// terminal id → waiting create caller; removed on completion or timeout.
    pending_creates: Mutex<HashMap<String, oneshot::Sender<CreateReply>>>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Client for the external PTY gateway process.
pub struct PtyGatewayClient {
    shared: Arc<GatewayShared>,
}

impl PtyGatewayClient {
    pub fn new(config: &CoreConfig, registry: Arc<TerminalRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(GatewayShared {
                url: config.gateway_url.clone(),
                reconnect_delay: config.reconnect_delay,
                create_timeout: config.create_timeout,
                registry,
                connected: AtomicBool::new(false),
                reconnect_pending: AtomicBool::new(false),
                outbound: RwLock::new(None),
                pending_creates: Mutex::new(HashMap::new()),
                shutdown_tx,
            }),
        }
    }

    /// Kick off the first connection attempt.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            Self::try_connect(shared).await;
        });
    }

    /// Stop the connection and cancel any pending reconnect timer.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(());
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Create a PTY session on the gateway.
    ///
    /// Correlated by a client-generated terminal id; resolves on `created`,
    /// fails on `error`, disconnect, or timeout — nothing is registered in
    /// the failure cases. On success an `attach` directive is issued right
    /// away so the gateway starts forwarding output.
    pub async fn create(
        &self,
        cwd: &str,
        cols: u16,
        rows: u16,
        owner_id: Option<String>,
    ) -> Result<TerminalSessionInfo, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::Disconnected);
        }

        let terminal_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending_creates
            .lock()
            .await
            .insert(terminal_id.clone(), reply_tx);

        let status = self
            .send_command(GatewayCommand::Create {
                terminal_id: terminal_id.clone(),
                cwd: cwd.to_string(),
                cols,
                rows,
            })
            .await;
        if status != RelayStatus::Delivered {
            self.shared.pending_creates.lock().await.remove(&terminal_id);
            return Err(GatewayError::Disconnected);
        }

        let reply = tokio::time::timeout(self.shared.create_timeout, reply_rx).await;
        match reply {
            Ok(Ok(Ok(pid))) => {
                let info = TerminalSessionInfo {
                    id: terminal_id,
                    cwd: cwd.to_string(),
                    pid,
                    created_at: chrono::Utc::now().timestamp_millis(),
                    owner_id,
                };
                // Register before attaching: the gateway replays buffered
                // history right after an attach, and that replay must find
                // the session or it gets dropped as unknown.
                self.shared.registry.insert(info.clone()).await;
                self.send_command(GatewayCommand::Attach {
                    terminal_id: info.id.clone(),
                })
                .await;
                info!(terminal_id = %info.id, pid, "PTY session created");
                Ok(info)
            }
            Ok(Ok(Err(e))) => Err(e),
            // Sender dropped without reply: connection torn down mid-flight.
            Ok(Err(_)) => Err(GatewayError::Disconnected),
            Err(_) => {
                self.shared.pending_creates.lock().await.remove(&terminal_id);
                warn!(%terminal_id, "Gateway create request timed out");
                Err(GatewayError::CreateTimeout(self.shared.create_timeout))
            }
        }
    }

    /// Relay input to a terminal. Unknown ids are ignored.
    pub async fn send_input(&self, terminal_id: &str, data: &str) -> RelayStatus {
        if !self.shared.registry.contains(terminal_id).await {
            return RelayStatus::UnknownTerminal;
        }
        self.send_command(GatewayCommand::Input {
            terminal_id: terminal_id.to_string(),
            data: data.to_string(),
        })
        .await
    }

    /// Relay a resize to a terminal. Unknown ids are ignored.
    pub async fn resize(&self, terminal_id: &str, cols: u16, rows: u16) -> RelayStatus {
        if !self.shared.registry.contains(terminal_id).await {
            return RelayStatus::UnknownTerminal;
        }
        self.send_command(GatewayCommand::Resize {
            terminal_id: terminal_id.to_string(),
            cols,
            rows,
        })
        .await
    }

    /// Relay a kill to a terminal. The session is removed when the gateway
    /// reports its exit. Unknown ids are ignored.
    pub async fn kill(&self, terminal_id: &str) -> RelayStatus {
        if !self.shared.registry.contains(terminal_id).await {
            return RelayStatus::UnknownTerminal;
        }
        self.send_command(GatewayCommand::Kill {
            terminal_id: terminal_id.to_string(),
        })
        .await
    }

    async fn send_command(&self, command: GatewayCommand) -> RelayStatus {
        let outbound = self.shared.outbound.read().await;
        match outbound.as_ref() {
            Some(tx) if self.is_connected() => {
                if tx.send(command).is_ok() {
                    RelayStatus::Delivered
                } else {
                    RelayStatus::DroppedDisconnected
                }
            }
            _ => {
                debug!("Gateway disconnected, command dropped");
                RelayStatus::DroppedDisconnected
            }
        }
    }

    async fn try_connect(shared: Arc<GatewayShared>) {
        match connect_async(&shared.url).await {
            Ok((ws_stream, _)) => {
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                *shared.outbound.write().await = Some(cmd_tx.clone());
                shared.connected.store(true, Ordering::SeqCst);
                info!(url = %shared.url, "Connected to PTY gateway");

                // Sessions surviving an outage stay frozen until the gateway
                // gets a fresh attach; without one it never forwards output
                // on the new connection.
                for session in shared.registry.list().await {
                    debug!(terminal_id = %session.id, "Re-attaching session after reconnect");
                    let _ = cmd_tx.send(GatewayCommand::Attach {
                        terminal_id: session.id,
                    });
                }

                tokio::spawn(async move {
                    Self::connection_loop(shared, ws_stream, cmd_rx).await;
                });
            }
            Err(e) => {
                warn!(url = %shared.url, error = %e, "Gateway connection failed");
                Self::schedule_reconnect(&shared);
            }
        }
    }

    async fn connection_loop(
        shared: Arc<GatewayShared>,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        mut cmd_rx: mpsc::UnboundedReceiver<GatewayCommand>,
    ) {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        let mut shutting_down = false;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let text = match serde_json::to_string(&cmd) {
                        Ok(t) => t,
                        Err(e) => {
                            error!(error = %e, "Failed to encode gateway command");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }

                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<GatewayEvent>(&text) {
                                Ok(event) => Self::dispatch(&shared, event).await,
                                Err(e) => debug!(error = %e, "Unparseable gateway message dropped"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            error!(error = %e, "Gateway WebSocket error");
                            break;
                        }
                        _ => {}
                    }
                }

                _ = shutdown_rx.recv() => {
                    shutting_down = true;
                    break;
                }
            }
        }

        shared.connected.store(false, Ordering::SeqCst);
        *shared.outbound.write().await = None;
        Self::fail_pending(&shared).await;

        if shutting_down {
            info!("Gateway client shut down");
        } else {
            warn!("Gateway connection lost");
            Self::schedule_reconnect(&shared);
        }
    }

    /// Schedule one reconnect attempt after the configured delay.
    ///
    /// Returns false when a timer is already pending (the call is a no-op).
    fn schedule_reconnect(shared: &Arc<GatewayShared>) -> bool {
        if shared
            .reconnect_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        debug!(delay = ?shared.reconnect_delay, "Reconnect scheduled");
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let mut shutdown_rx = shared.shutdown_tx.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(shared.reconnect_delay) => {
                    shared.reconnect_pending.store(false, Ordering::SeqCst);
                    Self::try_connect(shared).await;
                }
                _ = shutdown_rx.recv() => {
                    shared.reconnect_pending.store(false, Ordering::SeqCst);
                }
            }
        });
        true
    }

    /// Route an inbound gateway event. Stale or unknown terminal ids are
    /// dropped silently by the registry.
    async fn dispatch(shared: &Arc<GatewayShared>, event: GatewayEvent) {
        match event {
            GatewayEvent::Created { terminal_id, pid } => {
                match shared.pending_creates.lock().await.remove(&terminal_id) {
                    Some(reply) => {
                        let _ = reply.send(Ok(pid));
                    }
                    None => debug!(%terminal_id, "Stale created response dropped"),
                }
            }
            GatewayEvent::Error {
                terminal_id: Some(terminal_id),
                message,
            } => match shared.pending_creates.lock().await.remove(&terminal_id) {
                Some(reply) => {
                    let _ = reply.send(Err(GatewayError::Rejected(message)));
                }
                None => warn!(%terminal_id, %message, "Gateway error for unknown terminal"),
            },
            GatewayEvent::Error {
                terminal_id: None,
                message,
            } => {
                warn!(%message, "Gateway error");
            }
            GatewayEvent::Output { terminal_id, data }
            | GatewayEvent::Buffer { terminal_id, data } => {
                shared.registry.handle_output(&terminal_id, &data).await;
            }
            GatewayEvent::Exit { terminal_id, code } => {
                shared.registry.handle_exit(&terminal_id, code).await;
            }
            GatewayEvent::ErrorDetected {
                terminal_id,
                context,
            } => {
                shared
                    .registry
                    .handle_gateway_error(&terminal_id, context)
                    .await;
            }
            GatewayEvent::Attached { terminal_id } => {
                debug!(%terminal_id, "Gateway attach acknowledged");
            }
            GatewayEvent::Pong => {}
        }
    }

    async fn fail_pending(shared: &Arc<GatewayShared>) {
        let mut pending = shared.pending_creates.lock().await;
        for (terminal_id, reply) in pending.drain() {
            debug!(%terminal_id, "Failing pending create on disconnect");
            let _ = reply.send(Err(GatewayError::Disconnected));
        }
    }
}
