//! Control channel WebSocket server
//!
//! One persistent connection per client. Each connection gets its own id
//! and outbound queue; exec processes started over the connection are owned
//! by it and torn down when it goes away, terminal attachments are dropped
//! the same way.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::exec::{parse_signal, ExecSocketManager, SpawnSpec};
use crate::gateway::{PtyGatewayClient, RelayStatus};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::terminal::{ClientId, TerminalRegistry};

#[derive(Debug, Clone)]
pub struct ControlServerOptions {
    pub port: u16,
}

struct ServerContext {
    registry: Arc<TerminalRegistry>,
    gateway: Arc<PtyGatewayClient>,
    exec: Arc<ExecSocketManager>,
}

pub struct ControlServer {
    options: ControlServerOptions,
    context: Arc<ServerContext>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl ControlServer {
    pub fn new(
        options: ControlServerOptions,
        registry: Arc<TerminalRegistry>,
        gateway: Arc<PtyGatewayClient>,
        exec: Arc<ExecSocketManager>,
    ) -> Self {
        Self {
            options,
            context: Arc::new(ServerContext {
                registry,
                gateway,
                exec,
            }),
            shutdown_tx: None,
        }
    }

    /// Bind and start accepting connections. Returns the bound address.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("127.0.0.1:{}", self.options.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Control server listening");

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!(%peer, "Control connection accepted");
                                let context = Arc::clone(&context);
                                tokio::spawn(async move {
                                    handle_connection(stream, context).await;
                                });
                            }
                            Err(e) => error!(error = %e, "Control accept failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Control server stopped");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_connection(stream: TcpStream, context: Arc<ServerContext>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let client_id: ClientId = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    info!(%client_id, "Control client connected");

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                // Senders are held by this task and the exec forwarders, so
                // the channel never closes before the connection does.
                let Some(message) = outbound else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(t) => t,
                    Err(e) => {
                        error!(%client_id, error = %e, "Failed to encode server message");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => {
                                handle_message(client_id, message, &context, &out_tx).await;
                            }
                            Err(e) => {
                                debug!(%client_id, error = %e, "Unparseable client message dropped");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(%client_id, error = %e, "Control connection error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // Disconnect cleanup: drop every attachment and kill owned processes.
    context.registry.detach_all(client_id).await;
    let killed = context.exec.cleanup_for_connection(client_id).await;
    info!(%client_id, killed, "Control client disconnected");
}

async fn handle_message(
    client_id: ClientId,
    message: ClientMessage,
    context: &ServerContext,
    out_tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match message {
        ClientMessage::ExecStart { command, cwd, env } => {
            let spec = SpawnSpec {
                command,
                cwd: cwd.map(Into::into),
                env,
            };
            // Spawn failure already surfaced to the client as exec_error.
            let _ = context.exec.start(client_id, spec, out_tx.clone()).await;
        }
        ClientMessage::ExecKill { id, signal } => {
            context
                .exec
                .kill(&id, signal.as_deref().map(parse_signal))
                .await;
        }
        ClientMessage::TerminalAttach { terminal_id } => {
            context
                .registry
                .attach(&terminal_id, client_id, out_tx.clone())
                .await;
        }
        ClientMessage::TerminalDetach { terminal_id } => {
            context.registry.detach(&terminal_id, client_id).await;
        }
        ClientMessage::TerminalInput { terminal_id, data } => {
            let status = context.gateway.send_input(&terminal_id, &data).await;
            if status != RelayStatus::Delivered {
                debug!(%terminal_id, ?status, "Terminal input not relayed");
            }
        }
        ClientMessage::TerminalResize {
            terminal_id,
            cols,
            rows,
        } => {
            let status = context.gateway.resize(&terminal_id, cols, rows).await;
            if status != RelayStatus::Delivered {
                debug!(%terminal_id, ?status, "Terminal resize not relayed");
            }
        }
        ClientMessage::Ping => {
            let _ = out_tx.send(ServerMessage::Pong);
        }
    }
}
