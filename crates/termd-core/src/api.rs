//! Composition facade
//!
//! `TerminalCore` wires the gateway client, terminal registry and both exec
//! managers together and exposes the operations embedders call directly,
//! without going through the control channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::CoreConfig;
use crate::exec::{ExecProcessInfo, ExecSocketManager, ExecStreamManager, SpawnSpec};
use crate::gateway::{GatewayError, PtyGatewayClient, RelayStatus};
use crate::protocol::{ExecEvent, ServerMessage};
use crate::terminal::{ClientId, TerminalRegistry, TerminalSessionInfo};

pub struct TerminalCore {
    config: CoreConfig,
    registry: Arc<TerminalRegistry>,
    gateway: Arc<PtyGatewayClient>,
    exec_stream: Arc<ExecStreamManager>,
    exec_socket: Arc<ExecSocketManager>,
}

impl TerminalCore {
    pub fn new(config: CoreConfig) -> Self {
        let registry = Arc::new(TerminalRegistry::new(
            config.buffer_capacity,
            config.replay_lines,
        ));
        let gateway = Arc::new(PtyGatewayClient::new(&config, Arc::clone(&registry)));
        let exec_stream = Arc::new(ExecStreamManager::new(config.kill_grace));
        let exec_socket = Arc::new(ExecSocketManager::new(config.kill_grace));
        Self {
            config,
            registry,
            gateway,
            exec_stream,
            exec_socket,
        }
    }

    /// Start the gateway connection. Exec managers need no startup.
    pub fn start(&self) {
        info!("Terminal core starting");
        self.gateway.start();
    }

    pub fn shutdown(&self) {
        self.gateway.shutdown();
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<TerminalRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn gateway(&self) -> Arc<PtyGatewayClient> {
        Arc::clone(&self.gateway)
    }

    pub fn exec_stream(&self) -> Arc<ExecStreamManager> {
        Arc::clone(&self.exec_stream)
    }

    pub fn exec_socket(&self) -> Arc<ExecSocketManager> {
        Arc::clone(&self.exec_socket)
    }

    // ---- terminal operations ----

    /// Create a PTY session, defaulting geometry from the config.
    pub async fn create_terminal(
        &self,
        cwd: &str,
        cols: Option<u16>,
        rows: Option<u16>,
        owner_id: Option<String>,
    ) -> Result<TerminalSessionInfo, GatewayError> {
        self.gateway
            .create(
                cwd,
                cols.unwrap_or(self.config.default_cols),
                rows.unwrap_or(self.config.default_rows),
                owner_id,
            )
            .await
    }

    pub async fn list_terminals(&self) -> Vec<TerminalSessionInfo> {
        self.registry.list().await
    }

    pub async fn attach_terminal(
        &self,
        terminal_id: &str,
        client_id: ClientId,
        sink: mpsc::UnboundedSender<ServerMessage>,
    ) -> bool {
        self.registry.attach(terminal_id, client_id, sink).await
    }

    pub async fn detach_terminal(&self, terminal_id: &str, client_id: ClientId) {
        self.registry.detach(terminal_id, client_id).await;
    }

    pub async fn send_terminal_input(&self, terminal_id: &str, data: &str) -> RelayStatus {
        self.gateway.send_input(terminal_id, data).await
    }

    pub async fn resize_terminal(&self, terminal_id: &str, cols: u16, rows: u16) -> RelayStatus {
        self.gateway.resize(terminal_id, cols, rows).await
    }

    /// Relay a kill to the gateway; the session is removed once the gateway
    /// reports the exit.
    pub async fn kill_terminal(&self, terminal_id: &str) -> RelayStatus {
        self.gateway.kill(terminal_id).await
    }

    // ---- exec operations ----

    /// Spawn a command and stream its lifecycle as events.
    ///
    /// The stream always terminates: with `exit` after a successful run, or
    /// with a single `error` event when the spawn itself failed.
    pub async fn spawn_exec_stream(&self, spec: SpawnSpec) -> mpsc::UnboundedReceiver<ExecEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.exec_stream.start(spec, tx).await;
        rx
    }

    pub async fn kill_exec(&self, id: &str, signal: Option<i32>) {
        // An id lives in exactly one manager; both kills are no-ops for
        // unknown ids, so trying both is safe.
        self.exec_stream.kill(id, signal).await;
        self.exec_socket.kill(id, signal).await;
    }

    /// Snapshot of every tracked exec process across both managers.
    pub async fn list_exec(&self) -> Vec<ExecProcessInfo> {
        let mut all = self.exec_stream.list().await;
        all.extend(self.exec_socket.list().await);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn core() -> TerminalCore {
        TerminalCore::new(CoreConfig {
            kill_grace: Duration::from_millis(100),
            ..CoreConfig::default()
        })
    }

    #[tokio::test]
    async fn test_create_terminal_without_gateway_fails() {
        let core = core();
        let err = core
            .create_terminal("/tmp", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Disconnected));
        assert!(core.list_terminals().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_exec_stream_runs_to_exit() {
        let core = core();
        let mut rx = core
            .spawn_exec_stream(SpawnSpec {
                command: "echo facade".to_string(),
                ..Default::default()
            })
            .await;

        assert!(matches!(rx.recv().await.unwrap(), ExecEvent::Started { .. }));
        match rx.recv().await.unwrap() {
            ExecEvent::Stdout { data, .. } => assert_eq!(data, "facade\n"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            ExecEvent::Exit { code: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn test_spawn_exec_stream_failure_ends_stream() {
        let core = core();
        let mut rx = core
            .spawn_exec_stream(SpawnSpec {
                command: "echo hi".to_string(),
                cwd: Some("/nonexistent/definitely/missing".into()),
                ..Default::default()
            })
            .await;

        assert!(matches!(rx.recv().await.unwrap(), ExecEvent::Error { .. }));
        assert!(rx.recv().await.is_none());
        assert!(core.list_exec().await.is_empty());
    }

    #[tokio::test]
    async fn test_kill_exec_and_list() {
        let core = core();
        let _rx = core
            .spawn_exec_stream(SpawnSpec {
                command: "sleep 30".to_string(),
                ..Default::default()
            })
            .await;

        let listed = core.list_exec().await;
        assert_eq!(listed.len(), 1);

        core.kill_exec(&listed[0].id, None).await;
        assert!(core.list_exec().await.is_empty());

        // Unknown ids are a no-op everywhere.
        core.kill_exec("no-such-id", None).await;
    }
}
