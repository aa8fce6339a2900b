//! Exec process manager, socket variant
//!
//! Same operations as the stream variant, but events are pushed over the
//! owning client's persistent control channel, and processes are indexed by
//! that connection so a vanished client never leaks processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::process::{self, ExecHandle, ExecProcessInfo, SpawnSpec};
use crate::protocol::{ExecEvent, ServerMessage};
use crate::terminal::ClientId;

struct SocketExec {
    handle: ExecHandle,
    owner: ClientId,
}

pub struct ExecSocketManager {
    processes: Arc<RwLock<HashMap<String, SocketExec>>>,
    kill_grace: Duration,
}

impl ExecSocketManager {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            kill_grace,
        }
    }

    /// Spawn a shell command owned by `owner`, pushing events to its
    /// control channel sink. Spawn failure pushes an `exec_error` message
    /// and registers nothing.
    pub async fn start(
        &self,
        owner: ClientId,
        spec: SpawnSpec,
        sink: mpsc::UnboundedSender<ServerMessage>,
    ) -> anyhow::Result<ExecProcessInfo> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ExecEvent>();

        // Forward stream events onto the socket; a closed sink is swallowed,
        // cleanup_for_connection handles the process itself.
        let forward_sink = sink.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let _ = forward_sink.send(event.into_server_message());
            }
        });

        let command = spec.command.clone();
        let processes = Arc::clone(&self.processes);
        let handle = match process::launch(spec, events_tx.clone(), move |id| {
            let id = id.to_string();
            tokio::spawn(async move {
                processes.write().await.remove(&id);
            });
        }) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(command = %command, %owner, error = %e, "Exec spawn failed");
                let _ = sink.send(ServerMessage::ExecError {
                    id: String::new(),
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let info = handle.info.clone();
        self.processes
            .write()
            .await
            .insert(info.id.clone(), SocketExec { handle, owner });
        info!(id = %info.id, pid = ?info.pid, %owner, "Exec process started (socket)");
        Ok(info)
    }

    /// Signal a process and drop it from the registry. Unknown ids are a
    /// no-op. Without an explicit signal, SIGTERM escalates to SIGKILL
    /// after the grace period.
    pub async fn kill(&self, id: &str, signal: Option<i32>) {
        let Some(entry) = self.processes.write().await.remove(id) else {
            debug!(id, "Kill for unknown exec process ignored");
            return;
        };
        match signal {
            Some(sig) => {
                if let Some(pid) = entry.handle.info.pid {
                    process::signal_pid(pid, sig);
                }
            }
            None => process::kill_with_grace(&entry.handle, self.kill_grace),
        }
        info!(id, signal = ?signal, "Exec process killed (socket)");
    }

    /// Kill and remove every process owned by a disconnected client. This
    /// is the only path that keeps client crashes from leaking processes.
    pub async fn cleanup_for_connection(&self, owner: ClientId) -> usize {
        let owned: Vec<String> = {
            let processes = self.processes.read().await;
            processes
                .values()
                .filter(|p| p.owner == owner)
                .map(|p| p.handle.info.id.clone())
                .collect()
        };
        for id in &owned {
            self.kill(id, None).await;
        }
        if !owned.is_empty() {
            info!(%owner, count = owned.len(), "Cleaned up exec processes for connection");
        }
        owned.len()
    }

    /// Snapshot of active processes.
    pub async fn list(&self) -> Vec<ExecProcessInfo> {
        self.processes
            .read()
            .await
            .values()
            .map(|p| p.handle.info.clone())
            .collect()
    }

    /// Kill and remove every process idle past the threshold.
    pub async fn reap_idle(&self, threshold: Duration) -> usize {
        let now = process::now_millis();
        let threshold_ms = threshold.as_millis() as i64;
        let stale: Vec<String> = {
            let processes = self.processes.read().await;
            processes
                .values()
                .filter(|p| p.handle.idle_for(now) > threshold_ms)
                .map(|p| p.handle.info.id.clone())
                .collect()
        };
        for id in &stale {
            warn!(id = %id, "Reaping idle exec process");
            self.kill(id, None).await;
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_events_arrive_as_server_messages() {
        let manager = ExecSocketManager::new(Duration::from_millis(200));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let owner = Uuid::new_v4();

        manager
            .start(
                owner,
                SpawnSpec {
                    command: "echo hi".to_string(),
                    ..Default::default()
                },
                tx,
            )
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::ExecStarted { .. }
        ));
        match rx.recv().await.unwrap() {
            ServerMessage::ExecStdout { data, .. } => assert_eq!(data, "hi\n"),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::ExecExit { code: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn test_cleanup_for_connection_kills_owned_only() {
        let manager = ExecSocketManager::new(Duration::from_millis(100));
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let owner_a = Uuid::new_v4();
        let owner_b = Uuid::new_v4();

        manager
            .start(
                owner_a,
                SpawnSpec {
                    command: "sleep 30".to_string(),
                    ..Default::default()
                },
                tx_a,
            )
            .await
            .unwrap();
        let kept = manager
            .start(
                owner_b,
                SpawnSpec {
                    command: "sleep 30".to_string(),
                    ..Default::default()
                },
                tx_b,
            )
            .await
            .unwrap();

        assert_eq!(manager.cleanup_for_connection(owner_a).await, 1);

        let remaining = manager.list().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept.id);

        // Second cleanup finds nothing.
        assert_eq!(manager.cleanup_for_connection(owner_a).await, 0);

        manager.cleanup_for_connection(owner_b).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_pushes_error() {
        let manager = ExecSocketManager::new(Duration::from_millis(100));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = manager
            .start(
                Uuid::new_v4(),
                SpawnSpec {
                    command: "echo hi".to_string(),
                    cwd: Some("/nonexistent/definitely/missing".into()),
                    ..Default::default()
                },
                tx,
            )
            .await;

        assert!(result.is_err());
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::ExecError { .. }
        ));
        assert!(manager.list().await.is_empty());
    }
}
