//! Exec process manager, stream variant
//!
//! Each started process is bound to one caller-provided event stream.
//! Registry entries are removed on exit, explicit kill, or idle reaping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::process::{self, ExecHandle, ExecProcessInfo, SpawnSpec};
use crate::protocol::ExecEvent;

pub struct ExecStreamManager {
    processes: Arc<RwLock<HashMap<String, ExecHandle>>>,
    kill_grace: Duration,
}

impl ExecStreamManager {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            kill_grace,
        }
    }

    /// Spawn a shell command whose events go to `events`.
    ///
    /// A spawn failure emits an `error` event, drops the stream and
    /// registers nothing.
    pub async fn start(
        &self,
        spec: SpawnSpec,
        events: mpsc::UnboundedSender<ExecEvent>,
    ) -> anyhow::Result<ExecProcessInfo> {
        let command = spec.command.clone();
        let processes = Arc::clone(&self.processes);
        let handle = match process::launch(spec, events.clone(), move |id| {
            let id = id.to_string();
            tokio::spawn(async move {
                processes.write().await.remove(&id);
            });
        }) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(command = %command, error = %e, "Exec spawn failed");
                let _ = events.send(ExecEvent::Error {
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
            .insert(info.id.clone(), handle);
        info!(id = %info.id, pid = ?info.pid, "Exec process started (stream)");
        Ok(info)
    }

    /// Signal a process and drop it from the registry. Unknown ids are a
    /// no-op. Without an explicit signal, SIGTERM escalates to SIGKILL
    /// after the grace period.
    pub async fn kill(&self, id: &str, signal: Option<i32>) {
        let Some(handle) = self.processes.write().await.remove(id) else {
            debug!(id, "Kill for unknown exec process ignored");
            return;
        };
        match signal {
            Some(sig) => {
                if let Some(pid) = handle.info.pid {
                    process::signal_pid(pid, sig);
                }
            }
            None => process::kill_with_grace(&handle, self.kill_grace),
        }
        info!(id, signal = ?signal, "Exec process killed (stream)");
    }

    /// Snapshot of active processes.
    pub async fn list(&self) -> Vec<ExecProcessInfo> {
        self.processes
            .read()
            .await
            .values()
            .map(|h| h.info.clone())
            .collect()
    }

    /// Kill and remove every process idle past the threshold. Returns the
    /// number of reaped processes.
    pub async fn reap_idle(&self, threshold: Duration) -> usize {
        let now = process::now_millis();
        let threshold_ms = threshold.as_millis() as i64;
        let stale: Vec<String> = {
            let processes = self.processes.read().await;
            processes
                .values()
                .filter(|h| h.idle_for(now) > threshold_ms)
                .map(|h| h.info.id.clone())
                .collect()
        };
        for id in &stale {
            warn!(id = %id, "Reaping idle exec process");
            self.kill(id, None).await;
        }
        stale.len()
    }
}
