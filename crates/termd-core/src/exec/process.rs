//! Shared spawn and kill plumbing for one-shot exec processes
//!
//! Each spawned command gets dedicated reader tasks for stdout and stderr
//! feeding ordered events into a channel, and a background exit waiter that
//! drains the readers before reporting exit. Kill escalates SIGTERM to
//! SIGKILL after a grace period.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::ExecEvent;

/// Request to spawn a shell command.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
}

/// Snapshot of a tracked exec process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecProcessInfo {
    pub id: String,
    pub command: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: i64,
}

/// Shared state of a launched process kept in manager registries.
#[derive(Clone)]
pub(crate) struct ExecHandle {
    pub info: ExecProcessInfo,
    /// Epoch millis of the last stdout/stderr chunk.
    pub last_activity: Arc<AtomicI64>,
    pub exited: Arc<AtomicBool>,
}

impl ExecHandle {
    pub fn idle_for(&self, now_ms: i64) -> i64 {
        now_ms - self.last_activity.load(Ordering::SeqCst)
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Spawn `sh -c <command>` and wire up reader and exit tasks.
///
/// Events are sent to `events`; send failures are swallowed, a vanished
/// consumer must never tear down the process handling. `on_exit` runs after
/// the exit event was emitted so the owning registry can drop its entry.
pub(crate) fn launch(
    spec: SpawnSpec,
    events: mpsc::UnboundedSender<ExecEvent>,
    on_exit: impl FnOnce(&str) + Send + 'static,
) -> std::io::Result<ExecHandle> {
    let id = Uuid::new_v4().to_string();
    let cwd = spec
        .cwd
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")));

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&spec.command)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref env) = spec.env {
        for (key, value) in env {
            cmd.env(key, value);
        }
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    debug!(id = %id, pid = ?pid, command = %spec.command, "Exec process spawned");

    let info = ExecProcessInfo {
        id: id.clone(),
        command: spec.command,
        cwd: cwd.to_string_lossy().to_string(),
        pid,
        started_at: now_millis(),
    };
    let handle = ExecHandle {
        info,
        last_activity: Arc::new(AtomicI64::new(now_millis())),
        exited: Arc::new(AtomicBool::new(false)),
    };

    let _ = events.send(ExecEvent::Started { id: id.clone(), pid });

    // Dedicated reader task per stream keeps per-stream ordering explicit.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = {
        let id = id.clone();
        let events = events.clone();
        let last_activity = Arc::clone(&handle.last_activity);
        tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                last_activity.store(now_millis(), Ordering::SeqCst);
                let _ = events.send(ExecEvent::Stdout {
                    id: id.clone(),
                    data: format!("{}\n", line),
                });
            }
        })
    };

    let stderr_task = {
        let id = id.clone();
        let events = events.clone();
        let last_activity = Arc::clone(&handle.last_activity);
        tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                last_activity.store(now_millis(), Ordering::SeqCst);
                let _ = events.send(ExecEvent::Stderr {
                    id: id.clone(),
                    data: format!("{}\n", line),
                });
            }
        })
    };

    // Exit waiter: drain both readers first so exit is the final event.
    let exited = Arc::clone(&handle.exited);
    tokio::spawn(async move {
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(id = %id, error = %e, "Failed to wait for exec process");
                None
            }
        };
        exited.store(true, Ordering::SeqCst);
        let _ = events.send(ExecEvent::Exit { id: id.clone(), code });
        debug!(id = %id, code = ?code, "Exec process exited");
        on_exit(&id);
    });

    Ok(handle)
}

/// Send a signal to a process id. No-op off unix.
pub(crate) fn signal_pid(pid: u32, signal: i32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, signal);
    }
    #[cfg(not(unix))]
    let _ = (pid, signal);
}

/// SIGTERM now, SIGKILL after the grace period if the process is still up.
pub(crate) fn kill_with_grace(handle: &ExecHandle, grace: Duration) {
    let Some(pid) = handle.info.pid else { return };
    if handle.exited.load(Ordering::SeqCst) {
        return;
    }
    signal_pid(pid, term_signal());

    let exited = Arc::clone(&handle.exited);
    let id = handle.info.id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if !exited.load(Ordering::SeqCst) {
            warn!(id = %id, pid, "Exec process survived SIGTERM, force killing");
            signal_pid(pid, kill_signal());
        }
    });
}

pub(crate) fn term_signal() -> i32 {
    #[cfg(unix)]
    {
        libc::SIGTERM
    }
    #[cfg(not(unix))]
    {
        15
    }
}

pub(crate) fn kill_signal() -> i32 {
    #[cfg(unix)]
    {
        libc::SIGKILL
    }
    #[cfg(not(unix))]
    {
        9
    }
}

/// Map a signal name from the wire to its number. Unknown names fall back
/// to SIGTERM so a kill request always signals something sensible.
pub fn parse_signal(name: &str) -> i32 {
    match name.trim_start_matches("SIG") {
        "KILL" => kill_signal(),
        "INT" =>
        {
            #[cfg(unix)]
            {
                libc::SIGINT
            }
            #[cfg(not(unix))]
            {
                2
            }
        }
        "HUP" =>
        {
            #[cfg(unix)]
            {
                libc::SIGHUP
            }
            #[cfg(not(unix))]
            {
                1
            }
        }
        _ => term_signal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("SIGKILL"), kill_signal());
        assert_eq!(parse_signal("KILL"), kill_signal());
        assert_eq!(parse_signal("SIGTERM"), term_signal());
        assert_eq!(parse_signal("whatever"), term_signal());
    }

    #[tokio::test]
    async fn test_launch_echo_event_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = launch(
            SpawnSpec {
                command: "echo hello".to_string(),
                ..Default::default()
            },
            tx,
            |_| {},
        )
        .unwrap();
        assert!(handle.info.pid.is_some());

        match rx.recv().await.unwrap() {
            ExecEvent::Started { pid, .. } => assert!(pid.is_some()),
            other => panic!("expected started, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ExecEvent::Stdout { data, .. } => assert_eq!(data, "hello\n"),
            other => panic!("expected stdout, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ExecEvent::Exit { code, .. } => assert_eq!(code, Some(0)),
            other => panic!("expected exit, got {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_launch_stderr_and_exit_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        launch(
            SpawnSpec {
                command: "echo oops >&2; exit 3".to_string(),
                ..Default::default()
            },
            tx,
            |_| {},
        )
        .unwrap();

        let mut saw_stderr = false;
        let mut exit_code = None;
        while let Some(event) = rx.recv().await {
            match event {
                ExecEvent::Stderr { data, .. } => {
                    assert_eq!(data, "oops\n");
                    saw_stderr = true;
                }
                ExecEvent::Exit { code, .. } => exit_code = code,
                _ => {}
            }
        }
        assert!(saw_stderr);
        assert_eq!(exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_dropped_consumer_is_swallowed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        launch(
            SpawnSpec {
                command: "echo ignored".to_string(),
                ..Default::default()
            },
            tx,
            move |_| {
                let _ = exit_tx.send(());
            },
        )
        .unwrap();
        drop(rx);

        // The process still runs to completion and on_exit still fires.
        exit_rx.await.unwrap();
    }
}
