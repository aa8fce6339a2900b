//! Stale exec process reaper
//!
//! Periodically kills exec processes with no recent output activity. PTY
//! terminals are deliberately out of scope: an idle shell at a prompt is
//! normal, an exec command that went silent for minutes usually is not.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::exec::{ExecSocketManager, ExecStreamManager};

pub struct StaleProcessReaper {
    stream: Arc<ExecStreamManager>,
    socket: Arc<ExecSocketManager>,
    idle_threshold: Duration,
    interval: Duration,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl StaleProcessReaper {
    pub fn new(
        stream: Arc<ExecStreamManager>,
        socket: Arc<ExecSocketManager>,
        idle_threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            stream,
            socket,
            idle_threshold,
            interval,
            shutdown_tx: None,
        }
    }

    /// Start the periodic sweep loop.
    pub fn start(&mut self) {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let stream = Arc::clone(&self.stream);
        let socket = Arc::clone(&self.socket);
        let idle_threshold = self.idle_threshold;
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh daemon
            // never sweeps before anything had a chance to run.
            ticker.tick().await;
            info!(interval = ?interval, threshold = ?idle_threshold, "Stale process reaper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = Self::sweep(&stream, &socket, idle_threshold).await;
                        if reaped > 0 {
                            info!(reaped, "Reaper sweep finished");
                        } else {
                            debug!("Reaper sweep found nothing stale");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Stale process reaper stopped");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run one sweep immediately. Returns the number of reaped processes.
    pub async fn sweep_once(&self) -> usize {
        Self::sweep(&self.stream, &self.socket, self.idle_threshold).await
    }

    async fn sweep(
        stream: &ExecStreamManager,
        socket: &ExecSocketManager,
        threshold: Duration,
    ) -> usize {
        stream.reap_idle(threshold).await + socket.reap_idle(threshold).await
    }
}
