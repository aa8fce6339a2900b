//! Terminal session registry and broadcaster
//!
//! Tracks proxied PTY sessions, their bounded replay buffers and attached
//! clients, and fans gateway events out to every attached client. All
//! mutation happens under a single write lock per operation, so no session
//! is ever touched from two handlers concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::errdetect::{ErrorDetector, CONTEXT_WINDOW};
use crate::protocol::ServerMessage;

/// Identifies an attached client connection.
pub type ClientId = Uuid;

/// Snapshot of a proxied PTY session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSessionInfo {
    pub id: String,
    pub cwd: String,
    /// Process id reported by the gateway.
    pub pid: u32,
    pub created_at: i64,
    /// Owning higher-level session, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

struct TerminalSession {
    info: TerminalSessionInfo,
    /// Attached clients; insertion replaces, so a client is never held twice.
    clients: HashMap<ClientId, mpsc::UnboundedSender<ServerMessage>>,
    /// Bounded buffer of raw lines with their terminators kept, oldest
    /// evicted first. Raw storage keeps CR redraws and CRLF endings intact
    /// through a replay.
    buffer: VecDeque<String>,
    /// Trailing output fragment not yet terminated by a newline.
    partial: String,
}

impl TerminalSession {
    fn append_output(&mut self, data: &str, capacity: usize) {
        self.partial.push_str(data);
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            self.buffer.push_back(line);
            if self.buffer.len() > capacity {
                self.buffer.pop_front();
            }
        }
    }

    /// Buffered lines plus the open partial line, newest last.
    fn buffered_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.buffer.iter().cloned().collect();
        if !self.partial.is_empty() {
            lines.push(self.partial.clone());
        }
        lines
    }
}

/// Registry of proxied PTY sessions with multi-client fan-out.
pub struct TerminalRegistry {
    sessions: Arc<RwLock<HashMap<String, TerminalSession>>>,
    capacity: usize,
    replay_lines: usize,
    detector: ErrorDetector,
}

impl TerminalRegistry {
    pub fn new(capacity: usize, replay_lines: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            replay_lines,
            detector: ErrorDetector::new(),
        }
    }

    /// Register a session the gateway acknowledged as created.
    pub async fn insert(&self, info: TerminalSessionInfo) {
        let id = info.id.clone();
        let session = TerminalSession {
            info,
            clients: HashMap::new(),
            buffer: VecDeque::new(),
            partial: String::new(),
        };
        self.sessions.write().await.insert(id.clone(), session);
        info!(terminal_id = %id, "Terminal session registered");
    }

    pub async fn contains(&self, terminal_id: &str) -> bool {
        self.sessions.read().await.contains_key(terminal_id)
    }

    pub async fn list(&self) -> Vec<TerminalSessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.info.clone())
            .collect()
    }

    /// Attach a client and immediately replay the trailing buffer portion,
    /// so a late joiner sees recent history before any live output.
    ///
    /// Returns false when the session is unknown.
    pub async fn attach(
        &self,
        terminal_id: &str,
        client_id: ClientId,
        sink: mpsc::UnboundedSender<ServerMessage>,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(terminal_id) else {
            debug!(terminal_id, "Attach to unknown terminal ignored");
            return false;
        };

        let lines = session.buffered_lines();
        let start = lines.len().saturating_sub(self.replay_lines);
        let replay: String = lines[start..].concat();
        if !replay.is_empty() {
            // Replay failure means the client is already gone; don't attach.
            if sink
                .send(ServerMessage::TerminalOutput {
                    terminal_id: terminal_id.to_string(),
                    data: replay,
                })
                .is_err()
            {
                return false;
            }
        }

        session.clients.insert(client_id, sink);
        info!(terminal_id, %client_id, clients = session.clients.len(), "Client attached");
        true
    }

    pub async fn detach(&self, terminal_id: &str, client_id: ClientId) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(terminal_id) {
            if session.clients.remove(&client_id).is_some() {
                debug!(terminal_id, %client_id, "Client detached");
            }
        }
    }

    /// Remove a client from every session (client disconnect path).
    pub async fn detach_all(&self, client_id: ClientId) {
        let mut sessions = self.sessions.write().await;
        for session in sessions.values_mut() {
            session.clients.remove(&client_id);
        }
    }

    /// Append gateway output to the buffer and deliver it to every attached
    /// client in arrival order. Clients whose sink is closed are dropped;
    /// delivery to the rest continues. Then scan for failure signatures.
    pub async fn handle_output(&self, terminal_id: &str, data: &str) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(terminal_id) else {
            debug!(terminal_id, "Output for unknown terminal dropped");
            return;
        };

        // Context window is the buffer state before this chunk lands in it;
        // terminators are stripped so context lines read like chunk lines.
        let lines = session.buffered_lines();
        let start = lines.len().saturating_sub(CONTEXT_WINDOW);
        let recent: Vec<String> = lines[start..]
            .iter()
            .map(|l| l.trim_end_matches(['\n', '\r']).to_string())
            .collect();
        let detected = self.detector.scan(data, &recent);

        session.append_output(data, self.capacity);

        session.clients.retain(|client_id, sink| {
            let delivered = sink
                .send(ServerMessage::TerminalOutput {
                    terminal_id: terminal_id.to_string(),
                    data: data.to_string(),
                })
                .is_ok();
            if !delivered {
                debug!(terminal_id, %client_id, "Dropping dead client");
            }
            delivered
        });

        if let Some(hit) = detected {
            debug!(terminal_id, signature = %hit.signature, "Failure signature in output");
            Self::broadcast(
                session,
                ServerMessage::TerminalErrorDetected {
                    terminal_id: terminal_id.to_string(),
                    signature: hit.signature,
                    context: hit.context,
                },
            );
        }
    }

    /// Forward a gateway-side error detection to attached clients.
    pub async fn handle_gateway_error(&self, terminal_id: &str, context: String) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(terminal_id) else {
            return;
        };
        Self::broadcast(
            session,
            ServerMessage::TerminalErrorDetected {
                terminal_id: terminal_id.to_string(),
                signature: "gateway".to_string(),
                context: vec![context],
            },
        );
    }

    /// Deliver an exit event to all attached clients and drop the session.
    pub async fn handle_exit(&self, terminal_id: &str, code: i32) {
        let mut sessions = self.sessions.write().await;
        let Some(mut session) = sessions.remove(terminal_id) else {
            debug!(terminal_id, "Exit for unknown terminal dropped");
            return;
        };
        Self::broadcast(
            &mut session,
            ServerMessage::TerminalExit {
                terminal_id: terminal_id.to_string(),
                code,
            },
        );
        info!(terminal_id, code, "Terminal session exited");
    }

    fn broadcast(session: &mut TerminalSession, message: ServerMessage) {
        session
            .clients
            .retain(|_, sink| sink.send(message.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> TerminalSessionInfo {
        TerminalSessionInfo {
            id: id.to_string(),
            cwd: "/tmp".to_string(),
            pid: 100,
            created_at: Utc::now().timestamp_millis(),
            owner_id: None,
        }
    }

    fn client() -> (ClientId, mpsc::UnboundedSender<ServerMessage>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Uuid::new_v4(), tx, rx)
    }

    #[tokio::test]
    async fn test_buffer_never_exceeds_capacity() {
        let registry = TerminalRegistry::new(5, 5);
        registry.insert(info("t-1")).await;

        for i in 0..50 {
            registry.handle_output("t-1", &format!("line {}\n", i)).await;
        }

        let sessions = registry.sessions.read().await;
        let buffer = &sessions.get("t-1").unwrap().buffer;
        assert_eq!(buffer.len(), 5);
        // Oldest evicted first
        assert_eq!(buffer.front().unwrap(), "line 45\n");
        assert_eq!(buffer.back().unwrap(), "line 49\n");
    }

    #[tokio::test]
    async fn test_attach_replays_at_most_replay_lines() {
        let registry = TerminalRegistry::new(100, 3);
        registry.insert(info("t-1")).await;
        for i in 0..10 {
            registry.handle_output("t-1", &format!("line {}\n", i)).await;
        }

        let (id, tx, mut rx) = client();
        assert!(registry.attach("t-1", id, tx).await);

        let msg = rx.try_recv().unwrap();
        match msg {
            ServerMessage::TerminalOutput { data, .. } => {
                let lines: Vec<&str> = data.lines().collect();
                assert_eq!(lines.len(), 3);
                assert_eq!(lines, vec!["line 7", "line 8", "line 9"]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replay_comes_before_live_output() {
        let registry = TerminalRegistry::new(100, 10);
        registry.insert(info("t-1")).await;
        registry.handle_output("t-1", "history\n").await;

        let (id, tx, mut rx) = client();
        registry.attach("t-1", id, tx).await;
        registry.handle_output("t-1", "live\n").await;

        match rx.try_recv().unwrap() {
            ServerMessage::TerminalOutput { data, .. } => assert_eq!(data, "history\n"),
            other => panic!("unexpected message: {:?}", other),
        }
        match rx.try_recv().unwrap() {
            ServerMessage::TerminalOutput { data, .. } => assert_eq!(data, "live\n"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_order_preserved_across_clients() {
        let registry = TerminalRegistry::new(100, 10);
        registry.insert(info("t-1")).await;

        let (id_a, tx_a, mut rx_a) = client();
        let (id_b, tx_b, mut rx_b) = client();
        registry.attach("t-1", id_a, tx_a).await;
        registry.attach("t-1", id_b, tx_b).await;

        let chunks = ["one\n", "two\n", "three\n"];
        for chunk in &chunks {
            registry.handle_output("t-1", chunk).await;
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for expected in &chunks {
                match rx.try_recv().unwrap() {
                    ServerMessage::TerminalOutput { data, .. } => assert_eq!(&data, expected),
                    other => panic!("unexpected message: {:?}", other),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_dead_client_dropped_others_unaffected() {
        let registry = TerminalRegistry::new(100, 10);
        registry.insert(info("t-1")).await;

        let (id_dead, tx_dead, rx_dead) = client();
        let (id_live, tx_live, mut rx_live) = client();
        registry.attach("t-1", id_dead, tx_dead).await;
        registry.attach("t-1", id_live, tx_live).await;
        drop(rx_dead);

        registry.handle_output("t-1", "after drop\n").await;

        match rx_live.try_recv().unwrap() {
            ServerMessage::TerminalOutput { data, .. } => assert_eq!(data, "after drop\n"),
            other => panic!("unexpected message: {:?}", other),
        }

        let sessions = registry.sessions.read().await;
        let clients = &sessions.get("t-1").unwrap().clients;
        assert_eq!(clients.len(), 1);
        assert!(clients.contains_key(&id_live));
    }

    #[tokio::test]
    async fn test_attach_twice_keeps_single_entry() {
        let registry = TerminalRegistry::new(100, 10);
        registry.insert(info("t-1")).await;

        let (id, tx, _rx) = client();
        registry.attach("t-1", id, tx.clone()).await;
        registry.attach("t-1", id, tx).await;

        let sessions = registry.sessions.read().await;
        assert_eq!(sessions.get("t-1").unwrap().clients.len(), 1);
    }

    #[tokio::test]
    async fn test_exit_broadcasts_and_removes() {
        let registry = TerminalRegistry::new(100, 10);
        registry.insert(info("t-1")).await;

        let (id, tx, mut rx) = client();
        registry.attach("t-1", id, tx).await;
        registry.handle_exit("t-1", 0).await;

        match rx.try_recv().unwrap() {
            ServerMessage::TerminalExit { code, .. } => assert_eq!(code, 0),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(!registry.contains("t-1").await);

        // Output after exit targets an unknown id and is dropped silently.
        registry.handle_output("t-1", "late\n").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_detected_broadcast() {
        let registry = TerminalRegistry::new(100, 10);
        registry.insert(info("t-1")).await;

        let (id, tx, mut rx) = client();
        registry.attach("t-1", id, tx).await;
        registry
            .handle_output("t-1", "sh: frobnicate: command not found\n")
            .await;

        // First the raw output, then the detection event.
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::TerminalOutput { .. }
        ));
        match rx.try_recv().unwrap() {
            ServerMessage::TerminalErrorDetected { signature, context, .. } => {
                assert_eq!(signature, "command_not_found");
                assert!(!context.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_detach_all() {
        let registry = TerminalRegistry::new(100, 10);
        registry.insert(info("t-1")).await;
        registry.insert(info("t-2")).await;

        let (id, tx, _rx) = client();
        registry.attach("t-1", id, tx.clone()).await;
        registry.attach("t-2", id, tx).await;
        registry.detach_all(id).await;

        let sessions = registry.sessions.read().await;
        assert!(sessions.get("t-1").unwrap().clients.is_empty());
        assert!(sessions.get("t-2").unwrap().clients.is_empty());
    }

    #[tokio::test]
    async fn test_replay_preserves_raw_chunk_bytes() {
        let registry = TerminalRegistry::new(100, 10);
        registry.insert(info("t-1")).await;
        // CR-based progress redraw, a CRLF ending, and an open partial line.
        registry.handle_output("t-1", "step 1\rstep 2\r\ndone: ").await;

        let (id, tx, mut rx) = client();
        registry.attach("t-1", id, tx).await;

        match rx.try_recv().unwrap() {
            ServerMessage::TerminalOutput { data, .. } => {
                assert_eq!(data, "step 1\rstep 2\r\ndone: ");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_line_buffering() {
        let registry = TerminalRegistry::new(100, 10);
        registry.insert(info("t-1")).await;
        registry.handle_output("t-1", "prompt$ ").await;

        let (id, tx, mut rx) = client();
        registry.attach("t-1", id, tx).await;

        // The open partial line is part of the replay.
        match rx.try_recv().unwrap() {
            ServerMessage::TerminalOutput { data, .. } => assert_eq!(data, "prompt$ "),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
