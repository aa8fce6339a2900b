//! Wire protocol types
//!
//! Three surfaces share this module:
//! - the outbound gateway protocol (`GatewayCommand` / `GatewayEvent`),
//!   correlated by `terminal_id`
//! - the bidirectional control channel (`ClientMessage` / `ServerMessage`)
//! - the one-shot spawn-and-stream surface (`ExecEvent`)

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============ Gateway protocol ============

/// Commands sent to the PTY gateway.
///
/// The terminal id is generated on our side for `create` and echoed back by
/// the gateway in `created`/`error`, which is what correlates the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayCommand {
    Create {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        cwd: String,
        cols: u16,
        rows: u16,
    },
    Attach {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
    Input {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: String,
    },
    Resize {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        cols: u16,
        rows: u16,
    },
    Kill {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
    Ping,
}

/// Events received from the PTY gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    Created {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        pid: u32,
    },
    Output {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: String,
    },
    Exit {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        code: i32,
    },
    ErrorDetected {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        context: String,
    },
    Attached {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
    /// Buffered history the gateway replays right after an attach.
    Buffer {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: String,
    },
    Pong,
    Error {
        #[serde(rename = "terminalId")]
        terminal_id: Option<String>,
        message: String,
    },
}

// ============ Control channel ============

/// Client → server messages on the bidirectional control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ExecStart {
        command: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        env: Option<HashMap<String, String>>,
    },
    ExecKill {
        id: String,
        #[serde(default)]
        signal: Option<String>,
    },
    TerminalAttach {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
    TerminalDetach {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
    TerminalInput {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: String,
    },
    TerminalResize {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        cols: u16,
        rows: u16,
    },
    Ping,
}

/// Server → client messages on the bidirectional control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ExecStarted {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    ExecStdout {
        id: String,
        data: String,
    },
    ExecStderr {
        id: String,
        data: String,
    },
    ExecExit {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    ExecError {
        id: String,
        message: String,
    },
    TerminalOutput {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: String,
    },
    TerminalExit {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        code: i32,
    },
    TerminalErrorDetected {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        signature: String,
        context: Vec<String>,
    },
    Pong,
}

// ============ Spawn-and-stream surface ============

/// Events delivered incrementally on the one-shot exec stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecEvent {
    Started {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Stdout {
        id: String,
        data: String,
    },
    Stderr {
        id: String,
        data: String,
    },
    Exit {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    Error {
        id: String,
        message: String,
    },
}

impl ExecEvent {
    /// Map a stream event onto the control channel representation.
    pub fn into_server_message(self) -> ServerMessage {
        match self {
            ExecEvent::Started { id, pid } => ServerMessage::ExecStarted { id, pid },
            ExecEvent::Stdout { id, data } => ServerMessage::ExecStdout { id, data },
            ExecEvent::Stderr { id, data } => ServerMessage::ExecStderr { id, data },
            ExecEvent::Exit { id, code } => ServerMessage::ExecExit { id, code },
            ExecEvent::Error { id, message } => ServerMessage::ExecError { id, message },
        }
    }
}
