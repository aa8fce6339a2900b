//! termd-core - terminal/process core
//!
//! Manages one-shot exec processes (streamed to a caller over an event
//! stream or a bidirectional socket) and long-lived PTY sessions proxied
//! through an external gateway process, with multi-client attach/detach
//! fan-out, bounded replay buffers, heuristic error detection and
//! idle-process reaping.
//!
//! # Components
//! - `PtyGatewayClient`: single outbound connection to the PTY host
//! - `TerminalRegistry`: proxied sessions, buffers and attached clients
//! - `ExecStreamManager` / `ExecSocketManager`: one-shot command execution
//! - `StaleProcessReaper`: periodic sweep of idle exec processes
//! - `ControlServer`: bidirectional WebSocket control channel
//! - `TerminalCore`: composition facade over all of the above

pub mod api;
pub mod config;
pub mod exec;
pub mod gateway;
pub mod protocol;
pub mod reaper;
pub mod server;
pub mod terminal;

pub use api::TerminalCore;
pub use config::CoreConfig;
pub use exec::{
    parse_signal, ExecProcessInfo, ExecSocketManager, ExecStreamManager, SpawnSpec,
};
pub use gateway::{GatewayError, PtyGatewayClient, RelayStatus};
pub use protocol::{
    ClientMessage, ExecEvent, GatewayCommand, GatewayEvent, ServerMessage,
};
pub use reaper::StaleProcessReaper;
pub use server::{ControlServer, ControlServerOptions};
pub use terminal::{
    ClientId, DetectedError, ErrorDetector, TerminalRegistry, TerminalSessionInfo,
};
