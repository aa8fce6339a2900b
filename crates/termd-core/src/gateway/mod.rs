//! PTY gateway client
//!
//! Maintains the single outbound connection to the external PTY-hosting
//! process, owns reconnect scheduling and create-request correlation, and
//! dispatches inbound gateway events to the terminal registry.

mod client;

pub use client::{GatewayError, PtyGatewayClient, RelayStatus};
