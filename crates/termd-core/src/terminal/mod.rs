//! Terminal session registry and output fan-out
//!
//! # Components
//! - `TerminalRegistry`: proxied PTY sessions, their replay buffers and
//!   attached clients
//! - `ErrorDetector`: heuristic failure-signature scan over live output

mod errdetect;
mod registry;

pub use errdetect::{DetectedError, ErrorDetector, CONTEXT_WINDOW};
pub use registry::{ClientId, TerminalRegistry, TerminalSessionInfo};
