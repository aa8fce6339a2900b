//! One-shot exec process management
//!
//! Two transport variants over shared spawn/kill plumbing:
//! - `ExecStreamManager`: events go to a one-directional per-process stream
//! - `ExecSocketManager`: events go to the owning client socket, with
//!   per-connection cleanup on disconnect

mod process;
mod socket;
mod stream;

pub use process::{parse_signal, ExecProcessInfo, SpawnSpec};
pub use socket::ExecSocketManager;
pub use stream::ExecStreamManager;
