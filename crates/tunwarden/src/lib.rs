//! Tunwarden - supervises a local tunnel agent binary and exposes its
//! dynamically-assigned forwarding endpoints.
//!
//! The [`Supervisor`] facade orchestrates the [`Installer`] (agent binary
//! on disk), the [`ProcessMonitor`] (spawn, readiness, crash detection,
//! termination) and the tunnel [`Registry`](tunwarden_core::Registry).

mod installer;
mod monitor;
mod platform;
mod supervisor;

pub use installer::Installer;
pub use monitor::{AUTH_TOKEN_ENV, CrashCallback, ProcessMonitor, SupervisedProcess};
pub use platform::PlatformDriverFactory;
pub use supervisor::Supervisor;

// Re-export core functionality
pub use tunwarden_core::*;
