//! Tunwarden Core - Platform-independent supervisor building blocks
//!
//! This crate provides the configuration, error taxonomy, structured
//! agent-log event model, process state machine, and tunnel registry that
//! are shared across platform-specific implementations.

mod config;
mod error;
mod event;
mod process;
mod registry;
mod tunnel;

pub use config::*;
pub use error::*;
pub use event::*;
pub use process::*;
pub use registry::*;
pub use tunnel::*;
