use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Child;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Lifecycle state of a supervised agent process.
///
/// Transitions: `Starting -> Ready -> (Crashed | Stopping -> Stopped)`.
/// `Stopped` and `Crashed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Ready,
    Stopping,
    Stopped,
    Crashed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed)
    }

    /// Whether the state machine admits a transition to `next`
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        match (self, next) {
            (Starting, Ready) | (Starting, Stopping) | (Starting, Crashed) => true,
            (Ready, Stopping) | (Ready, Crashed) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal delivered (or process already gone)
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Insufficient privileges
    AccessDenied,
    /// Operation failed with a specific error message
    Failed(String),
}

/// Platform seam for spawning and signalling agent processes.
///
/// The monitor owns the `Child` returned by `spawn` (stdout/stderr piped);
/// the driver operates on raw pids for liveness checks and termination so
/// that signalling stays possible after the `Child` has been reaped.
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    /// Spawn the agent binary with piped stdout/stderr in its own process
    /// group
    async fn spawn(
        &self,
        binary: &Path,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Child>;

    /// Non-blocking liveness check
    fn is_running(&self, pid: ProcessId) -> bool;

    /// Graceful termination signal (SIGTERM on Unix)
    async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult;

    /// Forceful kill (SIGKILL on Unix)
    async fn force_kill(&self, pid: ProcessId) -> TerminationResult;

    /// Terminate the process and all of its descendants
    async fn terminate_tree(&self, pid: ProcessId) -> TerminationResult;
}

/// Registry-facing view of a supervised process
pub trait OwnedProcess: Send + Sync {
    fn pid(&self) -> Option<ProcessId>;
    fn state(&self) -> ProcessState;
    fn cache_key(&self) -> &str;
}
