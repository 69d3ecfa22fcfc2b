#[cfg(unix)]
mod unix_impl {
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::collections::HashMap;
    use std::path::Path;
    use std::process::Stdio;
    use std::time::Duration;
    use sysinfo::System;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};
    use tunwarden_core::{ProcessDriver, ProcessId, TerminationResult};

    /// Unix process driver: spawns the agent in its own process group and
    /// signals it by pid, with process-tree cleanup via sysinfo.
    pub struct UnixProcessDriver {
        system: std::sync::Mutex<System>,
    }

    impl UnixProcessDriver {
        pub fn new() -> Self {
            Self {
                system: std::sync::Mutex::new(System::new_all()),
            }
        }

        /// Signal a single process by pid, escalating SIGTERM -> SIGKILL
        async fn terminate_single_process(&self, pid: ProcessId) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid as i32);

            match signal::kill(nix_pid, Signal::SIGTERM) {
                Ok(()) => {
                    debug!("Sent SIGTERM to process {}", pid);

                    // Wait briefly for graceful shutdown before SIGKILL
                    tokio::time::sleep(Duration::from_millis(500)).await;

                    match signal::kill(nix_pid, Signal::SIGKILL) {
                        Ok(()) => TerminationResult::Success,
                        Err(nix::errno::Errno::ESRCH) => TerminationResult::Success,
                        Err(e) => {
                            warn!("Failed to kill process {}: {}", pid, e);
                            TerminationResult::Failed(format!("SIGKILL failed: {e}"))
                        }
                    }
                }
                Err(nix::errno::Errno::ESRCH) => TerminationResult::ProcessNotFound,
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to terminate process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGTERM to process {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGTERM failed: {e}"))
                }
            }
        }

        fn find_child_processes(&self, parent_pid: ProcessId) -> Vec<ProcessId> {
            let mut system = self.system.lock().unwrap();
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid, &mut children);
            children
        }

        /// Recursively collect descendants, deepest first
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if let Some(ppid) = process.parent() {
                    if ppid.as_u32() == parent_pid {
                        let child_pid = pid.as_u32();
                        Self::find_children_recursive(system, child_pid, result);
                        result.push(child_pid);
                    }
                }
            }
        }
    }

    impl Default for UnixProcessDriver {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessDriver for UnixProcessDriver {
        async fn spawn(
            &self,
            binary: &Path,
            args: &[String],
            env: &HashMap<String, String>,
        ) -> Result<Child> {
            let mut cmd = Command::new(binary);
            cmd.args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            for (key, value) in env {
                cmd.env(key, value);
            }

            // Own process group so tree termination cannot take the
            // supervisor down with it
            cmd.process_group(0);
            cmd.kill_on_drop(true);

            let child = cmd
                .spawn()
                .with_context(|| format!("failed to spawn agent binary {}", binary.display()))?;

            if let Some(pid) = child.id() {
                info!("Spawned agent process {} (PID: {})", binary.display(), pid);
            }

            Ok(child)
        }

        fn is_running(&self, pid: ProcessId) -> bool {
            // Signal 0 probes for existence without delivering anything
            let nix_pid = NixPid::from_raw(pid as i32);
            signal::kill(nix_pid, None).is_ok()
        }

        async fn terminate_gracefully(&self, pid: ProcessId) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid as i32);

            match signal::kill(nix_pid, Signal::SIGTERM) {
                Ok(()) => {
                    debug!("Sent SIGTERM to process {}", pid);
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => TerminationResult::ProcessNotFound,
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to terminate process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGTERM to process {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGTERM failed: {e}"))
                }
            }
        }

        async fn force_kill(&self, pid: ProcessId) -> TerminationResult {
            let nix_pid = NixPid::from_raw(pid as i32);

            match signal::kill(nix_pid, Signal::SIGKILL) {
                Ok(()) => {
                    debug!("Sent SIGKILL to process {}", pid);
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => TerminationResult::ProcessNotFound,
                Err(nix::errno::Errno::EPERM) => {
                    warn!("Permission denied to kill process {}", pid);
                    TerminationResult::AccessDenied
                }
                Err(e) => {
                    warn!("Failed to send SIGKILL to process {}: {}", pid, e);
                    TerminationResult::Failed(format!("SIGKILL failed: {e}"))
                }
            }
        }

        async fn terminate_tree(&self, root_pid: ProcessId) -> TerminationResult {
            let children = self.find_child_processes(root_pid);

            if !children.is_empty() {
                debug!(
                    "Terminating {} descendants of process {}",
                    children.len(),
                    root_pid
                );

                // Children first, bottom-up
                for child_pid in &children {
                    match self.terminate_single_process(*child_pid).await {
                        TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                        result => {
                            warn!(
                                "Failed to terminate child process {}: {:?}",
                                child_pid, result
                            );
                        }
                    }
                }
            }

            match self.terminate_single_process(root_pid).await {
                TerminationResult::ProcessNotFound => TerminationResult::Success,
                result => result,
            }
        }
    }

}

#[cfg(unix)]
pub use unix_impl::UnixProcessDriver;

// Stub so the crate still type-checks on non-Unix hosts; the platform
// factory never selects it there.
#[cfg(not(unix))]
pub struct UnixProcessDriver;

#[cfg(not(unix))]
impl UnixProcessDriver {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
impl Default for UnixProcessDriver {
    fn default() -> Self {
        Self::new()
    }
}
