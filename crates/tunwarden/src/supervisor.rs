use crate::installer::Installer;
use crate::monitor::{CrashCallback, ProcessMonitor, SupervisedProcess};
use crate::platform::PlatformDriverFactory;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tunwarden_core::{
    AgentEvent, ProcessDriver, ProcessState, Registry, Tunnel, TunnelConfig, TunwardenError,
};

/// The facade callers use: connect/disconnect tunnels, list active
/// endpoints, and guarantee no orphaned agent processes outlive the
/// supervisor.
///
/// All cross-thread state lives in the injected [`Registry`]; there are no
/// process-wide globals.
pub struct Supervisor {
    registry: Arc<Registry<SupervisedProcess>>,
    monitor: ProcessMonitor,
    installer: Installer,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_driver(PlatformDriverFactory::create_driver())
    }

    /// Construct with an explicit process driver (used by tests and
    /// embedders with custom platforms)
    pub fn with_driver(driver: Arc<dyn ProcessDriver>) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            monitor: ProcessMonitor::new(driver, registry.clone()),
            installer: Installer::new(),
            registry,
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a callback for agents that die after a successful connect
    pub fn on_crash(&self, callback: CrashCallback) {
        self.monitor.on_crash(callback);
    }

    /// Open a tunnel: install the agent if needed, spawn it (or reuse the
    /// running agent for the same config key), and wait for the endpoint
    /// matching the requested port.
    pub async fn connect(&self, config: &TunnelConfig) -> Result<Tunnel, TunwardenError> {
        let _serialized = self.connect_lock.lock().await;

        self.installer
            .ensure_binary(&config.binary_path, std::env::consts::OS, &config.download)
            .await?;

        let key = config.cache_key();
        let mut fresh = false;
        let process = match self.registry.process(&key) {
            Some(process) if process.state() == ProcessState::Ready => {
                debug!(key = %key, "reusing running agent process");
                process
            }
            other => {
                if other.is_some() {
                    // Stale handle (crashed or stopped): drop it and respawn
                    self.registry.remove_process(&key);
                }
                fresh = true;
                self.spawn_with_policy(config).await?
            }
        };

        // Subscribe before consulting the registry so an endpoint reported
        // between the lookup and the wait is never missed
        let mut events = process.subscribe_events();
        if let Some(tunnel) = self
            .registry
            .tunnels_for(&key)
            .into_iter()
            .find(|t| t.forwards_port(config.port))
        {
            return Ok(tunnel);
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(AgentEvent::TunnelEstablished { name, .. }) => {
                        if let Some(tunnel) = self.registry.get(&name) {
                            if tunnel.forwards_port(config.port) {
                                return Ok(tunnel);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(key = %key, skipped, "event stream lagged, re-checking registry");
                        if let Some(tunnel) = self
                            .registry
                            .tunnels_for(&key)
                            .into_iter()
                            .find(|t| t.forwards_port(config.port))
                        {
                            return Ok(tunnel);
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err(TunwardenError::ProcessCrashed { key: key.clone() });
                    }
                }
            }
        };

        match tokio::time::timeout(config.startup_timeout(), wait).await {
            Ok(result) => result,
            Err(_) => {
                if fresh {
                    // Agent we just spawned never reported the requested
                    // endpoint: take it down rather than leak it
                    self.monitor.terminate(&process).await;
                    self.registry.remove_process(&key);
                }
                Err(TunwardenError::StartupTimeout {
                    binary: config.binary_path.clone(),
                    timeout: config.startup_timeout(),
                })
            }
        }
    }

    async fn spawn_with_policy(
        &self,
        config: &TunnelConfig,
    ) -> Result<Arc<SupervisedProcess>, TunwardenError> {
        match self.monitor.spawn(config).await {
            Ok(process) => Ok(process),
            Err(err) if config.retry_on_spawn_failure && !err.is_permanent() => {
                warn!("agent spawn failed, retrying once: {err}");
                self.monitor.spawn(config).await
            }
            Err(err) => Err(err),
        }
    }

    /// Close one tunnel by name. When the last tunnel of an agent goes, the
    /// agent process is terminated with it.
    pub async fn disconnect(&self, name: &str) -> Result<(), TunwardenError> {
        let tunnel = self.registry.unregister(name)?;
        info!(name = %name, url = %tunnel.public_url, "tunnel disconnected");

        if self.registry.tunnels_for(&tunnel.process_key).is_empty() {
            let (process, _) = self.registry.remove_process(&tunnel.process_key);
            if let Some(process) = process {
                debug!(key = %tunnel.process_key, "last tunnel closed, stopping agent");
                self.monitor.terminate(&process).await;
            }
        }
        Ok(())
    }

    /// All currently valid tunnels
    pub fn tunnels(&self) -> Vec<Tunnel> {
        self.registry.list()
    }

    /// One endpoint by name
    pub fn tunnel(&self, name: &str) -> Option<Tunnel> {
        self.registry.get(name)
    }

    /// Tracked agent processes
    pub fn processes(&self) -> Vec<Arc<SupervisedProcess>> {
        self.registry.processes()
    }

    /// Terminate every tracked agent and clear the registry. Used at
    /// shutdown so no child processes survive the caller's lifetime.
    pub async fn kill_all(&self) {
        let processes = self.registry.clear();
        if processes.is_empty() {
            return;
        }
        info!(count = processes.len(), "terminating all agent processes");
        for process in processes {
            self.monitor.terminate(&process).await;
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Emergency cleanup; the async kill_all path is the proper one
        let processes = self.registry.clear();
        if processes.is_empty() {
            return;
        }

        warn!(
            count = processes.len(),
            "supervisor dropped with live agent processes, sending SIGTERM"
        );

        for process in processes {
            #[cfg(unix)]
            {
                use nix::sys::signal::{self, Signal};
                use nix::unistd::Pid as NixPid;

                let pid = NixPid::from_raw(process.pid() as i32);
                if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                    warn!("emergency cleanup failed for process {}: {}", process.pid(), e);
                }
            }
        }
    }
}
