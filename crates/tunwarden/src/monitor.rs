use anyhow::Context;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};
use tunwarden_core::{
    AgentEvent, OwnedProcess, ProcessDriver, ProcessId, ProcessState, Registry, TunnelConfig,
    TunnelProto, TunwardenError, parse_log_line,
};

/// Environment variable used to hand the auth token to the agent. The
/// preferred channel: it never shows up in process listings the way argv
/// would.
pub const AUTH_TOKEN_ENV: &str = "TUNWARDEN_AUTHTOKEN";

/// Invoked with the process cache key when an agent dies behind our back
pub type CrashCallback = Box<dyn Fn(&str) + Send + Sync>;

/// One spawned agent process: the OS child, its log reader task, and the
/// channels the rest of the supervisor observes it through.
pub struct SupervisedProcess {
    pid: ProcessId,
    key: String,
    binary: PathBuf,
    grace: Duration,
    child: Mutex<Option<Child>>,
    state_tx: watch::Sender<ProcessState>,
    events_tx: broadcast::Sender<AgentEvent>,
    startup_failure: StdMutex<Option<(i64, String)>>,
    started_at: Instant,
    last_seen: RwLock<Instant>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl SupervisedProcess {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AgentEvent> {
        self.events_tx.subscribe()
    }

    pub fn binary(&self) -> &std::path::Path {
        &self.binary
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Instant of the last log line observed from the agent
    pub fn last_seen_alive(&self) -> Instant {
        *self.last_seen.read().unwrap()
    }

    /// State-machine transition; returns false when the current state does
    /// not admit `next` (terminal states never do)
    fn transition(&self, next: ProcessState) -> bool {
        let mut moved = false;
        self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                moved = true;
                true
            } else {
                false
            }
        });
        moved
    }
}

impl OwnedProcess for SupervisedProcess {
    fn pid(&self) -> Option<ProcessId> {
        Some(self.pid)
    }

    fn state(&self) -> ProcessState {
        SupervisedProcess::state(self)
    }

    fn cache_key(&self) -> &str {
        &self.key
    }
}

/// Spawns agent processes, watches their structured log stream for
/// readiness and endpoint reports, and terminates them with SIGTERM ->
/// SIGKILL escalation.
pub struct ProcessMonitor {
    driver: Arc<dyn ProcessDriver>,
    registry: Arc<Registry<SupervisedProcess>>,
    crash_callbacks: Arc<StdMutex<Vec<CrashCallback>>>,
}

impl ProcessMonitor {
    pub fn new(driver: Arc<dyn ProcessDriver>, registry: Arc<Registry<SupervisedProcess>>) -> Self {
        Self {
            driver,
            registry,
            crash_callbacks: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Register a callback fired when a running agent exits unexpectedly.
    /// Crashes after a successful connect surface only here, never as an
    /// error thrown into unrelated call sites.
    pub fn on_crash(&self, callback: CrashCallback) {
        self.crash_callbacks.lock().unwrap().push(callback);
    }

    /// Spawn the agent for `config` and wait until it reports ready.
    ///
    /// On startup timeout or a fatal error event the child is terminated
    /// before the error propagates; no child process outlives a failed
    /// spawn.
    pub async fn spawn(
        &self,
        config: &TunnelConfig,
    ) -> Result<Arc<SupervisedProcess>, TunwardenError> {
        config
            .validate()
            .map_err(|e| TunwardenError::Config(e.to_string()))?;

        let key = config.cache_key();
        let config_path = write_agent_config(config).await?;
        let args = agent_args(config, &config_path);

        let mut env = config.env.clone();
        if let Some(token) = &config.auth_token {
            if !config.auth_token_in_file {
                env.insert(AUTH_TOKEN_ENV.to_string(), token.clone());
            }
        }

        let mut child = self
            .driver
            .spawn(&config.binary_path, &args, &env)
            .await
            .map_err(TunwardenError::Other)?;
        let pid = child
            .id()
            .ok_or_else(|| TunwardenError::ProcessCrashed { key: key.clone() })?;
        let stdout = child
            .stdout
            .take()
            .context("agent stdout was not piped")?;
        let stderr = child.stderr.take();

        let (state_tx, _) = watch::channel(ProcessState::Starting);
        let (events_tx, _) = broadcast::channel(64);
        let now = Instant::now();

        let process = Arc::new(SupervisedProcess {
            pid,
            key: key.clone(),
            binary: config.binary_path.clone(),
            grace: config.termination_grace(),
            child: Mutex::new(Some(child)),
            state_tx,
            events_tx,
            startup_failure: StdMutex::new(None),
            started_at: now,
            last_seen: RwLock::new(now),
            reader: StdMutex::new(None),
        });

        self.registry.insert_process(&key, process.clone());

        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(stderr, pid));
        }

        let reader = tokio::spawn(read_log_stream(
            stdout,
            process.clone(),
            self.registry.clone(),
            self.driver.clone(),
            self.crash_callbacks.clone(),
            config.proto,
        ));
        *process.reader.lock().unwrap() = Some(reader);

        match tokio::time::timeout(config.startup_timeout(), wait_for_ready(&process)).await {
            Ok(Ok(())) => {
                info!(pid, key = %key, "agent process is ready");
                Ok(process)
            }
            Ok(Err(err)) => {
                self.terminate(&process).await;
                self.registry.remove_process(&key);
                Err(err)
            }
            Err(_) => {
                warn!(pid, key = %key, "agent did not become ready in time, killing it");
                self.terminate(&process).await;
                self.registry.remove_process(&key);
                Err(TunwardenError::StartupTimeout {
                    binary: config.binary_path.clone(),
                    timeout: config.startup_timeout(),
                })
            }
        }
    }

    /// Graceful termination with SIGKILL escalation. Idempotent: calling it
    /// on an already-dead process is a no-op at the OS level, and the
    /// reader task is always reaped.
    pub async fn terminate(&self, process: &Arc<SupervisedProcess>) {
        process.transition(ProcessState::Stopping);

        if let tunwarden_core::TerminationResult::AccessDenied =
            self.driver.terminate_gracefully(process.pid).await
        {
            warn!(pid = process.pid, "no permission to signal agent process");
        }

        {
            let mut guard = process.child.lock().await;
            if let Some(child) = guard.as_mut() {
                if tokio::time::timeout(process.grace, child.wait())
                    .await
                    .is_err()
                {
                    warn!(
                        pid = process.pid,
                        "agent ignored graceful shutdown, escalating to forceful kill"
                    );
                    let _ = self.driver.force_kill(process.pid).await;
                    let _ = child.wait().await;
                }
            }
        }

        process.transition(ProcessState::Stopped);

        let reader = process.reader.lock().unwrap().take();
        if let Some(handle) = reader {
            // Child is dead: the stream is at EOF, so the task ends on its
            // own; abort covers the pathological case of an inherited pipe
            handle.abort();
            let _ = handle.await;
        }

        debug!(pid = process.pid, "agent process terminated");
    }
}

async fn wait_for_ready(process: &Arc<SupervisedProcess>) -> Result<(), TunwardenError> {
    let mut rx = process.subscribe_state();
    loop {
        let state = *rx.borrow_and_update();
        match state {
            ProcessState::Ready => return Ok(()),
            ProcessState::Crashed => {
                let failure = process.startup_failure.lock().unwrap().take();
                return Err(match failure {
                    Some((code, message)) => TunwardenError::AgentProcess { code, message },
                    None => TunwardenError::ProcessCrashed {
                        key: process.key.clone(),
                    },
                });
            }
            ProcessState::Stopping | ProcessState::Stopped => {
                return Err(TunwardenError::ProcessCrashed {
                    key: process.key.clone(),
                });
            }
            ProcessState::Starting => {}
        }
        if rx.changed().await.is_err() {
            return Err(TunwardenError::ProcessCrashed {
                key: process.key.clone(),
            });
        }
    }
}

/// Bound on waiting for the exit status once the log stream has closed
const EOF_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// One reader per process: events from a single agent are handled strictly
/// in emission order.
async fn read_log_stream(
    stdout: ChildStdout,
    process: Arc<SupervisedProcess>,
    registry: Arc<Registry<SupervisedProcess>>,
    driver: Arc<dyn ProcessDriver>,
    crash_callbacks: Arc<StdMutex<Vec<CrashCallback>>>,
    requested_proto: TunnelProto,
) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new());

    while let Some(frame) = lines.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(e) => {
                warn!(pid = process.pid, "agent log stream error: {e}");
                break;
            }
        };

        *process.last_seen.write().unwrap() = Instant::now();

        match parse_log_line(&line) {
            Some(AgentEvent::Starting) => {
                debug!(pid = process.pid, "agent initializing");
            }
            Some(AgentEvent::Ready) => {
                if process.transition(ProcessState::Ready) {
                    debug!(pid = process.pid, "agent reported ready");
                }
            }
            Some(event @ AgentEvent::TunnelEstablished { .. }) => {
                if let AgentEvent::TunnelEstablished { name, url, addr } = &event {
                    info!(
                        pid = process.pid,
                        name = %name,
                        url = %url,
                        "tunnel established"
                    );
                    registry.register(tunwarden_core::Tunnel {
                        name: name.clone(),
                        public_url: url.clone(),
                        proto: TunnelProto::from_url(url).unwrap_or(requested_proto),
                        local_addr: addr.clone(),
                        process_key: process.key.clone(),
                    });
                }
                // Register before broadcasting so a waiter that sees the
                // event always finds the tunnel in the registry
                let _ = process.events_tx.send(event);
            }
            Some(AgentEvent::Error { code, message }) => {
                if SupervisedProcess::state(&process) == ProcessState::Starting {
                    error!(
                        pid = process.pid,
                        code, "fatal agent error during startup: {message}"
                    );
                    *process.startup_failure.lock().unwrap() = Some((code, message));
                    process.transition(ProcessState::Crashed);
                    break;
                }
                warn!(pid = process.pid, code, "agent error: {message}");
            }
            None => {}
        }
    }

    // EOF (or unreadable stream). Distinguish supervised shutdown from an
    // unexpected death.
    let prior = SupervisedProcess::state(&process);
    if prior == ProcessState::Stopping || prior.is_terminal() {
        return;
    }

    // The child is only reaped through this handle, so a one-shot try_wait
    // at EOF races the exit itself. EOF means the exit status is imminent;
    // wait for it with a bound.
    let exited = {
        let mut guard = process.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(
                tokio::time::timeout(EOF_REAP_TIMEOUT, child.wait()).await,
                Ok(Ok(_))
            ),
            None => true,
        }
    };

    if exited || !driver.is_running(process.pid) {
        if process.transition(ProcessState::Crashed) {
            warn!(
                pid = process.pid,
                key = %process.key,
                "agent process exited unexpectedly"
            );
            let (_, orphaned) = registry.remove_process(&process.key);
            if !orphaned.is_empty() {
                warn!(
                    pid = process.pid,
                    count = orphaned.len(),
                    "invalidated tunnels of crashed agent"
                );
            }
            // A startup crash already fails the spawn call synchronously;
            // callbacks are for agents that die after becoming ready
            if prior == ProcessState::Ready {
                for callback in crash_callbacks.lock().unwrap().iter() {
                    callback(&process.key);
                }
            }
        }
    } else {
        warn!(
            pid = process.pid,
            "agent closed its log stream but is still running"
        );
    }
}

async fn drain_stderr(stderr: ChildStderr, pid: ProcessId) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new());
    while let Some(Ok(line)) = lines.next().await {
        debug!(pid, "agent stderr: {line}");
    }
}

/// Flags handed to the agent binary. Secrets never appear here; the auth
/// token travels through the environment or the config file.
fn agent_args(config: &TunnelConfig, config_path: &std::path::Path) -> Vec<String> {
    let mut args = vec![
        "start".to_string(),
        "--config".to_string(),
        config_path.to_string_lossy().into_owned(),
        "--log".to_string(),
        "stdout".to_string(),
        "--log-format".to_string(),
        "json".to_string(),
        "--proto".to_string(),
        config.proto.to_string(),
        "--port".to_string(),
        config.port.to_string(),
    ];
    if let Some(region) = &config.region {
        args.push("--region".to_string());
        args.push(region.clone());
    }
    args
}

/// Write the generated agent config file, unless the caller already
/// maintains one at that path.
async fn write_agent_config(config: &TunnelConfig) -> Result<PathBuf, TunwardenError> {
    let path = config.resolved_config_path();
    if path.exists() {
        return Ok(path);
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut contents = String::from("version: 2\n");
    if let Some(region) = &config.region {
        contents.push_str(&format!("region: {region}\n"));
    }
    contents.push_str(&format!("web_addr: 127.0.0.1:{}\n", config.web_port));
    contents.push_str("log_format: json\n");
    if config.auth_token_in_file {
        if let Some(token) = &config.auth_token {
            contents.push_str(&format!("authtoken: {token}\n"));
        }
    }

    tokio::fs::write(&path, contents).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunwarden_core::TunnelConfig;

    fn config_in(dir: &std::path::Path) -> TunnelConfig {
        TunnelConfig::builder()
            .binary_path(dir.join("tunneld"))
            .port(4040u16)
            .region("us")
            .auth_token("tok_secret")
            .build()
            .unwrap()
    }

    #[test]
    fn test_agent_args_carry_no_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let args = agent_args(&config, &config.resolved_config_path());

        assert!(args.iter().all(|a| !a.contains("tok_secret")));
        assert!(args.contains(&"--log-format".to_string()));
        assert!(args.contains(&"json".to_string()));
        assert!(args.contains(&"4040".to_string()));
        assert!(args.contains(&"us".to_string()));
    }

    #[tokio::test]
    async fn test_generated_config_file_defaults_to_env_token() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let path = write_agent_config(&config).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();

        assert!(contents.contains("region: us"));
        assert!(contents.contains("log_format: json"));
        assert!(!contents.contains("tok_secret"));
    }

    #[tokio::test]
    async fn test_token_written_to_file_only_when_opted_in() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.auth_token_in_file = true;

        let path = write_agent_config(&config).await.unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("authtoken: tok_secret"));
    }

    #[tokio::test]
    async fn test_existing_config_file_is_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        let custom = dir.path().join("custom.yml");
        std::fs::write(&custom, "authtoken: theirs\n").unwrap();
        config.config_path = Some(custom.clone());

        let path = write_agent_config(&config).await.unwrap();
        assert_eq!(path, custom);
        assert_eq!(
            std::fs::read_to_string(&custom).unwrap(),
            "authtoken: theirs\n"
        );
    }
}
