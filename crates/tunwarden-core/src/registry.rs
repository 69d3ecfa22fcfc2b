use crate::error::TunwardenError;
use crate::process::OwnedProcess;
use crate::tunnel::Tunnel;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide in-memory state: config key -> process handle and tunnel
/// name -> tunnel.
///
/// Both maps sit behind one coarse lock: mutations arrive from the
/// per-process log reader tasks and from API callers on arbitrary threads,
/// and these are rare human-timescale operations, not hot-path calls.
/// Nothing here is persisted; state is rebuilt only from live process
/// reports.
pub struct Registry<H> {
    inner: Mutex<Inner<H>>,
}

struct Inner<H> {
    processes: HashMap<String, Arc<H>>,
    tunnels: HashMap<String, Tunnel>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                processes: HashMap::new(),
                tunnels: HashMap::new(),
            }),
        }
    }
}

impl<H: OwnedProcess> Registry<H> {
    pub fn insert_process(&self, key: &str, process: Arc<H>) {
        let mut inner = self.inner.lock().unwrap();
        inner.processes.insert(key.to_string(), process);
    }

    pub fn process(&self, key: &str) -> Option<Arc<H>> {
        self.inner.lock().unwrap().processes.get(key).cloned()
    }

    pub fn processes(&self) -> Vec<Arc<H>> {
        self.inner.lock().unwrap().processes.values().cloned().collect()
    }

    /// Remove a process and invalidate every tunnel it owns. Returns the
    /// handle (if tracked) and the tunnels that were dropped with it.
    pub fn remove_process(&self, key: &str) -> (Option<Arc<H>>, Vec<Tunnel>) {
        let mut inner = self.inner.lock().unwrap();
        let process = inner.processes.remove(key);
        let mut orphaned = Vec::new();
        inner.tunnels.retain(|_, tunnel| {
            if tunnel.process_key == key {
                orphaned.push(tunnel.clone());
                false
            } else {
                true
            }
        });
        (process, orphaned)
    }

    pub fn register(&self, tunnel: Tunnel) {
        let mut inner = self.inner.lock().unwrap();
        inner.tunnels.insert(tunnel.name.clone(), tunnel);
    }

    pub fn unregister(&self, name: &str) -> Result<Tunnel, TunwardenError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tunnels
            .remove(name)
            .ok_or_else(|| TunwardenError::UnknownTunnel {
                name: name.to_string(),
            })
    }

    pub fn get(&self, name: &str) -> Option<Tunnel> {
        let mut inner = self.inner.lock().unwrap();
        Self::prune_orphans(&mut inner);
        inner.tunnels.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Tunnel> {
        let mut inner = self.inner.lock().unwrap();
        Self::prune_orphans(&mut inner);
        inner.tunnels.values().cloned().collect()
    }

    /// Tunnels owned by one process
    pub fn tunnels_for(&self, key: &str) -> Vec<Tunnel> {
        let mut inner = self.inner.lock().unwrap();
        Self::prune_orphans(&mut inner);
        inner
            .tunnels
            .values()
            .filter(|t| t.process_key == key)
            .cloned()
            .collect()
    }

    /// Drop all state, returning the processes so the caller can terminate
    /// them outside the lock
    pub fn clear(&self) -> Vec<Arc<H>> {
        let mut inner = self.inner.lock().unwrap();
        inner.tunnels.clear();
        inner.processes.drain().map(|(_, p)| p).collect()
    }

    /// A tunnel is valid only while its owning process is tracked and not
    /// in a terminal state
    fn prune_orphans(inner: &mut Inner<H>) {
        let Inner { processes, tunnels } = inner;
        tunnels.retain(|_, tunnel| {
            processes
                .get(&tunnel.process_key)
                .is_some_and(|p| !p.state().is_terminal())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelProto;
    use crate::process::{ProcessId, ProcessState};
    use std::sync::atomic::{AtomicU8, Ordering};

    struct StubProcess {
        key: String,
        state: AtomicU8,
    }

    impl StubProcess {
        fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                state: AtomicU8::new(0),
            })
        }

        fn crash(&self) {
            self.state.store(1, Ordering::SeqCst);
        }
    }

    impl OwnedProcess for StubProcess {
        fn pid(&self) -> Option<ProcessId> {
            Some(4242)
        }

        fn state(&self) -> ProcessState {
            if self.state.load(Ordering::SeqCst) == 0 {
                ProcessState::Ready
            } else {
                ProcessState::Crashed
            }
        }

        fn cache_key(&self) -> &str {
            &self.key
        }
    }

    fn tunnel(name: &str, key: &str) -> Tunnel {
        Tunnel {
            name: name.to_string(),
            public_url: format!("https://{name}.ngrok.io"),
            proto: TunnelProto::Http,
            local_addr: "localhost:8080".into(),
            process_key: key.to_string(),
        }
    }

    #[test]
    fn test_register_get_list() {
        let registry: Registry<StubProcess> = Registry::new();
        registry.insert_process("k1", StubProcess::new("k1"));
        registry.register(tunnel("t1", "k1"));

        assert_eq!(registry.get("t1").unwrap().name, "t1");
        assert_eq!(registry.list().len(), 1);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_unregister_unknown_tunnel() {
        let registry: Registry<StubProcess> = Registry::new();
        registry.insert_process("k1", StubProcess::new("k1"));
        registry.register(tunnel("t1", "k1"));

        assert!(registry.unregister("t1").is_ok());
        match registry.unregister("t1") {
            Err(TunwardenError::UnknownTunnel { name }) => assert_eq!(name, "t1"),
            other => panic!("expected UnknownTunnel, got {other:?}"),
        }
    }

    #[test]
    fn test_remove_process_invalidates_owned_tunnels() {
        let registry: Registry<StubProcess> = Registry::new();
        registry.insert_process("k1", StubProcess::new("k1"));
        registry.insert_process("k2", StubProcess::new("k2"));
        registry.register(tunnel("t1", "k1"));
        registry.register(tunnel("t2", "k1"));
        registry.register(tunnel("t3", "k2"));

        let (process, orphaned) = registry.remove_process("k1");
        assert!(process.is_some());
        assert_eq!(orphaned.len(), 2);
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.list()[0].name, "t3");
    }

    #[test]
    fn test_orphaned_tunnels_pruned_opportunistically() {
        let registry: Registry<StubProcess> = Registry::new();
        let process = StubProcess::new("k1");
        registry.insert_process("k1", process.clone());
        registry.register(tunnel("t1", "k1"));
        // Tunnel registered without any tracked owner is invalid from the start
        registry.register(tunnel("ghost", "missing"));

        assert_eq!(registry.list().len(), 1);

        process.crash();
        assert!(registry.get("t1").is_none());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_clear_returns_processes() {
        let registry: Registry<StubProcess> = Registry::new();
        registry.insert_process("k1", StubProcess::new("k1"));
        registry.insert_process("k2", StubProcess::new("k2"));
        registry.register(tunnel("t1", "k1"));

        let processes = registry.clear();
        assert_eq!(processes.len(), 2);
        assert!(registry.list().is_empty());
        assert!(registry.processes().is_empty());
    }
}
