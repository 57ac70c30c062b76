//! Application state
//!
//! Everything the gateway owns lives here as explicit fields with a
//! defined startup/shutdown lifecycle: the env store, the project
//! registry, the live-invocation map, and the watcher client set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use agentdeck_runner::AgentHandle;

use crate::env_store::EnvStore;
use crate::projects::ProjectRegistry;
use crate::watcher::WatchClients;

/// Shared gateway state
pub struct Gateway {
    pub env: EnvStore,
    pub projects: Arc<ProjectRegistry>,
    pub invocations: InvocationMap,
    pub watch_clients: Arc<WatchClients>,
    /// MCP tool config consulted at spawn time
    pub mcp_config: PathBuf,
}

impl Gateway {
    pub fn new(agent_root: PathBuf, sidecar_path: PathBuf, mcp_config: PathBuf) -> Self {
        Self {
            env: EnvStore::new(),
            projects: Arc::new(ProjectRegistry::new(agent_root, sidecar_path)),
            invocations: InvocationMap::new(),
            watch_clients: Arc::new(WatchClients::new()),
            mcp_config,
        }
    }

    /// SIGTERM every live child and wait for the reapers to drain the
    /// map, bounded by `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let signalled = self.invocations.terminate_all();
        if signalled == 0 {
            return;
        }
        info!(
            component = "gateway",
            event = "gateway.shutdown.signalled",
            children = signalled,
            "Waiting for agent children to exit"
        );
        let deadline = tokio::time::Instant::now() + grace;
        while !self.invocations.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

struct InvocationEntry {
    handle: AgentHandle,
    /// Connection that started the invocation; its close aborts us
    owner: u64,
}

/// Live invocations keyed by invocation id until the agent discloses a
/// session id, then re-keyed to it. Single-key operations are atomic.
#[derive(Default)]
pub struct InvocationMap {
    inner: Mutex<HashMap<String, InvocationEntry>>,
}

impl InvocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: String, handle: AgentHandle, owner: u64) {
        self.inner
            .lock()
            .expect("invocation map lock poisoned")
            .insert(key, InvocationEntry { handle, owner });
    }

    /// Move an entry to its captured session id. No-op when the keys are
    /// equal or the old key is already gone (abort races are benign).
    pub fn rekey(&self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let mut inner = self.inner.lock().expect("invocation map lock poisoned");
        if let Some(entry) = inner.remove(old) {
            debug!(
                component = "gateway",
                event = "gateway.invocation.rekeyed",
                from = %old,
                to = %new,
                "Invocation re-keyed to captured session id"
            );
            inner.insert(new.to_string(), entry);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner
            .lock()
            .expect("invocation map lock poisoned")
            .remove(key)
            .is_some()
    }

    /// Signal one invocation. Returns whether a handle was found; the
    /// entry is removed so a second abort reports `false`.
    pub fn abort(&self, key: &str) -> bool {
        let entry = self
            .inner
            .lock()
            .expect("invocation map lock poisoned")
            .remove(key);
        match entry {
            Some(entry) => {
                entry.handle.signal_terminate();
                true
            }
            None => false,
        }
    }

    /// Abort every invocation owned by a closing connection.
    pub fn abort_owned_by(&self, owner: u64) -> usize {
        let mut inner = self.inner.lock().expect("invocation map lock poisoned");
        let keys: Vec<String> = inner
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            if let Some(entry) = inner.remove(key) {
                entry.handle.signal_terminate();
            }
        }
        keys.len()
    }

    /// Signal everything; used at server shutdown.
    pub fn terminate_all(&self) -> usize {
        let inner = self.inner.lock().expect("invocation map lock poisoned");
        for entry in inner.values() {
            entry.handle.signal_terminate();
        }
        inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("invocation map lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
