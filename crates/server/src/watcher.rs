//! Filesystem watcher and change broadcaster.
//!
//! Watches the agent root recursively, coalesces raw events through a
//! 100 ms per-file write-stabilization delay and a 300 ms trailing
//! debounce, then recomputes the project list and fans one
//! `projects_updated` frame out to every attached client.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agentdeck_protocol::ServerFrame;

use crate::projects::ProjectRegistry;

const DEBOUNCE_MS: u64 = 300;
const STABILIZE_MS: u64 = 100;
const MAX_DEPTH: usize = 10;

/// Broadcast timestamps are epoch milliseconds
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Directory names whose subtrees never matter
const IGNORED_DIRS: &[&str] = &["node_modules", ".git", "dist", "build"];
/// OS junk and editor droppings
const IGNORED_FILES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];
const IGNORED_SUFFIXES: &[&str] = &[".swp", ".swx", ".tmp", "~"];

// ---------------------------------------------------------------------------
// Client registry
// ---------------------------------------------------------------------------

/// Outcome of pushing a frame at one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Queue full; watcher frames are the first to be dropped
    Dropped,
    /// Client gone; swept from the registry
    Closed,
}

type SendFn = Box<dyn Fn(&ServerFrame) -> SendOutcome + Send + Sync>;

/// The broadcaster interface the gateway registers its sockets with.
/// Sends that report `Closed` remove the client on the next broadcast.
#[derive(Default)]
pub struct WatchClients {
    next_id: AtomicU64,
    inner: Mutex<Vec<(u64, SendFn)>>,
}

impl WatchClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a client; returns the id used to detach it.
    pub fn attach(&self, send: SendFn) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .expect("watch clients lock poisoned")
            .push((id, send));
        id
    }

    pub fn detach(&self, id: u64) {
        self.inner
            .lock()
            .expect("watch clients lock poisoned")
            .retain(|(client_id, _)| *client_id != id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("watch clients lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a frame at every client, sweeping closed ones.
    pub fn broadcast(&self, frame: &ServerFrame) {
        let mut clients = self.inner.lock().expect("watch clients lock poisoned");
        clients.retain(|(id, send)| match send(frame) {
            SendOutcome::Sent => true,
            SendOutcome::Dropped => {
                debug!(
                    component = "watcher",
                    event = "watcher.broadcast.dropped",
                    client_id = id,
                    "Client queue full, dropping projects_updated"
                );
                true
            }
            SendOutcome::Closed => {
                debug!(
                    component = "watcher",
                    event = "watcher.broadcast.swept",
                    client_id = id,
                    "Removing closed client"
                );
                false
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Event pipeline
// ---------------------------------------------------------------------------

/// Raw event kinds, in the vocabulary clients expect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Change,
    Unlink,
    AddDir,
    UnlinkDir,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Unlink => "unlink",
            Self::AddDir => "addDir",
            Self::UnlinkDir => "unlinkDir",
        }
    }

    fn from_event_kind(kind: &EventKind) -> Option<Self> {
        use notify::event::{CreateKind, RemoveKind};
        match kind {
            EventKind::Create(CreateKind::Folder) => Some(Self::AddDir),
            EventKind::Create(_) => Some(Self::Add),
            EventKind::Modify(_) => Some(Self::Change),
            EventKind::Remove(RemoveKind::Folder) => Some(Self::UnlinkDir),
            EventKind::Remove(_) => Some(Self::Unlink),
            _ => None,
        }
    }
}

/// Messages flowing through the coalescing loop
pub enum WatchMsg {
    Raw { path: PathBuf, kind: ChangeKind },
    Stable { path: PathBuf, kind: ChangeKind },
    Fire,
}

/// Run the watcher until the process exits. Owns the notify handle.
pub async fn run_watcher(
    registry: Arc<ProjectRegistry>,
    clients: Arc<WatchClients>,
) -> anyhow::Result<()> {
    let root = registry.agent_root().to_path_buf();
    std::fs::create_dir_all(&root)?;

    let (tx, rx) = mpsc::unbounded_channel::<WatchMsg>();
    let watcher_tx = tx.clone();
    let watch_root = root.clone();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let Some(kind) = ChangeKind::from_event_kind(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    if should_ignore(&watch_root, &path) {
                        continue;
                    }
                    let _ = watcher_tx.send(WatchMsg::Raw { path, kind });
                }
            }
            Err(err) => {
                warn!(
                    component = "watcher",
                    event = "watcher.fs_event_error",
                    error = %err,
                    "Watcher event error"
                );
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(&root, RecursiveMode::Recursive)?;

    info!(
        component = "watcher",
        event = "watcher.started",
        path = %root.display(),
        "Filesystem watcher started"
    );

    coalesce_loop(&root, registry, clients, rx, tx).await;
    Ok(())
}

/// The coalescing state machine, separated from notify so tests can feed
/// it synthetic events.
pub async fn coalesce_loop(
    root: &Path,
    registry: Arc<ProjectRegistry>,
    clients: Arc<WatchClients>,
    mut rx: mpsc::UnboundedReceiver<WatchMsg>,
    tx: mpsc::UnboundedSender<WatchMsg>,
) {
    let mut stabilizers: HashMap<PathBuf, JoinHandle<()>> = HashMap::new();
    let mut debounce: Option<JoinHandle<()>> = None;
    let mut last_change: Option<(ChangeKind, String)> = None;

    while let Some(msg) = rx.recv().await {
        match msg {
            WatchMsg::Raw { path, kind } => {
                if matches!(kind, ChangeKind::Add | ChangeKind::Change) {
                    // Wait for write quiescence so half-written log lines
                    // are never observed
                    if let Some(previous) = stabilizers.remove(&path) {
                        previous.abort();
                    }
                    let tx = tx.clone();
                    let stable_path = path.clone();
                    stabilizers.insert(
                        path,
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(STABILIZE_MS)).await;
                            let _ = tx.send(WatchMsg::Stable {
                                path: stable_path,
                                kind,
                            });
                        }),
                    );
                } else {
                    schedule_fire(&tx, &mut debounce, &mut last_change, root, &path, kind);
                }
            }
            WatchMsg::Stable { path, kind } => {
                stabilizers.remove(&path);
                schedule_fire(&tx, &mut debounce, &mut last_change, root, &path, kind);
            }
            WatchMsg::Fire => {
                debounce = None;
                let Some((kind, changed_file)) = last_change.take() else {
                    continue;
                };
                if clients.is_empty() {
                    continue;
                }
                let projects = registry.discover();
                debug!(
                    component = "watcher",
                    event = "watcher.broadcast",
                    change_type = kind.as_str(),
                    changed_file = %changed_file,
                    clients = clients.len(),
                    project_count = projects.len(),
                    "Broadcasting project update"
                );
                clients.broadcast(&ServerFrame::ProjectsUpdated {
                    projects,
                    timestamp: now_millis(),
                    change_type: kind.as_str().to_string(),
                    changed_file,
                });
            }
        }
    }
}

/// Record the latest observed change and restart the trailing debounce.
fn schedule_fire(
    tx: &mpsc::UnboundedSender<WatchMsg>,
    debounce: &mut Option<JoinHandle<()>>,
    last_change: &mut Option<(ChangeKind, String)>,
    root: &Path,
    path: &Path,
    kind: ChangeKind,
) {
    let rel = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();
    *last_change = Some((kind, rel));

    if let Some(previous) = debounce.take() {
        previous.abort();
    }
    let tx = tx.clone();
    *debounce = Some(tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS)).await;
        let _ = tx.send(WatchMsg::Fire);
    }));
}

fn should_ignore(root: &Path, path: &Path) -> bool {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return true,
    };
    if rel.components().count() > MAX_DEPTH {
        return true;
    }
    for component in rel.components() {
        let name = component.as_os_str().to_string_lossy();
        if IGNORED_DIRS.contains(&name.as_ref()) || IGNORED_FILES.contains(&name.as_ref()) {
            return true;
        }
    }
    if let Some(name) = path.file_name().map(|n| n.to_string_lossy()) {
        if IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn test_registry(tmp: &TempDir) -> Arc<ProjectRegistry> {
        let root = tmp.path().join("projects");
        std::fs::create_dir_all(&root).unwrap();
        Arc::new(ProjectRegistry::new(
            root,
            tmp.path().join("project-config.json"),
        ))
    }

    #[test]
    fn ignore_rules_cover_vendored_dirs_and_junk() {
        let root = Path::new("/agent/projects");
        let ignored = [
            "/agent/projects/p/node_modules/x.js",
            "/agent/projects/p/.git/HEAD",
            "/agent/projects/p/dist/out.js",
            "/agent/projects/p/.DS_Store",
            "/agent/projects/p/file.swp",
            "/agent/projects/p/notes~",
        ];
        for path in ignored {
            assert!(should_ignore(root, Path::new(path)), "{path} should be ignored");
        }
        assert!(!should_ignore(
            root,
            Path::new("/agent/projects/p/session.jsonl")
        ));
        // Outside the root is never ours
        assert!(should_ignore(root, Path::new("/elsewhere/session.jsonl")));
    }

    #[test]
    fn depth_is_bounded() {
        let root = Path::new("/agent/projects");
        let deep = root.join("a/b/c/d/e/f/g/h/i/j/k.jsonl");
        assert!(should_ignore(root, &deep));
    }

    #[tokio::test]
    async fn rapid_events_coalesce_into_one_broadcast() {
        let tmp = TempDir::new().unwrap();
        let registry = test_registry(&tmp);
        let root = registry.agent_root().to_path_buf();
        let clients = Arc::new(WatchClients::new());

        let hits = Arc::new(AtomicUsize::new(0));
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();
        let hits_clone = hits.clone();
        clients.attach(Box::new(move |frame| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            let _ = frame_tx.send(frame.clone());
            SendOutcome::Sent
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let loop_root = root.clone();
        let loop_clients = clients.clone();
        let loop_tx = tx.clone();
        tokio::spawn(async move {
            coalesce_loop(&loop_root, registry, loop_clients, rx, loop_tx).await;
        });

        // 50 rapid events on the same file inside 100 ms
        let target = root.join("-tmp-p").join("s.jsonl");
        for _ in 0..50 {
            tx.send(WatchMsg::Raw {
                path: target.clone(),
                kind: ChangeKind::Add,
            })
            .unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let frame = tokio::time::timeout(Duration::from_millis(1500), frame_rx.recv())
            .await
            .expect("broadcast within deadline")
            .expect("frame");
        match frame {
            ServerFrame::ProjectsUpdated {
                change_type,
                changed_file,
                ..
            } => {
                assert_eq!(change_type, "add");
                assert_eq!(changed_file, "-tmp-p/s.jsonl");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Nothing else arrives afterwards
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_clients_are_swept_on_broadcast() {
        let clients = WatchClients::new();
        clients.attach(Box::new(|_| SendOutcome::Closed));
        let kept = clients.attach(Box::new(|_| SendOutcome::Sent));
        assert_eq!(clients.len(), 2);

        clients.broadcast(&ServerFrame::Error {
            error: "x".into(),
        });
        assert_eq!(clients.len(), 1);
        clients.detach(kept);
        assert!(clients.is_empty());
    }
}
