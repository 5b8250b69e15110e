//! Presence watcher for removable mount points.
//!
//! Native file-event APIs stop reporting once a mount point disappears and
//! never report a path that does not exist yet, so presence is sampled by
//! polling. A target whose parent has vanished too is tracked through its
//! deepest surviving ancestor (its anchor) until the chain comes back.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf, MAIN_SEPARATOR_STR};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Appeared(PathBuf),
    Disappeared(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Appeared(p) | WatchEvent::Disappeared(p) => p,
        }
    }
}

/// How a target is currently being observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchState {
    /// The target itself is polled. `present` is the last sample.
    Direct { present: bool },
    /// Target and parent are gone; the given ancestor is polled instead.
    ViaAncestor(PathBuf),
}

#[derive(Debug, Default)]
struct WatchSet {
    targets: HashMap<PathBuf, WatchState>,
}

#[derive(Clone)]
pub struct DirectoryWatcher {
    watch_set: Arc<Mutex<WatchSet>>,
    poll_interval: Duration,
}

impl DirectoryWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            watch_set: Arc::new(Mutex::new(WatchSet::default())),
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Start watching `path`. Its current presence becomes the baseline; no
    /// event is emitted for a path that is already there.
    pub async fn add(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        if self.watch_set.lock().targets.contains_key(&path) {
            return;
        }

        let state = if exists(&path).await {
            WatchState::Direct { present: true }
        } else {
            absent_state(&path).await
        };
        info!("Watching {} ({:?})", path.display(), state);

        // A concurrent add may have won the race; keep whichever came first.
        self.watch_set.lock().targets.entry(path).or_insert(state);
    }

    /// Stop watching `path`, dropping any anchor held for it.
    pub fn remove(&self, path: &Path) -> bool {
        let removed = self.watch_set.lock().targets.remove(path);
        if let Some(state) = &removed {
            info!("Stopped watching {} ({:?})", path.display(), state);
        }
        removed.is_some()
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.watch_set.lock().targets.contains_key(path)
    }

    /// Last sampled presence. `None` if the path is not watched.
    pub fn is_present(&self, path: &Path) -> Option<bool> {
        self.watch_set.lock().targets.get(path).map(|state| {
            matches!(state, WatchState::Direct { present: true })
        })
    }

    pub fn state(&self, path: &Path) -> Option<WatchState> {
        self.watch_set.lock().targets.get(path).cloned()
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.watch_set.lock().targets.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Targets currently observed through an ancestor, with that ancestor.
    pub fn anchors(&self) -> HashMap<PathBuf, PathBuf> {
        self.watch_set
            .lock()
            .targets
            .iter()
            .filter_map(|(path, state)| match state {
                WatchState::ViaAncestor(anchor) => Some((path.clone(), anchor.clone())),
                WatchState::Direct { .. } => None,
            })
            .collect()
    }

    /// Distinct directories the poller is sampling.
    pub fn polled_paths(&self) -> BTreeSet<PathBuf> {
        self.watch_set
            .lock()
            .targets
            .iter()
            .map(|(path, state)| match state {
                WatchState::ViaAncestor(anchor) => anchor.clone(),
                WatchState::Direct { .. } => path.clone(),
            })
            .collect()
    }

    /// Sample every target once and apply the resulting transitions.
    ///
    /// Filesystem checks happen without the lock held; a transition is only
    /// applied if the target is still in the state it was sampled from, so a
    /// concurrent `remove` or `add` always wins.
    pub async fn poll_once(&self) -> Vec<WatchEvent> {
        let snapshot: Vec<(PathBuf, WatchState)> = self
            .watch_set
            .lock()
            .targets
            .iter()
            .map(|(p, s)| (p.clone(), s.clone()))
            .collect();

        let mut events = Vec::new();
        for (path, state) in snapshot {
            let Some((next, event)) = transition(&path, &state).await else {
                continue;
            };

            let mut set = self.watch_set.lock();
            match set.targets.get_mut(&path) {
                Some(current) if *current == state => {
                    debug!("{}: {:?} -> {:?}", path.display(), state, next);
                    *current = next;
                    if let Some(event) = event {
                        events.push(event);
                    }
                }
                _ => debug!("{} changed while polling, dropping sample", path.display()),
            }
        }
        events
    }

    /// Poll forever on the configured interval, forwarding events to `tx`.
    /// Ends when the receiver is dropped.
    pub fn start(&self, tx: mpsc::Sender<WatchEvent>) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(watcher.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Presence polling every {:?}", watcher.poll_interval);

            loop {
                ticker.tick().await;
                for event in watcher.poll_once().await {
                    match &event {
                        WatchEvent::Appeared(p) => info!("Path appeared: {}", p.display()),
                        WatchEvent::Disappeared(p) => info!("Path disappeared: {}", p.display()),
                    }
                    if tx.send(event).await.is_err() {
                        debug!("Watch event receiver closed, stopping poller");
                        return;
                    }
                }
            }
        })
    }
}

/// Next state and event for one target, or `None` if nothing changed.
async fn transition(path: &Path, state: &WatchState) -> Option<(WatchState, Option<WatchEvent>)> {
    let present = exists(path).await;
    match state {
        WatchState::Direct { present: true } if present => None,
        WatchState::Direct { present: true } => Some((
            absent_state(path).await,
            Some(WatchEvent::Disappeared(path.to_path_buf())),
        )),
        WatchState::Direct { present: false } | WatchState::ViaAncestor(_) if present => {
            if let WatchState::ViaAncestor(anchor) = state {
                debug!("Releasing anchor {} for {}", anchor.display(), path.display());
            }
            Some((
                WatchState::Direct { present: true },
                Some(WatchEvent::Appeared(path.to_path_buf())),
            ))
        }
        // Still absent: re-check whether the anchor should move.
        _ => {
            let next = absent_state(path).await;
            (next != *state).then_some((next, None))
        }
    }
}

/// State for an absent target: polled directly while its parent exists,
/// otherwise through the deepest existing ancestor.
async fn absent_state(path: &Path) -> WatchState {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !is_dir(parent).await => {
            let anchor = deepest_existing_ancestor(path).await;
            debug!("Parent of {} is gone, anchoring at {}", path.display(), anchor.display());
            WatchState::ViaAncestor(anchor)
        }
        _ => WatchState::Direct { present: false },
    }
}

/// Deepest strict ancestor of `path` that is an existing directory, falling
/// back to the filesystem root.
pub async fn deepest_existing_ancestor(path: &Path) -> PathBuf {
    for ancestor in path.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        if is_dir(ancestor).await {
            return ancestor.to_path_buf();
        }
    }
    PathBuf::from(MAIN_SEPARATOR_STR)
}

// I/O errors (e.g. EIO from a yanked device) count as absent.
async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}
