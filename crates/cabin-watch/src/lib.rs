//! Filesystem watcher registry.
//!
//! One registered watch = one `watcherId` = one OS-level watcher plus a
//! set of subscribed clients. Patterns are glob-expanded against the
//! workspace root once, at registration; the matched paths are then
//! watched with write-settle debouncing so a burst of writes produces a
//! single event after the file has been quiet for the stability window.
//! Pre-existing files produce no events on registration.
//!
//! The registry keeps a pair of inverse indexes (watcherId to subscribers,
//! client to watcherIds) keyed by plain strings so that cleanup on
//! either side is an index removal, never a reference-count chase. When
//! the last subscriber of a watcher goes away, the watcher record is
//! dropped and its OS resources released with it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use notify::event::CreateKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use cabin_core::{new_token, AgentError, Result};

/// Clients are identified by their connection id (`wsId`).
pub type ClientId = String;

/// Logical change kinds reported to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// File added or modified.
    Change,
    /// File or directory removed.
    Rename,
    /// Anything else, passed through under its own name.
    Other(String),
}

impl ChangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeKind::Change => "change",
            ChangeKind::Rename => "rename",
            ChangeKind::Other(name) => name,
        }
    }
}

/// A debounced change notification, ready for fan-out.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub watcher_id: String,
    pub kind: ChangeKind,
    /// Workspace-relative path of the changed file.
    pub filename: String,
}

/// Debounce tuning.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// How long a file must be quiet before a change is reported.
    pub stability: Duration,

    /// Debouncer tick rate.
    pub poll: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            stability: Duration::from_millis(300),
            poll: Duration::from_millis(100),
        }
    }
}

struct WatcherRecord {
    /// Owns the OS watcher; dropping it stops the watch threads.
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
    subscribers: HashSet<ClientId>,
}

#[derive(Default)]
struct Inner {
    watchers: HashMap<String, WatcherRecord>,
    client_watchers: HashMap<ClientId, HashSet<String>>,
}

/// Registry of active watchers and their subscribers.
pub struct WatcherRegistry {
    root: PathBuf,
    config: WatchConfig,
    events: mpsc::UnboundedSender<WatchEvent>,
    inner: RwLock<Inner>,
}

impl WatcherRegistry {
    /// Create a registry rooted at the workspace directory, returning the
    /// receiving end of the event stream for the server's fan-out pump.
    pub fn new<P: Into<PathBuf>>(
        root: P,
        config: WatchConfig,
    ) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let root = root.into();
        // Watch backends report canonical paths; canonicalise the root so
        // prefix-stripping works when the workspace lives behind a symlink.
        let root = root.canonicalize().unwrap_or(root);
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                root,
                config,
                events,
                inner: RwLock::new(Inner::default()),
            },
            rx,
        )
    }

    /// Register a watch over `patterns` for `client`; returns the new
    /// `watcherId`. Registrations are never deduplicated: identical
    /// patterns from two calls yield two independent watchers.
    pub fn watch(&self, patterns: &[String], client: &str) -> Result<String> {
        let paths = self.expand_patterns(patterns)?;
        let watcher_id = new_token();

        let events = self.events.clone();
        let root = self.root.clone();
        let id_for_events = watcher_id.clone();

        let mut debouncer = new_debouncer(
            self.config.stability,
            Some(self.config.poll),
            move |result: DebounceEventResult| match result {
                Ok(batch) => {
                    for event in batch {
                        let Some(kind) = map_event_kind(&event.kind) else {
                            continue;
                        };
                        for path in &event.paths {
                            let _ = events.send(WatchEvent {
                                watcher_id: id_for_events.clone(),
                                kind: kind.clone(),
                                filename: relative_name(&root, path),
                            });
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        warn!(error = %error, "watcher backend error");
                    }
                }
            },
        )
        .map_err(|e| AgentError::watch(format!("failed to initialise watcher: {}", e)))?;

        for path in &paths {
            debouncer
                .watcher()
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    AgentError::watch(format!("failed to watch '{}': {}", path.display(), e))
                })?;
        }

        debug!(
            watcher_id = %watcher_id,
            client = %client,
            paths = paths.len(),
            "watcher registered"
        );

        let mut inner = self.inner.write().expect("watcher registry poisoned");
        inner.watchers.insert(
            watcher_id.clone(),
            WatcherRecord {
                _debouncer: debouncer,
                subscribers: HashSet::from([client.to_string()]),
            },
        );
        inner
            .client_watchers
            .entry(client.to_string())
            .or_default()
            .insert(watcher_id.clone());

        Ok(watcher_id)
    }

    /// Subscribers of a watcher, for event fan-out.
    pub fn subscribers(&self, watcher_id: &str) -> Vec<ClientId> {
        let inner = self.inner.read().expect("watcher registry poisoned");
        inner
            .watchers
            .get(watcher_id)
            .map(|record| record.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a disconnecting client from every watcher it subscribes to;
    /// watchers left without subscribers are closed immediately.
    pub fn unsubscribe(&self, client: &str) {
        let mut inner = self.inner.write().expect("watcher registry poisoned");
        let Some(watcher_ids) = inner.client_watchers.remove(client) else {
            return;
        };

        for watcher_id in watcher_ids {
            let drop_record = match inner.watchers.get_mut(&watcher_id) {
                Some(record) => {
                    record.subscribers.remove(client);
                    record.subscribers.is_empty()
                }
                None => false,
            };
            if drop_record {
                inner.watchers.remove(&watcher_id);
                debug!(watcher_id = %watcher_id, "last subscriber left; watcher closed");
            }
        }
    }

    /// Drop every watcher. Used on shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("watcher registry poisoned");
        inner.watchers.clear();
        inner.client_watchers.clear();
    }

    /// Number of live watchers.
    pub fn watcher_count(&self) -> usize {
        let inner = self.inner.read().expect("watcher registry poisoned");
        inner.watchers.len()
    }

    /// Watcher ids a client subscribes to.
    pub fn watchers_of(&self, client: &str) -> Vec<String> {
        let inner = self.inner.read().expect("watcher registry poisoned");
        inner
            .client_watchers
            .get(client)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Expand workspace-relative glob patterns into concrete paths.
    fn expand_patterns(&self, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();

        for pattern in patterns {
            let full = self.root.join(pattern);
            let full = full.to_string_lossy();
            let matches = glob::glob(&full)
                .map_err(|e| AgentError::watch(format!("invalid pattern '{}': {}", pattern, e)))?;

            for entry in matches {
                match entry {
                    Ok(path) => paths.push(path),
                    Err(e) => {
                        // Unreadable entries are skipped, not fatal.
                        warn!(pattern = %pattern, error = %e, "skipping unreadable glob match");
                    }
                }
            }
        }

        Ok(paths)
    }
}

/// Map a raw backend event kind onto the reported change kind.
///
/// | backend event        | reported   |
/// |----------------------|------------|
/// | create/modify (file) | `change`   |
/// | remove               | `rename`   |
/// | create (directory)   | `addDir`   |
/// | access               | (dropped)  |
fn map_event_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(CreateKind::Folder) => Some(ChangeKind::Other("addDir".to_string())),
        EventKind::Create(_) | EventKind::Modify(_) => Some(ChangeKind::Change),
        EventKind::Remove(_) => Some(ChangeKind::Rename),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => Some(ChangeKind::Change),
    }
}

/// Report paths workspace-relative; anything outside the root (should not
/// happen) is reported as-is.
fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}
