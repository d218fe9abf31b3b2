//! Live filesystem watcher
//!
//! Provides a [`LiveWatcher`] that wraps the `notify` crate to monitor a
//! directory tree, converting raw OS events into [`ChangeRecord`] values.
//!
//! Every directory of the tree is registered individually in a [`WatchSet`]
//! so that the set of watched directories is explicit: directories created
//! live are added, directories removed live are evicted together with their
//! descendants.
//!
//! ## Architecture
//!
//! ```text
//! inotify
//!    │  (notify thread, unbounded channel)
//!    ▼
//! LiveWatcher::run ── ignore ── probe ──→ mpsc<Emission> ──→ Coordinator
//!    │
//!    └── liveness tick: recreate the root if it was deleted
//! ```
//!
//! A file created inside a fresh directory before that directory is
//! registered is not seen live; the baseline scan covers that window.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use treesync_core::config::Config;
use treesync_core::domain::{Action, ChangeRecord};

use crate::ignore::IgnoreList;
use crate::probe::{is_skippable, probe};
use crate::retry::RetryPolicy;
use crate::{emit, unless_cancelled, Emission, SyncError};

// ============================================================================
// Raw event classification
// ============================================================================

/// The notification kinds the watcher acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Create,
    Write,
    Remove,
    /// A rename whose direction the backend did not report
    Renamed,
}

/// Converts a `notify::Event` into the raw kinds the watcher handles
///
/// - `Create(*)` -> `Create`
/// - `Modify(Data(*))`, `Modify(Any)` -> `Write`
/// - `Remove(*)` -> `Remove`
/// - `Modify(Name(From))` -> `Remove`, `Modify(Name(To))` -> `Create`
/// - `Modify(Name(Any))` -> `Renamed`
///
/// `Modify(Name(Both))` is dropped because inotify already reported the
/// `From` and `To` halves. Metadata and access events are ignored.
fn classify(event: &notify::Event) -> Vec<(RawKind, PathBuf)> {
    let kind = match &event.kind {
        EventKind::Create(_) => RawKind::Create,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            RawKind::Write
        }
        EventKind::Remove(_) => RawKind::Remove,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => RawKind::Remove,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => RawKind::Create,
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => RawKind::Renamed,
        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            return Vec::new();
        }
    };

    event.paths.iter().map(|p| (kind, p.clone())).collect()
}

// ============================================================================
// WatchSet
// ============================================================================

/// Directories currently registered for live notification
///
/// Owns the native watcher; dropping the set releases every OS watch.
pub struct WatchSet {
    native: RecommendedWatcher,
    dirs: HashSet<PathBuf>,
}

impl WatchSet {
    fn new(native: RecommendedWatcher) -> Self {
        Self {
            native,
            dirs: HashSet::new(),
        }
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.dirs.contains(dir)
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Registers a single directory; returns false if it was already present
    fn register(&mut self, dir: &Path) -> Result<bool, notify::Error> {
        if self.dirs.contains(dir) {
            return Ok(false);
        }
        self.native.watch(dir, RecursiveMode::NonRecursive)?;
        self.dirs.insert(dir.to_path_buf());
        debug!(path = %dir.display(), "Registered directory");
        Ok(true)
    }

    /// Registers `top` and every directory below it, skipping ignored paths
    ///
    /// Walks with an explicit worklist. Directories that vanish mid-walk are
    /// skipped silently; other failures are returned as non-fatal errors.
    async fn register_tree(&mut self, top: &Path, ignore: &IgnoreList) -> Vec<SyncError> {
        let mut problems = Vec::new();
        let mut stack = vec![top.to_path_buf()];

        while let Some(dir) = stack.pop() {
            if let Err(err) = self.register(&dir) {
                if !is_missing_path(&err) {
                    problems.push(SyncError::WatchRegistration {
                        path: dir.clone(),
                        reason: err.to_string(),
                    });
                }
                continue;
            }

            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    problems.push(SyncError::Traversal { path: dir, source });
                    continue;
                }
            };

            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        if ignore.is_ignored(&path) {
                            continue;
                        }
                        // file_type does not follow symlinks, so link cycles are never walked
                        if matches!(entry.file_type().await, Ok(t) if t.is_dir()) {
                            stack.push(path);
                        }
                    }
                    Ok(None) => break,
                    Err(source) => {
                        problems.push(SyncError::Traversal {
                            path: dir.clone(),
                            source,
                        });
                        break;
                    }
                }
            }
        }

        problems
    }

    /// Evicts `path` and every registered directory below it
    ///
    /// Returns the number of evicted directories. The kernel drops watches
    /// of deleted directories on its own, so unwatch failures are ignored.
    fn evict(&mut self, path: &Path) -> usize {
        let doomed: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|d| d.starts_with(path))
            .cloned()
            .collect();

        for dir in &doomed {
            self.dirs.remove(dir);
            if let Err(err) = self.native.unwatch(dir) {
                debug!(path = %dir.display(), error = %err, "Unwatch after removal failed");
            }
        }

        if !doomed.is_empty() {
            debug!(path = %path.display(), count = doomed.len(), "Evicted directories");
        }
        doomed.len()
    }

    /// Releases every registered watch
    fn clear(&mut self) {
        for dir in self.dirs.drain() {
            let _ = self.native.unwatch(&dir);
        }
    }
}

fn is_missing_path(err: &notify::Error) -> bool {
    match &err.kind {
        notify::ErrorKind::PathNotFound => true,
        notify::ErrorKind::Io(io) => io.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}

// ============================================================================
// LiveWatcher
// ============================================================================

/// Watches a directory tree and emits live [`ChangeRecord`]s
///
/// ## Usage
///
/// ```ignore
/// let watcher = LiveWatcher::bind(&root, &config).await?;
/// let (tx, rx) = mpsc::channel(1024);
/// tokio::spawn(watcher.run(tx, cancel.clone()));
/// // rx.recv().await yields Ok(record) or Err(error)
/// ```
pub struct LiveWatcher {
    root: PathBuf,
    ignore: IgnoreList,
    retry: RetryPolicy,
    liveness_interval: Duration,
    watch_set: WatchSet,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    /// Non-fatal problems from registration at bind time, emitted first by `run`
    pending: Vec<SyncError>,
}

impl LiveWatcher {
    /// Creates the native watcher and registers the whole tree under `root`
    ///
    /// Notifications that arrive between `bind` and [`run`](Self::run) are
    /// buffered, so nothing is lost while the caller starts other tasks.
    ///
    /// # Errors
    /// Returns [`SyncError::PathNotFound`] if `root` is not a directory and
    /// [`SyncError::NotificationSource`] if the OS watcher cannot be created
    /// or the root cannot be registered.
    pub async fn bind(root: &Path, config: &Config) -> Result<Self, SyncError> {
        match tokio::fs::metadata(root).await {
            Ok(m) if m.is_dir() => {}
            _ => return Err(SyncError::PathNotFound(root.to_path_buf())),
        }

        // unbounded: the notify thread must never block while watch() waits on it
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let native = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if raw_tx.send(res).is_err() {
                    debug!("Raw event receiver dropped");
                }
            },
            notify::Config::default(),
        )?;

        let mut watch_set = WatchSet::new(native);
        watch_set.register(root)?;

        let ignore = IgnoreList::from_config(root, &config.sync);
        let pending = watch_set.register_tree(root, &ignore).await;

        info!(
            root = %root.display(),
            directories = watch_set.len(),
            problems = pending.len(),
            "Live watcher bound"
        );

        Ok(Self {
            root: root.to_path_buf(),
            ignore,
            retry: RetryPolicy::from_config(&config.probe),
            liveness_interval: config.sync.liveness_interval(),
            watch_set,
            raw_rx,
            pending,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn watch_set(&self) -> &WatchSet {
        &self.watch_set
    }

    /// Main event loop of the watcher
    ///
    /// Runs until `cancel` fires, the consumer drops `tx`, or the
    /// notification source fails. A failing source is reported as a fatal
    /// error before the loop exits. Every OS watch is released on exit.
    pub async fn run(mut self, tx: mpsc::Sender<Emission>, cancel: CancellationToken) {
        info!(root = %self.root.display(), "Live watcher starting");

        let pending = std::mem::take(&mut self.pending);
        let mut running = true;
        for problem in pending {
            if !emit(&tx, &cancel, Err(problem)).await {
                running = false;
                break;
            }
        }

        let mut liveness = tokio::time::interval(self.liveness_interval);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while running {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Cancellation received");
                    running = false;
                }

                _ = liveness.tick() => {
                    for problem in self.check_root().await {
                        if !emit(&tx, &cancel, Err(problem)).await {
                            running = false;
                            break;
                        }
                    }
                }

                raw = self.raw_rx.recv() => match raw {
                    Some(Ok(event)) => {
                        running = self.handle_event(&event, &tx, &cancel).await;
                    }
                    Some(Err(err)) => {
                        error!(error = %err, "Notification source failed");
                        let _ = emit(&tx, &cancel, Err(err.into())).await;
                        running = false;
                    }
                    None => {
                        error!("Notification channel closed");
                        let closed = SyncError::NotificationSource("notification channel closed".into());
                        let _ = emit(&tx, &cancel, Err(closed)).await;
                        running = false;
                    }
                },
            }
        }

        self.watch_set.clear();
        info!(root = %self.root.display(), "Live watcher stopped");
    }

    /// Handles one raw notification; returns false if the watcher must stop
    async fn handle_event(
        &mut self,
        event: &notify::Event,
        tx: &mpsc::Sender<Emission>,
        cancel: &CancellationToken,
    ) -> bool {
        for (kind, path) in classify(event) {
            if let Some(pattern) = self.ignore.matching_pattern(&path) {
                debug!(path = %path.display(), pattern, "Ignoring path");
                continue;
            }

            let kind = match kind {
                RawKind::Renamed => {
                    if tokio::fs::symlink_metadata(&path).await.is_ok() {
                        RawKind::Create
                    } else {
                        RawKind::Remove
                    }
                }
                other => other,
            };

            let keep_going = match kind {
                RawKind::Write => self.on_write(&path, tx, cancel).await,
                RawKind::Remove => self.on_remove(&path, tx, cancel).await,
                RawKind::Create | RawKind::Renamed => self.on_create(&path, tx, cancel).await,
            };
            if !keep_going {
                return false;
            }
        }
        true
    }

    async fn on_write(
        &mut self,
        path: &Path,
        tx: &mpsc::Sender<Emission>,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(probed) = unless_cancelled(cancel, probe(path, &self.retry)).await else {
            return false;
        };
        match probed {
            // parents report writes when a descendant changes
            Ok(metadata) if metadata.is_directory => {
                debug!(path = %path.display(), "Suppressing directory write");
                true
            }
            Ok(metadata) => {
                debug!(path = %path.display(), "Write");
                emit(tx, cancel, Ok(metadata.into_record(Action::Write, path))).await
            }
            Err(err) if is_skippable(&err) => {
                debug!(path = %path.display(), error = %err, "Skipping written path");
                true
            }
            Err(err) => emit(tx, cancel, Err(err)).await,
        }
    }

    async fn on_remove(
        &mut self,
        path: &Path,
        tx: &mpsc::Sender<Emission>,
        cancel: &CancellationToken,
    ) -> bool {
        debug!(path = %path.display(), "Remove");
        if !emit(tx, cancel, Ok(ChangeRecord::removed(path))).await {
            return false;
        }
        // a path recreated before this event was handled keeps its fresh watches
        if tokio::fs::symlink_metadata(path).await.is_err() {
            self.watch_set.evict(path);
        }
        true
    }

    async fn on_create(
        &mut self,
        path: &Path,
        tx: &mpsc::Sender<Emission>,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(probed) = unless_cancelled(cancel, probe(path, &self.retry)).await else {
            return false;
        };
        let metadata = match probed {
            Ok(metadata) => metadata,
            Err(err) if is_skippable(&err) => {
                debug!(path = %path.display(), error = %err, "Skipping created path");
                return true;
            }
            Err(err) => return emit(tx, cancel, Err(err)).await,
        };

        debug!(path = %path.display(), is_directory = metadata.is_directory, "Create");
        let is_directory = metadata.is_directory;
        if !emit(tx, cancel, Ok(metadata.into_record(Action::Create, path))).await {
            return false;
        }

        if is_directory {
            // drop watches left over from an earlier directory with this name
            self.watch_set.evict(path);
            for problem in self.watch_set.register_tree(path, &self.ignore).await {
                if !emit(tx, cancel, Err(problem)).await {
                    return false;
                }
            }
        }
        true
    }

    /// Recreates and re-registers the root if it was deleted
    async fn check_root(&mut self) -> Vec<SyncError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(m) if m.is_dir() => return Vec::new(),
            _ => {}
        }

        warn!(root = %self.root.display(), "Sync root removed, recreating");
        if let Err(err) = tokio::fs::create_dir_all(&self.root).await {
            error!(root = %self.root.display(), error = %err, "Cannot recreate sync root");
            return vec![SyncError::IoError(err)];
        }

        self.watch_set.evict(&self.root);
        let root = self.root.clone();
        let mut problems = vec![SyncError::RootRecreated(root.clone())];
        problems.extend(self.watch_set.register_tree(&root, &self.ignore).await);
        problems
    }
}

// ============================================================================
// Unit tests
// ============================================================================
