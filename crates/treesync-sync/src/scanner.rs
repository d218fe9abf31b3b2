//! Baseline scanner
//!
//! One-shot depth-first walk of the sync root that emits a
//! [`Action::Baseline`] record for every non-ignored entry below it, then a
//! single [`Action::ScanComplete`] marker. Entries are visited in pre-order
//! and sorted by name within a directory, so two scans of an unchanged tree
//! produce the same sequence.
//!
//! A directory that cannot be listed or probed is reported and its subtree
//! skipped; the rest of the walk continues. Symbolic links are reported as
//! links and never descended into. Sockets, FIFOs and device nodes are
//! skipped without being opened.

use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use treesync_core::config::Config;
use treesync_core::domain::{Action, ChangeRecord};

use crate::ignore::IgnoreList;
use crate::probe::{is_skippable, probe};
use crate::retry::RetryPolicy;
use crate::{emit, unless_cancelled, Emission, SyncError};

/// Walks a tree once and reports every entry
#[derive(Debug, Clone)]
pub struct BaselineScanner {
    root: PathBuf,
    ignore: IgnoreList,
    retry: RetryPolicy,
}

/// Counters of a finished walk
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub files: u64,
    pub directories: u64,
    pub ignored: u64,
    /// Entries that vanished or are neither file, directory nor link
    pub skipped: u64,
    pub errors: u64,
}

impl BaselineScanner {
    pub fn new(root: impl Into<PathBuf>, ignore: IgnoreList, retry: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            ignore,
            retry,
        }
    }

    pub fn from_config(root: &Path, config: &Config) -> Self {
        Self::new(
            root,
            IgnoreList::from_config(root, &config.sync),
            RetryPolicy::from_config(&config.probe),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs the walk, emitting records and errors on `tx`
    ///
    /// `ScanComplete` is emitted exactly once, also when the walk is cut
    /// short by `cancel`. Nothing is emitted after it.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn run(self, tx: mpsc::Sender<Emission>, cancel: CancellationToken) -> ScanStats {
        info!("Baseline scan starting");
        let stats = self.walk(&tx, &cancel).await;

        let marker = Ok(ChangeRecord::scan_complete(&self.root));
        if cancel.is_cancelled() {
            // the consumer may be gone; never wait on it after cancellation
            if tx.try_send(marker).is_err() {
                debug!("ScanComplete dropped after cancellation");
            }
            info!(?stats, "Baseline scan cancelled");
        } else {
            if !emit(&tx, &cancel, marker).await {
                debug!("ScanComplete not delivered");
            }
            info!(
                files = stats.files,
                directories = stats.directories,
                ignored = stats.ignored,
                skipped = stats.skipped,
                errors = stats.errors,
                "Baseline scan complete"
            );
        }
        stats
    }

    async fn walk(&self, tx: &mpsc::Sender<Emission>, cancel: &CancellationToken) -> ScanStats {
        let mut stats = ScanStats::default();

        let top = match self.list(&self.root).await {
            Ok(entries) => entries,
            Err(source) => {
                stats.errors += 1;
                let err = SyncError::Traversal {
                    path: self.root.clone(),
                    source,
                };
                emit(tx, cancel, Err(err)).await;
                return stats;
            }
        };

        let mut stack = vec![top.into_iter()];

        while let Some(entries) = stack.last_mut() {
            if cancel.is_cancelled() {
                break;
            }
            let Some(path) = entries.next() else {
                stack.pop();
                continue;
            };

            if let Some(pattern) = self.ignore.matching_pattern(&path) {
                debug!(path = %path.display(), pattern, "Skipping ignored entry");
                stats.ignored += 1;
                continue;
            }

            let Some(probed) = unless_cancelled(cancel, probe(&path, &self.retry)).await else {
                break;
            };
            let metadata = match probed {
                Ok(metadata) => metadata,
                Err(err) if is_skippable(&err) => {
                    debug!(path = %path.display(), error = %err, "Skipping entry");
                    stats.skipped += 1;
                    continue;
                }
                Err(err) => {
                    stats.errors += 1;
                    if !emit(tx, cancel, Err(err)).await {
                        break;
                    }
                    continue;
                }
            };

            let is_directory = metadata.is_directory;
            if is_directory {
                stats.directories += 1;
            } else {
                stats.files += 1;
            }
            if !emit(tx, cancel, Ok(metadata.into_record(Action::Baseline, &path))).await {
                break;
            }

            if is_directory {
                let Some(listed) = unless_cancelled(cancel, self.list(&path)).await else {
                    break;
                };
                match listed {
                    Ok(children) => stack.push(children.into_iter()),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => {
                        warn!(path = %path.display(), error = %source, "Skipping unreadable directory");
                        stats.errors += 1;
                        if !emit(tx, cancel, Err(SyncError::Traversal { path, source })).await {
                            break;
                        }
                    }
                }
            }
        }

        stats
    }

    /// Lists `dir` sorted by name, retrying transient failures
    async fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        self.retry
            .run("read_dir", dir, || {
                let owned = dir.to_path_buf();
                async move {
                    tokio::task::spawn_blocking(move || read_sorted(&owned))
                        .await
                        .map_err(io::Error::other)?
                }
            })
            .await
    }
}

fn read_sorted(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    paths.sort();
    Ok(paths)
}
