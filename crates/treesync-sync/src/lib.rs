//! treesync sync - change detection and merge pipeline
//!
//! Provides:
//! - A recursive live watcher over OS change notifications
//! - A one-shot baseline scanner
//! - A coordinator merging both into one deduplicated, ordered stream
//! - The remote file writer's quarantine/write/restore protocol
//!
//! ## Modules
//!
//! - [`probe`] - Modification time, directory flag and content fingerprint of a path
//! - [`retry`] - Bounded fixed-delay retry for transient filesystem failures
//! - [`ignore`] - Substring ignore list shared by all producers
//! - [`watcher`] - Live watcher and its WatchSet
//! - [`scanner`] - Depth-first baseline scanner
//! - [`coordinator`] - Merge state machine and the [`synchronize`](coordinator::synchronize) entry point
//! - [`transport`] - Port to the component that ships records to the remote peer
//! - [`writer`] - Remote file writer and quarantine name transform

pub mod coordinator;
pub mod ignore;
pub mod probe;
pub mod retry;
pub mod scanner;
pub mod transport;
pub mod watcher;
pub mod writer;

use std::future::Future;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use treesync_core::domain::ChangeRecord;

use crate::transport::SendError;

/// What a producer puts on its channel: a record, or an error to report
pub type Emission = Result<ChangeRecord, SyncError>;

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Stat, hash or read of a single path failed after all retries
    #[error("Probe failed for {path}: {source}")]
    Probe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The native notification subscription broke; completeness is lost
    #[error("Notification source failed: {0}")]
    NotificationSource(String),

    /// Listing a directory failed; only its subtree is skipped
    #[error("Traversal failed for {path}: {source}")]
    Traversal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The transport did not accept a record in time; the record was dropped
    #[error("Send timed out after {timeout_ms}ms for {path}")]
    SendTimeout { path: PathBuf, timeout_ms: u64 },

    /// The transport rejected a record
    #[error("Transport error: {0}")]
    Transport(#[from] SendError),

    /// Write protocol misuse: no handle is open for the path
    #[error("No open handle for {0}")]
    NotOpen(PathBuf),

    /// Write protocol misuse: the path still has an open handle
    #[error("Handle still open for {0}")]
    AlreadyOpen(PathBuf),

    /// A directory could not be registered for live notification
    #[error("Could not watch {path}: {reason}")]
    WatchRegistration { path: PathBuf, reason: String },

    /// The watched root disappeared and was recreated
    #[error("Sync root was removed and recreated: {0}")]
    RootRecreated(PathBuf),

    /// The specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// A domain-level error propagated from treesync-core
    #[error("Domain error: {0}")]
    DomainError(#[from] treesync_core::domain::errors::DomainError),
}

impl SyncError {
    /// Returns true if the component that raised this error cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::NotificationSource(_) | SyncError::Transport(_)
        )
    }
}

impl From<notify::Error> for SyncError {
    fn from(err: notify::Error) -> Self {
        SyncError::NotificationSource(err.to_string())
    }
}

/// Puts `item` on a producer channel unless `cancel` fires first
///
/// Returns false when the producer should stop: cancelled, or the consumer
/// is gone.
pub(crate) async fn emit(
    tx: &mpsc::Sender<Emission>,
    cancel: &CancellationToken,
    item: Emission,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Runs `fut` unless `cancel` fires first; `None` means cancelled
pub(crate) async fn unless_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
