//! Metadata probe
//!
//! Collects what every non-removal [`ChangeRecord`] carries: modification
//! time, directory flag and content fingerprint. Regular files are
//! fingerprinted by a SHA-256 digest of their full content. Directories get
//! a SHA-256 digest of their path string, which stays stable across scans
//! for an unchanged directory but says nothing about its contents.
//!
//! Symbolic links are never followed: a link is reported as an entry of its
//! own, fingerprinted by its target string. Other special files (FIFOs,
//! sockets, devices) are never opened; probing one fails with
//! [`io::ErrorKind::Unsupported`].
//!
//! Hashing runs on the blocking pool so producers never stall the runtime.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use treesync_core::domain::{Action, ChangeRecord};

use crate::retry::RetryPolicy;
use crate::SyncError;

/// Snapshot of a path's metadata taken at probe time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMetadata {
    /// Modification time in UTC microseconds
    pub mod_time: i64,
    /// Hex SHA-256 fingerprint
    pub content_hash: String,
    pub is_directory: bool,
}

impl PathMetadata {
    /// Turns this snapshot into a record for `path`
    pub fn into_record(self, action: Action, path: impl Into<PathBuf>) -> ChangeRecord {
        ChangeRecord::probed(
            action,
            path,
            self.mod_time,
            self.content_hash,
            self.is_directory,
        )
    }
}

/// Converts a filesystem timestamp to UTC microseconds
pub fn to_micros(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp_micros()
}

/// Streams the file through SHA-256 and returns the hex digest
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Synthetic fingerprint of a directory, derived from its path only
pub fn fingerprint_directory(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

/// Synthetic fingerprint of a symbolic link, derived from its target
pub fn fingerprint_link(path: &Path) -> io::Result<String> {
    let target = std::fs::read_link(path)?;
    let mut hasher = Sha256::new();
    hasher.update(target.to_string_lossy().as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Probes `path` once on the calling thread, without following links
pub fn probe_blocking(path: &Path) -> io::Result<PathMetadata> {
    let metadata = std::fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();
    let mod_time = to_micros(metadata.modified()?);

    let content_hash = if file_type.is_dir() {
        fingerprint_directory(path)
    } else if file_type.is_file() {
        hash_file(path)?
    } else if file_type.is_symlink() {
        fingerprint_link(path)?
    } else {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "not a regular file, directory or symbolic link",
        ));
    };
    let is_directory = file_type.is_dir();

    Ok(PathMetadata {
        mod_time,
        content_hash,
        is_directory,
    })
}

/// Probes `path` on the blocking pool, retrying transient failures
///
/// # Errors
/// Returns [`SyncError::Probe`] once the retry policy is exhausted or the
/// path no longer exists.
#[instrument(skip(path, retry), fields(path = %path.display()))]
pub async fn probe(path: &Path, retry: &RetryPolicy) -> Result<PathMetadata, SyncError> {
    let result = retry
        .run("probe", path, || {
            let owned = path.to_path_buf();
            async move {
                tokio::task::spawn_blocking(move || probe_blocking(&owned))
                    .await
                    .map_err(io::Error::other)?
            }
        })
        .await;

    match result {
        Ok(metadata) => {
            debug!(
                mod_time = metadata.mod_time,
                is_directory = metadata.is_directory,
                "probe complete"
            );
            Ok(metadata)
        }
        Err(source) => Err(SyncError::Probe {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Returns true if a probe failed because the path is gone or is a special
/// file; producers skip such paths without reporting them
pub fn is_skippable(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::Probe { source, .. }
            if matches!(source.kind(), io::ErrorKind::NotFound | io::ErrorKind::Unsupported)
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    // sha256("hello")
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_hash_file_matches_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(hash_file(&path).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_directory_fingerprint_is_stable_and_path_bound() {
        let a = fingerprint_directory(Path::new("/sync/a"));
        let b = fingerprint_directory(Path::new("/sync/b"));
        assert_eq!(a, fingerprint_directory(Path::new("/sync/a")));
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_probe_blocking_file_and_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("hello.txt");
        std::fs::write(&file, b"hello").unwrap();

        let file_meta = probe_blocking(&file).unwrap();
        assert!(!file_meta.is_directory);
        assert_eq!(file_meta.content_hash, HELLO_SHA256);
        assert!(file_meta.mod_time > 0);

        let dir_meta = probe_blocking(dir.path()).unwrap();
        assert!(dir_meta.is_directory);
        assert_eq!(dir_meta.content_hash, fingerprint_directory(dir.path()));
    }

    #[test]
    fn test_probe_blocking_does_not_follow_links() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("up");
        std::os::unix::fs::symlink(dir.path(), &link).unwrap();

        let meta = probe_blocking(&link).unwrap();
        assert!(!meta.is_directory);
        assert_eq!(meta.content_hash.len(), 64);
        assert_ne!(meta.content_hash, fingerprint_directory(dir.path()));
    }

    #[test]
    fn test_probe_blocking_rejects_fifo_without_opening_it() {
        let dir = TempDir::new().unwrap();
        let fifo = dir.path().join("pipe");
        let status = std::process::Command::new("mkfifo").arg(&fifo).status().unwrap();
        assert!(status.success());

        // opening a FIFO for reading would block until a writer shows up
        let err = probe_blocking(&fifo).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_special_file_is_skippable_and_not_retried() {
        let dir = TempDir::new().unwrap();
        let fifo = dir.path().join("pipe");
        let status = std::process::Command::new("mkfifo").arg(&fifo).status().unwrap();
        assert!(status.success());

        let retry = RetryPolicy::new(3, Duration::from_secs(10));
        let err = tokio::time::timeout(Duration::from_secs(2), probe(&fifo, &retry))
            .await
            .unwrap()
            .unwrap_err();
        assert!(is_skippable(&err));
        assert!(!is_skippable(&SyncError::RootRecreated(dir.path().to_path_buf())));
    }

    #[test]
    fn test_to_micros_precision() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_micros(1_700_000_000_123_456);
        assert_eq!(to_micros(time), 1_700_000_000_123_456);
    }

    #[tokio::test]
    async fn test_probe_reflects_current_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.txt");
        let retry = RetryPolicy::new(1, Duration::ZERO);

        std::fs::write(&path, b"first").unwrap();
        let first = probe(&path, &retry).await.unwrap();

        std::fs::write(&path, b"second").unwrap();
        let second = probe(&path, &retry).await.unwrap();

        assert_ne!(first.content_hash, second.content_hash);
    }

    #[tokio::test]
    async fn test_probe_missing_path_is_probe_error() {
        let dir = TempDir::new().unwrap();
        let retry = RetryPolicy::new(3, Duration::from_millis(1));

        let err = probe(&dir.path().join("missing"), &retry).await.unwrap_err();
        match err {
            SyncError::Probe { source, .. } => assert_eq!(source.kind(), io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_into_record() {
        let metadata = PathMetadata {
            mod_time: 5,
            content_hash: "ff".into(),
            is_directory: true,
        };
        let record = metadata.into_record(Action::Baseline, "/sync/dir");
        assert_eq!(record.action(), Action::Baseline);
        assert!(record.is_directory());
        assert_eq!(record.content_hash(), "ff");
    }
}
