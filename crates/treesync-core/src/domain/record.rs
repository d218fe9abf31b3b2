//! Change records
//!
//! A [`ChangeRecord`] is the unit of information exchanged by every stage of
//! the pipeline: the watcher and scanner produce them, the coordinator merges
//! them, and the transport ships them to the remote peer.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Action
// ============================================================================

/// What happened to the path described by a [`ChangeRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// A live creation observed by the watcher
    Create,
    /// A live content change of a regular file observed by the watcher
    Write,
    /// A live removal observed by the watcher
    Remove,
    /// One entry of the startup scan
    Baseline,
    /// Terminal marker of the startup scan
    ScanComplete,
}

impl Action {
    /// Returns true for actions produced by the live watcher
    pub fn is_live(self) -> bool {
        matches!(self, Action::Create | Action::Write | Action::Remove)
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Create => "create",
            Action::Write => "write",
            Action::Remove => "remove",
            Action::Baseline => "baseline",
            Action::ScanComplete => "scan_complete",
        };
        f.write_str(s)
    }
}

// ============================================================================
// ChangeRecord
// ============================================================================

/// Immutable description of one filesystem event or baseline entry
///
/// For [`Action::Remove`] the metadata fields hold their sentinels:
/// `mod_time == 0`, empty `content_hash` and `is_directory == false`.
/// [`Action::ScanComplete`] carries the scan root as a directory with the
/// same `mod_time` and `content_hash` sentinels. Every other record carries
/// metadata probed at the moment the record was generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    action: Action,
    path: PathBuf,
    mod_time: i64,
    content_hash: String,
    is_directory: bool,
}

impl ChangeRecord {
    /// Builds a record from freshly probed metadata
    ///
    /// `mod_time` is microseconds since the Unix epoch, UTC.
    pub fn probed(
        action: Action,
        path: impl Into<PathBuf>,
        mod_time: i64,
        content_hash: impl Into<String>,
        is_directory: bool,
    ) -> Self {
        Self {
            action,
            path: path.into(),
            mod_time,
            content_hash: content_hash.into(),
            is_directory,
        }
    }

    /// Builds a removal record; a gone path is never re-stat'ed
    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self {
            action: Action::Remove,
            path: path.into(),
            mod_time: 0,
            content_hash: String::new(),
            is_directory: false,
        }
    }

    /// Builds the terminal marker of a scan rooted at `root`
    pub fn scan_complete(root: impl Into<PathBuf>) -> Self {
        Self {
            action: Action::ScanComplete,
            path: root.into(),
            mod_time: 0,
            content_hash: String::new(),
            is_directory: true,
        }
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Modification time in UTC microseconds, `0` when not applicable
    pub fn mod_time(&self) -> i64 {
        self.mod_time
    }

    /// Modification time as a UTC timestamp, `None` for the `0` sentinel
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        if self.mod_time == 0 {
            return None;
        }
        DateTime::from_timestamp_micros(self.mod_time)
    }

    /// Hex content fingerprint, empty when not applicable
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Returns true if this is the scanner's terminal marker
    pub fn is_scan_complete(&self) -> bool {
        self.action == Action::ScanComplete
    }
}

impl Display for ChangeRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (mod_time={}, hash={}, dir={})",
            self.action,
            self.path.display(),
            self.mod_time,
            self.content_hash,
            self.is_directory
        )
    }
}

// ============================================================================
// Component
// ============================================================================

/// Identifies which pipeline component raised an error
///
/// The caller of the transport uses this to restart a single component
/// instead of the whole agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    Watcher,
    Scanner,
    Writer,
    Coordinator,
}

impl Display for Component {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Watcher => "watcher",
            Component::Scanner => "scanner",
            Component::Writer => "writer",
            Component::Coordinator => "coordinator",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modified_at() {
        let record =
            ChangeRecord::probed(Action::Write, "/sync/a", 1_700_000_000_000_001, "h", false);
        let at = record.modified_at().unwrap();
        assert_eq!(at.timestamp(), 1_700_000_000);
        assert_eq!(at.timestamp_subsec_micros(), 1);

        assert!(ChangeRecord::removed("/sync/a").modified_at().is_none());
    }

    #[test]
    fn test_removed_uses_sentinels() {
        let record = ChangeRecord::removed("/sync/gone.txt");
        assert_eq!(record.action(), Action::Remove);
        assert_eq!(record.mod_time(), 0);
        assert!(record.content_hash().is_empty());
        assert!(!record.is_directory());
    }

    #[test]
    fn test_scan_complete_marker() {
        let record = ChangeRecord::scan_complete("/sync");
        assert!(record.is_scan_complete());
        assert_eq!(record.path(), Path::new("/sync"));
        assert!(!record.action().is_live());
    }

    #[test]
    fn test_probed_keeps_metadata() {
        let record = ChangeRecord::probed(Action::Write, "/sync/a.txt", 42, "abcd", false);
        assert_eq!(record.mod_time(), 42);
        assert_eq!(record.content_hash(), "abcd");
        assert!(record.action().is_live());
        assert!(!record.is_scan_complete());
    }

    #[test]
    fn test_display() {
        let record = ChangeRecord::removed("/sync/a.txt");
        assert_eq!(
            record.to_string(),
            "remove /sync/a.txt (mod_time=0, hash=, dir=false)"
        );
    }

    #[test]
    fn test_component_display() {
        assert_eq!(Component::Watcher.to_string(), "watcher");
        assert_eq!(Component::Writer.to_string(), "writer");
    }
}
