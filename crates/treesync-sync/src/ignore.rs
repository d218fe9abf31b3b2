//! Ignore list
//!
//! Paths containing any configured substring (editor backups, temp files,
//! the writer's quarantine marker) are dropped by every producer before any
//! metadata is probed. Matching is done on the part of the path below the
//! sync root, so the location of the root itself never causes a match.

use std::path::{Path, PathBuf};

use treesync_core::config::SyncConfig;

#[derive(Debug, Clone)]
pub struct IgnoreList {
    root: PathBuf,
    patterns: Vec<String>,
}

impl IgnoreList {
    pub fn new<I, S>(root: impl Into<PathBuf>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            root: root.into(),
            patterns: patterns
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn from_config(root: impl Into<PathBuf>, config: &SyncConfig) -> Self {
        Self::new(root, config.ignore_patterns.iter().cloned())
    }

    /// Returns the first pattern contained in `path`, if any
    pub fn matching_pattern(&self, path: &Path) -> Option<&str> {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let text = relative.to_string_lossy();
        self.patterns
            .iter()
            .find(|p| text.contains(p.as_str()))
            .map(String::as_str)
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        self.matching_pattern(path).is_some()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}
