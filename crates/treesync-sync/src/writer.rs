//! Remote file writer
//!
//! Applies incoming file content to the local tree with a safe-rename
//! protocol:
//!
//! 1. [`FileWriter::open`] renames the target to its quarantined name and
//!    opens it for read-write.
//! 2. [`FileWriter::write`] and [`FileWriter::resize`] modify the open file.
//! 3. [`FileWriter::close`] flushes and releases the handle.
//! 4. [`FileWriter::restore_name_and_time`] renames the file back and stamps
//!    the remote modification time on it.
//!
//! While a transfer is in progress the file carries the quarantine prefix,
//! which every producer ignores, so a half-written file is never reported.
//! A quarantined name left behind by a crash is undone by
//! [`FileWriter::recover_quarantined`].

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{self, SeekFrom};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};
use treesync_core::config::WriterConfig;
use treesync_core::domain::errors::DomainError;
use treesync_core::domain::ChangeRecord;
use treesync_core::options::TransferOptions;

use crate::SyncError;

/// Largest filler chunk written at once when a file grows
const FILL_CHUNK: usize = 64 * 1024;

// ============================================================================
// Quarantine name transform
// ============================================================================

/// Returns `path` with `prefix` prepended to its file name
///
/// A path without a file name (`/`, `..`) is returned unchanged.
pub fn quarantine(path: &Path, prefix: &str) -> PathBuf {
    let Some(name) = path.file_name() else {
        return path.to_path_buf();
    };

    let mut bytes = Vec::with_capacity(prefix.len() + name.len());
    bytes.extend_from_slice(prefix.as_bytes());
    bytes.extend_from_slice(name.as_bytes());
    path.with_file_name(OsString::from_vec(bytes))
}

/// Strips `prefix` from the file name of `path`, if present
pub fn dequarantine(path: &Path, prefix: &str) -> PathBuf {
    match path
        .file_name()
        .and_then(|name| name.as_bytes().strip_prefix(prefix.as_bytes()))
    {
        Some(original) if !original.is_empty() => {
            path.with_file_name(OsString::from_vec(original.to_vec()))
        }
        _ => path.to_path_buf(),
    }
}

/// Returns true if the file name of `path` carries `prefix`
pub fn is_quarantined(path: &Path, prefix: &str) -> bool {
    path.file_name().is_some_and(|name| {
        name.len() > prefix.len() && name.as_bytes().starts_with(prefix.as_bytes())
    })
}

/// Converts UTC microseconds to a `FileTime`
fn file_time_from_micros(micros: i64) -> FileTime {
    let seconds = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    FileTime::from_unix_time(seconds, nanos)
}

// ============================================================================
// FileWriter
// ============================================================================

/// Applies remote file content to local files
///
/// Owns the table of open handles, keyed by quarantined path. At most one
/// handle exists per path; `&mut self` on every operation serializes them.
#[derive(Debug)]
pub struct FileWriter {
    prefix: String,
    fill_byte: u8,
    handles: HashMap<PathBuf, File>,
}

impl FileWriter {
    pub fn new(config: &WriterConfig) -> Self {
        Self {
            prefix: config.quarantine_prefix.clone(),
            fill_byte: config.fill_byte,
            handles: HashMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of open handles
    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if a handle is open for `path` (original or quarantined)
    pub fn is_open(&self, path: &Path) -> bool {
        self.handles.contains_key(&self.key(path))
    }

    /// Handle table key of `path`
    fn key(&self, path: &Path) -> PathBuf {
        if is_quarantined(path, &self.prefix) {
            path.to_path_buf()
        } else {
            quarantine(path, &self.prefix)
        }
    }

    fn handle(&mut self, path: &Path) -> Result<&mut File, SyncError> {
        let key = self.key(path);
        match self.handles.get_mut(&key) {
            Some(file) => Ok(file),
            None => Err(SyncError::NotOpen(key)),
        }
    }

    /// Ensures `path` exists as a directory, creating parents as needed
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn create_directory(&mut self, path: &Path) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(path).await?;
        debug!("Directory ensured");
        Ok(())
    }

    /// Moves `path` to its quarantined name and opens it for read-write
    ///
    /// The file is created if neither name exists. An already open handle
    /// for the same path is flushed and closed first.
    ///
    /// Returns the quarantined path.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn open(&mut self, path: &Path) -> Result<PathBuf, SyncError> {
        let original = dequarantine(path, &self.prefix);
        let quarantined = quarantine(&original, &self.prefix);

        if let Some(stale) = self.handles.remove(&quarantined) {
            warn!("Closing stale handle before reopening");
            if let Err(err) = stale.sync_all().await {
                warn!(error = %err, "Stale handle did not sync");
            }
        }

        match tokio::fs::rename(&original, &quarantined).await {
            Ok(()) => debug!(quarantined = %quarantined.display(), "Quarantined"),
            // already quarantined by an earlier open, or a new file
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&quarantined)
            .await?;

        self.handles.insert(quarantined.clone(), file);
        Ok(quarantined)
    }

    /// Flushes and releases the handle for `path`
    ///
    /// The file keeps its quarantined name until
    /// [`restore_name_and_time`](Self::restore_name_and_time) is called.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn close(&mut self, path: &Path) -> Result<(), SyncError> {
        let key = self.key(path);
        let mut file = self
            .handles
            .remove(&key)
            .ok_or_else(|| SyncError::NotOpen(key.clone()))?;

        file.flush().await?;
        file.sync_all().await?;
        debug!("Handle closed");
        Ok(())
    }

    /// Writes `payload` at byte `offset` of the file open for the record's path
    #[instrument(
        skip(self, record, payload),
        fields(path = %record.path().display(), len = payload.len())
    )]
    pub async fn write(
        &mut self,
        record: &ChangeRecord,
        payload: &[u8],
        offset: u64,
    ) -> Result<(), SyncError> {
        self.write_at(record.path(), payload, offset).await
    }

    /// Writes one chunk described by framed transfer options
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidOptions`] if `current_offset` is not a
    /// byte offset, or [`SyncError::NotOpen`] if the file is not open.
    pub async fn write_chunk(
        &mut self,
        options: &TransferOptions,
        payload: &[u8],
    ) -> Result<(), SyncError> {
        let offset: u64 = options.current_offset.parse().map_err(|_| {
            DomainError::InvalidOptions(format!("invalid offset: {}", options.current_offset))
        })?;
        let path = PathBuf::from(&options.file_path);

        self.write_at(&path, payload, offset).await?;
        debug!(path = %path.display(), offset, index = %options.index, "Chunk written");
        Ok(())
    }

    async fn write_at(&mut self, path: &Path, payload: &[u8], offset: u64) -> Result<(), SyncError> {
        let file = self.handle(path)?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(payload).await?;
        Ok(())
    }

    /// Grows or shrinks the open file for `path` to `new_size` bytes
    ///
    /// Growth appends the configured fill byte.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn resize(&mut self, path: &Path, new_size: u64) -> Result<(), SyncError> {
        let fill_byte = self.fill_byte;
        let file = self.handle(path)?;
        file.flush().await?;
        let current = file.metadata().await?.len();

        if new_size > current {
            let mut remaining = new_size - current;
            let chunk = vec![fill_byte; (remaining as usize).min(FILL_CHUNK)];

            file.seek(SeekFrom::End(0)).await?;
            while remaining > 0 {
                let n = (remaining as usize).min(chunk.len());
                file.write_all(&chunk[..n]).await?;
                remaining -= n as u64;
            }
            file.flush().await?;
        } else if new_size < current {
            file.set_len(new_size).await?;
        }

        debug!(from = current, to = new_size, "Resized");
        Ok(())
    }

    /// Renames the quarantined file back and sets its access and
    /// modification times to `mod_time` (UTC microseconds)
    ///
    /// # Errors
    /// Returns [`SyncError::AlreadyOpen`] if the file still has an open
    /// handle.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn restore_name_and_time(
        &mut self,
        path: &Path,
        mod_time: i64,
    ) -> Result<PathBuf, SyncError> {
        let quarantined = self.key(path);
        if self.handles.contains_key(&quarantined) {
            return Err(SyncError::AlreadyOpen(quarantined));
        }

        let original = dequarantine(&quarantined, &self.prefix);
        tokio::fs::rename(&quarantined, &original).await?;

        let stamp = file_time_from_micros(mod_time);
        let target = original.clone();
        tokio::task::spawn_blocking(move || filetime::set_file_times(&target, stamp, stamp))
            .await
            .map_err(io::Error::other)??;

        debug!(original = %original.display(), "Name and time restored");
        Ok(original)
    }

    /// Renames every quarantined file below `dir` back to its original name
    ///
    /// Files with an open handle are left alone, as are files whose original
    /// name is taken again. Returns the restored paths.
    #[instrument(skip(self, dir), fields(dir = %dir.display()))]
    pub async fn recover_quarantined(&mut self, dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
        let mut restored = Vec::new();
        let mut stack = vec![dir.to_path_buf()];

        while let Some(current) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !is_quarantined(&path, &self.prefix) || self.handles.contains_key(&path) {
                    continue;
                }

                let original = dequarantine(&path, &self.prefix);
                if tokio::fs::symlink_metadata(&original).await.is_ok() {
                    warn!(
                        quarantined = %path.display(),
                        original = %original.display(),
                        "Original name is taken, leaving quarantined file"
                    );
                    continue;
                }

                tokio::fs::rename(&path, &original).await?;
                debug!(original = %original.display(), "Recovered quarantined file");
                restored.push(original);
            }
        }

        if !restored.is_empty() {
            info!(count = restored.len(), "Recovered quarantined files");
        }
        Ok(restored)
    }

    /// Flushes and releases every open handle
    ///
    /// All handles are released even if one fails; the first failure is
    /// returned.
    pub async fn close_all(&mut self) -> Result<usize, SyncError> {
        let mut first_error = None;
        let mut closed = 0;

        for (path, mut file) in self.handles.drain() {
            let result = match file.flush().await {
                Ok(()) => file.sync_all().await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => closed += 1,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Handle did not close cleanly");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(closed),
        }
    }
}
