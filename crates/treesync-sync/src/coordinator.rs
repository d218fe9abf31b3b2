//! Synchronization coordinator
//!
//! Merges the live watcher stream and the baseline scanner stream into the
//! single ordered stream handed to the [`Transport`].
//!
//! ## State machine
//!
//! ```text
//! Merging ──ScanComplete──→ Draining ──flush done──→ LiveOnly
//!    │                                                  │
//!    └────────── cancel / fatal error / watcher gone ───┴──→ Terminated
//! ```
//!
//! - **Merging**: live records update the [`DedupTable`] and are forwarded at
//!   once. Baseline records are only stored.
//! - **Draining**: the current value of every path first seen by the scanner
//!   is forwarded in path order, followed by the `ScanComplete` marker.
//! - **LiveOnly**: live records are forwarded directly.
//!
//! All state lives in one task, so a table update and the forward that
//! follows it are never interleaved with a drain.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use treesync_core::config::Config;
use treesync_core::domain::{Action, ChangeRecord, Component};

use crate::scanner::BaselineScanner;
use crate::transport::Transport;
use crate::watcher::LiveWatcher;
use crate::{unless_cancelled, Emission, SyncError};

// ============================================================================
// CoordinatorState
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Merging,
    Draining,
    LiveOnly,
    Terminated,
}

impl Display for CoordinatorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinatorState::Merging => "merging",
            CoordinatorState::Draining => "draining",
            CoordinatorState::LiveOnly => "live_only",
            CoordinatorState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

// ============================================================================
// DedupTable
// ============================================================================

#[derive(Debug, Clone)]
struct DedupEntry {
    record: ChangeRecord,
    /// The scanner reported this path
    baseline: bool,
}

/// Latest known record per path while the scan is running
#[derive(Debug, Default)]
pub struct DedupTable {
    entries: BTreeMap<PathBuf, DedupEntry>,
}

impl DedupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a live record; it supersedes whatever the path held before
    pub fn record_live(&mut self, record: ChangeRecord) {
        let path = record.path().to_path_buf();
        let baseline = self.entries.get(&path).is_some_and(|e| e.baseline);
        self.entries.insert(path, DedupEntry { record, baseline });
    }

    /// Stores a baseline record
    ///
    /// A live record already held for the path is newer than anything the
    /// scanner can report, so it is kept; the path is still marked as part
    /// of the baseline.
    pub fn record_baseline(&mut self, record: ChangeRecord) {
        match self.entries.get_mut(record.path()) {
            Some(entry) if entry.record.action().is_live() => entry.baseline = true,
            _ => {
                self.entries.insert(
                    record.path().to_path_buf(),
                    DedupEntry {
                        record,
                        baseline: true,
                    },
                );
            }
        }
    }

    pub fn get(&self, path: &Path) -> Option<&ChangeRecord> {
        self.entries.get(path).map(|e| &e.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the table, returning the current value of every baseline path
    /// in path order
    pub fn drain_baseline(&mut self) -> Vec<ChangeRecord> {
        std::mem::take(&mut self.entries)
            .into_values()
            .filter(|e| e.baseline)
            .map(|e| e.record)
            .collect()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Drives the merge of watcher and scanner output into a [`Transport`]
pub struct Coordinator<T: Transport> {
    root: PathBuf,
    transport: Arc<T>,
    send_timeout: Duration,
    state: CoordinatorState,
    table: DedupTable,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(root: impl Into<PathBuf>, transport: Arc<T>, send_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            transport,
            send_timeout,
            state: CoordinatorState::Merging,
            table: DedupTable::new(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn table(&self) -> &DedupTable {
        &self.table
    }

    /// Consumes both producer streams until cancellation, a fatal error or
    /// the end of the watcher stream
    ///
    /// Every producer error is passed to [`Transport::report_error`]. On a
    /// fatal one `cancel` is triggered and the error returned. The state is
    /// always [`CoordinatorState::Terminated`] afterwards.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn run(
        &mut self,
        watcher_rx: mpsc::Receiver<Emission>,
        scanner_rx: mpsc::Receiver<Emission>,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        info!("Coordinator starting");
        let result = self.merge(watcher_rx, scanner_rx, &cancel).await;

        self.state = CoordinatorState::Terminated;
        match &result {
            Ok(()) => info!("Coordinator stopped"),
            Err(err) => {
                warn!(error = %err, "Coordinator stopped on fatal error");
                cancel.cancel();
            }
        }
        result
    }

    async fn merge(
        &mut self,
        mut watcher_rx: mpsc::Receiver<Emission>,
        mut scanner_rx: mpsc::Receiver<Emission>,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let mut scanner_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Cancellation received");
                    return Ok(());
                }

                item = watcher_rx.recv() => match item {
                    Some(Ok(record)) => self.on_live(record, cancel).await?,
                    Some(Err(err)) => self.on_error(Component::Watcher, err, cancel)?,
                    None => {
                        debug!("Watcher stream ended");
                        return Ok(());
                    }
                },

                item = scanner_rx.recv(), if scanner_open => match item {
                    Some(Ok(record)) if record.is_scan_complete() => {
                        scanner_open = false;
                        self.drain(record, cancel).await?;
                    }
                    Some(Ok(record)) => self.on_baseline(record),
                    Some(Err(err)) => self.on_error(Component::Scanner, err, cancel)?,
                    None => {
                        scanner_open = false;
                        if self.state == CoordinatorState::Merging {
                            warn!("Scanner stream ended without ScanComplete");
                            let marker = ChangeRecord::scan_complete(&self.root);
                            self.drain(marker, cancel).await?;
                        }
                    }
                },
            }
        }
    }

    async fn on_live(
        &mut self,
        record: ChangeRecord,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if self.state == CoordinatorState::Merging {
            self.table.record_live(record.clone());
        }
        self.forward(record, cancel).await
    }

    fn on_baseline(&mut self, record: ChangeRecord) {
        if self.state != CoordinatorState::Merging || record.action() != Action::Baseline {
            debug!(record = %record, state = %self.state, "Dropping unexpected scanner record");
            return;
        }
        self.table.record_baseline(record);
    }

    fn on_error(
        &self,
        component: Component,
        err: SyncError,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.transport.report_error(component, cancel, &err);
        if err.is_fatal() {
            Err(err)
        } else {
            Ok(())
        }
    }

    /// Flushes the baseline, forwards `marker` and moves to LiveOnly
    async fn drain(
        &mut self,
        marker: ChangeRecord,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        self.state = CoordinatorState::Draining;
        let baseline = self.table.drain_baseline();
        info!(records = baseline.len(), "Draining baseline");

        for record in baseline.into_iter().chain(std::iter::once(marker)) {
            if cancel.is_cancelled() {
                debug!("Drain interrupted by cancellation");
                return Ok(());
            }
            self.forward(record, cancel).await?;
        }

        self.state = CoordinatorState::LiveOnly;
        info!("Baseline delivered, forwarding live changes only");
        Ok(())
    }

    /// Hands one record to the transport within the send timeout
    ///
    /// A timeout drops the record and is reported as a non-fatal error. A
    /// transport failure is reported and returned. Cancellation abandons
    /// the send.
    async fn forward(
        &self,
        record: ChangeRecord,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let path = record.path().to_path_buf();
        debug!(action = %record.action(), path = %path.display(), "Forwarding record");

        let send = tokio::time::timeout(self.send_timeout, self.transport.send(record));
        let Some(outcome) = unless_cancelled(cancel, send).await else {
            debug!(path = %path.display(), "Send abandoned on cancellation");
            return Ok(());
        };
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => {
                let err = SyncError::Transport(source);
                self.transport
                    .report_error(Component::Coordinator, cancel, &err);
                Err(err)
            }
            Err(_) => {
                let err = SyncError::SendTimeout {
                    path,
                    timeout_ms: self.send_timeout.as_millis() as u64,
                };
                self.transport
                    .report_error(Component::Coordinator, cancel, &err);
                Ok(())
            }
        }
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Runs the whole pipeline for `root` until `cancel` fires or a fatal error
///
/// The watcher is bound before the scanner starts so that no change made
/// during the scan goes unseen. Both producers are stopped and joined on
/// every exit path.
///
/// # Errors
/// Returns the error that bound the watcher or the fatal error that
/// stopped the coordinator.
pub async fn synchronize<T>(
    root: &Path,
    config: &Config,
    transport: Arc<T>,
    cancel: CancellationToken,
) -> Result<(), SyncError>
where
    T: Transport + 'static,
{
    let watcher = LiveWatcher::bind(root, config).await?;
    let scanner = BaselineScanner::from_config(root, config);

    let capacity = config.sync.channel_capacity;
    let (watcher_tx, watcher_rx) = mpsc::channel(capacity);
    let (scanner_tx, scanner_rx) = mpsc::channel(capacity);

    let producers = cancel.child_token();
    let watcher_task = tokio::spawn(watcher.run(watcher_tx, producers.clone()));
    let scanner_task = tokio::spawn(scanner.run(scanner_tx, producers.clone()));

    let mut coordinator = Coordinator::new(root, transport, config.sync.send_timeout());
    let result = coordinator.run(watcher_rx, scanner_rx, cancel).await;

    producers.cancel();
    if let Err(err) = watcher_task.await {
        warn!(error = %err, "Watcher task did not finish cleanly");
    }
    match scanner_task.await {
        Ok(stats) => debug!(?stats, "Scanner task joined"),
        Err(err) => warn!(error = %err, "Scanner task did not finish cleanly"),
    }

    result
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::transport::SendError;

    fn baseline(path: &str) -> ChangeRecord {
        ChangeRecord::probed(Action::Baseline, path, 1, "base", false)
    }

    fn write(path: &str) -> ChangeRecord {
        ChangeRecord::probed(Action::Write, path, 2, "live", false)
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<ChangeRecord>>,
        errors: Mutex<Vec<(Component, bool)>>,
        fail: bool,
        stall: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, record: ChangeRecord) -> Result<(), SendError> {
            if self.fail {
                return Err(SendError::new("peer unreachable"));
            }
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.sent.lock().unwrap().push(record);
            Ok(())
        }

        fn report_error(&self, component: Component, _cancel: &CancellationToken, err: &SyncError) {
            self.errors.lock().unwrap().push((component, err.is_fatal()));
        }
    }

    fn coordinator(transport: &Arc<RecordingTransport>) -> Coordinator<RecordingTransport> {
        Coordinator::new("/sync", Arc::clone(transport), Duration::from_secs(1))
    }

    // ------------------------------------------------------------------
    // DedupTable
    // ------------------------------------------------------------------

    #[test]
    fn test_table_live_supersedes_baseline() {
        let mut table = DedupTable::new();
        table.record_baseline(baseline("/sync/b"));
        table.record_live(write("/sync/b"));

        assert_eq!(table.get(Path::new("/sync/b")).unwrap().action(), Action::Write);
        let drained = table.drain_baseline();
        assert_eq!(drained, vec![write("/sync/b")]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_baseline_does_not_overwrite_live() {
        let mut table = DedupTable::new();
        table.record_live(write("/sync/b"));
        table.record_baseline(baseline("/sync/b"));

        assert_eq!(table.drain_baseline(), vec![write("/sync/b")]);
    }

    #[test]
    fn test_table_drain_skips_live_only_paths_and_sorts() {
        let mut table = DedupTable::new();
        table.record_baseline(baseline("/sync/c"));
        table.record_live(write("/sync/new"));
        table.record_baseline(baseline("/sync/a"));

        let drained = table.drain_baseline();
        let paths: Vec<_> = drained.iter().map(|r| r.path().to_path_buf()).collect();
        assert_eq!(paths, vec![PathBuf::from("/sync/a"), PathBuf::from("/sync/c")]);
    }

    #[test]
    fn test_table_remove_is_current_value() {
        let mut table = DedupTable::new();
        table.record_baseline(baseline("/sync/a"));
        table.record_live(ChangeRecord::removed("/sync/a"));

        assert_eq!(table.drain_baseline(), vec![ChangeRecord::removed("/sync/a")]);
    }

    // ------------------------------------------------------------------
    // Coordinator
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_merge_then_drain_then_live_only() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(&transport);
        let (watcher_tx, watcher_rx) = mpsc::channel(16);
        let (scanner_tx, scanner_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        scanner_tx.send(Ok(baseline("/sync/a"))).await.unwrap();
        scanner_tx.send(Ok(baseline("/sync/b"))).await.unwrap();
        scanner_tx
            .send(Ok(ChangeRecord::scan_complete("/sync")))
            .await
            .unwrap();
        watcher_tx.send(Ok(write("/sync/c"))).await.unwrap();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator.run(watcher_rx, scanner_rx, cancel).await.unwrap();
                coordinator
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        watcher_tx.send(Ok(write("/sync/d"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let coordinator = handle.await.unwrap();

        assert_eq!(coordinator.state(), CoordinatorState::Terminated);
        // c is live and not part of the baseline, so it is not flushed again
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                write("/sync/c"),
                baseline("/sync/a"),
                baseline("/sync/b"),
                ChangeRecord::scan_complete("/sync"),
                write("/sync/d"),
            ]
        );
        assert!(coordinator.table().is_empty());
        drop(scanner_tx);
    }

    #[tokio::test]
    async fn test_scanner_end_without_marker_synthesizes_drain() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(&transport);
        let (watcher_tx, watcher_rx) = mpsc::channel(16);
        let (scanner_tx, scanner_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        scanner_tx.send(Ok(baseline("/sync/a"))).await.unwrap();
        drop(scanner_tx);

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator.run(watcher_rx, scanner_rx, cancel).await.unwrap();
                coordinator
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let coordinator = handle.await.unwrap();
        drop(watcher_tx);

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![baseline("/sync/a"), ChangeRecord::scan_complete("/sync")]
        );
        assert_eq!(coordinator.state(), CoordinatorState::Terminated);
    }

    #[tokio::test]
    async fn test_non_fatal_error_is_reported_and_merge_continues() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(&transport);
        let (watcher_tx, watcher_rx) = mpsc::channel(16);
        let (_scanner_tx, scanner_rx) = mpsc::channel::<Emission>(16);

        watcher_tx
            .send(Err(SyncError::RootRecreated(PathBuf::from("/sync"))))
            .await
            .unwrap();
        watcher_tx.send(Ok(write("/sync/a"))).await.unwrap();
        drop(watcher_tx);

        coordinator
            .run(watcher_rx, scanner_rx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*transport.errors.lock().unwrap(), vec![(Component::Watcher, false)]);
        assert_eq!(*transport.sent.lock().unwrap(), vec![write("/sync/a")]);
    }

    #[tokio::test]
    async fn test_fatal_watcher_error_cancels_pipeline() {
        let transport = Arc::new(RecordingTransport::default());
        let mut coordinator = coordinator(&transport);
        let (watcher_tx, watcher_rx) = mpsc::channel(16);
        let (_scanner_tx, scanner_rx) = mpsc::channel::<Emission>(16);
        let cancel = CancellationToken::new();

        watcher_tx
            .send(Err(SyncError::NotificationSource("queue overflow".into())))
            .await
            .unwrap();

        let err = coordinator
            .run(watcher_rx, scanner_rx, cancel.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::NotificationSource(_)));
        assert!(cancel.is_cancelled());
        assert_eq!(coordinator.state(), CoordinatorState::Terminated);
        assert_eq!(*transport.errors.lock().unwrap(), vec![(Component::Watcher, true)]);
    }

    #[tokio::test]
    async fn test_transport_failure_is_fatal() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let mut coordinator = coordinator(&transport);
        let (watcher_tx, watcher_rx) = mpsc::channel(16);
        let (_scanner_tx, scanner_rx) = mpsc::channel::<Emission>(16);
        let cancel = CancellationToken::new();

        watcher_tx.send(Ok(write("/sync/a"))).await.unwrap();

        let err = coordinator
            .run(watcher_rx, scanner_rx, cancel.clone())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Transport(_)));
        assert!(cancel.is_cancelled());
        assert_eq!(
            *transport.errors.lock().unwrap(),
            vec![(Component::Coordinator, true)]
        );
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_drain() {
        let transport = Arc::new(RecordingTransport {
            stall: true,
            ..Default::default()
        });
        let mut coordinator =
            Coordinator::new("/sync", Arc::clone(&transport), Duration::from_secs(10));
        let (_watcher_tx, watcher_rx) = mpsc::channel::<Emission>(16);
        let (scanner_tx, scanner_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        for i in 0..20 {
            scanner_tx
                .send(Ok(baseline(&format!("/sync/f{i:02}"))))
                .await
                .unwrap();
        }
        scanner_tx
            .send(Ok(ChangeRecord::scan_complete("/sync")))
            .await
            .unwrap();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = coordinator.run(watcher_rx, scanner_rx, cancel).await;
                (coordinator, result)
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let (coordinator, result) = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("drain ignored cancellation")
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(coordinator.state(), CoordinatorState::Terminated);
        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(transport.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CoordinatorState::LiveOnly.to_string(), "live_only");
        assert_eq!(CoordinatorState::Terminated.to_string(), "terminated");
    }
}
