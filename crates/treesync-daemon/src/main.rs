//! treesync daemon - background change-detection agent
//!
//! This binary runs the synchronization pipeline for one sync root:
//! - Recovers files left quarantined by an interrupted transfer
//! - Binds the live watcher and runs the baseline scan
//! - Hands every merged record to the transport
//! - Shuts down gracefully on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The pipeline is driven by [`synchronize`] under a `CancellationToken`
//! that is triggered on receipt of SIGTERM or SIGINT, or by a fatal
//! pipeline error. Records and error reports leave the pipeline through a
//! [`ChannelTransport`] drained by a delivery task.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use treesync_core::config::Config;
use treesync_core::domain::{ChangeRecord, Component};
use treesync_sync::coordinator::synchronize;
use treesync_sync::transport::{ChannelTransport, ErrorReport, Transport};
use treesync_sync::writer::FileWriter;

// ============================================================================
// Configuration
// ============================================================================

/// Loads and validates the configuration file
fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?
    } else {
        info!(config_path = %path.display(), "No configuration file, using defaults");
        Config::default()
    };

    let errors = config.validate();
    if !errors.is_empty() {
        for err in &errors {
            error!(%err, "Invalid configuration");
        }
        anyhow::bail!("configuration has {} invalid field(s)", errors.len());
    }
    Ok(config)
}

/// Builds the tracing filter: `RUST_LOG` wins over the configured level
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

// ============================================================================
// Delivery
// ============================================================================

/// Drains the transport's receivers until both are closed
///
/// Stands in for the network side: records and error reports are logged.
fn spawn_delivery(
    mut records: mpsc::Receiver<ChangeRecord>,
    mut errors: mpsc::UnboundedReceiver<ErrorReport>,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut delivered = 0u64;
        let mut errors_open = true;

        loop {
            tokio::select! {
                record = records.recv() => match record {
                    Some(record) => {
                        delivered += 1;
                        debug!(
                            action = %record.action(),
                            path = %record.path().display(),
                            mod_time = record.mod_time(),
                            is_directory = record.is_directory(),
                            "Delivered record"
                        );
                        if record.is_scan_complete() {
                            info!(delivered, "Baseline delivered");
                        }
                    }
                    None => break,
                },
                report = errors.recv(), if errors_open => match report {
                    Some(report) if report.fatal => {
                        error!(component = %report.component, message = %report.message, "Fatal pipeline error");
                    }
                    Some(report) => {
                        debug!(component = %report.component, message = %report.message, "Pipeline error");
                    }
                    None => errors_open = false,
                },
            }
        }

        delivered
    })
}

// ============================================================================
// Recovery
// ============================================================================

/// Restores files quarantined by an interrupted transfer below `root`
///
/// A failure is reported as a writer error and does not stop the daemon.
/// Returns the number of restored files.
async fn recover_interrupted<T: Transport>(
    writer: &mut FileWriter,
    root: &Path,
    transport: &T,
    cancel: &CancellationToken,
) -> usize {
    match writer.recover_quarantined(root).await {
        Ok(restored) => {
            if !restored.is_empty() {
                warn!(count = restored.len(), "Restored files from an interrupted transfer");
            }
            restored.len()
        }
        Err(err) => {
            transport.report_error(Component::Writer, cancel, &err);
            0
        }
    }
}

// ============================================================================
// Signal handling
// ============================================================================

/// Waits for SIGINT or SIGTERM, then cancels `token`
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
        _ = token.cancelled() => return,
    }

    token.cancel();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load_or_default(&config_path);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.logging.level))
        .with_target(true)
        .init();

    info!("treesync daemon starting (treesyncd)");
    let config = load_config(&config_path)?;
    let root = config.sync.root.clone();

    tokio::fs::create_dir_all(&root)
        .await
        .with_context(|| format!("Failed to create sync root {}", root.display()))?;

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let (transport, records, errors) = ChannelTransport::new(config.sync.channel_capacity);
    let delivery = spawn_delivery(records, errors);

    let mut writer = FileWriter::new(&config.writer);
    recover_interrupted(&mut writer, &root, &transport, &shutdown_token).await;

    info!(root = %root.display(), "Starting synchronization");
    let result = synchronize(&root, &config, Arc::new(transport), shutdown_token.clone()).await;
    shutdown_token.cancel();

    match delivery.await {
        Ok(delivered) => info!(delivered, "Delivery task finished"),
        Err(e) => warn!(error = %e, "Delivery task failed"),
    }

    match &result {
        Ok(()) => info!("treesync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "treesync daemon exiting with error"),
    }

    result.context("Synchronization failed")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use treesync_core::domain::Action;

    use super::*;

    #[test]
    fn test_load_config_defaults_when_missing() {
        let config = load_config(Path::new("/nonexistent/treesync/config.yaml")).unwrap();
        assert_eq!(config.sync.liveness_interval_ms, 2_000);
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let dir = std::env::temp_dir().join(format!("treesyncd-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(&path, "sync:\n  root: relative/path\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("invalid"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_recovery_failure_is_reported_as_writer_error() {
        let (transport, _records, mut errors) = ChannelTransport::new(4);
        let mut writer = FileWriter::new(&Config::default().writer);

        let restored = recover_interrupted(
            &mut writer,
            Path::new("/nonexistent/treesync/root"),
            &transport,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(restored, 0);
        let report = errors.try_recv().unwrap();
        assert_eq!(report.component, Component::Writer);
        assert!(!report.fatal);
    }

    #[tokio::test]
    async fn test_delivery_counts_records_until_closed() {
        let (tx, rx) = mpsc::channel(8);
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let delivery = spawn_delivery(rx, err_rx);

        tx.send(ChangeRecord::probed(Action::Baseline, "/sync/a", 1, "h", false))
            .await
            .unwrap();
        tx.send(ChangeRecord::scan_complete(PathBuf::from("/sync")))
            .await
            .unwrap();
        drop(err_tx);
        drop(tx);

        assert_eq!(delivery.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_signal_returns_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        shutdown_signal(token.clone()).await;
        assert!(token.is_cancelled());
    }
}
