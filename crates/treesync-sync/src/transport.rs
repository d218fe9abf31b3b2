//! Transport port
//!
//! The coordinator hands every merged record to a [`Transport`], which ships
//! it to the remote peer, and funnels every producer error through
//! [`Transport::report_error`] together with the component that raised it.
//!
//! [`ChannelTransport`] is the in-process adapter: records and error reports
//! land on tokio channels for whatever drives the network side.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use treesync_core::domain::{ChangeRecord, Component};

use crate::SyncError;

/// The transport could not accept a record
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SendError(String);

impl SendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Delivery side of the pipeline
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ships one record to the remote peer
    async fn send(&self, record: ChangeRecord) -> Result<(), SendError>;

    /// Reports an error raised by `component`
    ///
    /// `cancel` is the pipeline's shared token; a transport may cancel it to
    /// stop every component.
    fn report_error(&self, component: Component, cancel: &CancellationToken, error: &SyncError);
}

/// An error as seen by the consumer of a [`ChannelTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub component: Component,
    pub message: String,
    pub fatal: bool,
}

/// Transport adapter backed by tokio channels
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    records: mpsc::Sender<ChangeRecord>,
    errors: mpsc::UnboundedSender<ErrorReport>,
}

impl ChannelTransport {
    /// Creates the transport and the receivers for records and error reports
    pub fn new(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<ChangeRecord>,
        mpsc::UnboundedReceiver<ErrorReport>,
    ) {
        let (records, record_rx) = mpsc::channel(capacity);
        let (errors, error_rx) = mpsc::unbounded_channel();
        (Self { records, errors }, record_rx, error_rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, record: ChangeRecord) -> Result<(), SendError> {
        self.records
            .send(record)
            .await
            .map_err(|_| SendError::new("record receiver dropped"))
    }

    fn report_error(&self, component: Component, _cancel: &CancellationToken, err: &SyncError) {
        let fatal = err.is_fatal();
        if fatal {
            error!(%component, error = %err, "Component failed");
        } else {
            warn!(%component, error = %err, "Component reported an error");
        }

        let report = ErrorReport {
            component,
            message: err.to_string(),
            fatal,
        };
        if self.errors.send(report).is_err() {
            warn!(%component, "Error report receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[tokio::test]
    async fn test_send_delivers_record() {
        let (transport, mut records, _errors) = ChannelTransport::new(4);
        let record = ChangeRecord::removed("/sync/a.txt");

        transport.send(record.clone()).await.unwrap();
        assert_eq!(records.recv().await, Some(record));
    }

    #[tokio::test]
    async fn test_send_fails_when_receiver_dropped() {
        let (transport, records, _errors) = ChannelTransport::new(4);
        drop(records);

        let err = transport
            .send(ChangeRecord::removed("/sync/a.txt"))
            .await
            .unwrap_err();
        assert_eq!(err, SendError::new("record receiver dropped"));
    }

    #[test]
    fn test_report_error_carries_component_and_severity() {
        let (transport, _records, mut errors) = ChannelTransport::new(4);
        let cancel = CancellationToken::new();

        transport.report_error(
            Component::Watcher,
            &cancel,
            &SyncError::NotificationSource("closed".into()),
        );
        transport.report_error(
            Component::Scanner,
            &cancel,
            &SyncError::RootRecreated(PathBuf::from("/sync")),
        );

        let first = errors.try_recv().unwrap();
        assert_eq!(first.component, Component::Watcher);
        assert!(first.fatal);

        let second = errors.try_recv().unwrap();
        assert_eq!(second.component, Component::Scanner);
        assert!(!second.fatal);
        assert!(second.message.contains("/sync"));
        assert!(!cancel.is_cancelled());
    }
}
