use crate::change_stream::{ChangeEvent, ChangeKind, ChangeStream, ChangeStreamError};
use crate::error::PipelineError;
use crate::notifier::Notifier;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Pause after a failed change stream read
const STREAM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What happened to one change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Notified,
    Ignored,
    Failed,
}

/// Outcome counts for one batch of changes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub notified: usize,
    pub ignored: usize,
    pub failed: usize,
}

/// Turns store mutations into notifications
///
/// Inserts and modifications are notified with the record's post-image,
/// removals are ignored. A failed send is logged and counted but not retried.
pub struct ChangeRelay {
    notifier: Arc<dyn Notifier>,
    send_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChangeRelay {
    pub fn new(notifier: Arc<dyn Notifier>, send_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            notifier,
            send_timeout,
            shutdown_tx,
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Relay changes until shutdown or until the stream closes
    pub async fn run<S: ChangeStream>(&self, mut stream: S) -> Result<(), ChangeStreamError> {
        let mut shutdown_rx = self.shutdown_receiver();
        info!("Change relay started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Change relay shutting down");
                    break;
                }
                batch = stream.next_batch() => match batch {
                    Ok(events) => {
                        self.handle_batch(&events).await;
                    }
                    Err(ChangeStreamError::Closed) => {
                        warn!("Change stream closed, stopping relay");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to read change stream");
                        metrics::counter!("images.relay.stream_errors").increment(1);
                        tokio::time::sleep(STREAM_ERROR_BACKOFF).await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a batch of changes in stream order
    pub async fn handle_batch(&self, events: &[ChangeEvent]) -> RelayReport {
        let mut report = RelayReport::default();
        for event in events {
            match self.handle_change(event).await {
                RelayOutcome::Notified => report.notified += 1,
                RelayOutcome::Ignored => report.ignored += 1,
                RelayOutcome::Failed => report.failed += 1,
            }
        }
        report
    }

    #[instrument(skip(self, event), fields(key = %event.key, kind = ?event.kind))]
    pub async fn handle_change(&self, event: &ChangeEvent) -> RelayOutcome {
        let record = match (event.kind, &event.new_image) {
            (ChangeKind::Remove, _) => {
                debug!("Ignoring removal");
                return RelayOutcome::Ignored;
            }
            (_, Some(record)) => record,
            (_, None) => {
                warn!("Change carries no new image, nothing to notify");
                return RelayOutcome::Ignored;
            }
        };

        let result = match tokio::time::timeout(self.send_timeout, self.notifier.send(record)).await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::SendFailure(format!(
                "send timed out after {:?}",
                self.send_timeout
            ))),
        };

        match result {
            Ok(()) => {
                metrics::counter!("images.notifications.sent").increment(1);
                RelayOutcome::Notified
            }
            Err(e) => {
                error!(error = %e, reason = e.reason(), "Failed to send notification");
                metrics::counter!("images.notifications.failed").increment(1);
                RelayOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ImageType;
    use crate::memory::InMemoryMetadataStore;
    use crate::metadata_store::{ImageRecord, MetadataStore};
    use crate::notifier::MockNotifier;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn change(kind: ChangeKind, record: Option<ImageRecord>) -> ChangeEvent {
        ChangeEvent {
            kind,
            key: "image/photo.png".to_string(),
            new_image: record,
            sequence_number: None,
        }
    }

    fn photo() -> ImageRecord {
        ImageRecord::new("image/photo.png", ImageType::Png, "b")
    }

    #[tokio::test]
    async fn test_insert_and_modify_are_notified() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .withf(|record| record.name == "image/photo.png")
            .times(2)
            .returning(|_| Ok(()));

        let relay = ChangeRelay::new(Arc::new(notifier), Duration::from_secs(3));
        let report = relay
            .handle_batch(&[
                change(ChangeKind::Insert, Some(photo())),
                change(ChangeKind::Modify, Some(photo())),
                change(ChangeKind::Remove, None),
            ])
            .await;

        assert_eq!(
            report,
            RelayReport {
                notified: 2,
                ignored: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_send_failure_is_not_retried() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_send()
            .times(1)
            .returning(|_| Err(PipelineError::SendFailure("throttled".to_string())));

        let relay = ChangeRelay::new(Arc::new(notifier), Duration::from_secs(3));
        let outcome = relay
            .handle_change(&change(ChangeKind::Insert, Some(photo())))
            .await;

        assert_eq!(outcome, RelayOutcome::Failed);
    }

    struct SlowNotifier;

    #[async_trait]
    impl Notifier for SlowNotifier {
        async fn send(&self, _record: &ImageRecord) -> Result<(), PipelineError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout() {
        let relay = ChangeRelay::new(Arc::new(SlowNotifier), Duration::from_secs(3));
        let outcome = relay
            .handle_change(&change(ChangeKind::Insert, Some(photo())))
            .await;

        assert_eq!(outcome, RelayOutcome::Failed);
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<ImageRecord>>,
        notify: Notify,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, record: &ImageRecord) -> Result<(), PipelineError> {
            self.sent.lock().unwrap().push(record.clone());
            self.notify.notify_one();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_relays_store_changes_until_shutdown() {
        let store = InMemoryMetadataStore::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let relay = Arc::new(ChangeRelay::new(notifier.clone(), Duration::from_secs(3)));

        let stream = store.subscribe();
        let handle = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(stream).await }
        });

        store.upsert(&photo()).await.unwrap();
        store.upsert(&photo()).await.unwrap();
        notifier.notify.notified().await;

        relay.shutdown();
        handle.await.unwrap().unwrap();

        assert_eq!(notifier.sent.lock().unwrap().clone(), vec![photo()]);
    }
}
