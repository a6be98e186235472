//! Batch consumer runtime for the imagebus pipeline.
//!
//! This module polls a [`MessageQueue`] for bounded batches, hands every
//! message of a batch to a [`MessageHandler`] concurrently, and settles each
//! message on its own: acked on success, released for redelivery on failure,
//! or dead-lettered once the [`RedrivePolicy`] threshold for its failure class
//! is reached.

use crate::config::{QueueConfig, RedrivePolicy};
use crate::queue::{MessageQueue, QueueError, QueueMessage};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, error, info, instrument, warn};

/// Pause between empty polls when the queue returns without long polling
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Errors that can occur running a consumer
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Invalid consumer configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Outcome of a failed handler invocation, classified for the redrive policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Redelivery may succeed (throttling, timeouts, unavailable collaborators)
    #[error("{reason}: {message}")]
    Transient { reason: String, message: String },

    /// Redelivery will fail the same way (malformed or invalid input)
    #[error("{reason}: {message}")]
    Fatal { reason: String, message: String },
}

impl HandlerError {
    /// Create a transient failure
    pub fn transient(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Create a fatal failure
    pub fn fatal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Machine-readable reason code, recorded on dead-lettered messages
    pub fn reason(&self) -> &str {
        match self {
            Self::Transient { reason, .. } | Self::Fatal { reason, .. } => reason,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Handler trait for processing messages
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: &QueueMessage) -> Result<(), HandlerError>;

    /// Called when message processing fails, before the message is settled
    async fn on_error(&self, message: &QueueMessage, error: &HandlerError) {
        warn!(
            message_id = %message.message_id,
            receive_count = message.receive_count,
            transient = error.is_transient(),
            error = %error,
            "Message processing failed"
        );
    }
}

/// What happened to a message after its handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Deleted from the queue
    Acked,
    /// Made visible again for redelivery
    Released,
    /// Moved to the dead letter queue
    DeadLettered,
}

/// Counts of settlements for one polled batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub acked: usize,
    pub released: usize,
    pub dead_lettered: usize,
    /// Whether the batch hit the invocation timeout
    pub timed_out: bool,
}

impl BatchReport {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Acked => self.acked += 1,
            Settlement::Released => self.released += 1,
            Settlement::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Polls one queue and drives a handler over bounded batches
pub struct QueueConsumer {
    queue: Arc<dyn MessageQueue>,
    batch_size: usize,
    batching_window: Duration,
    invocation_timeout: Duration,
    retry_delay: Duration,
    redrive: RedrivePolicy,
    shutdown_tx: broadcast::Sender<()>,
}

impl QueueConsumer {
    /// Create a consumer for the given queue
    pub fn new(queue: Arc<dyn MessageQueue>, config: &QueueConfig) -> Result<Self, ConsumerError> {
        config.validate()?;

        info!(
            queue = %queue.name(),
            batch_size = config.batch_size,
            batching_window_secs = config.batching_window_secs,
            invocation_timeout_secs = config.invocation_timeout_secs,
            fatal_max_receive_count = config.redrive.fatal_max_receive_count,
            transient_max_receive_count = config.redrive.transient_max_receive_count,
            "Creating queue consumer"
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            queue,
            batch_size: config.batch_size,
            batching_window: config.batching_window(),
            invocation_timeout: config.invocation_timeout(),
            retry_delay: config.retry_delay(),
            redrive: config.redrive,
            shutdown_tx,
        })
    }

    /// Get the consumed queue
    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.queue
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to stop consuming
    pub fn shutdown(&self) {
        info!(queue = %self.queue.name(), "Signaling consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Start consuming messages and process them with the given handler.
    ///
    /// Returns after [`shutdown`](Self::shutdown) once the batch in flight is settled.
    #[instrument(skip(self, handler), fields(queue = %self.queue.name()))]
    pub async fn run<H: MessageHandler + ?Sized>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        let mut shutdown_rx = self.shutdown_receiver();

        info!("Starting message consumption loop");

        loop {
            // Checked between batches so a batch is never abandoned half-settled
            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                info!("Received shutdown signal");
                break;
            }

            match self.poll_once(handler.as_ref()).await {
                Ok(report) if report.received > 0 => {
                    debug!(?report, "Batch settled");
                }
                Ok(_) => {
                    if self.batching_window.is_zero() {
                        tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Queue poll failed");
                    metrics::counter!("queue.poll.errors").increment(1);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        Ok(())
    }

    /// Receive one batch, handle it, and settle every message in it
    pub async fn poll_once<H: MessageHandler + ?Sized>(
        &self,
        handler: &H,
    ) -> Result<BatchReport, ConsumerError> {
        let batch = self.receive_batch().await?;
        if batch.is_empty() {
            return Ok(BatchReport::default());
        }

        Ok(self.process_batch(handler, batch).await)
    }

    /// Accumulate up to `batch_size` messages within the batching window
    async fn receive_batch(&self) -> Result<Vec<QueueMessage>, ConsumerError> {
        let deadline = Instant::now() + self.batching_window;
        let mut batch = Vec::with_capacity(self.batch_size);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // Round up so a sub-second remainder still long-polls
            let wait = Duration::from_secs(remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0));

            let received = self
                .queue
                .receive(self.batch_size - batch.len(), wait)
                .await?;
            batch.extend(received);

            if batch.len() >= self.batch_size || Instant::now() >= deadline {
                break;
            }
        }

        Ok(batch)
    }

    /// Handle a received batch and settle each message independently
    #[instrument(skip(self, handler, batch), fields(queue = %self.queue.name(), size = batch.len()))]
    pub async fn process_batch<H: MessageHandler + ?Sized>(
        &self,
        handler: &H,
        batch: Vec<QueueMessage>,
    ) -> BatchReport {
        let mut report = BatchReport {
            received: batch.len(),
            ..Default::default()
        };
        metrics::counter!("queue.messages.received").increment(batch.len() as u64);

        let started = Instant::now();
        let handled = tokio::time::timeout(
            self.invocation_timeout,
            futures::future::join_all(batch.iter().map(|message| handler.handle(message))),
        )
        .await;
        metrics::histogram!("queue.batch.duration_seconds").record(started.elapsed().as_secs_f64());

        let results = match handled {
            Ok(results) => results,
            Err(_) => {
                // The whole invocation failed; nothing in it counts as handled
                error!(
                    timeout_secs = self.invocation_timeout.as_secs(),
                    "Batch exceeded invocation timeout, releasing all messages"
                );
                metrics::counter!("queue.batch.timeouts").increment(1);
                report.timed_out = true;
                for message in &batch {
                    let settlement = self.release(message).await;
                    report.record(settlement);
                }
                return report;
            }
        };

        for (message, result) in batch.iter().zip(results) {
            let settlement = match result {
                Ok(()) => self.ack(message).await,
                Err(e) => {
                    handler.on_error(message, &e).await;
                    self.settle_failure(message, &e).await
                }
            };
            report.record(settlement);
        }

        report
    }

    /// Decide between redelivery and the dead letter queue for a failed message
    async fn settle_failure(&self, message: &QueueMessage, error: &HandlerError) -> Settlement {
        if !self.redrive.exhausted(error.is_transient(), message.receive_count) {
            return self.release(message).await;
        }

        match self.queue.dead_letter(message, error.reason()).await {
            Ok(()) => {
                metrics::counter!("queue.messages.dead_lettered", "reason" => error.reason().to_string())
                    .increment(1);
                Settlement::DeadLettered
            }
            Err(QueueError::NoDeadLetterQueue) => {
                // The queue's own redrive policy takes over
                debug!(message_id = %message.message_id, "No dead letter queue, releasing");
                self.release(message).await
            }
            Err(e) => {
                error!(message_id = %message.message_id, error = %e, "Failed to dead-letter message");
                self.release(message).await
            }
        }
    }

    async fn ack(&self, message: &QueueMessage) -> Settlement {
        if let Err(e) = self.queue.ack(message).await {
            // The message reappears after its visibility timeout and is handled again
            warn!(message_id = %message.message_id, error = %e, "Failed to delete message");
        }
        metrics::counter!("queue.messages.processed").increment(1);
        Settlement::Acked
    }

    async fn release(&self, message: &QueueMessage) -> Settlement {
        if let Err(e) = self.queue.release(message, self.retry_delay).await {
            warn!(message_id = %message.message_id, error = %e, "Failed to release message");
        }
        metrics::counter!("queue.messages.released").increment(1);
        Settlement::Released
    }
}

/// Builder for creating consumers with custom settings
pub struct ConsumerBuilder {
    queue: Arc<dyn MessageQueue>,
    config: QueueConfig,
}

impl ConsumerBuilder {
    /// Create a new consumer builder for a queue
    pub fn new(queue: Arc<dyn MessageQueue>, queue_url: impl Into<String>) -> Self {
        Self {
            queue,
            config: QueueConfig::new(queue_url),
        }
    }

    /// Set the maximum batch size
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Set the batching window
    pub fn batching_window(mut self, window: Duration) -> Self {
        self.config.batching_window_secs = window.as_secs();
        self
    }

    /// Set the invocation timeout
    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.config.invocation_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the redrive policy
    pub fn redrive(mut self, redrive: RedrivePolicy) -> Self {
        self.config.redrive = redrive;
        self
    }

    /// Build the consumer
    pub fn build(self) -> Result<QueueConsumer, ConsumerError> {
        QueueConsumer::new(self.queue, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every message whose body starts with "fatal" or "transient"
    struct ScriptedHandler {
        calls: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, message: &QueueMessage) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if message.body.starts_with("fatal") {
                Err(HandlerError::fatal("UnsupportedImageType", &message.body))
            } else if message.body.starts_with("transient") {
                Err(HandlerError::transient("StoreFailure", &message.body))
            } else if message.body.starts_with("slow") {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            } else {
                Ok(())
            }
        }
    }

    fn consumer(queue: Arc<InMemoryQueue>, redrive: RedrivePolicy) -> QueueConsumer {
        ConsumerBuilder::new(queue, "test-queue")
            .batching_window(Duration::ZERO)
            .redrive(redrive)
            .build()
            .unwrap()
    }

    fn queues(max_receive_count: u32) -> (Arc<InMemoryQueue>, Arc<InMemoryQueue>) {
        let dlq = Arc::new(InMemoryQueue::new("dlq"));
        let queue = Arc::new(InMemoryQueue::new("main").with_redrive(dlq.clone(), max_receive_count));
        (queue, dlq)
    }

    #[test]
    fn test_handler_error_classification() {
        let error = HandlerError::transient("StoreFailure", "throttled");
        assert!(error.is_transient());
        assert_eq!(error.reason(), "StoreFailure");
        assert_eq!(error.to_string(), "StoreFailure: throttled");

        let error = HandlerError::fatal("MalformedEnvelope", "not json");
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn test_batch_members_settle_independently() {
        let (queue, dlq) = queues(10);
        queue.send("ok-1");
        queue.send("fatal-1");
        queue.send("ok-2");
        queue.send("transient-1");

        let consumer = consumer(queue.clone(), RedrivePolicy::default());
        let report = consumer.poll_once(&ScriptedHandler::new()).await.unwrap();

        assert_eq!(report.received, 4);
        assert_eq!(report.acked, 2);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.released, 1);
        assert_eq!(queue.visible_len(), 1);
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(dlq.visible_len(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_is_bounded() {
        let (queue, _dlq) = queues(10);
        for i in 0..8 {
            queue.send(format!("ok-{}", i));
        }

        let consumer = consumer(queue.clone(), RedrivePolicy::default());
        let report = consumer.poll_once(&ScriptedHandler::new()).await.unwrap();

        assert_eq!(report.received, 5);
        assert_eq!(queue.visible_len(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_until_threshold() {
        let (queue, dlq) = queues(10);
        queue.send("transient-store");

        let consumer = consumer(
            queue.clone(),
            RedrivePolicy {
                fatal_max_receive_count: 1,
                transient_max_receive_count: 3,
            },
        );
        let handler = ScriptedHandler::new();

        for _ in 0..2 {
            let report = consumer.poll_once(&handler).await.unwrap();
            assert_eq!(report.released, 1);
        }
        let report = consumer.poll_once(&handler).await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.is_empty());

        let dead = dlq.receive(1, Duration::ZERO).await.unwrap().remove(0);
        assert_eq!(dead.rejection_reason(), Some("StoreFailure"));
    }

    #[tokio::test]
    async fn test_queue_redrive_after_exactly_max_receive_count() {
        // Thresholds above the queue's own maxReceiveCount: the queue redrives
        let (queue, dlq) = queues(3);
        queue.send("transient-forever");

        let consumer = consumer(
            queue.clone(),
            RedrivePolicy {
                fatal_max_receive_count: 100,
                transient_max_receive_count: 100,
            },
        );
        let handler = ScriptedHandler::new();

        for _ in 0..5 {
            consumer.poll_once(&handler).await.unwrap();
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.is_empty());
        assert_eq!(dlq.visible_len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_without_dead_letter_queue_is_released() {
        let queue = Arc::new(InMemoryQueue::new("main"));
        queue.send("fatal-no-dlq");

        let consumer = consumer(queue.clone(), RedrivePolicy::default());
        let report = consumer.poll_once(&ScriptedHandler::new()).await.unwrap();

        assert_eq!(report.released, 1);
        assert_eq!(queue.visible_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batching_window_accumulates_messages() {
        let (queue, _dlq) = queues(10);
        let consumer = ConsumerBuilder::new(queue.clone(), "test-queue")
            .batching_window(Duration::from_secs(5))
            .build()
            .unwrap();

        queue.send("ok-first");
        let late = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            late.send("ok-second");
        });

        let started = Instant::now();
        let handler = ScriptedHandler::new();
        let report = consumer.poll_once(&handler).await.unwrap();

        assert_eq!(report.received, 2);
        assert_eq!(report.acked, 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        // Returns when the window closes, not before
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invocation_timeout_releases_whole_batch() {
        let (queue, dlq) = queues(10);
        queue.send("ok-fast");
        queue.send("slow-1");

        let consumer = ConsumerBuilder::new(queue.clone(), "test-queue")
            .batching_window(Duration::ZERO)
            .invocation_timeout(Duration::from_secs(15))
            .build()
            .unwrap();

        let report = consumer.poll_once(&ScriptedHandler::new()).await.unwrap();

        assert!(report.timed_out);
        assert_eq!(report.released, 2);
        assert_eq!(queue.visible_len(), 2);
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn test_empty_poll() {
        let (queue, _dlq) = queues(10);
        let consumer = consumer(queue, RedrivePolicy::default());
        let report = consumer.poll_once(&ScriptedHandler::new()).await.unwrap();
        assert_eq!(report, BatchReport::default());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (queue, _dlq) = queues(10);
        queue.send("ok-1");

        let consumer = Arc::new(consumer(queue.clone(), RedrivePolicy::default()));
        let handler = Arc::new(ScriptedHandler::new());

        let runner = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.run(handler).await })
        };

        while !queue.is_empty() {
            tokio::task::yield_now().await;
        }
        consumer.shutdown();

        runner.await.unwrap().unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
