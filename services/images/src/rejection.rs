//! Terminal sink for dead-lettered upload notifications.

use crate::classifier::classify;
use crate::envelope;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imagebus_pipeline::{HandlerError, MessageHandler, QueueMessage};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

/// Key reported for a message whose body could not be decoded
pub const UNDECODABLE_KEY: &str = "<undecodable>";

/// Reason for a message dead-lettered by the queue's own redrive
pub const RETRIES_EXHAUSTED: &str = "RetriesExhausted";

const MALFORMED_ENVELOPE: &str = "MalformedEnvelope";

/// A permanently failed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionRecord {
    pub key: String,
    pub bucket: Option<String>,
    pub reason: String,
    pub message_id: String,
    pub receive_count: u32,
    pub rejected_at: DateTime<Utc>,
}

/// Bounded record of the most recent rejections
pub struct RejectionLog {
    capacity: usize,
    entries: Mutex<VecDeque<RejectionRecord>>,
}

impl RejectionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a record, evicting the oldest once full
    pub fn push(&self, record: RejectionRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Up to `limit` records, newest first
    pub fn recent(&self, limit: usize) -> Vec<RejectionRecord> {
        self.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RejectionRecord>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Why an upload was rejected
///
/// The reason written at dead-lettering applies to every key of the message,
/// unless it is a classification reason: that one belongs to a single key, so
/// each key is classified again. A key that still fails names its own
/// classification error, one that classifies fine must have run out of retries.
pub fn resolve_reason(recorded: Option<&str>, key: &str) -> String {
    if let Some(reason) = recorded {
        if !is_classification_reason(reason) {
            return reason.to_string();
        }
    }
    match classify(key) {
        Err(e) => e.reason().to_string(),
        Ok(_) => RETRIES_EXHAUSTED.to_string(),
    }
}

fn is_classification_reason(reason: &str) -> bool {
    matches!(reason, "UnknownImageType" | "UnsupportedImageType")
}

/// Handler for the dead letter queue
///
/// Never fails, so every dead-lettered message is acked after being recorded.
pub struct RejectionHandler {
    log: Arc<RejectionLog>,
}

impl RejectionHandler {
    pub fn new(log: Arc<RejectionLog>) -> Self {
        Self { log }
    }

    /// Rejection records for one dead-lettered message
    pub fn rejections(&self, message: &QueueMessage) -> Vec<RejectionRecord> {
        let rejected_at = Utc::now();
        let record = |key: String, bucket: Option<String>, reason: String| RejectionRecord {
            key,
            bucket,
            reason,
            message_id: message.message_id.clone(),
            receive_count: message.receive_count,
            rejected_at,
        };

        match envelope::decode(message.body.as_bytes()) {
            Ok(events) => events
                .into_iter()
                .map(|event| {
                    let reason = resolve_reason(message.rejection_reason(), &event.object_key);
                    record(event.object_key, Some(event.bucket_name), reason)
                })
                .collect(),
            Err(e) => {
                debug!(error = %e, "Dead-lettered message is undecodable");
                vec![record(
                    UNDECODABLE_KEY.to_string(),
                    None,
                    MALFORMED_ENVELOPE.to_string(),
                )]
            }
        }
    }
}

#[async_trait]
impl MessageHandler for RejectionHandler {
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    async fn handle(&self, message: &QueueMessage) -> Result<(), HandlerError> {
        let rejections = self.rejections(message);
        if rejections.is_empty() {
            debug!("Dead-lettered message carries no upload records");
        }

        for rejection in rejections {
            warn!(
                key = %rejection.key,
                bucket = rejection.bucket.as_deref().unwrap_or_default(),
                reason = %rejection.reason,
                receive_count = rejection.receive_count,
                "Rejected upload"
            );
            metrics::counter!("images.rejections", "reason" => rejection.reason.clone()).increment(1);
            self.log.push(rejection);
        }

        Ok(())
    }
}
