//! Queue abstraction shared by the SQS and in-memory backends.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Message attribute carrying the reason a message was dead-lettered
pub const REJECTION_REASON_ATTRIBUTE: &str = "rejection-reason";

/// Message attribute carrying the id of the message on its origin queue
pub const SOURCE_MESSAGE_ID_ATTRIBUTE: &str = "source-message-id";

/// Errors that can occur talking to a queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to receive messages: {0}")]
    ReceiveError(String),

    #[error("Failed to delete message {message_id}: {message}")]
    AckError { message_id: String, message: String },

    #[error("Failed to release message {message_id}: {message}")]
    ReleaseError { message_id: String, message: String },

    #[error("Failed to dead-letter message {message_id}: {message}")]
    DeadLetterError { message_id: String, message: String },

    #[error("No dead letter queue configured")]
    NoDeadLetterQueue,

    #[error("Message {0} is not in flight")]
    NotInFlight(String),
}

/// A message received from a queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    /// Queue-assigned message id
    pub message_id: String,
    /// Raw message body
    pub body: String,
    /// Handle identifying this particular receipt of the message
    pub receipt_handle: String,
    /// How many times the message has been received, this receipt included
    pub receive_count: u32,
    /// String message attributes
    pub attributes: HashMap<String, String>,
}

impl QueueMessage {
    /// Deserialize the body as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// Get a message attribute
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    /// Reason recorded when this message was explicitly dead-lettered
    pub fn rejection_reason(&self) -> Option<&str> {
        self.attribute(REJECTION_REASON_ATTRIBUTE)
    }
}

/// Operations a consumer needs from the queue it polls.
///
/// Every received message must eventually be settled with exactly one of
/// [`ack`](MessageQueue::ack), [`release`](MessageQueue::release) or
/// [`dead_letter`](MessageQueue::dead_letter).
#[async_trait::async_trait]
pub trait MessageQueue: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    /// Receive up to `max_messages`, waiting at most `wait` for the first one
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete a successfully handled message
    async fn ack(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Make a message visible again after `delay` so it is redelivered
    async fn release(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError>;

    /// Move a message to the dead letter queue, recording `reason`
    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError>;
}
