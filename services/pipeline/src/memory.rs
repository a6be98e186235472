//! In-process [`MessageQueue`] with SQS-style redrive.
//!
//! Messages are redelivered until their receive count reaches the redrive
//! threshold; the next receive attempt moves them to the attached dead letter
//! queue instead, exactly as SQS applies `maxReceiveCount`.

use crate::queue::{
    MessageQueue, QueueError, QueueMessage, REJECTION_REASON_ATTRIBUTE,
    SOURCE_MESSAGE_ID_ATTRIBUTE,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: HashMap<String, String>,
    receive_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
}

struct Redrive {
    target: Arc<InMemoryQueue>,
    max_receive_count: u32,
}

/// In-memory queue used for tests and local runs
pub struct InMemoryQueue {
    name: String,
    state: Mutex<QueueState>,
    redrive: Option<Redrive>,
}

impl InMemoryQueue {
    /// Create a queue without a dead letter queue
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            redrive: None,
        }
    }

    /// Attach a dead letter queue with the given `maxReceiveCount`
    pub fn with_redrive(mut self, target: Arc<InMemoryQueue>, max_receive_count: u32) -> Self {
        self.redrive = Some(Redrive {
            target,
            max_receive_count,
        });
        self
    }

    /// Enqueue a message body, returning its message id
    pub fn send(&self, body: impl Into<String>) -> String {
        self.send_with_attributes(body, HashMap::new())
    }

    /// Enqueue a message body with attributes, returning its message id
    pub fn send_with_attributes(
        &self,
        body: impl Into<String>,
        attributes: HashMap<String, String>,
    ) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.lock().ready.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            attributes,
            receive_count: 0,
        });
        message_id
    }

    /// Messages waiting to be received
    pub fn visible_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Messages received but not yet settled
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Whether the queue holds no messages at all
    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.ready.is_empty() && state.in_flight.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_in_flight(&self, message: &QueueMessage) -> Result<StoredMessage, QueueError> {
        self.lock()
            .in_flight
            .remove(&message.receipt_handle)
            .ok_or_else(|| QueueError::NotInFlight(message.message_id.clone()))
    }

    fn receive_now(&self, max_messages: usize) -> Vec<QueueMessage> {
        let mut received = Vec::new();
        let mut redriven = Vec::new();

        {
            let mut state = self.lock();
            while received.len() < max_messages {
                let Some(mut stored) = state.ready.pop_front() else {
                    break;
                };

                if let Some(ref redrive) = self.redrive {
                    if stored.receive_count >= redrive.max_receive_count {
                        redriven.push(stored);
                        continue;
                    }
                }

                stored.receive_count += 1;
                let receipt_handle = Uuid::new_v4().to_string();
                received.push(QueueMessage {
                    message_id: stored.message_id.clone(),
                    body: stored.body.clone(),
                    receipt_handle: receipt_handle.clone(),
                    receive_count: stored.receive_count,
                    attributes: stored.attributes.clone(),
                });
                state.in_flight.insert(receipt_handle, stored);
            }
        }

        if let Some(ref redrive) = self.redrive {
            for stored in redriven {
                debug!(
                    queue = %self.name,
                    message_id = %stored.message_id,
                    receive_count = stored.receive_count,
                    "Redriving message to dead letter queue"
                );
                redrive.target.lock().ready.push_back(StoredMessage {
                    receive_count: 0,
                    ..stored
                });
            }
        }

        received
    }
}

#[async_trait::async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let received = self.receive_now(max_messages);
        if !received.is_empty() || wait.is_zero() {
            return Ok(received);
        }

        tokio::time::sleep(wait).await;
        Ok(self.receive_now(max_messages))
    }

    async fn ack(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.take_in_flight(message)?;
        Ok(())
    }

    async fn release(&self, message: &QueueMessage, _delay: Duration) -> Result<(), QueueError> {
        let stored = self.take_in_flight(message)?;
        self.lock().ready.push_back(stored);
        Ok(())
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let redrive = self.redrive.as_ref().ok_or(QueueError::NoDeadLetterQueue)?;
        let stored = self.take_in_flight(message)?;

        let mut attributes = stored.attributes;
        attributes.insert(REJECTION_REASON_ATTRIBUTE.to_string(), reason.to_string());
        attributes.insert(
            SOURCE_MESSAGE_ID_ATTRIBUTE.to_string(),
            stored.message_id.clone(),
        );

        redrive.target.send_with_attributes(stored.body, attributes);
        Ok(())
    }
}
