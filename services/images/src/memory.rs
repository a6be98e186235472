//! In-process metadata store with a change feed, for tests and local runs.

use crate::change_stream::{ChangeEvent, ChangeKind, ChangeStream, ChangeStreamError};
use crate::error::PipelineError;
use crate::metadata_store::{ImageRecord, MetadataStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

const CHANGE_FEED_CAPACITY: usize = 1024;
const MAX_CHANGE_BATCH: usize = 100;

#[derive(Default)]
struct StoreState {
    records: HashMap<String, ImageRecord>,
    sequence: u64,
}

/// Metadata store holding records in memory
///
/// Mirrors the change capture of the table: inserts and modifications are
/// published to subscribers, writes that leave the record unchanged are not.
pub struct InMemoryMetadataStore {
    state: Mutex<StoreState>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            state: Mutex::new(StoreState::default()),
            changes,
        }
    }

    /// Subscribe to changes made from now on
    pub fn subscribe(&self) -> InMemoryChangeStream {
        InMemoryChangeStream {
            receiver: self.changes.subscribe(),
        }
    }

    /// Remove a record, publishing a `Remove` change if it existed
    pub fn delete(&self, name: &str) -> Option<ImageRecord> {
        let mut state = self.lock();
        let removed = state.records.remove(name)?;
        let sequence_number = next_sequence(&mut state);
        self.publish(ChangeEvent {
            kind: ChangeKind::Remove,
            key: name.to_string(),
            new_image: None,
            sequence_number: Some(sequence_number),
        });
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is not an error
        let _ = self.changes.send(event);
    }
}

fn next_sequence(state: &mut StoreState) -> String {
    state.sequence += 1;
    format!("{:020}", state.sequence)
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn upsert(&self, record: &ImageRecord) -> Result<(), PipelineError> {
        let mut state = self.lock();

        let kind = match state.records.get(&record.name) {
            Some(existing) if existing == record => return Ok(()),
            Some(_) => ChangeKind::Modify,
            None => ChangeKind::Insert,
        };

        state.records.insert(record.name.clone(), record.clone());
        let sequence_number = next_sequence(&mut state);

        // Published under the lock so subscribers see changes in write order
        self.publish(ChangeEvent {
            kind,
            key: record.name.clone(),
            new_image: Some(record.clone()),
            sequence_number: Some(sequence_number),
        });
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<ImageRecord>, PipelineError> {
        Ok(self.lock().records.get(name).cloned())
    }

    async fn check(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Change feed of an [`InMemoryMetadataStore`]
pub struct InMemoryChangeStream {
    receiver: broadcast::Receiver<ChangeEvent>,
}

#[async_trait]
impl ChangeStream for InMemoryChangeStream {
    async fn next_batch(&mut self) -> Result<Vec<ChangeEvent>, ChangeStreamError> {
        let first = match self.receiver.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Change feed lagged, changes were dropped");
                return Ok(Vec::new());
            }
            Err(RecvError::Closed) => return Err(ChangeStreamError::Closed),
        };

        let mut batch = vec![first];
        while batch.len() < MAX_CHANGE_BATCH {
            match self.receiver.try_recv() {
                Ok(event) => batch.push(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Change feed lagged, changes were dropped");
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(batch)
    }
}
