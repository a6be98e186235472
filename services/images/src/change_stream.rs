//! Mutation feed of the metadata store.
//!
//! The relay only sees changes made after it subscribed. The DynamoDB Streams
//! backend therefore starts every shard that is open at subscription time at
//! `LATEST`. Shards that appear later (splits) start at `TRIM_HORIZON`, since
//! everything they hold was written after the subscription.

use crate::metadata_store::{record_from_item, ImageRecord, ItemAttribute, ATTR_NAME};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_dynamodbstreams::error::DisplayErrorContext;
use aws_sdk_dynamodbstreams::types::{AttributeValue, OperationType, Record, ShardIteratorType};
use aws_sdk_dynamodbstreams::Client as StreamsClient;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Kind of store mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// One mutation of the metadata store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Key of the mutated record
    pub key: String,
    /// Record after the mutation, absent for removals
    pub new_image: Option<ImageRecord>,
    /// Position of the mutation within its shard
    pub sequence_number: Option<String>,
}

/// Errors that can occur while reading the change feed
#[derive(Error, Debug)]
pub enum ChangeStreamError {
    #[error("Change stream request failed: {0}")]
    Request(String),

    #[error("Table has no change stream enabled")]
    NotEnabled,

    #[error("Invalid change record: {0}")]
    InvalidRecord(String),

    #[error("Change stream closed")]
    Closed,
}

/// Ordered feed of store mutations
#[async_trait]
pub trait ChangeStream: Send {
    /// Next batch of changes, empty when nothing arrived within one poll
    async fn next_batch(&mut self) -> Result<Vec<ChangeEvent>, ChangeStreamError>;
}

impl ItemAttribute for AttributeValue {
    fn string_value(&self) -> Option<&str> {
        self.as_s().ok().map(String::as_str)
    }

    fn number_value(&self) -> Option<&str> {
        self.as_n().ok().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StartPosition {
    Latest,
    TrimHorizon,
    After(String),
}

struct ShardCursor {
    start: StartPosition,
    iterator: Option<String>,
    last_sequence_number: Option<String>,
}

impl ShardCursor {
    fn new(start: StartPosition) -> Self {
        Self {
            start,
            iterator: None,
            last_sequence_number: None,
        }
    }

    /// Cursor already holding the iterator for its start position
    fn opened(start: StartPosition, iterator: String) -> Self {
        Self {
            iterator: Some(iterator),
            ..Self::new(start)
        }
    }

    /// Record a failed read. The iterator is kept unless the read proved it
    /// unusable, so a retry continues exactly where the last read stopped.
    fn read_failed(&mut self, iterator_lost: bool) {
        if iterator_lost {
            self.iterator = None;
        }
    }

    /// Where to resume after losing the iterator
    fn resume_position(&self) -> StartPosition {
        match self.last_sequence_number {
            Some(ref sequence_number) => StartPosition::After(sequence_number.clone()),
            None => self.start.clone(),
        }
    }
}

struct ShardInfo {
    shard_id: String,
    open: bool,
}

/// Shards to read from at subscription: only open ones, from `LATEST`
fn subscription_positions(shards: &[ShardInfo]) -> Vec<(&str, StartPosition)> {
    shards
        .iter()
        .filter(|shard| shard.open)
        .map(|shard| (shard.shard_id.as_str(), StartPosition::Latest))
        .collect()
}

/// Change stream reading a DynamoDB Streams stream shard by shard
pub struct DynamoChangeStream {
    client: StreamsClient,
    stream_arn: String,
    cursors: HashMap<String, ShardCursor>,
    known_shards: HashSet<String>,
    poll_interval: Duration,
    shard_refresh_interval: Duration,
    last_refresh: Instant,
}

impl DynamoChangeStream {
    /// Subscribe at the latest position of every open shard
    pub async fn subscribe(
        sdk_config: &SdkConfig,
        stream_arn: impl Into<String>,
        poll_interval: Duration,
        shard_refresh_interval: Duration,
    ) -> Result<Self, ChangeStreamError> {
        let mut stream = Self {
            client: StreamsClient::new(sdk_config),
            stream_arn: stream_arn.into(),
            cursors: HashMap::new(),
            known_shards: HashSet::new(),
            poll_interval,
            shard_refresh_interval,
            last_refresh: Instant::now(),
        };

        let shards = list_shards(&stream.client, &stream.stream_arn).await?;

        // Iterators are taken now so nothing committed before the first poll is missed
        for (shard_id, position) in subscription_positions(&shards) {
            let iterator = acquire_iterator(&stream.client, &stream.stream_arn, shard_id, &position)
                .await?;
            if let Some(iterator) = iterator {
                stream
                    .cursors
                    .insert(shard_id.to_string(), ShardCursor::opened(position, iterator));
            }
        }
        stream
            .known_shards
            .extend(shards.into_iter().map(|shard| shard.shard_id));

        info!(
            stream_arn = %stream.stream_arn,
            open_shards = stream.cursors.len(),
            "Subscribed to change stream"
        );

        Ok(stream)
    }

    /// Pick up shards created since the last refresh and forget expired ones
    #[instrument(skip(self), fields(stream_arn = %self.stream_arn))]
    async fn refresh_shards(&mut self) -> Result<(), ChangeStreamError> {
        let shards = list_shards(&self.client, &self.stream_arn).await?;
        let listed: HashSet<&str> = shards.iter().map(|s| s.shard_id.as_str()).collect();

        self.cursors.retain(|shard_id, _| listed.contains(shard_id.as_str()));
        self.known_shards
            .retain(|shard_id| listed.contains(shard_id.as_str()));

        for shard in &shards {
            if self.known_shards.insert(shard.shard_id.clone()) {
                debug!(shard_id = %shard.shard_id, "Discovered new shard");
                self.cursors.insert(
                    shard.shard_id.clone(),
                    ShardCursor::new(StartPosition::TrimHorizon),
                );
            }
        }

        self.last_refresh = Instant::now();
        Ok(())
    }

    async fn poll_shard(&mut self, shard_id: &str, events: &mut Vec<ChangeEvent>) {
        let Some(cursor) = self.cursors.get(shard_id) else {
            return;
        };

        let existing = cursor.iterator.clone();
        let position = cursor.resume_position();

        let iterator = match existing {
            Some(iterator) => iterator,
            None => {
                match acquire_iterator(&self.client, &self.stream_arn, shard_id, &position).await {
                    Ok(Some(iterator)) => iterator,
                    Ok(None) => {
                        debug!(shard_id = %shard_id, "Shard has no iterator, dropping it");
                        self.cursors.remove(shard_id);
                        return;
                    }
                    Err(e) => {
                        warn!(shard_id = %shard_id, error = %e, "Failed to acquire shard iterator");
                        return;
                    }
                }
            }
        };

        let result = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .send()
            .await;

        let Some(cursor) = self.cursors.get_mut(shard_id) else {
            return;
        };

        match result {
            Ok(output) => {
                for record in output.records() {
                    match convert_record(record) {
                        Ok(Some(event)) => {
                            if event.sequence_number.is_some() {
                                cursor.last_sequence_number = event.sequence_number.clone();
                            }
                            events.push(event);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(shard_id = %shard_id, error = %e, "Skipping change record"),
                    }
                }

                match output.next_shard_iterator() {
                    Some(next) => cursor.iterator = Some(next.to_string()),
                    None => {
                        debug!(shard_id = %shard_id, "Shard closed");
                        self.cursors.remove(shard_id);
                    }
                }
            }
            Err(e) => {
                let iterator_lost = e.as_service_error().is_some_and(|service_error| {
                    service_error.is_expired_iterator_exception()
                        || service_error.is_trimmed_data_access_exception()
                        || service_error.is_resource_not_found_exception()
                });
                warn!(
                    shard_id = %shard_id,
                    iterator_lost = iterator_lost,
                    error = %DisplayErrorContext(&e),
                    "Failed to read shard"
                );
                metrics::counter!("images.change_stream.errors").increment(1);
                cursor.read_failed(iterator_lost);
            }
        }
    }
}

#[async_trait]
impl ChangeStream for DynamoChangeStream {
    async fn next_batch(&mut self) -> Result<Vec<ChangeEvent>, ChangeStreamError> {
        if self.last_refresh.elapsed() >= self.shard_refresh_interval {
            if let Err(e) = self.refresh_shards().await {
                warn!(error = %e, "Failed to refresh shards");
            }
        }

        let mut events = Vec::new();
        let shard_ids: Vec<String> = self.cursors.keys().cloned().collect();
        for shard_id in shard_ids {
            self.poll_shard(&shard_id, &mut events).await;
        }

        if events.is_empty() {
            tokio::time::sleep(self.poll_interval).await;
        }

        Ok(events)
    }
}

fn request_failure<E: std::error::Error>(error: E) -> ChangeStreamError {
    ChangeStreamError::Request(DisplayErrorContext(error).to_string())
}

async fn list_shards(
    client: &StreamsClient,
    stream_arn: &str,
) -> Result<Vec<ShardInfo>, ChangeStreamError> {
    let mut shards = Vec::new();
    let mut exclusive_start: Option<String> = None;

    loop {
        let output = client
            .describe_stream()
            .stream_arn(stream_arn)
            .set_exclusive_start_shard_id(exclusive_start.take())
            .send()
            .await
            .map_err(request_failure)?;

        let Some(description) = output.stream_description() else {
            break;
        };

        for shard in description.shards() {
            let Some(shard_id) = shard.shard_id() else {
                continue;
            };
            let open = shard
                .sequence_number_range()
                .map(|range| range.ending_sequence_number().is_none())
                .unwrap_or(true);
            shards.push(ShardInfo {
                shard_id: shard_id.to_string(),
                open,
            });
        }

        match description.last_evaluated_shard_id() {
            Some(last) => exclusive_start = Some(last.to_string()),
            None => break,
        }
    }

    Ok(shards)
}

async fn acquire_iterator(
    client: &StreamsClient,
    stream_arn: &str,
    shard_id: &str,
    position: &StartPosition,
) -> Result<Option<String>, ChangeStreamError> {
    let request = client
        .get_shard_iterator()
        .stream_arn(stream_arn)
        .shard_id(shard_id);

    let request = match position {
        StartPosition::Latest => request.shard_iterator_type(ShardIteratorType::Latest),
        StartPosition::TrimHorizon => request.shard_iterator_type(ShardIteratorType::TrimHorizon),
        StartPosition::After(sequence_number) => request
            .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
            .sequence_number(sequence_number),
    };

    let output = request.send().await.map_err(request_failure)?;
    Ok(output.shard_iterator().map(str::to_string))
}

fn convert_record(record: &Record) -> Result<Option<ChangeEvent>, ChangeStreamError> {
    let kind = match record.event_name() {
        Some(OperationType::Insert) => ChangeKind::Insert,
        Some(OperationType::Modify) => ChangeKind::Modify,
        Some(OperationType::Remove) => ChangeKind::Remove,
        _ => return Ok(None),
    };

    let stream_record = record
        .dynamodb()
        .ok_or_else(|| ChangeStreamError::InvalidRecord("record has no stream data".to_string()))?;

    let new_image = stream_record
        .new_image()
        .map(|image| record_from_item(image))
        .transpose()
        .map_err(|e| ChangeStreamError::InvalidRecord(e.to_string()))?;

    let key = stream_record
        .keys()
        .and_then(|keys| keys.get(ATTR_NAME))
        .and_then(ItemAttribute::string_value)
        .map(str::to_string)
        .or_else(|| new_image.as_ref().map(|image| image.name.clone()))
        .ok_or_else(|| ChangeStreamError::InvalidRecord("record has no key".to_string()))?;

    Ok(Some(ChangeEvent {
        kind,
        key,
        new_image,
        sequence_number: stream_record.sequence_number().map(str::to_string),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ImageType;
    use aws_sdk_dynamodbstreams::types::StreamRecord;

    fn stream_image(name: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([
            ("name".to_string(), AttributeValue::S(name.to_string())),
            ("image_type".to_string(), AttributeValue::S("png".to_string())),
            ("bucket".to_string(), AttributeValue::S("b".to_string())),
        ])
    }

    fn record(kind: OperationType, name: &str, with_image: bool) -> Record {
        let mut stream_record = StreamRecord::builder()
            .keys("name", AttributeValue::S(name.to_string()))
            .sequence_number("100");
        if with_image {
            stream_record = stream_record.set_new_image(Some(stream_image(name)));
        }

        Record::builder()
            .event_name(kind)
            .dynamodb(stream_record.build())
            .build()
    }

    #[test]
    fn test_convert_insert() {
        let event = convert_record(&record(OperationType::Insert, "image/photo.png", true))
            .unwrap()
            .unwrap();

        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.key, "image/photo.png");
        assert_eq!(event.sequence_number.as_deref(), Some("100"));
        assert_eq!(
            event.new_image,
            Some(ImageRecord::new("image/photo.png", ImageType::Png, "b"))
        );
    }

    #[test]
    fn test_convert_remove_has_no_image() {
        let event = convert_record(&record(OperationType::Remove, "image/photo.png", false))
            .unwrap()
            .unwrap();

        assert_eq!(event.kind, ChangeKind::Remove);
        assert!(event.new_image.is_none());
    }

    #[test]
    fn test_convert_rejects_record_without_stream_data() {
        let record = Record::builder().event_name(OperationType::Modify).build();
        assert!(matches!(
            convert_record(&record),
            Err(ChangeStreamError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_subscription_starts_open_shards_at_latest() {
        let shards = vec![
            ShardInfo {
                shard_id: "shard-closed".to_string(),
                open: false,
            },
            ShardInfo {
                shard_id: "shard-open".to_string(),
                open: true,
            },
        ];

        assert_eq!(
            subscription_positions(&shards),
            vec![("shard-open", StartPosition::Latest)]
        );
    }

    #[test]
    fn test_read_failure_keeps_usable_iterator() {
        let mut cursor = ShardCursor::opened(StartPosition::Latest, "it-1".to_string());
        assert_eq!(cursor.iterator.as_deref(), Some("it-1"));

        cursor.read_failed(false);
        assert_eq!(cursor.iterator.as_deref(), Some("it-1"));

        cursor.read_failed(true);
        assert_eq!(cursor.iterator, None);
    }

    #[test]
    fn test_resume_position() {
        let mut cursor = ShardCursor::new(StartPosition::Latest);
        assert_eq!(cursor.resume_position(), StartPosition::Latest);

        cursor.last_sequence_number = Some("42".to_string());
        assert_eq!(
            cursor.resume_position(),
            StartPosition::After("42".to_string())
        );
    }
}
