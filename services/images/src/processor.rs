use crate::classifier::classify;
use crate::config::FilterConfig;
use crate::envelope::{self, UploadEvent};
use crate::error::PipelineError;
use crate::metadata_store::{ImageRecord, MetadataStore};
use crate::object_store::{content_type_for, ObjectSource};
use async_trait::async_trait;
use imagebus_pipeline::{HandlerError, MessageHandler, QueueMessage};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What processing did with one upload event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The record was upserted
    Stored(ImageRecord),
    /// The event was filtered out
    Skipped,
}

/// Processes upload notifications: decode, classify, enrich, persist
pub struct ImageProcessor {
    store: Arc<dyn MetadataStore>,
    objects: Option<Arc<dyn ObjectSource>>,
    filter: FilterConfig,
    expected_bucket: Option<String>,
}

impl ImageProcessor {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            objects: None,
            filter: FilterConfig::default(),
            expected_bucket: None,
        }
    }

    /// Enrich records with object details
    pub fn with_object_source(mut self, objects: Arc<dyn ObjectSource>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Only process keys passing the filter
    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filter = filter;
        self
    }

    /// Only process uploads to the given bucket
    pub fn with_expected_bucket(mut self, bucket: Option<String>) -> Self {
        self.expected_bucket = bucket;
        self
    }

    /// Process one upload event
    #[instrument(skip(self, event), fields(bucket = %event.bucket_name, key = %event.object_key))]
    pub async fn process_event(&self, event: &UploadEvent) -> Result<ProcessOutcome, PipelineError> {
        if let Some(ref bucket) = self.expected_bucket {
            if event.bucket_name != *bucket {
                debug!("Skipping upload to another bucket");
                metrics::counter!("images.uploads.skipped", "filter" => "bucket").increment(1);
                return Ok(ProcessOutcome::Skipped);
            }
        }

        if !self.filter.accepts(&event.object_key) {
            debug!("Skipping upload outside accepted prefixes");
            metrics::counter!("images.uploads.skipped", "filter" => "prefix").increment(1);
            return Ok(ProcessOutcome::Skipped);
        }

        let image_type = classify(&event.object_key)?;
        let mut record = ImageRecord::new(&event.object_key, image_type, &event.bucket_name);

        if let Some(ref objects) = self.objects {
            let probed = match objects.head(&event.bucket_name, &event.object_key).await {
                Ok(Some(info)) => Some(info),
                Ok(None) => {
                    warn!("Uploaded object no longer exists");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Failed to probe uploaded object");
                    None
                }
            };

            match probed {
                Some(info) => record = record.with_object_info(info),
                // A redelivery must not strip details stored by an earlier delivery
                None => {
                    if let Some(existing) = self.store.get(&event.object_key).await? {
                        record.content_type = existing.content_type;
                        record.size_bytes = existing.size_bytes;
                    }
                }
            }
        }
        if record.content_type.is_none() {
            record.content_type = Some(content_type_for(image_type).to_string());
        }

        self.store.upsert(&record).await?;

        metrics::counter!("images.records.stored", "image_type" => image_type.as_str()).increment(1);
        info!(image_type = %image_type, "Image record stored");

        Ok(ProcessOutcome::Stored(record))
    }
}

#[async_trait]
impl MessageHandler for ImageProcessor {
    #[instrument(skip(self, message), fields(message_id = %message.message_id, receive_count = message.receive_count))]
    async fn handle(&self, message: &QueueMessage) -> Result<(), HandlerError> {
        let events = envelope::decode(message.body.as_bytes())?;
        if events.is_empty() {
            debug!("Message carries no upload records");
        }

        for event in &events {
            self.process_event(event).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_stream::{ChangeKind, ChangeStream};
    use crate::classifier::ImageType;
    use crate::memory::InMemoryMetadataStore;
    use crate::metadata_store::MockMetadataStore;
    use crate::object_store::{MockObjectSource, ObjectInfo};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(body: String) -> QueueMessage {
        QueueMessage {
            message_id: "m-1".to_string(),
            body,
            receipt_handle: "r-1".to_string(),
            receive_count: 1,
            attributes: HashMap::new(),
        }
    }

    fn upload_body(keys: &[&str]) -> String {
        let records: Vec<serde_json::Value> = keys
            .iter()
            .map(|key| serde_json::json!({ "s3": { "bucket": { "name": "b" }, "object": { "key": key } } }))
            .collect();
        serde_json::json!({ "Records": records }).to_string()
    }

    #[tokio::test]
    async fn test_stores_classified_upload() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let processor = ImageProcessor::new(store.clone());

        processor
            .handle(&message(upload_body(&["image/photo.png", "image/other.JPEG"])))
            .await
            .unwrap();

        let photo = store.get("image/photo.png").await.unwrap().unwrap();
        assert_eq!(photo.image_type, Some(ImageType::Png));
        assert_eq!(photo.bucket.as_deref(), Some("b"));
        assert_eq!(photo.content_type.as_deref(), Some("image/png"));

        let other = store.get("image/other.JPEG").await.unwrap().unwrap();
        assert_eq!(other.image_type, Some(ImageType::Jpeg));
    }

    #[tokio::test]
    async fn test_classification_failure_is_fatal() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let processor = ImageProcessor::new(store.clone());

        let error = processor
            .handle(&message(upload_body(&["notes.txt"])))
            .await
            .unwrap_err();

        assert!(!error.is_transient());
        assert_eq!(error.reason(), "UnsupportedImageType");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_fatal() {
        let processor = ImageProcessor::new(Arc::new(InMemoryMetadataStore::new()));
        let error = processor
            .handle(&message("{not json".to_string()))
            .await
            .unwrap_err();

        assert!(!error.is_transient());
        assert_eq!(error.reason(), "MalformedEnvelope");
    }

    #[tokio::test]
    async fn test_store_failure_is_transient() {
        let mut store = MockMetadataStore::new();
        store
            .expect_upsert()
            .times(1)
            .returning(|_| Err(PipelineError::StoreFailure("throttled".to_string())));

        let processor = ImageProcessor::new(Arc::new(store));
        let error = processor
            .handle(&message(upload_body(&["image/photo.png"])))
            .await
            .unwrap_err();

        assert!(error.is_transient());
        assert_eq!(error.reason(), "StoreFailure");
    }

    #[tokio::test]
    async fn test_object_details_enrich_record() {
        let mut objects = MockObjectSource::new();
        objects
            .expect_head()
            .withf(|bucket, key| bucket == "b" && key == "image/photo.png")
            .times(1)
            .returning(|_, _| {
                Ok(Some(ObjectInfo {
                    content_type: Some("image/x-png".to_string()),
                    size_bytes: Some(4096),
                }))
            });

        let processor = ImageProcessor::new(Arc::new(InMemoryMetadataStore::new()))
            .with_object_source(Arc::new(objects));
        let outcome = processor
            .process_event(&UploadEvent::new("b", "image/photo.png"))
            .await
            .unwrap();

        let ProcessOutcome::Stored(record) = outcome else {
            panic!("expected a stored record");
        };
        assert_eq!(record.content_type.as_deref(), Some("image/x-png"));
        assert_eq!(record.size_bytes, Some(4096));
    }

    #[tokio::test]
    async fn test_probe_failure_still_stores() {
        let mut objects = MockObjectSource::new();
        objects
            .expect_head()
            .returning(|_, _| Err(anyhow::anyhow!("access denied")));

        let store = Arc::new(InMemoryMetadataStore::new());
        let processor =
            ImageProcessor::new(store.clone()).with_object_source(Arc::new(objects));

        processor
            .process_event(&UploadEvent::new("b", "image/photo.png"))
            .await
            .unwrap();

        let record = store.get("image/photo.png").await.unwrap().unwrap();
        assert_eq!(record.size_bytes, None);
        assert_eq!(record.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_redelivery_with_failed_probe_keeps_record() {
        let calls = AtomicUsize::new(0);
        let mut objects = MockObjectSource::new();
        objects.expect_head().times(2).returning(move |_, _| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Some(ObjectInfo {
                    content_type: Some("image/png".to_string()),
                    size_bytes: Some(4096),
                }))
            } else {
                Err(anyhow::anyhow!("slow down"))
            }
        });

        let store = Arc::new(InMemoryMetadataStore::new());
        let mut changes = store.subscribe();
        let processor =
            ImageProcessor::new(store.clone()).with_object_source(Arc::new(objects));
        let event = UploadEvent::new("b", "image/photo.png");

        processor.process_event(&event).await.unwrap();
        let first = store.get("image/photo.png").await.unwrap().unwrap();
        processor.process_event(&event).await.unwrap();
        let second = store.get("image/photo.png").await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(second.size_bytes, Some(4096));

        let events = changes.next_batch().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Insert);
    }

    #[tokio::test]
    async fn test_filtered_events_are_skipped() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let processor = ImageProcessor::new(store.clone())
            .with_filter(FilterConfig {
                accepted_prefixes: vec!["image".to_string()],
            })
            .with_expected_bucket(Some("b".to_string()));

        assert_eq!(
            processor
                .process_event(&UploadEvent::new("b", "docs/notes.txt"))
                .await
                .unwrap(),
            ProcessOutcome::Skipped
        );
        assert_eq!(
            processor
                .process_event(&UploadEvent::new("other", "image/photo.png"))
                .await
                .unwrap(),
            ProcessOutcome::Skipped
        );
        assert!(store.is_empty());
    }
}
