use crate::classifier::ImageType;
use crate::error::PipelineError;
use crate::object_store::ObjectInfo;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{AttributeValue, TableStatus};
use aws_sdk_dynamodb::Client as DynamoClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

/// Partition key of the image table
pub const ATTR_NAME: &str = "name";
pub const ATTR_IMAGE_TYPE: &str = "image_type";
pub const ATTR_BUCKET: &str = "bucket";
pub const ATTR_CONTENT_TYPE: &str = "content_type";
pub const ATTR_SIZE_BYTES: &str = "size_bytes";

/// Stored image metadata, keyed by object key
///
/// No write timestamp is stored, so upserting the same upload twice leaves a
/// byte-identical item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Object key, the record identity
    pub name: String,
    /// Classified image type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<ImageType>,
    /// Bucket the object lives in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// Content type reported by object storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Object size reported by object storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
}

impl ImageRecord {
    pub fn new(name: impl Into<String>, image_type: ImageType, bucket: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image_type: Some(image_type),
            bucket: Some(bucket.into()),
            content_type: None,
            size_bytes: None,
        }
    }

    /// Enrich the record with what object storage reports about the upload
    pub fn with_object_info(mut self, info: ObjectInfo) -> Self {
        self.content_type = info.content_type;
        self.size_bytes = info.size_bytes;
        self
    }
}

/// Queryable store of accepted uploads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or replace the record keyed by `record.name`
    async fn upsert(&self, record: &ImageRecord) -> Result<(), PipelineError>;

    /// Point lookup by object key
    async fn get(&self, name: &str) -> Result<Option<ImageRecord>, PipelineError>;

    /// Verify the store is reachable
    async fn check(&self) -> Result<(), PipelineError>;
}

/// Read access to a stored attribute, shared by table items and stream images
pub(crate) trait ItemAttribute {
    fn string_value(&self) -> Option<&str>;
    fn number_value(&self) -> Option<&str>;
}

impl ItemAttribute for AttributeValue {
    fn string_value(&self) -> Option<&str> {
        self.as_s().ok().map(String::as_str)
    }

    fn number_value(&self) -> Option<&str> {
        self.as_n().ok().map(String::as_str)
    }
}

/// Convert a record to its table item
pub fn to_item(record: &ImageRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert(ATTR_NAME.to_string(), AttributeValue::S(record.name.clone()));

    if let Some(image_type) = record.image_type {
        item.insert(
            ATTR_IMAGE_TYPE.to_string(),
            AttributeValue::S(image_type.as_str().to_string()),
        );
    }
    if let Some(ref bucket) = record.bucket {
        item.insert(ATTR_BUCKET.to_string(), AttributeValue::S(bucket.clone()));
    }
    if let Some(ref content_type) = record.content_type {
        item.insert(
            ATTR_CONTENT_TYPE.to_string(),
            AttributeValue::S(content_type.clone()),
        );
    }
    if let Some(size_bytes) = record.size_bytes {
        item.insert(
            ATTR_SIZE_BYTES.to_string(),
            AttributeValue::N(size_bytes.to_string()),
        );
    }

    item
}

/// Rebuild a record from a table item or stream image
pub(crate) fn record_from_item<A: ItemAttribute>(
    item: &HashMap<String, A>,
) -> Result<ImageRecord, PipelineError> {
    let string = |attr: &str| item.get(attr).and_then(ItemAttribute::string_value);

    let name = string(ATTR_NAME)
        .ok_or_else(|| PipelineError::StoreFailure("item has no name attribute".to_string()))?;

    let image_type = string(ATTR_IMAGE_TYPE)
        .map(|value| {
            ImageType::from_suffix(value).ok_or_else(|| {
                PipelineError::StoreFailure(format!("item {} has image type {:?}", name, value))
            })
        })
        .transpose()?;

    let size_bytes = item
        .get(ATTR_SIZE_BYTES)
        .and_then(ItemAttribute::number_value)
        .map(|value| {
            value.parse::<i64>().map_err(|e| {
                PipelineError::StoreFailure(format!("item {} has size {:?}: {}", name, value, e))
            })
        })
        .transpose()?;

    Ok(ImageRecord {
        name: name.to_string(),
        image_type,
        bucket: string(ATTR_BUCKET).map(str::to_string),
        content_type: string(ATTR_CONTENT_TYPE).map(str::to_string),
        size_bytes,
    })
}

fn store_failure<E: std::error::Error>(error: E) -> PipelineError {
    PipelineError::StoreFailure(DisplayErrorContext(error).to_string())
}

/// Metadata store backed by a DynamoDB table
pub struct DynamoMetadataStore {
    client: DynamoClient,
    table_name: String,
}

impl DynamoMetadataStore {
    /// Create a store for the given table
    pub fn new(sdk_config: &SdkConfig, table_name: impl Into<String>) -> Self {
        Self::from_client(DynamoClient::new(sdk_config), table_name)
    }

    pub fn from_client(client: DynamoClient, table_name: impl Into<String>) -> Self {
        let table_name = table_name.into();
        info!(table = %table_name, "DynamoDB metadata store initialized");
        Self { client, table_name }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// ARN of the table's current change stream, if streams are enabled
    #[instrument(skip(self), fields(table = %self.table_name))]
    pub async fn latest_stream_arn(&self) -> Result<Option<String>, PipelineError> {
        let output = self
            .client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
            .map_err(store_failure)?;

        Ok(output
            .table()
            .and_then(|table| table.latest_stream_arn())
            .map(str::to_string))
    }
}

#[async_trait]
impl MetadataStore for DynamoMetadataStore {
    #[instrument(skip(self, record), fields(name = %record.name))]
    async fn upsert(&self, record: &ImageRecord) -> Result<(), PipelineError> {
        let started = Instant::now();

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(to_item(record)))
            .send()
            .await
            .map_err(store_failure)?;

        metrics::histogram!("images.store.upsert_seconds").record(started.elapsed().as_secs_f64());
        debug!("Image record upserted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, name: &str) -> Result<Option<ImageRecord>, PipelineError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(ATTR_NAME, AttributeValue::S(name.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(store_failure)?;

        output.item().map(|item| record_from_item(item)).transpose()
    }

    async fn check(&self) -> Result<(), PipelineError> {
        let output = self
            .client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
            .map_err(store_failure)?;

        match output.table().and_then(|table| table.table_status()) {
            None | Some(TableStatus::Active) | Some(TableStatus::Updating) => Ok(()),
            Some(status) => Err(PipelineError::StoreFailure(format!(
                "table {} is {}",
                self.table_name,
                status.as_str()
            ))),
        }
    }
}
