//! Read access to uploaded objects in S3.

use crate::classifier::ImageType;
use crate::config::StorageConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

/// What object storage reports about an uploaded object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
}

/// Probe of uploaded objects by key
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Look up an object, `None` if it no longer exists
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>>;
}

/// Object source backed by S3 `HeadObject`
pub struct S3ObjectSource {
    client: S3Client,
}

impl S3ObjectSource {
    pub fn new(sdk_config: &SdkConfig, config: &StorageConfig) -> Self {
        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config);

        // Path-style addressing for LocalStack/MinIO
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());
        info!(
            force_path_style = config.force_path_style,
            "S3 object source initialized"
        );

        Self { client }
    }

    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectSource for S3ObjectSource {
    #[instrument(skip(self))]
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectInfo {
                content_type: output.content_type().map(str::to_string),
                size_bytes: output.content_length(),
            })),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    debug!("Object no longer exists");
                    Ok(None)
                } else {
                    Err(e).context("Failed to head object")
                }
            }
        }
    }
}

/// Content type implied by the classified image type
pub fn content_type_for(image_type: ImageType) -> &'static str {
    match image_type {
        ImageType::Jpeg => "image/jpeg",
        ImageType::Png => "image/png",
    }
}
