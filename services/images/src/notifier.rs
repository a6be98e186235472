//! Outbound notification of committed image records.

use crate::config::NotificationConfig;
use crate::error::PipelineError;
use crate::metadata_store::ImageRecord;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sesv2::error::DisplayErrorContext;
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message, MessageTag};
use aws_sdk_sesv2::Client as SesClient;
use imagebus_pipeline::ConfigError;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Email tag carrying the notification id
pub const NOTIFICATION_ID_TAG: &str = "notification-id";

const CHARSET: &str = "UTF-8";

/// Sends one notification per committed record
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, record: &ImageRecord) -> Result<(), PipelineError>;
}

/// A composed notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Stable id for the record's object, identical across duplicate sends
    pub notification_id: Uuid,
    pub subject: String,
    pub body: String,
}

/// Object URL of a record
pub fn object_url(record: &ImageRecord) -> String {
    format!(
        "s3://{}/{}",
        record.bucket.as_deref().unwrap_or_default(),
        record.name
    )
}

/// Deterministic id derived from the object URL
pub fn notification_id(record: &ImageRecord) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, object_url(record).as_bytes())
}

/// Compose subject and text body for a record
pub fn compose(record: &ImageRecord) -> Notification {
    let notification_id = notification_id(record);
    let image_type = record
        .image_type
        .map(|t| t.as_str())
        .unwrap_or("unknown");

    let mut body = format!(
        "We received your image.\n\nObject: {}\nType: {}\n",
        object_url(record),
        image_type
    );
    if let Some(ref content_type) = record.content_type {
        body.push_str(&format!("Content type: {}\n", content_type));
    }
    if let Some(size_bytes) = record.size_bytes {
        body.push_str(&format!("Size: {} bytes\n", size_bytes));
    }
    body.push_str(&format!("\nNotification id: {}\n", notification_id));

    Notification {
        notification_id,
        subject: format!("New image upload: {}", record.name),
        body,
    }
}

fn send_failure<E: std::error::Error>(error: E) -> PipelineError {
    PipelineError::SendFailure(DisplayErrorContext(error).to_string())
}

/// Notifier sending email through SES v2
pub struct SesNotifier {
    client: SesClient,
    from_address: String,
    to_addresses: Vec<String>,
    configuration_set: Option<String>,
}

impl SesNotifier {
    pub fn new(sdk_config: &SdkConfig, config: &NotificationConfig) -> Result<Self, ConfigError> {
        let from_address = config
            .from_address
            .clone()
            .ok_or_else(|| ConfigError::MissingRequired("notification.from_address".to_string()))?;

        if config.to_addresses.is_empty() {
            return Err(ConfigError::MissingRequired(
                "notification.to_addresses".to_string(),
            ));
        }

        info!(
            from = %from_address,
            recipients = config.to_addresses.len(),
            "SES notifier initialized"
        );

        Ok(Self {
            client: SesClient::new(sdk_config),
            from_address,
            to_addresses: config.to_addresses.clone(),
            configuration_set: config.configuration_set.clone(),
        })
    }
}

#[async_trait]
impl Notifier for SesNotifier {
    #[instrument(skip(self, record), fields(name = %record.name))]
    async fn send(&self, record: &ImageRecord) -> Result<(), PipelineError> {
        let notification = compose(record);

        let subject = Content::builder()
            .data(notification.subject)
            .charset(CHARSET)
            .build()
            .map_err(send_failure)?;
        let text = Content::builder()
            .data(notification.body)
            .charset(CHARSET)
            .build()
            .map_err(send_failure)?;
        let tag = MessageTag::builder()
            .name(NOTIFICATION_ID_TAG)
            .value(notification.notification_id.to_string())
            .build()
            .map_err(send_failure)?;

        let message = Message::builder()
            .subject(subject)
            .body(Body::builder().text(text).build())
            .build();

        let output = self
            .client
            .send_email()
            .from_email_address(&self.from_address)
            .destination(
                Destination::builder()
                    .set_to_addresses(Some(self.to_addresses.clone()))
                    .build(),
            )
            .content(EmailContent::builder().simple(message).build())
            .email_tags(tag)
            .set_configuration_set_name(self.configuration_set.clone())
            .send()
            .await
            .map_err(send_failure)?;

        debug!(
            message_id = output.message_id().unwrap_or_default(),
            notification_id = %notification.notification_id,
            "Notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ImageType;

    #[test]
    fn test_notification_id_is_stable() {
        let record = ImageRecord::new("image/photo.png", ImageType::Png, "b");
        let mut enriched = record.clone();
        enriched.size_bytes = Some(99);

        assert_eq!(notification_id(&record), notification_id(&enriched));
        assert_eq!(notification_id(&record).get_version_num(), 5);

        let other = ImageRecord::new("image/other.png", ImageType::Png, "b");
        assert_ne!(notification_id(&record), notification_id(&other));
    }

    #[test]
    fn test_compose() {
        let mut record = ImageRecord::new("image/photo.png", ImageType::Png, "b");
        record.size_bytes = Some(2048);

        let notification = compose(&record);
        assert_eq!(notification.subject, "New image upload: image/photo.png");
        assert!(notification.body.contains("s3://b/image/photo.png"));
        assert!(notification.body.contains("Type: png"));
        assert!(notification.body.contains("Size: 2048 bytes"));
        assert!(!notification.body.contains("Content type"));
        assert!(notification
            .body
            .contains(&notification.notification_id.to_string()));
    }

    #[test]
    fn test_missing_sender_is_rejected() {
        let sdk_config = SdkConfig::builder().build();
        let config = NotificationConfig {
            to_addresses: vec!["ops@example.com".to_string()],
            ..NotificationConfig::default()
        };

        assert!(matches!(
            SesNotifier::new(&sdk_config, &config),
            Err(ConfigError::MissingRequired(_))
        ));
    }
}
