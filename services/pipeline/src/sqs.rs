//! SQS-backed [`MessageQueue`].

use crate::config::{QueueConfig, MAX_BATCH_SIZE, MAX_WAIT_TIME_SECS};
use crate::queue::{
    MessageQueue, QueueError, QueueMessage, REJECTION_REASON_ATTRIBUTE,
    SOURCE_MESSAGE_ID_ATTRIBUTE,
};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message, MessageAttributeValue, MessageSystemAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// SQS limit on message attributes per message
const MAX_MESSAGE_ATTRIBUTES: usize = 10;

/// A queue living in Amazon SQS, optionally paired with a dead letter queue
pub struct SqsQueue {
    client: SqsClient,
    name: String,
    queue_url: String,
    dead_letter_queue_url: Option<String>,
}

impl SqsQueue {
    /// Create a queue handle from a shared SDK configuration
    pub fn new(sdk_config: &aws_config::SdkConfig, config: &QueueConfig) -> Self {
        Self::from_client(SqsClient::new(sdk_config), config)
    }

    /// Create a queue handle around an existing client
    pub fn from_client(client: SqsClient, config: &QueueConfig) -> Self {
        let name = queue_name(&config.queue_url).to_string();

        info!(
            queue = %name,
            dead_letter_queue = ?config.dead_letter_queue_url,
            "SQS queue initialized"
        );

        Self {
            client,
            name,
            queue_url: config.queue_url.clone(),
            dead_letter_queue_url: config.dead_letter_queue_url.clone(),
        }
    }

    /// Get the queue URL
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

#[async_trait::async_trait]
impl MessageQueue for SqsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let max_messages = max_messages.clamp(1, MAX_BATCH_SIZE) as i32;
        let wait_secs = wait.as_secs().min(MAX_WAIT_TIME_SECS) as i32;

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_secs)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::ReceiveError(DisplayErrorContext(&e).to_string()))?;

        let messages: Vec<QueueMessage> =
            output.messages().iter().filter_map(convert_message).collect();

        debug!(count = messages.len(), "Received messages");

        Ok(messages)
    }

    async fn ack(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::AckError {
                message_id: message.message_id.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }

    async fn release(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&message.receipt_handle)
            .visibility_timeout(delay.as_secs() as i32)
            .send()
            .await
            .map_err(|e| QueueError::ReleaseError {
                message_id: message.message_id.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }

    #[instrument(skip(self, message), fields(queue = %self.name, message_id = %message.message_id))]
    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let dead_letter_queue_url = self
            .dead_letter_queue_url
            .as_ref()
            .ok_or(QueueError::NoDeadLetterQueue)?;

        let dead_letter_error = |message_text: String| QueueError::DeadLetterError {
            message_id: message.message_id.clone(),
            message: message_text,
        };

        let mut request = self
            .client
            .send_message()
            .queue_url(dead_letter_queue_url)
            .message_body(&message.body);

        for (key, value) in forwarded_attributes(&message.attributes) {
            request = request.message_attributes(
                key,
                string_attribute(value).map_err(|e| dead_letter_error(e.to_string()))?,
            );
        }

        request
            .message_attributes(
                REJECTION_REASON_ATTRIBUTE,
                string_attribute(reason).map_err(|e| dead_letter_error(e.to_string()))?,
            )
            .message_attributes(
                SOURCE_MESSAGE_ID_ATTRIBUTE,
                string_attribute(&message.message_id)
                    .map_err(|e| dead_letter_error(e.to_string()))?,
            )
            .send()
            .await
            .map_err(|e| dead_letter_error(DisplayErrorContext(&e).to_string()))?;

        // Only remove from the origin once the copy is safely in the DLQ
        self.ack(message).await?;

        warn!(reason = %reason, "Message moved to dead letter queue");

        Ok(())
    }
}

/// Original attributes carried into the dead letter queue
///
/// Our own two attributes are always written, so at most
/// `MAX_MESSAGE_ATTRIBUTES - 2` originals fit. They are kept in key order.
fn forwarded_attributes(attributes: &HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut forwarded: Vec<(&String, &String)> = attributes
        .iter()
        .filter(|(key, _)| {
            key.as_str() != REJECTION_REASON_ATTRIBUTE && key.as_str() != SOURCE_MESSAGE_ID_ATTRIBUTE
        })
        .collect();
    forwarded.sort();

    let limit = MAX_MESSAGE_ATTRIBUTES - 2;
    if forwarded.len() > limit {
        warn!(
            dropped = forwarded.len() - limit,
            "Too many message attributes, not all are dead-lettered"
        );
        forwarded.truncate(limit);
    }
    forwarded
}

fn string_attribute(
    value: &str,
) -> Result<MessageAttributeValue, aws_sdk_sqs::error::BuildError> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
}

/// Convert an SDK message; messages without a receipt handle cannot be settled
fn convert_message(message: &Message) -> Option<QueueMessage> {
    let Some(receipt_handle) = message.receipt_handle() else {
        warn!(message_id = ?message.message_id(), "Dropping message without receipt handle");
        return None;
    };

    let receive_count = message
        .attributes()
        .and_then(|attributes| attributes.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|count| count.parse().ok())
        .unwrap_or(1);

    let attributes: HashMap<String, String> = message
        .message_attributes()
        .map(|attributes| {
            attributes
                .iter()
                .filter_map(|(key, value)| {
                    value.string_value().map(|v| (key.clone(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(QueueMessage {
        message_id: message.message_id().unwrap_or_default().to_string(),
        body: message.body().unwrap_or_default().to_string(),
        receipt_handle: receipt_handle.to_string(),
        receive_count,
        attributes,
    })
}

/// Last path segment of a queue URL
fn queue_name(queue_url: &str) -> &str {
    queue_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(queue_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name() {
        assert_eq!(
            queue_name("https://sqs.eu-west-1.amazonaws.com/123456789012/img-process-q"),
            "img-process-q"
        );
        assert_eq!(queue_name("img-dlq/"), "img-dlq");
        assert_eq!(queue_name("local"), "local");
    }

    #[test]
    fn test_forwarded_attributes_fit_the_limit() {
        let mut attributes: HashMap<String, String> = (0..12)
            .map(|i| (format!("attr-{:02}", i), i.to_string()))
            .collect();
        attributes.insert(REJECTION_REASON_ATTRIBUTE.to_string(), "StoreFailure".to_string());

        let forwarded = forwarded_attributes(&attributes);
        assert_eq!(forwarded.len(), MAX_MESSAGE_ATTRIBUTES - 2);
        assert_eq!(forwarded[0].0, "attr-00");
        assert!(forwarded
            .iter()
            .all(|(key, _)| key.as_str() != REJECTION_REASON_ATTRIBUTE));

        let few = HashMap::from([("origin".to_string(), "upload".to_string())]);
        assert_eq!(forwarded_attributes(&few).len(), 1);
    }

    #[test]
    fn test_convert_message() {
        let message = Message::builder()
            .message_id("m-1")
            .receipt_handle("r-1")
            .body(r#"{"Records": []}"#)
            .attributes(MessageSystemAttributeName::ApproximateReceiveCount, "3")
            .message_attributes(
                REJECTION_REASON_ATTRIBUTE,
                string_attribute("UnknownImageType").unwrap(),
            )
            .build();

        let converted = convert_message(&message).unwrap();
        assert_eq!(converted.message_id, "m-1");
        assert_eq!(converted.receive_count, 3);
        assert_eq!(converted.rejection_reason(), Some("UnknownImageType"));
    }

    #[test]
    fn test_convert_message_without_receipt_handle() {
        let message = Message::builder().message_id("m-2").body("{}").build();
        assert!(convert_message(&message).is_none());
    }
}
