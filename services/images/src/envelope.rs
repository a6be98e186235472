//! Unwrapping of queue message bodies into upload events.
//!
//! A body either is the storage notification itself (raw delivery), or a
//! broker notification whose `Message` field holds the storage notification as
//! a JSON string. Which of the two applies is decided by probing for that
//! field, so both shapes can arrive on the same queue.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field a relaying broker wraps the original payload in
pub const RELAYED_MESSAGE_FIELD: &str = "Message";

/// An object creation reported by object storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadEvent {
    /// Bucket the object was created in
    pub bucket_name: String,
    /// Decoded object key
    pub object_key: String,
}

impl UploadEvent {
    pub fn new(bucket_name: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            object_key: object_key.into(),
        }
    }
}

/// A parsed message body, tagged with how many layers wrapped the payload
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// The transport body is the event payload
    SingleLayer(Value),
    /// The transport body relays the event payload as a JSON string
    DoubleLayer(Value),
}

#[derive(Deserialize)]
struct StorageNotification {
    #[serde(rename = "Records", default)]
    records: Option<Vec<StorageRecord>>,
}

#[derive(Deserialize)]
struct StorageRecord {
    s3: StorageEntity,
}

#[derive(Deserialize)]
struct StorageEntity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Deserialize)]
struct ObjectEntity {
    key: String,
}

impl Envelope {
    /// Parse raw message bytes, detecting the layering from the body itself
    pub fn parse(raw: &[u8]) -> Result<Self, PipelineError> {
        let outer: Value = serde_json::from_slice(raw).map_err(|e| {
            PipelineError::MalformedEnvelope(format!("transport body is not JSON: {}", e))
        })?;

        match outer.get(RELAYED_MESSAGE_FIELD) {
            None => Ok(Envelope::SingleLayer(outer)),
            Some(Value::String(relayed)) => {
                let payload = serde_json::from_str(relayed).map_err(|e| {
                    PipelineError::MalformedEnvelope(format!("relayed message is not JSON: {}", e))
                })?;
                Ok(Envelope::DoubleLayer(payload))
            }
            Some(other) => Err(PipelineError::MalformedEnvelope(format!(
                "relayed message must be a JSON string, got {}",
                json_type(other)
            ))),
        }
    }

    /// The event payload, with every transport layer removed
    pub fn payload(&self) -> &Value {
        match self {
            Envelope::SingleLayer(payload) | Envelope::DoubleLayer(payload) => payload,
        }
    }

    /// Whether the payload was relayed through the broker
    pub fn is_relayed(&self) -> bool {
        matches!(self, Envelope::DoubleLayer(_))
    }

    /// Extract the upload events carried by the payload, in record order.
    ///
    /// A payload without a `Records` list carries no uploads (broker heartbeats,
    /// storage test events) and yields an empty list.
    pub fn upload_events(&self) -> Result<Vec<UploadEvent>, PipelineError> {
        let payload = self.payload();
        if !payload.is_object() {
            return Err(PipelineError::MalformedEnvelope(format!(
                "event payload must be a JSON object, got {}",
                json_type(payload)
            )));
        }

        let notification = StorageNotification::deserialize(payload).map_err(|e| {
            PipelineError::MalformedEnvelope(format!("invalid storage records: {}", e))
        })?;

        notification
            .records
            .unwrap_or_default()
            .into_iter()
            .map(|record| {
                Ok(UploadEvent {
                    bucket_name: record.s3.bucket.name,
                    object_key: decode_object_key(&record.s3.object.key)?,
                })
            })
            .collect()
    }
}

/// Decode raw message bytes into the upload events they carry
pub fn decode(raw: &[u8]) -> Result<Vec<UploadEvent>, PipelineError> {
    Envelope::parse(raw)?.upload_events()
}

/// Undo the storage notification key encoding.
///
/// `+` stands for a space and is replaced before percent-decoding, so that an
/// encoded plus (`%2B`) survives as a literal `+`.
pub fn decode_object_key(raw: &str) -> Result<String, PipelineError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| {
            PipelineError::MalformedEnvelope(format!("object key {:?} is not valid UTF-8: {}", raw, e))
        })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage_notification(keys: &[&str]) -> Value {
        let records: Vec<Value> = keys
            .iter()
            .map(|key| {
                json!({
                    "eventVersion": "2.1",
                    "eventSource": "aws:s3",
                    "eventName": "ObjectCreated:Put",
                    "s3": {
                        "bucket": { "name": "b", "arn": "arn:aws:s3:::b" },
                        "object": { "key": key, "size": 1024 }
                    }
                })
            })
            .collect();
        json!({ "Records": records })
    }

    fn relayed(payload: &Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "Type": "Notification",
            "TopicArn": "arn:aws:sns:eu-west-1:123456789012:NewImageTopic",
            "Message": payload.to_string()
        }))
        .unwrap()
    }

    #[test]
    fn test_single_and_double_layer_decode_identically() {
        let payload = storage_notification(&["image/photo.png", "image/other.jpeg"]);

        let single = Envelope::parse(payload.to_string().as_bytes()).unwrap();
        let double = Envelope::parse(&relayed(&payload)).unwrap();

        assert!(!single.is_relayed());
        assert!(double.is_relayed());
        assert_eq!(single.payload(), double.payload());
        assert_eq!(
            single.upload_events().unwrap(),
            double.upload_events().unwrap()
        );
    }

    #[test]
    fn test_decode_preserves_record_order() {
        let payload = storage_notification(&["image/a.png", "image/b.png", "image/c.png"]);
        let events = decode(payload.to_string().as_bytes()).unwrap();

        let keys: Vec<&str> = events.iter().map(|e| e.object_key.as_str()).collect();
        assert_eq!(keys, vec!["image/a.png", "image/b.png", "image/c.png"]);
        assert!(events.iter().all(|e| e.bucket_name == "b"));
    }

    #[test]
    fn test_missing_records_is_empty() {
        let test_event = json!({
            "Service": "Amazon S3",
            "Event": "s3:TestEvent",
            "Bucket": "b"
        });
        assert!(decode(test_event.to_string().as_bytes()).unwrap().is_empty());
        assert!(decode(&relayed(&test_event)).unwrap().is_empty());
        assert!(decode(br#"{"Records": null}"#).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_envelopes() {
        let cases: Vec<Vec<u8>> = vec![
            b"not json".to_vec(),
            br#"{"Message": "not json either"}"#.to_vec(),
            br#"{"Message": {"Records": []}}"#.to_vec(),
            br#"{"Records": "nope"}"#.to_vec(),
            br#"{"Records": [{"s3": {"bucket": {"name": "b"}}}]}"#.to_vec(),
            b"42".to_vec(),
        ];

        for raw in cases {
            let result = decode(&raw);
            assert!(
                matches!(result, Err(PipelineError::MalformedEnvelope(_))),
                "expected MalformedEnvelope for {}",
                String::from_utf8_lossy(&raw)
            );
        }
    }

    #[test]
    fn test_object_key_decoding() {
        assert_eq!(
            decode_object_key("image%2Bfoo+bar.jpeg").unwrap(),
            "image+foo bar.jpeg"
        );
        assert_eq!(
            decode_object_key("image/summer+holiday%281%29.png").unwrap(),
            "image/summer holiday(1).png"
        );
        assert_eq!(decode_object_key("image/plain.png").unwrap(), "image/plain.png");
        assert!(decode_object_key("image/%FF.png").is_err());
    }

    #[test]
    fn test_decoded_key_in_relayed_event() {
        let payload = storage_notification(&["image%2Bfoo+bar.jpeg"]);
        let events = decode(&relayed(&payload)).unwrap();
        assert_eq!(events, vec![UploadEvent::new("b", "image+foo bar.jpeg")]);
    }
}
