//! Imagebus Images Service
//!
//! Processing, rejection and notification stages of the image upload pipeline.
//! Object creation events reach the processing queue either directly or
//! relayed through the fan-out topic. Each accepted upload becomes one record
//! in the image table, and every committed record triggers one notification.
//!
//! ## Features
//!
//! - **Envelope Decoding**: Raw and topic-relayed notifications on the same queue
//! - **Image Classification**: `jpeg`/`png` by key suffix, anything else rejected
//! - **Idempotent Persistence**: One DynamoDB item per object key
//! - **Explicit Redrive**: Separate dead-letter thresholds for fatal and
//!   transient failures
//! - **Change Relay**: Notifications driven by the table's change stream
//! - **Ops API**: Health, readiness, record lookup and recent rejections
//!
//! ## Architecture
//!
//! ```text
//! S3 Bucket           SNS Topic            SQS                      DynamoDB
//! ┌──────────┐       ┌──────────┐       ┌──────────────┐          ┌──────────────┐
//! │ image/*  │──────▶│ NewImage │──────▶│ img-process  │          │ Images       │
//! └──────────┘       └──────────┘       └──────────────┘          │ Table        │
//!                                              │                  └──────────────┘
//!                                              ▼                     ▲       │
//!                                       ┌──────────────┐             │       │ stream
//!                                       │ Image        │─────────────┘       ▼
//!                                       │ Processor    │              ┌──────────────┐
//!                                       └──────────────┘              │ Change       │
//!                                              │ dead letters         │ Relay        │
//!                                              ▼                      └──────────────┘
//!                                       ┌──────────────┐                     │
//!                                       │ Rejection    │                     ▼
//!                                       │ Handler      │              ┌──────────────┐
//!                                       └──────────────┘              │ SES Notifier │
//!                                                                     └──────────────┘
//! ```

pub mod api;
pub mod change_stream;
pub mod classifier;
pub mod config;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod metadata_store;
pub mod notifier;
pub mod object_store;
pub mod processor;
pub mod rejection;
pub mod relay;

pub use api::{start_api_server, AppState};
pub use change_stream::{ChangeEvent, ChangeKind, ChangeStream, DynamoChangeStream};
pub use classifier::{classify, ImageType};
pub use config::Config;
pub use envelope::{decode, Envelope, UploadEvent};
pub use error::PipelineError;
pub use memory::{InMemoryChangeStream, InMemoryMetadataStore};
pub use metadata_store::{DynamoMetadataStore, ImageRecord, MetadataStore};
pub use notifier::{Notifier, SesNotifier};
pub use object_store::{ObjectInfo, ObjectSource, S3ObjectSource};
pub use processor::{ImageProcessor, ProcessOutcome};
pub use rejection::{RejectionHandler, RejectionLog, RejectionRecord};
pub use relay::{ChangeRelay, RelayReport};
