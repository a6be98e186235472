//! Imagebus Pipeline - queue consumer runtime for the image upload pipeline
//!
//! This library polls a queue for bounded batches of messages and settles
//! every message independently. It handles:
//!
//! - Batch accumulation (batch size and batching window)
//! - A hard per-batch invocation timeout
//! - Typed `Transient` / `Fatal` handler failures
//! - Separately tunable dead-letter thresholds per failure class
//!
//! # Example
//!
//! ```rust,no_run
//! use imagebus_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl MessageHandler for Echo {
//!     async fn handle(&self, message: &QueueMessage) -> Result<(), HandlerError> {
//!         println!("{}", message.body);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sdk_config = aws_config::load_from_env().await;
//!     let config = QueueConfig::new("https://sqs.eu-west-1.amazonaws.com/123456789012/img-process-q");
//!     let queue = Arc::new(SqsQueue::new(&sdk_config, &config));
//!
//!     let consumer = QueueConsumer::new(queue, &config)?;
//!     consumer.run(Arc::new(Echo)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod memory;
pub mod queue;
pub mod sqs;

// Re-export main types
pub use config::{ConfigError, QueueConfig, RedrivePolicy};
pub use consumer::{
    BatchReport, ConsumerBuilder, ConsumerError, HandlerError, MessageHandler, QueueConsumer,
    Settlement,
};
pub use memory::InMemoryQueue;
pub use queue::{
    MessageQueue, QueueError, QueueMessage, REJECTION_REASON_ATTRIBUTE,
    SOURCE_MESSAGE_ID_ATTRIBUTE,
};
pub use sqs::SqsQueue;

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{QueueConfig, RedrivePolicy};
    pub use crate::consumer::{HandlerError, MessageHandler, QueueConsumer};
    pub use crate::queue::{MessageQueue, QueueMessage};
    pub use crate::sqs::SqsQueue;
    pub use async_trait::async_trait;
}
