//! Queue configuration for the imagebus pipeline.
//!
//! This module provides the settings that control how a consumer polls its
//! queue, how long one batch may run, and when a failing message is moved to
//! the dead letter queue instead of being redelivered.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// SQS never returns more than ten messages per receive call.
pub const MAX_BATCH_SIZE: usize = 10;

/// SQS long polling is capped at twenty seconds.
pub const MAX_WAIT_TIME_SECS: u64 = 20;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// When a failing message stops being redelivered and is dead-lettered.
///
/// Fatal failures (malformed envelopes, unsupported image types) never succeed
/// on a later attempt, transient ones (store throttling) might. The two
/// thresholds are therefore tuned separately. A threshold of `1` dead-letters
/// on the very first failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedrivePolicy {
    /// Receive count at which a fatally failing message is dead-lettered
    #[serde(default = "default_fatal_max_receive_count")]
    pub fatal_max_receive_count: u32,
    /// Receive count at which a transiently failing message is dead-lettered
    #[serde(default = "default_transient_max_receive_count")]
    pub transient_max_receive_count: u32,
}

fn default_fatal_max_receive_count() -> u32 {
    1
}

fn default_transient_max_receive_count() -> u32 {
    3
}

impl Default for RedrivePolicy {
    fn default() -> Self {
        Self {
            fatal_max_receive_count: default_fatal_max_receive_count(),
            transient_max_receive_count: default_transient_max_receive_count(),
        }
    }
}

impl RedrivePolicy {
    /// Threshold that applies to a failure of the given class
    pub fn threshold(&self, transient: bool) -> u32 {
        if transient {
            self.transient_max_receive_count
        } else {
            self.fatal_max_receive_count
        }
    }

    /// Whether a message received `receive_count` times should be dead-lettered
    pub fn exhausted(&self, transient: bool, receive_count: u32) -> bool {
        receive_count >= self.threshold(transient)
    }
}

/// Settings for one consumed queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// URL of the queue to consume
    pub queue_url: String,
    /// URL of the dead letter queue failing messages are moved to
    #[serde(default)]
    pub dead_letter_queue_url: Option<String>,
    /// Maximum messages handed to the handler in one batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long to keep accumulating a batch before handing it over
    #[serde(default = "default_batching_window_secs")]
    pub batching_window_secs: u64,
    /// Hard limit for handling one batch
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
    /// Visibility timeout applied to released messages before redelivery
    #[serde(default)]
    pub retry_delay_secs: u64,
    /// Number of independent consumer tasks polling this queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Dead-letter thresholds
    #[serde(default)]
    pub redrive: RedrivePolicy,
}

fn default_batch_size() -> usize {
    5
}

fn default_batching_window_secs() -> u64 {
    5
}

fn default_invocation_timeout_secs() -> u64 {
    15
}

fn default_concurrency() -> usize {
    1
}

impl QueueConfig {
    /// Create a queue configuration with default batching for the given URL
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            dead_letter_queue_url: None,
            batch_size: default_batch_size(),
            batching_window_secs: default_batching_window_secs(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            retry_delay_secs: 0,
            concurrency: default_concurrency(),
            redrive: RedrivePolicy::default(),
        }
    }

    /// Set the dead letter queue URL
    pub fn with_dead_letter_queue(mut self, url: impl Into<String>) -> Self {
        self.dead_letter_queue_url = Some(url.into());
        self
    }

    /// Get the batching window as Duration
    pub fn batching_window(&self) -> Duration {
        Duration::from_secs(self.batching_window_secs)
    }

    /// Get the invocation timeout as Duration
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    /// Get the retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_url.is_empty() {
            return Err(ConfigError::MissingRequired("queue_url".to_string()));
        }

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".to_string(),
                message: format!("must be between 1 and {}", MAX_BATCH_SIZE),
            });
        }

        if self.batching_window_secs > MAX_WAIT_TIME_SECS {
            return Err(ConfigError::InvalidValue {
                key: "batching_window_secs".to_string(),
                message: format!("must not exceed {}", MAX_WAIT_TIME_SECS),
            });
        }

        if self.invocation_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "invocation_timeout_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }

        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "concurrency".to_string(),
                message: "at least one consumer task is required".to_string(),
            });
        }

        if self.redrive.fatal_max_receive_count == 0 || self.redrive.transient_max_receive_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "redrive".to_string(),
                message: "receive count thresholds start at 1".to_string(),
            });
        }

        if let Some(ref url) = self.dead_letter_queue_url {
            if url == &self.queue_url {
                return Err(ConfigError::InvalidValue {
                    key: "dead_letter_queue_url".to_string(),
                    message: "must differ from queue_url".to_string(),
                });
            }
        }

        Ok(())
    }
}
