use config::builder::DefaultState;
use config::ConfigBuilder;
use imagebus_pipeline::{ConfigError, QueueConfig};
use serde::Deserialize;
use std::time::Duration;

/// Bare environment variables recognized on top of the layered configuration
pub const TABLE_NAME_VAR: &str = "TABLE_NAME";
pub const BUCKET_NAME_VAR: &str = "BUCKET_NAME";
pub const REGION_VAR: &str = "REGION";

/// Main configuration for the images service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// AWS client configuration
    #[serde(default)]
    pub aws: AwsConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata table configuration
    pub table: TableConfig,
    /// Consumed queues
    #[serde(default)]
    pub queues: QueuesConfig,
    /// Outbound notification configuration
    #[serde(default)]
    pub notification: NotificationConfig,
    /// Change relay configuration
    #[serde(default)]
    pub relay: RelayConfig,
    /// Ops API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Upload key filter
    #[serde(default)]
    pub filter: FilterConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Settings shared by every AWS client
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack)
    pub endpoint_url: Option<String>,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket uploads are expected from; events naming another bucket are skipped
    pub bucket_name: Option<String>,
    /// Force path-style access (LocalStack/MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Enrich records with the object's content type and size
    #[serde(default = "default_true")]
    pub probe_objects: bool,
}

/// Metadata table configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    /// DynamoDB table holding image records
    pub table_name: String,
    /// Change stream ARN, looked up from the table when absent
    pub stream_arn: Option<String>,
}

/// Queues consumed by the service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueuesConfig {
    /// Upload notifications to process
    pub processing: Option<QueueConfig>,
    /// Dead letter queue of the processing queue
    pub rejection: Option<QueueConfig>,
}

/// Outbound notification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Sender address
    pub from_address: Option<String>,
    /// Recipient addresses
    #[serde(default)]
    pub to_addresses: Vec<String>,
    /// SES configuration set to send through
    pub configuration_set: Option<String>,
    /// Upper bound for one send
    #[serde(default = "default_notification_timeout_secs")]
    pub timeout_secs: u64,
}

/// Change relay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Pause between polls that returned no changes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often to look for new shards
    #[serde(default = "default_shard_refresh_secs")]
    pub shard_refresh_secs: u64,
}

/// Ops API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Rejections kept for the rejections endpoint
    #[serde(default = "default_rejection_log_capacity")]
    pub rejection_log_capacity: usize,
}

/// Upload key filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterConfig {
    /// Key prefixes to process (empty = all)
    #[serde(default)]
    pub accepted_prefixes: Vec<String>,
}

impl FilterConfig {
    /// Whether an object key passes the filter
    pub fn accepts(&self, key: &str) -> bool {
        self.accepted_prefixes.is_empty()
            || self
                .accepted_prefixes
                .iter()
                .any(|prefix| key.starts_with(prefix.as_str()))
    }
}

// Default value functions
fn default_service_name() -> String {
    "images-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "eu-west-1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_notification_timeout_secs() -> u64 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_shard_refresh_secs() -> u64 {
    60
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_rejection_log_capacity() -> usize {
    100
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket_name: None,
            force_path_style: false,
            probe_objects: default_true(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            from_address: None,
            to_addresses: Vec::new(),
            configuration_set: None,
            timeout_secs: default_notification_timeout_secs(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            shard_refresh_secs: default_shard_refresh_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            rejection_log_capacity: default_rejection_log_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            // Start with default values
            .set_default("service.name", "images-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/images").required(false))
            .add_source(config::File::with_name("/etc/imagebus/images").required(false))
            // Override with environment variables
            // IMAGES__QUEUES__PROCESSING__QUEUE_URL -> queues.processing.queue_url
            .add_source(
                config::Environment::with_prefix("IMAGES")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("filter.accepted_prefixes")
                    .with_list_parse_key("notification.to_addresses"),
            );

        Self::from_builder(builder, |name| std::env::var(name).ok())
    }

    /// Apply the bare environment overrides and deserialize
    fn from_builder(
        builder: ConfigBuilder<DefaultState>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let config = builder
            .set_override_option("table.table_name", lookup(TABLE_NAME_VAR))?
            .set_override_option("storage.bucket_name", lookup(BUCKET_NAME_VAR))?
            .set_override_option("aws.region", lookup(REGION_VAR))?
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Processing queue, required by the processing consumer
    pub fn processing_queue(&self) -> Result<&QueueConfig, ConfigError> {
        self.queues
            .processing
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("queues.processing".to_string()))
    }

    /// Dead letter queue, required by the rejection consumer
    pub fn rejection_queue(&self) -> Result<&QueueConfig, ConfigError> {
        self.queues
            .rejection
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("queues.rejection".to_string()))
    }

    /// Get notification send timeout as Duration
    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification.timeout_secs)
    }

    /// Get relay poll interval as Duration
    pub fn relay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay.poll_interval_ms)
    }

    /// Get shard refresh interval as Duration
    pub fn shard_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.relay.shard_refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    const MINIMAL: &str = r#"
        [table]
        table_name = "ImagesTable"

        [queues.processing]
        queue_url = "http://localhost:4566/000000000000/img-process-q"
        dead_letter_queue_url = "http://localhost:4566/000000000000/img-dlq"

        [queues.rejection]
        queue_url = "http://localhost:4566/000000000000/img-dlq"
        batch_size = 10
    "#;

    fn load(toml: &str, env: &[(&str, &str)]) -> Config {
        let env: Vec<(String, String)> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let builder = config::Config::builder().add_source(File::from_str(toml, FileFormat::Toml));

        Config::from_builder(builder, |name| {
            env.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = load(MINIMAL, &[]);

        assert_eq!(config.aws.region, "eu-west-1");
        assert_eq!(config.notification_timeout(), Duration::from_secs(3));
        assert!(config.storage.probe_objects);
        assert!(config.filter.accepted_prefixes.is_empty());

        let processing = config.processing_queue().unwrap();
        assert_eq!(processing.batch_size, 5);
        assert_eq!(processing.batching_window_secs, 5);
        assert_eq!(processing.invocation_timeout_secs, 15);
        assert_eq!(processing.redrive.fatal_max_receive_count, 1);
        assert_eq!(processing.redrive.transient_max_receive_count, 3);

        assert_eq!(config.rejection_queue().unwrap().batch_size, 10);
    }

    #[test]
    fn test_bare_environment_overrides() {
        let config = load(
            MINIMAL,
            &[
                ("TABLE_NAME", "OtherTable"),
                ("BUCKET_NAME", "images-bucket"),
                ("REGION", "us-east-1"),
            ],
        );

        assert_eq!(config.table.table_name, "OtherTable");
        assert_eq!(config.storage.bucket_name.as_deref(), Some("images-bucket"));
        assert_eq!(config.aws.region, "us-east-1");
    }

    #[test]
    fn test_missing_queue_is_reported() {
        let config = load("[table]\ntable_name = \"ImagesTable\"\n", &[]);
        assert!(matches!(
            config.processing_queue(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_prefix_filter() {
        let all = FilterConfig::default();
        assert!(all.accepts("notes.txt"));

        let images = FilterConfig {
            accepted_prefixes: vec!["image".to_string()],
        };
        assert!(images.accepts("image/photo.png"));
        assert!(!images.accepts("docs/photo.png"));
    }
}
