use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use imagebus_pipeline::{MessageHandler, MessageQueue, QueueConfig, QueueConsumer, SqsQueue};
use images_service::config::{AwsConfig, Config};
use images_service::{
    start_api_server, AppState, ChangeRelay, DynamoChangeStream, DynamoMetadataStore,
    ImageProcessor, MetadataStore, RejectionHandler, RejectionLog, S3ObjectSource, SesNotifier,
};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Which pipeline stages this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Process,
    Reject,
    Relay,
    All,
}

impl Mode {
    fn parse(arg: Option<&str>) -> Option<Self> {
        match arg.unwrap_or("all") {
            "process" => Some(Mode::Process),
            "reject" => Some(Mode::Reject),
            "relay" => Some(Mode::Relay),
            "all" => Some(Mode::All),
            _ => None,
        }
    }

    fn processes(self) -> bool {
        matches!(self, Mode::Process | Mode::All)
    }

    fn rejects(self) -> bool {
        matches!(self, Mode::Reject | Mode::All)
    }

    fn relays(self) -> bool {
        matches!(self, Mode::Relay | Mode::All)
    }
}

/// Running queue consumers and their tasks
#[derive(Default)]
struct Workers {
    consumers: Vec<Arc<QueueConsumer>>,
    relay: Option<Arc<ChangeRelay>>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Spawn `concurrency` consumers sharing one queue client and handler
    fn spawn_consumers<H: MessageHandler + 'static>(
        &mut self,
        sdk_config: &SdkConfig,
        config: &QueueConfig,
        handler: Arc<H>,
    ) -> Result<()> {
        let queue: Arc<dyn MessageQueue> = Arc::new(SqsQueue::new(sdk_config, config));

        for worker in 0..config.concurrency {
            let consumer = Arc::new(
                QueueConsumer::new(queue.clone(), config)
                    .with_context(|| format!("Failed to create consumer for {}", config.queue_url))?,
            );
            self.consumers.push(consumer.clone());

            let handler = handler.clone();
            self.handles.push(tokio::spawn(async move {
                if let Err(e) = consumer.run(handler).await {
                    error!(worker = worker, error = %e, "Queue consumer error");
                }
            }));
        }

        Ok(())
    }

    /// Stop every loop and wait for in-flight batches to settle
    async fn shutdown(self) {
        for consumer in &self.consumers {
            consumer.shutdown();
        }
        if let Some(ref relay) = self.relay {
            relay.shutdown();
        }
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let Some(mode) = Mode::parse(args.get(1).map(String::as_str)) else {
        print_usage();
        return Ok(());
    };

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        mode = ?mode,
        "Starting Imagebus Images Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Clients are built once and shared by every stage
    let sdk_config = load_aws_config(&config.aws).await;
    let dynamo_store = Arc::new(DynamoMetadataStore::new(
        &sdk_config,
        &config.table.table_name,
    ));
    let store: Arc<dyn MetadataStore> = dynamo_store.clone();
    let rejections = Arc::new(RejectionLog::new(config.api.rejection_log_capacity));

    let mut workers = Workers::default();

    if mode.processes() {
        let mut processor = ImageProcessor::new(store.clone())
            .with_filter(config.filter.clone())
            .with_expected_bucket(config.storage.bucket_name.clone());
        if config.storage.probe_objects {
            processor = processor
                .with_object_source(Arc::new(S3ObjectSource::new(&sdk_config, &config.storage)));
        }

        workers.spawn_consumers(&sdk_config, config.processing_queue()?, Arc::new(processor))?;
    }

    if mode.rejects() {
        let handler = Arc::new(RejectionHandler::new(rejections.clone()));
        workers.spawn_consumers(&sdk_config, config.rejection_queue()?, handler)?;
    }

    if mode.relays() {
        let notifier = SesNotifier::new(&sdk_config, &config.notification)
            .context("Failed to initialize notifier")?;

        let stream_arn = match config.table.stream_arn.clone() {
            Some(arn) => arn,
            None => dynamo_store
                .latest_stream_arn()
                .await
                .context("Failed to describe image table")?
                .context("Image table has no change stream enabled")?,
        };

        let stream = DynamoChangeStream::subscribe(
            &sdk_config,
            stream_arn,
            config.relay_poll_interval(),
            config.shard_refresh_interval(),
        )
        .await
        .context("Failed to subscribe to change stream")?;

        let relay = Arc::new(ChangeRelay::new(
            Arc::new(notifier),
            config.notification_timeout(),
        ));
        let task_relay = relay.clone();
        workers.handles.push(tokio::spawn(async move {
            if let Err(e) = task_relay.run(stream).await {
                error!(error = %e, "Change relay error");
            }
        }));
        workers.relay = Some(relay);
    }

    // Spawn API server task
    let api_state = AppState {
        metadata_store: store,
        rejections,
    };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Images service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down images service");

    workers.shutdown().await;
    api_handle.abort();

    info!("Images service stopped");

    Ok(())
}

fn print_usage() {
    println!("Usage: images-service [process|reject|relay|all]");
    println!();
    println!("Modes:");
    println!("  process - Consume upload notifications and store image records");
    println!("  reject  - Consume the dead letter queue and record rejected uploads");
    println!("  relay   - Notify on image table changes");
    println!("  all     - Run every stage (default)");
    println!();
    println!("Environment variables:");
    println!("  TABLE_NAME   - Image table name");
    println!("  BUCKET_NAME  - Bucket uploads are expected from");
    println!("  REGION       - AWS region (default: eu-west-1)");
    println!("  IMAGES__*    - Any other setting, e.g. IMAGES__QUEUES__PROCESSING__QUEUE_URL");
}

/// Build the shared AWS configuration
async fn load_aws_config(config: &AwsConfig) -> SdkConfig {
    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));

    // Custom endpoint for LocalStack
    if let Some(ref endpoint_url) = config.endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }

    loader.load().await
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(Mode::parse(None), Some(Mode::All));
        assert_eq!(Mode::parse(Some("relay")), Some(Mode::Relay));
        assert_eq!(Mode::parse(Some("ingest")), None);

        assert!(Mode::All.processes() && Mode::All.rejects() && Mode::All.relays());
        assert!(Mode::Reject.rejects());
        assert!(!Mode::Reject.processes());
        assert!(!Mode::Process.relays());
    }
}
