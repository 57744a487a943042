mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};
use tracing::warn;

pub use settings::{
    PipelineSettings, PublisherSettings, Settings, SubscriptionSettings,
};

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the pipeline, publisher, and
/// subscription configurations
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("_"));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    let merged = Settings {
        pipeline: PipelineSettings {
            data_dir: partial
                .pipeline
                .as_ref()
                .and_then(|p| p.data_dir.clone())
                .unwrap_or(default.pipeline.data_dir),
            environment: partial
                .pipeline
                .as_ref()
                .and_then(|p| p.environment.clone())
                .unwrap_or(default.pipeline.environment),
            source: partial
                .pipeline
                .as_ref()
                .and_then(|p| p.source.clone())
                .unwrap_or(default.pipeline.source),
            log_level: partial
                .pipeline
                .as_ref()
                .and_then(|p| p.log_level.clone())
                .unwrap_or(default.pipeline.log_level),
            max_payload_bytes: partial
                .pipeline
                .as_ref()
                .and_then(|p| p.max_payload_bytes)
                .unwrap_or(default.pipeline.max_payload_bytes),
            consumer_timeout_ms: partial
                .pipeline
                .as_ref()
                .and_then(|p| p.consumer_timeout_ms)
                .unwrap_or(default.pipeline.consumer_timeout_ms),
            idempotency_ttl_secs: partial
                .pipeline
                .as_ref()
                .and_then(|p| p.idempotency_ttl_secs)
                .unwrap_or(default.pipeline.idempotency_ttl_secs),
            dlq_retention_secs: partial
                .pipeline
                .as_ref()
                .and_then(|p| p.dlq_retention_secs)
                .unwrap_or(default.pipeline.dlq_retention_secs),
        },
        publisher: PublisherSettings {
            topic: partial
                .publisher
                .as_ref()
                .and_then(|p| p.topic.clone())
                .unwrap_or(default.publisher.topic),
            max_attempts: partial
                .publisher
                .as_ref()
                .and_then(|p| p.max_attempts)
                .unwrap_or(default.publisher.max_attempts),
            base_delay_ms: partial
                .publisher
                .as_ref()
                .and_then(|p| p.base_delay_ms)
                .unwrap_or(default.publisher.base_delay_ms),
            max_delay_ms: partial
                .publisher
                .as_ref()
                .and_then(|p| p.max_delay_ms)
                .unwrap_or(default.publisher.max_delay_ms),
        },
        subscriptions: partial.subscriptions.unwrap_or(default.subscriptions),
    };

    if merged.subscriptions.is_empty() {
        warn!("no subscriptions configured; published messages will fan out to nothing");
    }

    Ok(merged)
}
