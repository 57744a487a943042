use std::collections::BTreeMap;

use serde::Deserialize;

use crate::broker::subscription::{
    FilterPolicy, RedrivePolicy, RetryPolicy, Subscription,
};

/// Top-level configuration settings for the application.
///
/// Covers the pipeline's shared bounds, the publisher's retry ceiling, and
/// the statically configured subscriptions.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub pipeline: PipelineSettings,
    pub publisher: PublisherSettings,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSettings>,
}

/// Shared pipeline settings: storage location, identity attributes, and the
/// size/timeout/TTL bounds every component treats as read-only.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    pub data_dir: String,
    pub environment: String,
    pub source: String,
    pub log_level: String,
    pub max_payload_bytes: usize,
    pub consumer_timeout_ms: u64,
    pub idempotency_ttl_secs: i64,
    pub dlq_retention_secs: i64,
}

/// Publisher send-retry settings.
#[derive(Debug, Deserialize, Clone)]
pub struct PublisherSettings {
    pub topic: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// One statically configured subscription.
#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionSettings {
    pub id: String,
    pub topic: String,
    /// Attribute key → accepted values. Empty means match everything.
    #[serde(default)]
    pub filter: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub max_receive_count: u32,
    pub dead_letter_target: String,
}

impl SubscriptionSettings {
    /// Builds the typed subscription this configuration describes.
    pub fn to_subscription(&self) -> Subscription {
        let mut filter_policy = FilterPolicy::match_all();
        for (key, accepted) in &self.filter {
            filter_policy = filter_policy.with_rule(key, accepted.iter().cloned());
        }
        Subscription {
            id: self.id.clone(),
            filter_policy,
            retry_policy: self.retry.clone(),
            redrive_policy: RedrivePolicy {
                max_receive_count: self.max_receive_count,
                dead_letter_target: self.dead_letter_target.clone(),
            },
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub pipeline: Option<PartialPipelineSettings>,
    pub publisher: Option<PartialPublisherSettings>,
    pub subscriptions: Option<Vec<SubscriptionSettings>>,
}

/// Partial pipeline settings.
///
/// Used when loading pipeline configuration from external sources with optional values.
#[derive(Debug, Deserialize)]
pub struct PartialPipelineSettings {
    pub data_dir: Option<String>,
    pub environment: Option<String>,
    pub source: Option<String>,
    pub log_level: Option<String>,
    pub max_payload_bytes: Option<usize>,
    pub consumer_timeout_ms: Option<u64>,
    pub idempotency_ttl_secs: Option<i64>,
    pub dlq_retention_secs: Option<i64>,
}

/// Partial publisher settings.
///
/// Used for publisher configuration from external sources with optional values.
#[derive(Debug, Deserialize)]
pub struct PartialPublisherSettings {
    pub topic: Option<String>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            pipeline: PipelineSettings {
                data_dir: "courier_db".to_string(),
                environment: "dev".to_string(),
                source: "courier-publisher".to_string(),
                log_level: "info".to_string(),
                // 256 KiB payload bound
                max_payload_bytes: 256 * 1024,
                consumer_timeout_ms: 30_000,
                // 7 days of duplicate suppression
                idempotency_ttl_secs: 7 * 24 * 3600,
                // 14 days of dead-letter retention
                dlq_retention_secs: 14 * 24 * 3600,
            },
            publisher: PublisherSettings {
                topic: "events".to_string(),
                max_attempts: 4,
                base_delay_ms: 200,
                max_delay_ms: 5_000,
            },
            subscriptions: Vec::new(),
        }
    }
}
