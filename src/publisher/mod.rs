//! The `publisher` module is the pipeline's inbound edge.
//!
//! The enricher validates and decorates raw input; the publisher then sends
//! the enriched message to the broker, retrying transient failures with
//! exponential backoff and jitter up to an attempt ceiling. Non-retryable
//! failures fail fast. Per-attempt metrics are emitted but never gate the
//! outcome: a publish succeeds or fails on the send alone.

pub mod enricher;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

pub use enricher::{Enricher, RawPublish};

use crate::broker::message::{EnrichedMessage, MessageId};
use crate::metrics::{self, Metrics};
use crate::utils::error::SendError;

/// Where the publisher sends enriched messages.
///
/// The broker implements this; tests substitute fault-injecting targets.
#[async_trait]
pub trait PublishTarget: Send + Sync {
    async fn send(&self, topic: &str, message: EnrichedMessage) -> Result<MessageId, SendError>;
}

/// Terminal outcome of one publish, after all retries.
#[derive(Debug)]
pub enum PublishResult {
    Published {
        message_id: MessageId,
        attempts: u32,
    },
    Failed {
        attempts: u32,
        last_error: SendError,
    },
}

impl PublishResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PublishResult::Published { .. })
    }
}

/// Sends enriched messages to a [`PublishTarget`] with bounded retries.
pub struct Publisher {
    target: Arc<dyn PublishTarget>,
    topic: String,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(
        target: Arc<dyn PublishTarget>,
        topic: &str,
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            target,
            topic: topic.to_string(),
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            metrics,
        }
    }

    /// Publishes one enriched message, retrying transient failures.
    ///
    /// Always returns a terminal outcome; the caller never sees anything of
    /// the downstream consumers.
    pub async fn publish(&self, message: EnrichedMessage) -> PublishResult {
        let mut last_error: Option<SendError> = None;

        for attempt in 1..=self.max_attempts {
            metrics::incr(&self.metrics.publish_attempts);
            let started = Instant::now();

            match self.target.send(&self.topic, message.clone()).await {
                Ok(message_id) => {
                    metrics::incr(&self.metrics.publish_success);
                    info!(
                        correlation_id = %message.correlation_id,
                        message_id = %message_id,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "message published"
                    );
                    return PublishResult::Published {
                        message_id,
                        attempts: attempt,
                    };
                }
                Err(err) if !err.is_retryable() => {
                    metrics::incr(&self.metrics.publish_failure);
                    warn!(
                        correlation_id = %message.correlation_id,
                        attempt,
                        error = %err,
                        "non-retryable publish failure"
                    );
                    return PublishResult::Failed {
                        attempts: attempt,
                        last_error: err,
                    };
                }
                Err(err) => {
                    warn!(
                        correlation_id = %message.correlation_id,
                        attempt,
                        error = %err,
                        "transient publish failure"
                    );
                    last_error = Some(err);
                    if attempt < self.max_attempts {
                        sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }
        }

        metrics::incr(&self.metrics.publish_failure);
        let last_error =
            last_error.unwrap_or_else(|| SendError::Unavailable("no attempt made".to_string()));
        warn!(
            correlation_id = %message.correlation_id,
            attempts = self.max_attempts,
            error = %last_error,
            "publish retries exhausted"
        );
        PublishResult::Failed {
            attempts: self.max_attempts,
            last_error,
        }
    }

    /// Exponential backoff doubling from the base delay, capped at the max,
    /// with multiplicative jitter in [0.5, 1.5).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let raw_ms = base_ms
            .saturating_mul(factor)
            .min(self.max_delay.as_millis() as u64);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis((raw_ms as f64 * jitter) as u64).min(self.max_delay)
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests;
