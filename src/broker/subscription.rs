use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::message::Attributes;

pub type SubscriptionId = String;

/// Predicate over message attributes deciding subscription eligibility.
///
/// A message matches iff every policy key is present in the message
/// attributes with a value in that key's accepted set: AND across keys,
/// OR within a key's value set. An empty policy matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterPolicy {
    rules: BTreeMap<String, BTreeSet<String>>,
}

impl FilterPolicy {
    /// A policy with no rules; matches every message.
    pub fn match_all() -> Self {
        Self::default()
    }

    /// Adds an accepted value set for an attribute key.
    pub fn with_rule<I, S>(mut self, key: &str, accepted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .entry(key.to_string())
            .or_default()
            .extend(accepted.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluates the policy against a message's attributes.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.rules.iter().all(|(key, accepted)| {
            attributes
                .get(key)
                .is_some_and(|value| accepted.contains(value))
        })
    }
}

/// Growth curve for computed backoff once the retry pools are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffFunction {
    Linear,
    Exponential,
}

/// Retry schedule parameters for one subscription.
///
/// Retries are partitioned into three pools consumed in order (zero-delay,
/// then minimum-delay, then maximum-delay) before falling back to the
/// computed linear/exponential curve between `min_delay` and `max_delay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub num_retries: u32,
    pub num_no_delay_retries: u32,
    pub num_min_delay_retries: u32,
    pub num_max_delay_retries: u32,
    pub backoff_function: BackoffFunction,
}

impl RetryPolicy {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 20_000,
            num_retries: 3,
            num_no_delay_retries: 0,
            num_min_delay_retries: 0,
            num_max_delay_retries: 0,
            backoff_function: BackoffFunction::Linear,
        }
    }
}

/// Redrive parameters: how many delivery attempts a subscription tolerates
/// before the message is moved to its dead-letter target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedrivePolicy {
    pub max_receive_count: u32,
    pub dead_letter_target: String,
}

/// A subscription on a topic.
///
/// Created at configuration time and immutable during normal operation.
/// The broker evaluates `filter_policy` once per published message and, on
/// a match, drives delivery attempts under `retry_policy` and
/// `redrive_policy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    #[serde(default)]
    pub filter_policy: FilterPolicy,
    pub retry_policy: RetryPolicy,
    pub redrive_policy: RedrivePolicy,
}
