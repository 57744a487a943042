use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Broker-assigned unique message identifier, immutable after publish.
pub type MessageId = String;

/// Producer-assigned correlation identifier, stable across every delivery
/// attempt of the same logical message.
pub type CorrelationId = String;

/// Ordered attribute map used for subscription filter evaluation.
pub type Attributes = BTreeMap<String, String>;

/// A message after enrichment but before the broker has accepted it.
///
/// The enricher produces this; the broker assigns the final `id` when it
/// persists the message, turning it into a [`Message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedMessage {
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
    pub attributes: Attributes,
    /// Unix timestamp (milliseconds) stamped by the enricher before send.
    pub published_at: i64,
}

/// A published message as the broker stores and delivers it.
///
/// This structure is serialized to JSON for persistence in the broker's
/// message tree and carried on every delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
    pub attributes: Attributes,
    pub published_at: i64,
}

impl Message {
    /// Assigns a broker id to an enriched message at publish time.
    pub fn accepted(id: MessageId, enriched: EnrichedMessage) -> Self {
        Self {
            id,
            correlation_id: enriched.correlation_id,
            payload: enriched.payload,
            attributes: enriched.attributes,
            published_at: enriched.published_at,
        }
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Pending,
    Success,
    Failure,
}

/// One delivery attempt of a message to a subscription.
///
/// `attempt_number` is 1-based, strictly increasing per
/// (`message_id`, `subscription_id`) pair, and bounded by the subscription's
/// `max_receive_count`. `generation` starts at 0 and is bumped each time the
/// pair is requeued from the dead-letter channel, so attempt numbers restart
/// without colliding with the previous pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub message_id: MessageId,
    pub subscription_id: String,
    #[serde(default)]
    pub generation: u32,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    /// Unix timestamp (milliseconds) when the attempt was scheduled.
    pub scheduled_at: i64,
}
