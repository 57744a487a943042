//! The `dlq` module provides the dead-letter channel.
//!
//! Deliveries that exhaust a subscription's retry budget land here, keyed by
//! message id, together with their full attempt history. Entries stay until
//! a manual `take`/requeue or until the retention window ends; retention
//! expiry is a data-loss event, so every swept entry is logged and counted
//! rather than silently dropped.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::warn;

use crate::broker::message::{DeliveryAttempt, Message, MessageId};
use crate::metrics::{self, Metrics};
use crate::utils::error::StoreError;

/// A dead-lettered message with the failure history that put it here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetteredMessage {
    pub message: Message,
    pub subscription_id: String,
    pub attempt_history: Vec<DeliveryAttempt>,
    /// Unix timestamp (milliseconds) of dead-lettering.
    pub enqueued_at: i64,
}

/// Terminal store for one subscription's failed deliveries.
#[derive(Clone)]
pub struct DeadLetterChannel {
    target: String,
    tree: Tree,
    retention_seconds: i64,
    metrics: Arc<Metrics>,
}

impl DeadLetterChannel {
    /// Opens the channel for a subscription's `dead_letter_target`.
    pub fn open(
        db: &Db,
        target: &str,
        retention_seconds: i64,
        metrics: Arc<Metrics>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            target: target.to_string(),
            tree: db.open_tree(format!("dlq/{target}"))?,
            retention_seconds,
            metrics,
        })
    }

    /// Stores a message whose delivery attempts are exhausted.
    pub fn enqueue(
        &self,
        message: &Message,
        subscription_id: &str,
        attempt_history: &[DeliveryAttempt],
    ) -> Result<(), StoreError> {
        let entry = DeadLetteredMessage {
            message: message.clone(),
            subscription_id: subscription_id.to_string(),
            attempt_history: attempt_history.to_vec(),
            enqueued_at: Utc::now().timestamp_millis(),
        };
        self.tree
            .insert(message.id.as_str(), serde_json::to_vec(&entry)?)?;
        metrics::incr(&self.metrics.dlq_enqueued);
        warn!(
            correlation_id = %message.correlation_id,
            message_id = %message.id,
            target = %self.target,
            attempts = attempt_history.len(),
            "message dead-lettered"
        );
        Ok(())
    }

    /// All entries currently held, oldest first.
    pub fn list(&self) -> Result<Vec<DeadLetteredMessage>, StoreError> {
        let mut entries: Vec<DeadLetteredMessage> = self
            .tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(_, value)| serde_json::from_slice(&value).ok())
            .collect();
        entries.sort_by_key(|e| e.enqueued_at);
        Ok(entries)
    }

    /// Removes and returns the entry for `message_id`, if present.
    pub fn take(&self, message_id: &MessageId) -> Result<Option<DeadLetteredMessage>, StoreError> {
        match self.tree.remove(message_id.as_str())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drops entries past the retention window.
    ///
    /// Each dropped entry is unrecoverable, so the sweep logs and counts
    /// every one of them.
    pub fn sweep_expired(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now().timestamp_millis() - self.retention_seconds * 1_000;
        let expired: Vec<(sled::IVec, DeadLetteredMessage)> = self
            .tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(key, value)| {
                let entry: DeadLetteredMessage = serde_json::from_slice(&value).ok()?;
                (entry.enqueued_at < cutoff).then_some((key, entry))
            })
            .collect();

        let count = expired.len();
        for (key, entry) in expired {
            let _ = self.tree.remove(key);
            metrics::incr(&self.metrics.dlq_expired);
            warn!(
                correlation_id = %entry.message.correlation_id,
                message_id = %entry.message.id,
                target = %self.target,
                "dead-letter entry expired without manual intervention; message lost"
            );
        }
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl std::fmt::Debug for DeadLetterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterChannel")
            .field("target", &self.target)
            .field("retention_seconds", &self.retention_seconds)
            .finish()
    }
}
