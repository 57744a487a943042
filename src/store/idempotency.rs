use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{CompareAndSwapError, Db, Tree};

use crate::broker::message::MessageId;
use crate::utils::error::StoreError;

/// Ledger entry for one message identifier.
///
/// A record with `result: None` is a pending placeholder held by an
/// in-flight consumer invocation. A record with a result is a finalized
/// success; failed invocations release their placeholder instead of
/// finalizing, so the next delivery attempt re-executes the business logic.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IdempotencyRecord {
    pub message_id: MessageId,
    /// Unix timestamp (milliseconds) of finalization; `None` while pending.
    pub processed_at: Option<i64>,
    /// Success summary; `None` while pending.
    pub result: Option<String>,
    /// Unix timestamp (milliseconds) after which the record no longer
    /// suppresses duplicates.
    pub expires_at: i64,
}

impl IdempotencyRecord {
    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Result of an atomic check-and-reserve on the ledger.
#[derive(Debug)]
pub enum Reservation {
    /// This invocation created the placeholder and owns the execution; it
    /// must call `finalize` on success or `release` on failure.
    Created,
    /// A finalized success already exists; the delivery is a duplicate.
    CompletedSuccess(IdempotencyRecord),
    /// Another invocation holds the placeholder right now.
    InFlight,
}

/// Sled-backed idempotency ledger with atomic create-if-absent semantics.
///
/// Records carry a TTL: once expired, a re-delivered message is treated as
/// new. That trades storage growth against the duplicate-suppression window.
#[derive(Clone)]
pub struct IdempotencyStore {
    tree: Tree,
    ttl_seconds: i64,
}

impl IdempotencyStore {
    pub fn open(db: &Db, ttl_seconds: i64) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree("idempotency")?,
            ttl_seconds,
        })
    }

    /// Atomically reserves `message_id` for processing.
    ///
    /// Exactly one of any number of concurrent callers observes
    /// [`Reservation::Created`]; the rest see the winner's record. Expired
    /// records are treated as absent and replaced atomically.
    pub fn create_if_absent(&self, message_id: &str) -> Result<Reservation, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let placeholder = IdempotencyRecord {
            message_id: message_id.to_string(),
            processed_at: None,
            result: None,
            expires_at: now_ms + self.ttl_seconds * 1_000,
        };
        let placeholder_bytes = serde_json::to_vec(&placeholder)?;

        loop {
            match self.tree.compare_and_swap(
                message_id,
                None::<&[u8]>,
                Some(placeholder_bytes.clone()),
            )? {
                Ok(()) => return Ok(Reservation::Created),
                Err(CompareAndSwapError {
                    current: Some(current),
                    ..
                }) => {
                    let existing: IdempotencyRecord = serde_json::from_slice(&current)?;
                    if existing.is_expired(now_ms) {
                        // Expired records count as absent; swap them out.
                        match self.tree.compare_and_swap(
                            message_id,
                            Some(&current[..]),
                            Some(placeholder_bytes.clone()),
                        )? {
                            Ok(()) => return Ok(Reservation::Created),
                            Err(_) => continue,
                        }
                    }
                    return Ok(if existing.is_success() {
                        Reservation::CompletedSuccess(existing)
                    } else {
                        Reservation::InFlight
                    });
                }
                // The holder released between our swap and the read; retry.
                Err(CompareAndSwapError { current: None, .. }) => continue,
            }
        }
    }

    /// Finalizes a held reservation with a success summary.
    pub fn finalize(&self, message_id: &str, result: &str) -> Result<(), StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let record = IdempotencyRecord {
            message_id: message_id.to_string(),
            processed_at: Some(now_ms),
            result: Some(result.to_string()),
            expires_at: now_ms + self.ttl_seconds * 1_000,
        };
        self.tree.insert(message_id, serde_json::to_vec(&record)?)?;
        Ok(())
    }

    /// Drops a held placeholder after a business-logic failure so the next
    /// delivery attempt re-executes.
    pub fn release(&self, message_id: &str) -> Result<(), StoreError> {
        self.tree.remove(message_id)?;
        Ok(())
    }

    /// Reads the record for `message_id`, treating expired records as absent.
    pub fn get(&self, message_id: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        match self.tree.get(message_id)? {
            Some(bytes) => {
                let record: IdempotencyRecord = serde_json::from_slice(&bytes)?;
                Ok(if record.is_expired(now_ms) {
                    None
                } else {
                    Some(record)
                })
            }
            None => Ok(None),
        }
    }

    /// Removes expired records and returns how many were dropped.
    pub fn cleanup_expired(&self) -> Result<usize, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let expired_keys: Vec<_> = self
            .tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(key, value)| {
                let record: IdempotencyRecord = serde_json::from_slice(&value).ok()?;
                if record.is_expired(now_ms) {
                    Some(key)
                } else {
                    None
                }
            })
            .collect();

        let count = expired_keys.len();
        for key in expired_keys {
            let _ = self.tree.remove(key);
        }
        Ok(count)
    }
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}
