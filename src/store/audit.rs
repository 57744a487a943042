use sled::{Db, Tree};

use serde::{Deserialize, Serialize};

use crate::broker::message::{CorrelationId, MessageId};
use crate::utils::error::StoreError;

/// Terminal outcome of a consumer invocation as recorded for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// Audit row for one delivery attempt. Append-only; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    /// Delivery generation of the pair; bumped on requeue so a requeued
    /// pass's attempts do not collide with the original pass.
    #[serde(default)]
    pub generation: u32,
    pub attempt_number: u32,
    pub consumer_outcome: AuditOutcome,
    pub processing_duration_ms: u64,
    /// Unix timestamp (milliseconds) when the outcome was recorded.
    pub timestamp: i64,
}

/// Append-only audit trail keyed by
/// (`message_id`, `generation`, `attempt_number`).
///
/// The composite key makes retried outcome reporting idempotent: a second
/// append for the same attempt is a no-op rather than a duplicate row.
#[derive(Clone)]
pub struct AuditStore {
    tree: Tree,
}

impl AuditStore {
    pub fn open(db: &Db) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree("audit")?,
        })
    }

    /// Appends a record. Returns `false` if a row for this
    /// (`message_id`, `generation`, `attempt_number`) already exists.
    pub fn append(&self, record: &AuditRecord) -> Result<bool, StoreError> {
        let key = Self::key(&record.message_id, record.generation, record.attempt_number);
        let bytes = serde_json::to_vec(record)?;
        match self
            .tree
            .compare_and_swap(key, None::<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// All records for one message, ordered by generation then attempt
    /// number.
    pub fn for_message(&self, message_id: &str) -> Result<Vec<AuditRecord>, StoreError> {
        let prefix = format!("{message_id}/");
        self.tree
            .scan_prefix(prefix)
            .filter_map(|res| res.ok())
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn key(message_id: &str, generation: u32, attempt_number: u32) -> String {
        // Zero-padded so scan_prefix yields generations, then attempts,
        // in order.
        format!("{message_id}/{generation:03}/{attempt_number:03}")
    }
}

impl std::fmt::Debug for AuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditStore").finish()
    }
}
