//! The `store` module provides the pipeline's persistence layer.
//!
//! Two concerns live here, each in its own sled tree:
//!
//! - the idempotency ledger, the single source of truth for "has this
//!   message been processed", built on sled's conditional writes so
//!   concurrent deliveries race safely;
//! - the append-only audit store, one record per terminal delivery attempt.

pub mod audit;
pub mod idempotency;

pub use audit::{AuditOutcome, AuditRecord, AuditStore};
pub use idempotency::{IdempotencyRecord, IdempotencyStore, Reservation};
