use async_trait::async_trait;
use thiserror::Error;

use crate::broker::message::Attributes;

/// Business-logic failure reported by a handler.
#[derive(Debug, Clone, Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// The business logic a subscription executes per message.
///
/// The pipeline treats this as a black box: it may block on downstream I/O,
/// and a timed-out invocation can keep running in the background after the
/// broker has already counted the attempt as failed. Correctness therefore
/// rests on the idempotency ledger, not on cancellation.
///
/// On success, implementations return a short summary that is cached in the
/// idempotency record and replayed to duplicate deliveries.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, payload: &[u8], attributes: &Attributes)
    -> Result<String, HandlerError>;
}
