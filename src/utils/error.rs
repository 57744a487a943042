//! The `error` module defines the error types used across the pipeline.
//!
//! Errors are grouped by the component that produces them: validation errors
//! never leave the enricher/publisher boundary, send errors drive the
//! publisher's retry loop, and store errors wrap the persistence layer.

use std::time::Duration;

use thiserror::Error;

/// Rejection of raw input before it ever reaches the broker.
///
/// These are surfaced synchronously to the original caller and are never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message cannot be empty")]
    EmptyMessage,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("payload size ({size} bytes) exceeds limit ({limit} bytes)")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Failure of a single send from the publisher to the broker.
///
/// Only the retryable variants consume the publisher's retry budget;
/// the rest fail fast.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker throttled the request")]
    Throttled,

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl SendError {
    /// Whether the publisher should retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendError::Unavailable(_)
                | SendError::Throttled
                | SendError::Timeout(_)
                | SendError::Storage(_)
        )
    }
}

/// Failure inside the sled-backed stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sled(#[from] sled::Error),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failure to requeue a dead-lettered message.
#[derive(Debug, Error)]
pub enum RequeueError {
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("message {0} not found in dead-letter channel")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
