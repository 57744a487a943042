use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::enricher::{Enricher, RawPublish};
use super::{PublishResult, PublishTarget, Publisher};
use crate::broker::message::{EnrichedMessage, MessageId};
use crate::metrics::Metrics;
use crate::utils::error::{SendError, ValidationError};

fn enricher() -> Enricher {
    Enricher::new("test-publisher", "dev", 1024)
}

#[test]
fn test_enrich_assigns_correlation_id() {
    let enriched = enricher()
        .enrich(RawPublish {
            message: "hello".to_string(),
            attributes: None,
            correlation_id: None,
        })
        .unwrap();

    assert!(!enriched.correlation_id.is_empty());
    assert_eq!(enriched.payload, b"hello");
    assert!(enriched.published_at > 0);
}

#[test]
fn test_enrich_keeps_caller_correlation_id() {
    let enriched = enricher()
        .enrich(RawPublish {
            message: "hello".to_string(),
            attributes: None,
            correlation_id: Some("client-retry-7".to_string()),
        })
        .unwrap();

    // Idempotent enrichment for retried client requests.
    assert_eq!(enriched.correlation_id, "client-retry-7");
}

#[test]
fn test_enrich_stamps_default_attributes() {
    let enriched = enricher()
        .enrich(RawPublish {
            message: "hello".to_string(),
            attributes: None,
            correlation_id: None,
        })
        .unwrap();

    assert_eq!(
        enriched.attributes.get("source").map(String::as_str),
        Some("test-publisher")
    );
    assert_eq!(
        enriched.attributes.get("environment").map(String::as_str),
        Some("dev")
    );
}

#[test]
fn test_enrich_does_not_override_caller_attributes() {
    let mut attributes = std::collections::BTreeMap::new();
    attributes.insert("environment".to_string(), "prod".to_string());

    let enriched = enricher()
        .enrich(RawPublish {
            message: "hello".to_string(),
            attributes: Some(attributes),
            correlation_id: None,
        })
        .unwrap();

    assert_eq!(
        enriched.attributes.get("environment").map(String::as_str),
        Some("prod")
    );
}

#[test]
fn test_enrich_rejects_empty_message() {
    let err = enricher()
        .enrich(RawPublish {
            message: "   ".to_string(),
            attributes: None,
            correlation_id: None,
        })
        .unwrap_err();
    assert_eq!(err, ValidationError::EmptyMessage);
}

#[test]
fn test_enrich_rejects_oversized_payload() {
    let err = enricher()
        .enrich(RawPublish {
            message: "x".repeat(2048),
            attributes: None,
            correlation_id: None,
        })
        .unwrap_err();
    assert_eq!(
        err,
        ValidationError::PayloadTooLarge {
            size: 2048,
            limit: 1024
        }
    );
}

#[test]
fn test_enrich_json_missing_message_field() {
    let err = enricher().enrich_json(r#"{"attributes": {}}"#).unwrap_err();
    assert_eq!(err, ValidationError::MissingField("message"));
}

#[test]
fn test_enrich_json_malformed_body() {
    let err = enricher().enrich_json("not json at all").unwrap_err();
    assert!(matches!(err, ValidationError::MalformedInput(_)));
}

#[test]
fn test_enrich_json_happy_path() {
    let enriched = enricher()
        .enrich_json(r#"{"message": "hello", "attributes": {"message_type": "order"}}"#)
        .unwrap();
    assert_eq!(enriched.payload, b"hello");
    assert_eq!(
        enriched.attributes.get("message_type").map(String::as_str),
        Some("order")
    );
}

/// Fails a configured number of sends before accepting.
struct FlakyTarget {
    failures_remaining: AtomicU32,
    error: SendError,
    calls: AtomicU32,
}

impl FlakyTarget {
    fn new(failures: u32, error: SendError) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicU32::new(failures),
            error,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishTarget for FlakyTarget {
    async fn send(&self, _topic: &str, _message: EnrichedMessage) -> Result<MessageId, SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            Err(self.error.clone())
        } else {
            Ok("broker-id-1".to_string())
        }
    }
}

fn publisher(target: Arc<dyn PublishTarget>, max_attempts: u32) -> Publisher {
    Publisher::new(
        target,
        "events",
        max_attempts,
        Duration::from_millis(1),
        Duration::from_millis(5),
        Arc::new(Metrics::new()),
    )
}

fn sample_message() -> EnrichedMessage {
    enricher()
        .enrich(RawPublish {
            message: "hello".to_string(),
            attributes: None,
            correlation_id: None,
        })
        .unwrap()
}

#[tokio::test]
async fn test_publish_succeeds_first_attempt() {
    let target = FlakyTarget::new(0, SendError::Throttled);
    let result = publisher(target.clone(), 4).publish(sample_message()).await;

    match result {
        PublishResult::Published {
            message_id,
            attempts,
        } => {
            assert_eq!(message_id, "broker-id-1");
            assert_eq!(attempts, 1);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(target.calls(), 1);
}

#[tokio::test]
async fn test_publish_retries_transient_failures() {
    let target = FlakyTarget::new(2, SendError::Unavailable("connection refused".to_string()));
    let result = publisher(target.clone(), 4).publish(sample_message()).await;

    match result {
        PublishResult::Published { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected success after retries, got {other:?}"),
    }
    assert_eq!(target.calls(), 3);
}

#[tokio::test]
async fn test_publish_exhausts_retry_ceiling() {
    let target = FlakyTarget::new(10, SendError::Throttled);
    let result = publisher(target.clone(), 3).publish(sample_message()).await;

    match result {
        PublishResult::Failed {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.is_retryable());
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(target.calls(), 3);
}

#[tokio::test]
async fn test_publish_fails_fast_on_non_retryable() {
    let target = FlakyTarget::new(10, SendError::Unauthorized("bad credentials".to_string()));
    let result = publisher(target.clone(), 4).publish(sample_message()).await;

    match result {
        PublishResult::Failed {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 1);
            assert!(!last_error.is_retryable());
        }
        other => panic!("expected fail-fast, got {other:?}"),
    }
    // No retry budget was consumed.
    assert_eq!(target.calls(), 1);
}

#[test]
fn test_send_error_classification() {
    assert!(SendError::Throttled.is_retryable());
    assert!(SendError::Unavailable("x".to_string()).is_retryable());
    assert!(SendError::Timeout(Duration::from_secs(1)).is_retryable());
    assert!(!SendError::Malformed("x".to_string()).is_retryable());
    assert!(!SendError::Unauthorized("x".to_string()).is_retryable());
}
