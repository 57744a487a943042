use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;

use super::Broker;
use crate::broker::message::{AttemptOutcome, Attributes, EnrichedMessage};
use crate::broker::retry::RetrySchedule;
use crate::broker::subscription::{
    BackoffFunction, FilterPolicy, RedrivePolicy, RetryPolicy, Subscription,
};
use crate::consumer::{Consumer, Handler, HandlerError};
use crate::dlq::DeadLetterChannel;
use crate::metrics::Metrics;
use crate::store::{AuditOutcome, AuditStore, IdempotencyStore};

#[test]
fn test_filter_policy_and_across_keys_or_within_values() {
    let policy = FilterPolicy::match_all()
        .with_rule("environment", ["prod", "staging"])
        .with_rule("message_type", ["order"]);

    let mut attrs: Attributes = BTreeMap::new();
    attrs.insert("environment".to_string(), "staging".to_string());
    attrs.insert("message_type".to_string(), "order".to_string());
    assert!(policy.matches(&attrs));

    // OR within a key's value set.
    attrs.insert("environment".to_string(), "prod".to_string());
    assert!(policy.matches(&attrs));

    // AND across keys: one missing key fails the whole policy.
    attrs.remove("message_type");
    assert!(!policy.matches(&attrs));
}

#[test]
fn test_filter_policy_rejects_unaccepted_value() {
    let policy = FilterPolicy::match_all().with_rule("environment", ["prod"]);
    let mut attrs: Attributes = BTreeMap::new();
    attrs.insert("environment".to_string(), "dev".to_string());
    assert!(!policy.matches(&attrs));
}

#[test]
fn test_absent_filter_policy_matches_everything() {
    let policy = FilterPolicy::match_all();
    assert!(policy.is_empty());
    assert!(policy.matches(&BTreeMap::new()));

    let mut attrs: Attributes = BTreeMap::new();
    attrs.insert("anything".to_string(), "at all".to_string());
    assert!(policy.matches(&attrs));
}

#[test]
fn test_retry_schedule_consumes_pools_in_order() {
    let policy = RetryPolicy {
        min_delay_ms: 100,
        max_delay_ms: 900,
        num_retries: 6,
        num_no_delay_retries: 2,
        num_min_delay_retries: 1,
        num_max_delay_retries: 1,
        backoff_function: BackoffFunction::Linear,
    };
    let mut schedule = RetrySchedule::new(policy);

    assert_eq!(schedule.next_delay(), Duration::ZERO);
    assert_eq!(schedule.next_delay(), Duration::ZERO);
    assert_eq!(schedule.next_delay(), Duration::from_millis(100));
    assert_eq!(schedule.next_delay(), Duration::from_millis(900));

    // Pools drained; computed delays take over and never decrease.
    let mut previous = schedule.next_delay();
    for _ in 0..5 {
        let next = schedule.next_delay();
        assert!(next >= previous);
        previous = next;
    }
}

#[test]
fn test_retry_schedule_exponential_caps_at_max() {
    let policy = RetryPolicy {
        min_delay_ms: 100,
        max_delay_ms: 400,
        num_retries: 5,
        num_no_delay_retries: 0,
        num_min_delay_retries: 0,
        num_max_delay_retries: 0,
        backoff_function: BackoffFunction::Exponential,
    };
    let mut schedule = RetrySchedule::new(policy);

    assert_eq!(schedule.next_delay(), Duration::from_millis(100));
    assert_eq!(schedule.next_delay(), Duration::from_millis(200));
    assert_eq!(schedule.next_delay(), Duration::from_millis(400));
    assert_eq!(schedule.next_delay(), Duration::from_millis(400));
}

#[test]
fn test_retry_schedule_linear_reaches_max() {
    let policy = RetryPolicy {
        min_delay_ms: 100,
        max_delay_ms: 1_000,
        num_retries: 4,
        num_no_delay_retries: 0,
        num_min_delay_retries: 0,
        num_max_delay_retries: 0,
        backoff_function: BackoffFunction::Linear,
    };
    let mut schedule = RetrySchedule::new(policy);

    let mut previous = Duration::ZERO;
    for _ in 0..4 {
        let next = schedule.next_delay();
        assert!(next >= previous);
        previous = next;
    }
    assert_eq!(previous, Duration::from_millis(1_000));
}

/// Returns scripted outcomes in order, then keeps succeeding.
struct ScriptedHandler {
    outcomes: Mutex<VecDeque<Result<String, HandlerError>>>,
    executions: AtomicU32,
    delay: Duration,
}

impl ScriptedHandler {
    fn new(outcomes: Vec<Result<String, HandlerError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            executions: AtomicU32::new(0),
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
            executions: AtomicU32::new(0),
            delay,
        })
    }

    fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn handle(
        &self,
        _payload: &[u8],
        _attributes: &Attributes,
    ) -> Result<String, HandlerError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("ok".to_string()))
    }
}

struct BrokerRig {
    _dir: tempfile::TempDir,
    db: sled::Db,
    broker: Broker,
    metrics: Arc<Metrics>,
}

fn broker_rig(consumer_timeout: Duration) -> BrokerRig {
    let dir = tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let metrics = Arc::new(Metrics::new());
    let broker = Broker::new(db.clone(), consumer_timeout, 3_600, metrics.clone()).unwrap();
    BrokerRig {
        _dir: dir,
        db,
        broker,
        metrics,
    }
}

/// Retry policy whose delays are all zero, to keep tests fast.
fn instant_retries() -> RetryPolicy {
    RetryPolicy {
        min_delay_ms: 0,
        max_delay_ms: 0,
        num_retries: 10,
        num_no_delay_retries: 10,
        num_min_delay_retries: 0,
        num_max_delay_retries: 0,
        backoff_function: BackoffFunction::Linear,
    }
}

fn subscription(id: &str, filter_policy: FilterPolicy, max_receive_count: u32) -> Subscription {
    Subscription {
        id: id.to_string(),
        filter_policy,
        retry_policy: instant_retries(),
        redrive_policy: RedrivePolicy {
            max_receive_count,
            dead_letter_target: format!("{id}-dlq"),
        },
    }
}

struct Attached {
    handler: Arc<ScriptedHandler>,
    idempotency: IdempotencyStore,
    audit: AuditStore,
    dlq: DeadLetterChannel,
}

fn attach(rig: &BrokerRig, topic: &str, sub: Subscription, handler: Arc<ScriptedHandler>) -> Attached {
    let idempotency = IdempotencyStore::open(&rig.db, 3_600).unwrap();
    let audit = AuditStore::open(&rig.db).unwrap();
    let dlq = DeadLetterChannel::open(
        &rig.db,
        &sub.redrive_policy.dead_letter_target,
        3_600,
        rig.metrics.clone(),
    )
    .unwrap();
    let consumer = Arc::new(
        Consumer::new(
            handler.clone(),
            idempotency.clone(),
            audit.clone(),
            rig.metrics.clone(),
        )
        .with_race_poll(Duration::from_millis(10), 30),
    );
    rig.broker.subscribe(topic, sub, consumer).unwrap();
    Attached {
        handler,
        idempotency,
        audit,
        dlq,
    }
}

fn enriched(attrs: &[(&str, &str)]) -> EnrichedMessage {
    let mut attributes: Attributes = BTreeMap::new();
    for (key, value) in attrs {
        attributes.insert(key.to_string(), value.to_string());
    }
    EnrichedMessage {
        correlation_id: "corr-1".to_string(),
        payload: b"hello".to_vec(),
        attributes,
        published_at: 1_725_000_000_000,
    }
}

#[tokio::test]
async fn test_delivery_succeeds_on_first_attempt() {
    let rig = broker_rig(Duration::from_millis(500));
    let attached = attach(
        &rig,
        "events",
        subscription("sub-1", FilterPolicy::match_all(), 3),
        ScriptedHandler::new(vec![]),
    );

    let message_id = rig.broker.publish("events", enriched(&[])).unwrap();
    rig.broker.drain().await;

    assert_eq!(attached.handler.executions(), 1);
    let state = rig
        .broker
        .delivery_state(&message_id, "sub-1")
        .unwrap()
        .unwrap();
    assert_eq!(state.outcome, AttemptOutcome::Success);
    assert_eq!(state.attempt_number, 1);
    assert_eq!(attached.audit.for_message(&message_id).unwrap().len(), 1);
    assert!(attached.dlq.is_empty());
}

#[tokio::test]
async fn test_fails_twice_then_succeeds() {
    let rig = broker_rig(Duration::from_millis(500));
    let attached = attach(
        &rig,
        "events",
        subscription(
            "sub-1",
            FilterPolicy::match_all().with_rule("environment", ["dev"]),
            3,
        ),
        ScriptedHandler::new(vec![
            Err(HandlerError::new("attempt 1 fails")),
            Err(HandlerError::new("attempt 2 fails")),
            Ok("processed".to_string()),
        ]),
    );

    let message_id = rig
        .broker
        .publish("events", enriched(&[("environment", "dev")]))
        .unwrap();
    rig.broker.drain().await;

    let audits = attached.audit.for_message(&message_id).unwrap();
    assert_eq!(audits.len(), 3);
    assert_eq!(audits[0].consumer_outcome, AuditOutcome::Failure);
    assert_eq!(audits[1].consumer_outcome, AuditOutcome::Failure);
    assert_eq!(audits[2].consumer_outcome, AuditOutcome::Success);

    let record = attached.idempotency.get(&message_id).unwrap().unwrap();
    assert_eq!(record.result.as_deref(), Some("processed"));

    assert!(attached.dlq.is_empty());
    let state = rig
        .broker
        .delivery_state(&message_id, "sub-1")
        .unwrap()
        .unwrap();
    assert_eq!(state.outcome, AttemptOutcome::Success);
    assert_eq!(state.attempt_number, 3);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter() {
    let rig = broker_rig(Duration::from_millis(500));
    let attached = attach(
        &rig,
        "events",
        subscription(
            "sub-1",
            FilterPolicy::match_all().with_rule("environment", ["dev"]),
            3,
        ),
        ScriptedHandler::new(vec![
            Err(HandlerError::new("fail")),
            Err(HandlerError::new("fail")),
            Err(HandlerError::new("fail")),
        ]),
    );

    let message_id = rig
        .broker
        .publish("events", enriched(&[("environment", "dev")]))
        .unwrap();
    rig.broker.drain().await;

    // Exactly max_receive_count attempts, then exactly one DLQ entry.
    assert_eq!(attached.handler.executions(), 3);
    let entries = attached.dlq.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.id, message_id);
    assert_eq!(entries[0].attempt_history.len(), 3);

    let audits = attached.audit.for_message(&message_id).unwrap();
    assert_eq!(audits.len(), 3);
    assert!(audits
        .iter()
        .all(|a| a.consumer_outcome == AuditOutcome::Failure));

    // No finalized success record remains.
    assert!(attached.idempotency.get(&message_id).unwrap().is_none());
    assert_eq!(rig.metrics.dlq_enqueued.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_filter_mismatch_never_enters_delivery() {
    let rig = broker_rig(Duration::from_millis(500));
    let attached = attach(
        &rig,
        "events",
        subscription(
            "sub-1",
            FilterPolicy::match_all().with_rule("environment", ["prod"]),
            3,
        ),
        ScriptedHandler::new(vec![]),
    );

    let message_id = rig
        .broker
        .publish("events", enriched(&[("environment", "dev")]))
        .unwrap();
    rig.broker.drain().await;

    assert_eq!(attached.handler.executions(), 0);
    // No Pending state was ever created for the pair.
    assert!(rig
        .broker
        .delivery_state(&message_id, "sub-1")
        .unwrap()
        .is_none());
    assert!(attached.audit.for_message(&message_id).unwrap().is_empty());
    assert!(attached.dlq.is_empty());
}

#[tokio::test]
async fn test_fanout_is_per_subscription() {
    let rig = broker_rig(Duration::from_millis(500));
    let all = attach(
        &rig,
        "events",
        subscription("sub-all", FilterPolicy::match_all(), 3),
        ScriptedHandler::new(vec![]),
    );
    let orders_only = attach(
        &rig,
        "events",
        subscription(
            "sub-orders",
            FilterPolicy::match_all().with_rule("message_type", ["order"]),
            3,
        ),
        ScriptedHandler::new(vec![]),
    );

    rig.broker
        .publish("events", enriched(&[("message_type", "event")]))
        .unwrap();
    rig.broker.drain().await;

    assert_eq!(all.handler.executions(), 1);
    assert_eq!(orders_only.handler.executions(), 0);
}

#[tokio::test]
async fn test_consumer_timeout_counts_as_failure() {
    let rig = broker_rig(Duration::from_millis(40));
    let attached = attach(
        &rig,
        "events",
        subscription("sub-1", FilterPolicy::match_all(), 1),
        ScriptedHandler::slow(Duration::from_millis(300)),
    );

    rig.broker.publish("events", enriched(&[])).unwrap();
    rig.broker.drain().await;

    assert_eq!(attached.handler.executions(), 1);
    assert_eq!(attached.dlq.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_timed_out_attempt_settles_ledger_for_retry() {
    let rig = broker_rig(Duration::from_millis(100));
    let attached = attach(
        &rig,
        "events",
        subscription("sub-1", FilterPolicy::match_all(), 3),
        ScriptedHandler::slow(Duration::from_millis(150)),
    );

    let message_id = rig.broker.publish("events", enriched(&[])).unwrap();
    rig.broker.drain().await;

    // The first attempt times out, but its invocation keeps running and
    // finalizes the reservation, so a retry picks up the cached success
    // instead of wedging on an orphaned placeholder.
    assert_eq!(attached.handler.executions(), 1);
    assert!(attached.dlq.is_empty());
    let record = attached.idempotency.get(&message_id).unwrap().unwrap();
    assert!(record.is_success());
    let state = rig
        .broker
        .delivery_state(&message_id, "sub-1")
        .unwrap()
        .unwrap();
    assert_eq!(state.outcome, AttemptOutcome::Success);
}

#[tokio::test]
async fn test_requeue_restarts_with_fresh_attempts() {
    let rig = broker_rig(Duration::from_millis(500));
    let attached = attach(
        &rig,
        "events",
        subscription("sub-1", FilterPolicy::match_all(), 1),
        ScriptedHandler::new(vec![Err(HandlerError::new("first pass fails"))]),
    );

    let message_id = rig.broker.publish("events", enriched(&[])).unwrap();
    rig.broker.drain().await;
    assert_eq!(attached.dlq.list().unwrap().len(), 1);

    rig.broker.requeue("sub-1", &message_id).unwrap();
    rig.broker.drain().await;

    assert!(attached.dlq.is_empty());
    let state = rig
        .broker
        .delivery_state(&message_id, "sub-1")
        .unwrap()
        .unwrap();
    assert_eq!(state.outcome, AttemptOutcome::Success);
    assert_eq!(state.generation, 1);
    assert_eq!(state.attempt_number, 1);
    assert_eq!(attached.handler.executions(), 2);

    // The requeued pass keeps its own audit rows alongside the first
    // pass's; the successful outcome is recorded, not dropped.
    let audits = attached.audit.for_message(&message_id).unwrap();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[0].generation, 0);
    assert_eq!(audits[0].consumer_outcome, AuditOutcome::Failure);
    assert_eq!(audits[1].generation, 1);
    assert_eq!(audits[1].consumer_outcome, AuditOutcome::Success);
}

#[tokio::test]
async fn test_requeue_unknown_message_errors() {
    let rig = broker_rig(Duration::from_millis(500));
    attach(
        &rig,
        "events",
        subscription("sub-1", FilterPolicy::match_all(), 1),
        ScriptedHandler::new(vec![]),
    );

    let err = rig.broker.requeue("sub-1", &"missing".to_string());
    assert!(err.is_err());
}

#[tokio::test]
async fn test_publish_without_subscriptions_accepts_message() {
    let rig = broker_rig(Duration::from_millis(500));

    let message_id = rig.broker.publish("nowhere", enriched(&[])).unwrap();
    rig.broker.drain().await;

    // The message is stored even though it fanned out to nothing.
    assert!(rig.broker.message(&message_id).unwrap().is_some());
}
