use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sled::{Db, Tree};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::message::{
    AttemptOutcome, DeliveryAttempt, EnrichedMessage, Message, MessageId,
};
use crate::broker::retry::RetrySchedule;
use crate::broker::subscription::Subscription;
use crate::broker::topic::{SubscriptionBinding, Topic};
use crate::consumer::{Consumer, ConsumerOutcome, Delivery};
use crate::dlq::DeadLetterChannel;
use crate::metrics::{self, Metrics};
use crate::publisher::PublishTarget;
use crate::utils::error::{RequeueError, SendError, StoreError};

/// Durable fan-out engine.
///
/// On publish the broker persists the message, evaluates every
/// subscription's filter once, and runs one independent delivery driver per
/// matching (message, subscription) pair: invoke the consumer under a
/// timeout, back off through the subscription's tiered retry schedule on
/// failure, and dead-letter the pair once `max_receive_count` is exhausted.
/// Per-pair delivery state lives in a sled tree guarded by conditional
/// writes, so a pair is never driven twice.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    db: Db,
    messages: Tree,
    delivery_state: Tree,
    topics: RwLock<HashMap<String, Topic>>,
    consumer_timeout: Duration,
    dlq_retention_seconds: i64,
    metrics: Arc<Metrics>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl Broker {
    pub fn new(
        db: Db,
        consumer_timeout: Duration,
        dlq_retention_seconds: i64,
        metrics: Arc<Metrics>,
    ) -> Result<Self, StoreError> {
        let messages = db.open_tree("messages")?;
        let delivery_state = db.open_tree("delivery_state")?;
        Ok(Self {
            inner: Arc::new(BrokerInner {
                db,
                messages,
                delivery_state,
                topics: RwLock::new(HashMap::new()),
                consumer_timeout,
                dlq_retention_seconds,
                metrics,
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        })
    }

    /// Attaches a subscription to a topic, creating the topic if needed.
    ///
    /// Opens the subscription's dead-letter channel on its configured
    /// target. Subscriptions are immutable once registered.
    pub fn subscribe(
        &self,
        topic: &str,
        subscription: Subscription,
        consumer: Arc<Consumer>,
    ) -> Result<(), StoreError> {
        let dlq = DeadLetterChannel::open(
            &self.inner.db,
            &subscription.redrive_policy.dead_letter_target,
            self.inner.dlq_retention_seconds,
            self.inner.metrics.clone(),
        )?;
        let binding = Arc::new(SubscriptionBinding {
            subscription,
            consumer,
            dlq,
        });
        let mut topics = self.inner.topics.write().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .add(binding);
        Ok(())
    }

    /// Accepts an enriched message: assigns its broker id, persists it, and
    /// fans it out to every matching subscription.
    ///
    /// Returns as soon as the delivery drivers are spawned; everything past
    /// this boundary is asynchronous.
    pub fn publish(&self, topic: &str, enriched: EnrichedMessage) -> Result<MessageId, SendError> {
        let id: MessageId = Uuid::new_v4().to_string();
        let message = Message::accepted(id.clone(), enriched);

        let bytes =
            serde_json::to_vec(&message).map_err(|e| SendError::Malformed(e.to_string()))?;
        self.inner
            .messages
            .insert(id.as_str(), bytes)
            .map_err(|e| SendError::Storage(e.to_string()))?;

        let matching = {
            let topics = self.inner.topics.read().unwrap();
            match topics.get(topic) {
                Some(t) => t.matching(&message.attributes),
                None => Vec::new(),
            }
        };

        info!(
            correlation_id = %message.correlation_id,
            message_id = %id,
            topic = %topic,
            subscriptions = matching.len(),
            "message accepted"
        );

        for binding in matching {
            if self.claim_pair(&message.id, &binding.subscription.id) {
                self.spawn_delivery(binding, message.clone(), 0);
            }
        }

        Ok(id)
    }

    /// Moves a dead-lettered message back into delivery for its
    /// subscription, with the attempt counter reset to 1, a fresh retry
    /// schedule, and the delivery generation bumped so the new pass's
    /// audit rows do not collide with the old ones.
    pub fn requeue(
        &self,
        subscription_id: &str,
        message_id: &MessageId,
    ) -> Result<(), RequeueError> {
        let binding = self
            .find_binding(subscription_id)
            .ok_or_else(|| RequeueError::UnknownSubscription(subscription_id.to_string()))?;

        let entry = binding
            .dlq
            .take(message_id)?
            .ok_or_else(|| RequeueError::NotFound(message_id.clone()))?;

        let generation = self
            .delivery_state(message_id, subscription_id)?
            .map_or(1, |state| state.generation + 1);

        let pending = DeliveryAttempt {
            message_id: message_id.clone(),
            subscription_id: subscription_id.to_string(),
            generation,
            attempt_number: 1,
            outcome: AttemptOutcome::Pending,
            scheduled_at: Utc::now().timestamp_millis(),
        };
        self.record_state(&pending);

        info!(
            correlation_id = %entry.message.correlation_id,
            message_id = %message_id,
            subscription_id = %subscription_id,
            generation = generation,
            "requeued from dead-letter channel"
        );

        self.spawn_delivery(binding, entry.message, generation);
        Ok(())
    }

    /// Loads a stored message by id.
    pub fn message(&self, message_id: &MessageId) -> Result<Option<Message>, StoreError> {
        match self.inner.messages.get(message_id.as_str())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Latest recorded delivery state for a (message, subscription) pair.
    pub fn delivery_state(
        &self,
        message_id: &MessageId,
        subscription_id: &str,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        let key = pair_key(message_id, subscription_id);
        match self.inner.delivery_state.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Waits until every in-flight delivery driver has finished.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn find_binding(&self, subscription_id: &str) -> Option<Arc<SubscriptionBinding>> {
        let topics = self.inner.topics.read().unwrap();
        topics.values().find_map(|topic| {
            topic
                .subscriptions
                .iter()
                .find(|b| b.subscription.id == subscription_id)
                .cloned()
        })
    }

    /// Claims the (message, subscription) pair with a conditional write so
    /// no second driver can start for it.
    fn claim_pair(&self, message_id: &MessageId, subscription_id: &str) -> bool {
        let pending = DeliveryAttempt {
            message_id: message_id.clone(),
            subscription_id: subscription_id.to_string(),
            generation: 0,
            attempt_number: 1,
            outcome: AttemptOutcome::Pending,
            scheduled_at: Utc::now().timestamp_millis(),
        };
        let key = pair_key(message_id, subscription_id);
        let bytes = match serde_json::to_vec(&pending) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(message_id = %message_id, error = %err, "failed to encode delivery state");
                return false;
            }
        };
        match self
            .inner
            .delivery_state
            .compare_and_swap(key, None::<&[u8]>, Some(bytes))
        {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                debug!(
                    message_id = %message_id,
                    subscription_id = %subscription_id,
                    "pair already claimed; skipping"
                );
                false
            }
            Err(err) => {
                error!(message_id = %message_id, error = %err, "failed to claim delivery pair");
                false
            }
        }
    }

    fn record_state(&self, attempt: &DeliveryAttempt) {
        Self::record_state_inner(&self.inner, attempt);
    }

    fn record_state_inner(inner: &BrokerInner, attempt: &DeliveryAttempt) {
        match serde_json::to_vec(attempt) {
            Ok(bytes) => {
                let key = pair_key(&attempt.message_id, &attempt.subscription_id);
                if let Err(err) = inner.delivery_state.insert(key, bytes) {
                    error!(
                        message_id = %attempt.message_id,
                        error = %err,
                        "failed to record delivery state"
                    );
                }
            }
            Err(err) => {
                error!(message_id = %attempt.message_id, error = %err, "failed to encode delivery state");
            }
        }
    }

    fn spawn_delivery(&self, binding: Arc<SubscriptionBinding>, message: Message, generation: u32) {
        let inner = self.inner.clone();
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            drive(&inner, binding, message, generation).await;
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.drained.notify_one();
            }
        });
    }
}

fn pair_key(message_id: &str, subscription_id: &str) -> String {
    format!("{message_id}/{subscription_id}")
}

/// Delivery state machine for one (message, subscription) pair.
///
/// Scheduled → invoke consumer → Delivered, or Retry-Wait → Scheduled …
/// until success or `max_receive_count`, then Dead-Lettered. The consumer
/// call is a black box: the broker never inspects why it failed, and a
/// timeout counts as a failure while the invocation itself keeps running so
/// it can settle its idempotency reservation. Attempts are strictly
/// sequential in attempt number.
async fn drive(
    inner: &BrokerInner,
    binding: Arc<SubscriptionBinding>,
    message: Message,
    generation: u32,
) {
    let subscription = &binding.subscription;
    let max_receive_count = subscription.redrive_policy.max_receive_count.max(1);
    let mut schedule = RetrySchedule::new(subscription.retry_policy.clone());
    let mut history: Vec<DeliveryAttempt> = Vec::new();

    for attempt_number in 1..=max_receive_count {
        let mut attempt = DeliveryAttempt {
            message_id: message.id.clone(),
            subscription_id: subscription.id.clone(),
            generation,
            attempt_number,
            outcome: AttemptOutcome::Pending,
            scheduled_at: Utc::now().timestamp_millis(),
        };
        Broker::record_state_inner(inner, &attempt);
        metrics::incr(&inner.metrics.delivery_attempts);
        debug!(
            correlation_id = %message.correlation_id,
            message_id = %message.id,
            subscription_id = %subscription.id,
            attempt = attempt_number,
            "delivering"
        );

        let delivery = Delivery::from_message(&message, generation, attempt_number);
        let invoke = invoke_consumer(binding.consumer.clone(), delivery, inner.consumer_timeout);

        match invoke.await {
            ConsumerOutcome::Success => {
                attempt.outcome = AttemptOutcome::Success;
                Broker::record_state_inner(inner, &attempt);
                info!(
                    correlation_id = %message.correlation_id,
                    message_id = %message.id,
                    subscription_id = %subscription.id,
                    attempt = attempt_number,
                    "delivered"
                );
                return;
            }
            ConsumerOutcome::Failure => {
                attempt.outcome = AttemptOutcome::Failure;
                Broker::record_state_inner(inner, &attempt);
                history.push(attempt);

                if attempt_number == max_receive_count {
                    if let Err(err) = binding.dlq.enqueue(&message, &subscription.id, &history) {
                        error!(
                            correlation_id = %message.correlation_id,
                            message_id = %message.id,
                            error = %err,
                            "failed to dead-letter message"
                        );
                    }
                    return;
                }

                let delay = schedule.next_delay();
                debug!(
                    correlation_id = %message.correlation_id,
                    message_id = %message.id,
                    subscription_id = %subscription.id,
                    attempt = attempt_number,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Invokes the consumer as its own task so the timeout abandons the wait,
/// not the work: a timed-out invocation runs to completion in the
/// background and finalizes or releases its idempotency reservation, so a
/// later attempt is never wedged behind an orphaned placeholder.
async fn invoke_consumer(
    consumer: Arc<Consumer>,
    delivery: Delivery,
    limit: Duration,
) -> ConsumerOutcome {
    let correlation_id = delivery.correlation_id.clone();
    let message_id = delivery.message_id.clone();
    let attempt_number = delivery.attempt_number;

    let invocation = tokio::spawn(async move { consumer.on_delivery(&delivery).await });
    match timeout(limit, invocation).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            error!(
                correlation_id = %correlation_id,
                message_id = %message_id,
                attempt = attempt_number,
                error = %err,
                "consumer invocation task failed"
            );
            ConsumerOutcome::Failure
        }
        Err(_) => {
            warn!(
                correlation_id = %correlation_id,
                message_id = %message_id,
                attempt = attempt_number,
                timeout_ms = limit.as_millis() as u64,
                "consumer invocation timed out"
            );
            ConsumerOutcome::Failure
        }
    }
}

#[async_trait]
impl PublishTarget for Broker {
    async fn send(&self, topic: &str, message: EnrichedMessage) -> Result<MessageId, SendError> {
        self.publish(topic, message)
    }
}
