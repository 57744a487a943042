//! The `consumer` module processes delivery attempts handed over by the
//! broker.
//!
//! Delivery is at-least-once, so the consumer reconciles it to effective
//! exactly-once: every invocation first races on the idempotency ledger's
//! atomic create-if-absent, and only the winner executes the business logic.
//! Losers either return the winner's cached success or report failure so the
//! broker's schedule re-delivers. Every terminal outcome writes one audit
//! row, keyed by attempt, without ever blocking the outcome itself.

pub mod handler;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub use handler::{Handler, HandlerError};

use crate::broker::message::{Attributes, CorrelationId, Message, MessageId};
use crate::metrics::{self, Metrics};
use crate::store::{AuditOutcome, AuditRecord, AuditStore, IdempotencyStore, Reservation};

/// How long a race loser polls for the winner's result before giving up and
/// deferring to the broker's retry schedule.
const RACE_POLL_INTERVAL: Duration = Duration::from_millis(25);
const RACE_POLL_ATTEMPTS: u32 = 40;

/// One delivery attempt as the broker hands it to the consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
    pub attributes: Attributes,
    /// Delivery generation of the pair; bumped each time the broker
    /// requeues the message from the dead-letter channel.
    pub generation: u32,
    pub attempt_number: u32,
}

impl Delivery {
    pub fn from_message(message: &Message, generation: u32, attempt_number: u32) -> Self {
        Self {
            message_id: message.id.clone(),
            correlation_id: message.correlation_id.clone(),
            payload: message.payload.clone(),
            attributes: message.attributes.clone(),
            generation,
            attempt_number,
        }
    }
}

/// What the consumer reports back to the broker for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerOutcome {
    Success,
    Failure,
}

/// A subscriber endpoint: business logic behind a [`Handler`], guarded by
/// the idempotency ledger, with an audit trail per attempt.
pub struct Consumer {
    handler: Arc<dyn Handler>,
    idempotency: IdempotencyStore,
    audit: AuditStore,
    metrics: Arc<Metrics>,
    race_poll_interval: Duration,
    race_poll_attempts: u32,
}

impl Consumer {
    pub fn new(
        handler: Arc<dyn Handler>,
        idempotency: IdempotencyStore,
        audit: AuditStore,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            handler,
            idempotency,
            audit,
            metrics,
            race_poll_interval: RACE_POLL_INTERVAL,
            race_poll_attempts: RACE_POLL_ATTEMPTS,
        }
    }

    /// Overrides the race-loser polling schedule.
    pub fn with_race_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.race_poll_interval = interval;
        self.race_poll_attempts = attempts;
        self
    }

    /// Processes one delivery attempt.
    ///
    /// The business logic runs at most once per message id; duplicate
    /// deliveries return the cached success without re-executing it.
    pub async fn on_delivery(&self, delivery: &Delivery) -> ConsumerOutcome {
        let started = Instant::now();

        let reservation = match self.idempotency.create_if_absent(&delivery.message_id) {
            Ok(reservation) => reservation,
            Err(err) => {
                error!(
                    correlation_id = %delivery.correlation_id,
                    message_id = %delivery.message_id,
                    error = %err,
                    "idempotency ledger unavailable; failing the attempt"
                );
                return ConsumerOutcome::Failure;
            }
        };

        match reservation {
            Reservation::Created => self.execute(delivery, started).await,
            Reservation::CompletedSuccess(_) => {
                metrics::incr(&self.metrics.duplicate_deliveries);
                debug!(
                    correlation_id = %delivery.correlation_id,
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt_number,
                    "duplicate delivery; returning cached success"
                );
                self.write_audit(delivery, AuditOutcome::Success, started);
                ConsumerOutcome::Success
            }
            Reservation::InFlight => self.await_winner(delivery, started).await,
        }
    }

    /// Runs the business logic while holding the placeholder reservation.
    async fn execute(&self, delivery: &Delivery, started: Instant) -> ConsumerOutcome {
        match self
            .handler
            .handle(&delivery.payload, &delivery.attributes)
            .await
        {
            Ok(summary) => {
                if let Err(err) = self.idempotency.finalize(&delivery.message_id, &summary) {
                    // The work is done; re-executing would be worse than a
                    // placeholder lingering until its TTL.
                    error!(
                        correlation_id = %delivery.correlation_id,
                        message_id = %delivery.message_id,
                        error = %err,
                        "failed to finalize idempotency record"
                    );
                }
                metrics::incr(&self.metrics.deliveries_succeeded);
                info!(
                    correlation_id = %delivery.correlation_id,
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt_number,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "message processed"
                );
                self.write_audit(delivery, AuditOutcome::Success, started);
                ConsumerOutcome::Success
            }
            Err(err) => {
                if let Err(release_err) = self.idempotency.release(&delivery.message_id) {
                    error!(
                        correlation_id = %delivery.correlation_id,
                        message_id = %delivery.message_id,
                        error = %release_err,
                        "failed to release idempotency placeholder"
                    );
                }
                metrics::incr(&self.metrics.deliveries_failed);
                warn!(
                    correlation_id = %delivery.correlation_id,
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt_number,
                    error = %err,
                    "business logic failed"
                );
                self.write_audit(delivery, AuditOutcome::Failure, started);
                ConsumerOutcome::Failure
            }
        }
    }

    /// Lost the reservation race: poll for the winner's result for a bounded
    /// window.
    async fn await_winner(&self, delivery: &Delivery, started: Instant) -> ConsumerOutcome {
        for _ in 0..self.race_poll_attempts {
            sleep(self.race_poll_interval).await;
            match self.idempotency.get(&delivery.message_id) {
                Ok(Some(record)) if record.is_success() => {
                    metrics::incr(&self.metrics.duplicate_deliveries);
                    debug!(
                        correlation_id = %delivery.correlation_id,
                        message_id = %delivery.message_id,
                        "winner finalized; returning cached success"
                    );
                    self.write_audit(delivery, AuditOutcome::Success, started);
                    return ConsumerOutcome::Success;
                }
                // Winner still running.
                Ok(Some(_)) => continue,
                // Winner released its placeholder: it failed.
                Ok(None) => break,
                Err(err) => {
                    error!(
                        correlation_id = %delivery.correlation_id,
                        message_id = %delivery.message_id,
                        error = %err,
                        "idempotency ledger read failed while awaiting winner"
                    );
                    break;
                }
            }
        }

        // The winner failed or is still running past our window; report
        // failure so the broker's schedule re-delivers.
        metrics::incr(&self.metrics.deliveries_failed);
        self.write_audit(delivery, AuditOutcome::Failure, started);
        ConsumerOutcome::Failure
    }

    /// Appends the audit row for this attempt. Fire-and-forget: a write
    /// failure is an observability gap, never a processing failure.
    fn write_audit(&self, delivery: &Delivery, outcome: AuditOutcome, started: Instant) {
        let record = AuditRecord {
            message_id: delivery.message_id.clone(),
            correlation_id: delivery.correlation_id.clone(),
            generation: delivery.generation,
            attempt_number: delivery.attempt_number,
            consumer_outcome: outcome,
            processing_duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now().timestamp_millis(),
        };
        match self.audit.append(&record) {
            Ok(true) => {}
            Ok(false) => {
                metrics::incr(&self.metrics.audit_write_failures);
                warn!(
                    correlation_id = %delivery.correlation_id,
                    message_id = %delivery.message_id,
                    generation = delivery.generation,
                    attempt = delivery.attempt_number,
                    "audit row for this attempt already exists; outcome not recorded"
                );
            }
            Err(err) => {
                metrics::incr(&self.metrics.audit_write_failures);
                warn!(
                    correlation_id = %delivery.correlation_id,
                    message_id = %delivery.message_id,
                    attempt = delivery.attempt_number,
                    error = %err,
                    "failed to write audit record"
                );
            }
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("race_poll_interval", &self.race_poll_interval)
            .field("race_poll_attempts", &self.race_poll_attempts)
            .finish()
    }
}
