use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use courier::broker::Broker;
use courier::broker::message::Attributes;
use courier::config::load_config;
use courier::consumer::{Consumer, Handler, HandlerError};
use courier::dlq::DeadLetterChannel;
use courier::metrics::Metrics;
use courier::publisher::{Enricher, Publisher, RawPublish};
use courier::store::{AuditStore, IdempotencyStore};
use courier::utils::logging;

/// Demo business logic: counts words in the payload.
struct WordCountHandler;

#[async_trait]
impl Handler for WordCountHandler {
    async fn handle(
        &self,
        payload: &[u8],
        _attributes: &Attributes,
    ) -> Result<String, HandlerError> {
        let text = String::from_utf8_lossy(payload);
        let words = text.split_whitespace().count();
        Ok(format!("word_count={words}"))
    }
}

#[tokio::main]
async fn main() {
    let settings = load_config().expect("Failed to load configuration");
    logging::init(&settings.pipeline.log_level);

    let db = sled::open(&settings.pipeline.data_dir).expect("Failed to open database");
    let metrics = Arc::new(Metrics::new());

    let broker = Broker::new(
        db.clone(),
        Duration::from_millis(settings.pipeline.consumer_timeout_ms),
        settings.pipeline.dlq_retention_secs,
        metrics.clone(),
    )
    .expect("Failed to start broker");

    for sub_settings in &settings.subscriptions {
        let idempotency = IdempotencyStore::open(&db, settings.pipeline.idempotency_ttl_secs)
            .expect("Failed to open idempotency store");
        let audit = AuditStore::open(&db).expect("Failed to open audit store");
        let consumer = Arc::new(Consumer::new(
            Arc::new(WordCountHandler),
            idempotency,
            audit,
            metrics.clone(),
        ));
        broker
            .subscribe(&sub_settings.topic, sub_settings.to_subscription(), consumer)
            .expect("Failed to register subscription");
    }

    let enricher = Enricher::new(
        &settings.pipeline.source,
        &settings.pipeline.environment,
        settings.pipeline.max_payload_bytes,
    );
    let publisher = Publisher::new(
        Arc::new(broker.clone()),
        &settings.publisher.topic,
        settings.publisher.max_attempts,
        Duration::from_millis(settings.publisher.base_delay_ms),
        Duration::from_millis(settings.publisher.max_delay_ms),
        metrics.clone(),
    );

    let raw = RawPublish {
        message: "hello from courier".to_string(),
        attributes: None,
        correlation_id: None,
    };
    match enricher.enrich(raw) {
        Ok(enriched) => {
            let result = publisher.publish(enriched).await;
            info!(?result, "demo publish finished");
        }
        Err(err) => {
            info!(error = %err, "demo publish rejected");
        }
    }

    broker.drain().await;

    // Maintenance: age out expired ledger entries and surface any
    // dead-letter retention losses.
    let ledger = IdempotencyStore::open(&db, settings.pipeline.idempotency_ttl_secs)
        .expect("Failed to open idempotency store");
    if let Ok(removed) = ledger.cleanup_expired() {
        if removed > 0 {
            info!(removed, "expired idempotency records removed");
        }
    }
    for sub_settings in &settings.subscriptions {
        if let Ok(dlq) = DeadLetterChannel::open(
            &db,
            &sub_settings.dead_letter_target,
            settings.pipeline.dlq_retention_secs,
            metrics.clone(),
        ) {
            let _ = dlq.sweep_expired();
        }
    }

    info!(snapshot = ?metrics.snapshot(), "pipeline counters");
}
