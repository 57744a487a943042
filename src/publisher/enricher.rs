use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::broker::message::{Attributes, EnrichedMessage};
use crate::utils::error::ValidationError;

/// Raw publish request as submitted by the original caller.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPublish {
    pub message: String,
    #[serde(default)]
    pub attributes: Option<Attributes>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Validates and decorates raw input into an [`EnrichedMessage`].
///
/// Pure: no I/O beyond object construction. Rejections never reach the
/// broker.
#[derive(Debug, Clone)]
pub struct Enricher {
    source: String,
    environment: String,
    max_payload_bytes: usize,
}

impl Enricher {
    pub fn new(source: &str, environment: &str, max_payload_bytes: usize) -> Self {
        Self {
            source: source.to_string(),
            environment: environment.to_string(),
            max_payload_bytes,
        }
    }

    /// Enriches a typed request.
    ///
    /// A caller-supplied correlation id passes through unchanged, so a
    /// client retrying its own request keeps one id end to end; otherwise a
    /// fresh one is assigned. `source` and `environment` attributes are
    /// stamped in only where the caller did not set them.
    pub fn enrich(&self, raw: RawPublish) -> Result<EnrichedMessage, ValidationError> {
        if raw.message.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }

        let payload = raw.message.into_bytes();
        if payload.len() > self.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        let correlation_id = raw
            .correlation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut attributes = raw.attributes.unwrap_or_default();
        attributes
            .entry("source".to_string())
            .or_insert_with(|| self.source.clone());
        attributes
            .entry("environment".to_string())
            .or_insert_with(|| self.environment.clone());

        Ok(EnrichedMessage {
            correlation_id,
            payload,
            attributes,
            published_at: Utc::now().timestamp_millis(),
        })
    }

    /// Enriches a JSON request body of the form
    /// `{ "message": string, "attributes"?: map, "correlation_id"?: string }`.
    pub fn enrich_json(&self, body: &str) -> Result<EnrichedMessage, ValidationError> {
        let raw: RawPublish = serde_json::from_str(body).map_err(|err| {
            if err.to_string().contains("missing field") {
                ValidationError::MissingField("message")
            } else {
                ValidationError::MalformedInput(err.to_string())
            }
        })?;
        self.enrich(raw)
    }
}
