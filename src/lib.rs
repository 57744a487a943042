//! # Courier
//!
//! `courier` is a publish/subscribe message-delivery pipeline built with Rust.
//! A producer enriches and publishes discrete messages; the broker durably
//! fans them out to subscriptions under attribute filtering rules; each
//! consumer processes a message effectively once despite at-least-once
//! delivery, persists an audit record, and reports success or failure.
//! Failures are retried with tiered backoff and, past a limit, routed to a
//! dead-letter channel for manual recovery.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `publisher`: Validates and decorates raw input, then sends it to the broker with retry/backoff.
//! - `broker`: The fan-out engine that manages topics, subscriptions, filtering, and delivery retries.
//! - `consumer`: Processes delivery attempts exactly-effectively-once against the idempotency ledger.
//! - `store`: Sled-backed idempotency ledger and append-only audit trail.
//! - `dlq`: Terminal store for deliveries that exhausted their retry budget.
//! - `config`: Handles loading and managing pipeline configuration.
//! - `metrics`: Process-local counters read by external monitoring.
//! - `utils`: Contains shared utilities, such as error handling and logging setup.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod metrics;
pub mod publisher;
pub mod store;
pub mod utils;
