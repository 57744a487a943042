//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `courier` application.
//!
//! This module centralizes the pipeline's error taxonomy and the tracing
//! setup so each component reports errors and log lines the same way.

pub mod error;
pub mod logging;
