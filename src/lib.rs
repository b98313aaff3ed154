//! Local process supervisor with a durable state store.

#![warn(unused_crate_dependencies)]
use strum as _;
// Test dependencies are only used in test code
#[cfg(test)]
use tempfile as _;
#[cfg(test)]
use tracing_subscriber as _;

/// Config loading.
pub mod config;

/// Errors.
pub mod error;

/// Event stream.
pub mod events;

/// Error categorization and review.
pub mod errorsink;

/// Group orchestration.
pub mod groups;

/// Log ingestion and queries.
pub mod logsink;

/// Metrics.
pub mod metrics;

/// Health probing.
pub mod prober;

/// Persistent store.
pub mod store;

/// Process supervision.
pub mod supervisor;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
