#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for DFQ crates.
//!
//! Architecture role:
//! - defines remote-task and coordinator communication configuration passed across layers
//! - provides common [`DfqError`] / [`Result`] contracts
//! - hosts the controller metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Remote-task and coordinator communication configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{CommunicationConfig, RemoteTaskConfig};
pub use error::{DfqError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
