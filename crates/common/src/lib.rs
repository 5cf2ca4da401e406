//! Shared configuration, error types, IDs, and observability primitives for FLQ crates.
//!
//! Architecture role:
//! - defines task-manager/node configuration passed across layers
//! - provides common [`FlqError`] / [`Result`] contracts
//! - hosts typed task/query identifiers and worker metrics
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::{NodeConfig, TaskManagerConfig};
pub use error::{FlqError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
