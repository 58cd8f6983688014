//! Infrastructure layer: stores, the outbox bridge, workers, stats and config.
//!
//! Every store has an in-memory implementation (tests, benches, single-process
//! use) and a Postgres implementation behind the same trait.

pub mod bridge;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod jobs;
pub mod outbox;
pub mod postgres;
pub mod stats;

#[cfg(test)]
mod integration_tests;

pub use bridge::{BridgeConfig, BridgeReport, EventRoutes, OutboxBridge, Route};
pub use config::{ConfigError, RelayConfig};
pub use error::StoreError;
pub use stats::{Alert, Liveness, StatsConfig, StatsReport, StatsService, WorkerHealth};
