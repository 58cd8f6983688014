//! Worker liveness registry.
//!
//! One row per worker identity, overwritten on every beat. Beats are sent on a
//! fixed cadence whether or not there is work, so "idle" and "dead" stay
//! distinguishable.

pub mod beat;
pub mod postgres;
pub mod store;

pub use beat::Heartbeater;
pub use postgres::PostgresHeartbeats;
pub use store::{Heartbeat, HeartbeatStore, InMemoryHeartbeats, WorkerStatus};
