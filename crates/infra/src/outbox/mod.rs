//! Transactional event outbox.
//!
//! The application appends rows; the relay only reads them and flips
//! `queue_status` once a row has been turned into a job.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryOutbox;
pub use postgres::PostgresOutbox;
pub use r#trait::{OutboxCounts, OutboxStore};
