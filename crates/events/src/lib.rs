//! Outbox events as written by the producing application.
//!
//! The application appends [`NewOutboxEvent`]s inside its own transactions; the
//! relay reads them back as [`OutboxEvent`]s and bridges each one into a job
//! whose payload is an [`EventPayload`].

pub mod envelope;
pub mod event;
pub mod status;

pub use envelope::EventPayload;
pub use event::{NewOutboxEvent, OutboxEvent};
pub use status::{ProcessStatus, QueueStatus};
