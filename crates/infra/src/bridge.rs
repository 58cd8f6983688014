//! Outbox → job queue bridge.
//!
//! Each cycle reads unbridged outbox rows oldest first and enqueues one job per
//! row with `source_event_id` set. The queue's uniqueness on
//! `source_event_id` makes a second insert for the same row come back as
//! `Duplicate`, which the bridge treats as confirmation and marks the row
//! bridged. Any number of bridges can run against the same outbox.
//!
//! Both steps are idempotent, so an infrastructure error simply aborts the
//! cycle; the next tick picks up where it stopped. A row the queue refuses
//! outright is marked rejected in the outbox and never scanned again.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use jobrelay_core::DomainError;
use jobrelay_events::{EventPayload, OutboxEvent};

use crate::error::StoreError;
use crate::jobs::{DEFAULT_MAX_ATTEMPTS, EnqueueOutcome, JobQueue, NewJob};
use crate::outbox::OutboxStore;

/// Where an event goes in the job queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub job_type: String,
    /// Overrides the bridge's default when set.
    pub max_attempts: Option<u32>,
}

/// `event_name` → job routing. Unrouted events become jobs whose type is the
/// event name itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRoutes {
    routes: HashMap<String, Route>,
}

impl EventRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(
        self,
        event_name: impl Into<String>,
        job_type: impl Into<String>,
    ) -> Result<Self, DomainError> {
        self.insert(event_name.into(), job_type.into(), None)
    }

    pub fn route_with_attempts(
        self,
        event_name: impl Into<String>,
        job_type: impl Into<String>,
        max_attempts: u32,
    ) -> Result<Self, DomainError> {
        self.insert(event_name.into(), job_type.into(), Some(max_attempts))
    }

    fn insert(
        mut self,
        event_name: String,
        job_type: String,
        max_attempts: Option<u32>,
    ) -> Result<Self, DomainError> {
        let (event_name, job_type) = (event_name.trim(), job_type.trim());
        if event_name.is_empty() || job_type.is_empty() {
            return Err(DomainError::validation(format!(
                "route '{event_name}={job_type}' needs both an event name and a job type"
            )));
        }
        if max_attempts == Some(0) {
            return Err(DomainError::validation(format!(
                "route '{event_name}' must allow at least one attempt"
            )));
        }
        self.routes.insert(
            event_name.to_string(),
            Route {
                job_type: job_type.to_string(),
                max_attempts,
            },
        );
        Ok(self)
    }

    pub fn get(&self, event_name: &str) -> Option<&Route> {
        self.routes.get(event_name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Parse `event=job_type[:max_attempts]` entries separated by commas,
    /// e.g. `invoice_generated=billing.invoice:3,company_registered=email.welcome`.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let mut routes = Self::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (event_name, target) = entry
                .split_once('=')
                .ok_or_else(|| DomainError::validation(format!("route '{entry}' is missing '='")))?;
            routes = match target.split_once(':') {
                Some((job_type, attempts)) => {
                    let attempts: u32 = attempts.trim().parse().map_err(|_| {
                        DomainError::validation(format!("route '{entry}' has a bad max_attempts"))
                    })?;
                    routes.route_with_attempts(event_name, job_type, attempts)?
                }
                None => routes.route(event_name, target)?,
            };
        }
        Ok(routes)
    }
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub poll_interval: Duration,
    /// Outbox rows read per cycle
    pub batch_size: usize,
    /// `max_attempts` for jobs whose route does not set one
    pub default_max_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Outcome of one bridge cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeReport {
    /// Rows read from the outbox.
    pub scanned: usize,
    /// Jobs inserted by this cycle.
    pub created: usize,
    /// Rows whose job already existed.
    pub confirmed: usize,
    /// Rows the queue refused, now marked rejected in the outbox.
    pub rejected: usize,
}

pub struct OutboxBridge<O, Q> {
    outbox: O,
    queue: Q,
    routes: EventRoutes,
    config: BridgeConfig,
}

impl<O: OutboxStore, Q: JobQueue> OutboxBridge<O, Q> {
    pub fn new(outbox: O, queue: Q, routes: EventRoutes, config: BridgeConfig) -> Self {
        Self {
            outbox,
            queue,
            routes,
            config,
        }
    }

    /// The enqueue request for one outbox row.
    pub fn job_for(&self, event: &OutboxEvent) -> NewJob {
        let (job_type, max_attempts) = match self.routes.get(&event.event_name) {
            Some(route) => (
                route.job_type.clone(),
                route.max_attempts.unwrap_or(self.config.default_max_attempts),
            ),
            None => (event.event_name.clone(), self.config.default_max_attempts),
        };

        NewJob::new(job_type, EventPayload::from_event(event).to_json())
            .max_attempts(max_attempts)
            .source_event(event.id)
    }

    /// Bridge one batch.
    pub async fn run_once(&self) -> Result<BridgeReport, StoreError> {
        let events = self.outbox.fetch_unbridged(self.config.batch_size).await?;
        let mut report = BridgeReport {
            scanned: events.len(),
            ..Default::default()
        };

        for event in events {
            let outcome = match self.queue.enqueue(self.job_for(&event)).await {
                Ok(outcome) => outcome,
                Err(StoreError::Invalid(reason)) => {
                    error!(
                        event_id = %event.id,
                        event_name = %event.event_name,
                        %reason,
                        "outbox row cannot become a job"
                    );
                    self.outbox.mark_rejected(event.id, &reason).await?;
                    report.rejected += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match outcome {
                EnqueueOutcome::Created(job_id) => {
                    report.created += 1;
                    debug!(event_id = %event.id, job_id = %job_id, "bridged event");
                }
                EnqueueOutcome::Duplicate(job_id) => {
                    report.confirmed += 1;
                    debug!(event_id = %event.id, job_id = %job_id, "event already bridged");
                }
            }
            self.outbox.mark_bridged(event.id).await?;
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                created = report.created,
                confirmed = report.confirmed,
                rejected = report.rejected,
                "bridge cycle"
            );
        }
        Ok(report)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(batch_size = self.config.batch_size, routes = self.routes.len(), "bridge started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                // A full batch means more rows are probably waiting.
                Ok(report) if report.scanned >= self.config.batch_size => continue,
                Ok(_) => {}
                Err(e) => error!(error = %e, "bridge cycle failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("bridge stopped");
    }
}
