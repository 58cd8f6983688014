//! Integration tests for the full relay pipeline on the in-memory stores.
//!
//! Tests: Outbox → Bridge → JobQueue → Worker/Pool → Heartbeats → Stats
//!
//! Verifies:
//! - Every outbox row becomes exactly one job and is processed once
//! - Retryable failures back off and end in `dead` once the budget is spent
//! - A crashed worker's lease is reclaimed by another worker
//! - Stats reflect the final state

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use jobrelay_core::{ManualClock, WorkerId};
use jobrelay_events::{EventPayload, NewOutboxEvent, QueueStatus};

use crate::bridge::{BridgeConfig, EventRoutes, OutboxBridge};
use crate::heartbeat::{HeartbeatStore, InMemoryHeartbeats};
use crate::jobs::{
    HandlerError, HandlerRegistry, InMemoryJobQueue, Job, JobContext, JobQueue, JobStatus,
    NewJob, PoolConfig, QueueConfig, RetryPolicy, Worker, WorkerConfig, WorkerPool,
};
use crate::outbox::{InMemoryOutbox, OutboxStore};
use crate::stats::{Liveness, StatsConfig, StatsService};

fn worker_id(s: &str) -> WorkerId {
    WorkerId::parse(s).unwrap()
}

fn push_job() -> NewJob {
    NewJob::new("push", json!({"device": "abc"}))
}

#[tokio::test]
async fn events_flow_from_outbox_to_done_jobs() {
    let outbox = Arc::new(InMemoryOutbox::new());
    let queue = InMemoryJobQueue::arc(QueueConfig::default());
    let heartbeats = Arc::new(InMemoryHeartbeats::new());

    for invoice in 0..5 {
        outbox
            .append(NewOutboxEvent::new("invoice_generated").metadata(json!({"invoice": invoice})))
            .await
            .unwrap();
    }
    outbox.append(NewOutboxEvent::new("company_registered")).await.unwrap();

    let bridge = OutboxBridge::new(
        outbox.clone(),
        queue.clone(),
        EventRoutes::new()
            .route("invoice_generated", "billing.invoice")
            .and_then(|r| r.route_with_attempts("company_registered", "email.welcome", 2))
            .unwrap(),
        BridgeConfig::default(),
    );
    let report = bridge.run_once().await.unwrap();
    assert_eq!((report.scanned, report.created), (6, 6));

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let handlers = HandlerRegistry::new()
        .with("billing.*", move |job: Job, _ctx: JobContext| {
            let counter = counter.clone();
            async move {
                let payload = EventPayload::from_json(&job.payload)
                    .map_err(|e| HandlerError::permanent(e.to_string()))?;
                assert_eq!(payload.event_name, "invoice_generated");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .with("email.*", |_job: Job, _ctx: JobContext| async move {
            Err::<(), _>(HandlerError::permanent("mailbox does not exist"))
        });

    let pool = WorkerPool::new(
        queue.clone(),
        heartbeats.clone(),
        Arc::new(handlers),
        PoolConfig {
            worker_prefix: worker_id("relay"),
            concurrency: 2,
            heartbeat_interval: Duration::from_millis(20),
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(5),
                batch_size: 2,
                ..Default::default()
            },
        },
    )
    .spawn(CancellationToken::new());

    for _ in 0..400 {
        let counts = queue.counts().await.unwrap();
        if counts.pending == 0 && counts.processing == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pool.shutdown().await;

    assert_eq!(seen.load(Ordering::SeqCst), 5);
    assert_eq!(bridge.run_once().await.unwrap().scanned, 0);

    let stats = StatsService::new(outbox.clone(), queue.clone(), heartbeats.clone(), StatsConfig::default())
        .snapshot()
        .await
        .unwrap();
    assert_eq!(stats.jobs.done, 5);
    assert_eq!(stats.jobs.dead, 1);
    assert_eq!(stats.outbox.bridged, 6);
    assert_eq!(stats.workers.len(), 2);
    assert!(stats.workers.iter().all(|w| w.liveness == Liveness::Stopped));
    assert_eq!(stats.recent_failures.len(), 1);
    assert_eq!(stats.recent_failures[0].job_type, "email.welcome");
    assert_eq!(stats.recent_failures[0].attempts, 1);
    assert!(stats.has_alert("dead_jobs"));
    assert!(!stats.has_alert("worker_down"));
}

#[tokio::test]
async fn retryable_failures_exhaust_budget_then_dead() {
    let clock = Arc::new(ManualClock::starting_now());
    let outbox = Arc::new(InMemoryOutbox::with_clock(clock.clone()));
    let queue = Arc::new(InMemoryJobQueue::with_clock(
        QueueConfig {
            retry: RetryPolicy::fixed(Duration::from_secs(10)),
            ..Default::default()
        },
        clock.clone(),
    ));
    let event = outbox.append(NewOutboxEvent::new("invoice_generated")).await.unwrap();

    OutboxBridge::new(
        outbox.clone(),
        queue.clone(),
        EventRoutes::new().route_with_attempts("invoice_generated", "billing.invoice", 3).unwrap(),
        BridgeConfig::default(),
    )
    .run_once()
    .await
    .unwrap();

    let handlers = HandlerRegistry::new().with("billing.invoice", |_job: Job, ctx: JobContext| async move {
        Err::<(), _>(HandlerError::retryable(format!("gateway timeout on attempt {}", ctx.attempt)))
    });
    let worker = Worker::new(worker_id("w-1"), queue.clone(), Arc::new(handlers), WorkerConfig::default());

    for attempt in 1..=3u32 {
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.claimed, 1, "attempt {attempt}");

        // Not due again until the backoff has elapsed.
        assert_eq!(worker.run_once().await.unwrap().claimed, 0);
        clock.advance(Duration::from_secs(11));
    }

    let jobs = queue.recent_failures(10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.source_event_id, Some(event.id));
    assert_eq!(job.last_error.as_deref(), Some("gateway timeout on attempt 3"));
    assert_eq!(worker.run_once().await.unwrap().claimed, 0);

    let stats = worker.monitor().snapshot();
    assert_eq!((stats.jobs_retried, stats.jobs_dead), (2, 1));
    assert_eq!(
        outbox.get(event.id).await.unwrap().unwrap().queue_status,
        QueueStatus::Bridged
    );
}

#[tokio::test]
async fn crashed_worker_lease_is_reclaimed() {
    let clock = Arc::new(ManualClock::starting_now());
    let config = QueueConfig {
        lease_timeout: Duration::from_secs(300),
        ..Default::default()
    };
    let queue = Arc::new(InMemoryJobQueue::with_clock(config, clock.clone()));
    let job_id = queue
        .enqueue(push_job())
        .await
        .unwrap()
        .job_id();

    // w-1 claims and then disappears without reporting.
    let crashed = worker_id("w-1");
    assert_eq!(queue.claim(&crashed, 1).await.unwrap().len(), 1);

    let handlers = Arc::new(
        HandlerRegistry::new().with("push", |_job: Job, _ctx: JobContext| async move {
            Ok::<(), HandlerError>(())
        }),
    );
    let survivor = Worker::new(worker_id("w-2"), queue.clone(), handlers, WorkerConfig::default());

    assert_eq!(survivor.run_once().await.unwrap().claimed, 0);
    clock.advance(Duration::from_secs(301));
    let report = survivor.run_once().await.unwrap();
    assert_eq!((report.claimed, report.completed), (1, 1));

    let job = queue.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempts, 0);

    // The crashed worker's late report changes nothing.
    assert!(!queue.complete(job_id, &crashed).await.unwrap());
}

#[tokio::test]
async fn dead_job_replay_runs_again() {
    let queue = InMemoryJobQueue::arc(QueueConfig::default());
    let heartbeats = Arc::new(InMemoryHeartbeats::new());
    let original = queue
        .enqueue(push_job().max_attempts(1))
        .await
        .unwrap()
        .job_id();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handlers = Arc::new(HandlerRegistry::new().with("push", move |_job: Job, _ctx: JobContext| {
        let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
        async move {
            if first {
                Err(HandlerError::retryable("device offline"))
            } else {
                Ok(())
            }
        }
    }));
    let worker = Worker::new(worker_id("w-1"), queue.clone(), handlers, WorkerConfig::default());

    assert_eq!(worker.run_once().await.unwrap().dead, 1);
    let replay = queue.replay_dead(original).await.unwrap();
    assert_eq!(worker.run_once().await.unwrap().completed, 1);

    assert_eq!(queue.get(original).await.unwrap().unwrap().status, JobStatus::Dead);
    let replayed = queue.get(replay).await.unwrap().unwrap();
    assert_eq!(replayed.status, JobStatus::Done);
    assert_eq!(replayed.replayed_from, Some(original));

    heartbeats.beat(&worker_id("w-1"), "idle", json!({})).await.unwrap();
    let stats = StatsService::new(
        Arc::new(InMemoryOutbox::new()),
        queue.clone(),
        heartbeats,
        StatsConfig::default(),
    )
    .snapshot()
    .await
    .unwrap();
    assert_eq!(stats.jobs.done, 1);
    assert_eq!(stats.jobs.dead, 1);
    assert_eq!(stats.live_workers(), 1);
}
