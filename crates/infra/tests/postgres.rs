//! Postgres store tests.
//!
//! Need a disposable database: `DATABASE_URL=postgres://... cargo test -- --ignored`.
//! The tables are truncated at the start, so everything runs inside a single
//! test to keep steps from interleaving.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use jobrelay_core::WorkerId;
use jobrelay_events::{NewOutboxEvent, QueueStatus};
use jobrelay_infra::bridge::{BridgeConfig, EventRoutes, OutboxBridge};
use jobrelay_infra::heartbeat::{HeartbeatStore, PostgresHeartbeats};
use jobrelay_infra::jobs::{
    EnqueueOutcome, FailOutcome, FailureKind, JobQueue, JobStatus, NewJob, PostgresJobQueue,
    QueueConfig, RetryPolicy,
};
use jobrelay_infra::outbox::{OutboxStore, PostgresOutbox};
use jobrelay_infra::postgres;
use jobrelay_infra::stats::{StatsConfig, StatsService};
use jobrelay_infra::StoreError;

fn worker(id: &str) -> WorkerId {
    WorkerId::parse(id).unwrap()
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn postgres_relay_round_trip() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = postgres::connect(&url, 10).await.unwrap();
    postgres::migrate(&pool).await.unwrap();
    // Second run must be a no-op.
    postgres::migrate(&pool).await.unwrap();
    sqlx::query("TRUNCATE event_outbox, jobs, worker_heartbeats RESTART IDENTITY")
        .execute(&pool)
        .await
        .unwrap();

    let outbox = Arc::new(PostgresOutbox::new(pool.clone()));
    let queue = Arc::new(PostgresJobQueue::new(
        pool.clone(),
        QueueConfig {
            lease_timeout: Duration::from_secs(2),
            retry: RetryPolicy::fixed(Duration::from_millis(0)),
        },
    ));
    let heartbeats = Arc::new(PostgresHeartbeats::new(pool.clone()));

    // Outbox row written in the producer's transaction.
    let mut tx = pool.begin().await.unwrap();
    let event = PostgresOutbox::append_in_tx(
        &mut tx,
        NewOutboxEvent::new("invoice_generated").metadata(json!({"invoice": 7})),
    )
    .await
    .unwrap();
    assert!(outbox.fetch_unbridged(10).await.unwrap().is_empty());
    tx.commit().await.unwrap();

    // Written around the validation, so the queue refuses it.
    sqlx::query("INSERT INTO event_outbox (event_name) VALUES (' ')")
        .execute(&pool)
        .await
        .unwrap();

    // Concurrent bridges: one job per event.
    for i in 0..20 {
        outbox
            .append(NewOutboxEvent::new(format!("event_{i}")))
            .await
            .unwrap();
    }
    let bridge = Arc::new(OutboxBridge::new(
        outbox.clone(),
        queue.clone(),
        EventRoutes::new().route_with_attempts("invoice_generated", "billing.invoice", 2).unwrap(),
        BridgeConfig {
            batch_size: 5,
            ..Default::default()
        },
    ));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let bridge = bridge.clone();
        handles.push(tokio::spawn(async move {
            while bridge.run_once().await.unwrap().scanned > 0 {}
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.pending, 21);
    let outbox_counts = outbox.counts().await.unwrap();
    assert_eq!((outbox_counts.bridged, outbox_counts.rejected), (21, 1));
    let refused = outbox.get(jobrelay_core::EventId::new(2)).await.unwrap().unwrap();
    assert!(refused.is_rejected());
    assert_eq!(refused.send_attempts, 1);
    assert_eq!(
        outbox.get(event.id).await.unwrap().unwrap().queue_status,
        QueueStatus::Bridged
    );

    // Bridging the same row again is a duplicate, not an error.
    let again = queue
        .enqueue(NewJob::new("billing.invoice", json!({})).source_event(event.id))
        .await
        .unwrap();
    let EnqueueOutcome::Duplicate(invoice_job) = again else {
        panic!("expected duplicate, got {again:?}");
    };

    // Racing claims never hand out the same job twice.
    let mut claims = Vec::new();
    for n in 0..4 {
        let queue = queue.clone();
        claims.push(tokio::spawn(async move {
            queue.claim(&worker(&format!("w-{n}")), 10).await.unwrap()
        }));
    }
    let mut claimed = Vec::new();
    for handle in claims {
        claimed.extend(handle.await.unwrap().into_iter().map(|j| j.id));
    }
    claimed.sort();
    let unique = claimed.len();
    claimed.dedup();
    assert_eq!(claimed.len(), unique);
    assert_eq!(unique, 21);

    // Only the lease holder can finish a job.
    let invoice = queue.get(invoice_job).await.unwrap().unwrap();
    let holder = invoice.locked_by.clone().unwrap();
    assert!(!queue.complete(invoice_job, &worker("intruder")).await.unwrap());
    let first = queue
        .fail(invoice_job, &holder, "gateway timeout", FailureKind::Retryable)
        .await
        .unwrap();
    assert!(matches!(first, FailOutcome::Retrying { attempts: 1, .. }));

    // Due immediately with a zero backoff; the second failure spends the budget.
    let retried = queue.claim(&holder, 50).await.unwrap();
    assert!(retried.iter().any(|j| j.id == invoice_job));
    let second = queue
        .fail(invoice_job, &holder, "gateway timeout", FailureKind::Retryable)
        .await
        .unwrap();
    assert_eq!(second, FailOutcome::Dead { attempts: 2 });
    assert_eq!(
        queue
            .fail(invoice_job, &holder, "late", FailureKind::Retryable)
            .await
            .unwrap(),
        FailOutcome::Ignored
    );

    // Stale leases are reclaimable.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let reclaimed = queue.claim(&worker("rescuer"), 100).await.unwrap();
    assert_eq!(reclaimed.len(), 20);
    for job in &reclaimed {
        assert_eq!(job.attempts, 0);
        assert!(queue.complete(job.id, &worker("rescuer")).await.unwrap());
    }

    // Replay and dead-letter listing.
    let failures = queue.recent_failures(5).await.unwrap();
    assert_eq!(failures[0].id, invoice_job);
    assert_eq!(failures[0].status, JobStatus::Dead);
    let replay = queue.replay_dead(invoice_job).await.unwrap();
    let replayed = queue.get(replay).await.unwrap().unwrap();
    assert_eq!(replayed.replayed_from, Some(invoice_job));
    assert_eq!(replayed.source_event_id, None);
    assert!(matches!(
        queue.replay_dead(replay).await,
        Err(StoreError::InvalidState(_))
    ));

    // Heartbeats upsert one row per worker.
    heartbeats.beat(&worker("w-0"), "idle", json!({})).await.unwrap();
    let beat = heartbeats.beat(&worker("w-0"), "busy", json!({"pid": 1})).await.unwrap();
    assert_eq!(beat.status.as_deref(), Some("busy"));
    assert_eq!(heartbeats.list().await.unwrap().len(), 1);

    let report = StatsService::new(outbox, queue.clone(), heartbeats, StatsConfig::default())
        .snapshot()
        .await
        .unwrap();
    assert_eq!(report.jobs.done, 20);
    assert_eq!(report.jobs.dead, 1);
    assert_eq!(report.jobs.pending, 1);
    assert!(report.has_alert("dead_jobs"));

    // A done job whose outbox row is unbridged again keeps its event reserved.
    let kept = &reclaimed[0];
    let source = kept.source_event_id.unwrap();
    sqlx::query("UPDATE event_outbox SET queue_status = 'queued' WHERE id = $1")
        .bind(source.get())
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(queue.prune_done(chrono::Utc::now() + chrono::Duration::hours(1)).await.unwrap(), 19);
    assert!(queue.get(kept.id).await.unwrap().is_some());
    let report = bridge.run_once().await.unwrap();
    assert_eq!((report.created, report.confirmed), (0, 1));
    assert_eq!(queue.prune_done(chrono::Utc::now() + chrono::Duration::hours(1)).await.unwrap(), 1);
}
