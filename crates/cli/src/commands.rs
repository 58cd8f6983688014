use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use jobrelay_core::JobId;
use jobrelay_infra::bridge::OutboxBridge;
use jobrelay_infra::heartbeat::PostgresHeartbeats;
use jobrelay_infra::jobs::{
    DryRunHandler, HandlerRegistry, JobQueue, PoolConfig, PostgresJobQueue, WorkerPool,
};
use jobrelay_infra::outbox::PostgresOutbox;
use jobrelay_infra::postgres;
use jobrelay_infra::stats::StatsService;
use jobrelay_infra::RelayConfig;

struct Stores {
    outbox: Arc<PostgresOutbox>,
    queue: Arc<PostgresJobQueue>,
    heartbeats: Arc<PostgresHeartbeats>,
}

impl Stores {
    async fn open(config: &RelayConfig) -> Result<Self> {
        let pool = connect(config).await?;
        Ok(Self {
            outbox: Arc::new(PostgresOutbox::new(pool.clone())),
            queue: Arc::new(PostgresJobQueue::new(pool.clone(), config.queue_config())),
            heartbeats: Arc::new(PostgresHeartbeats::new(pool)),
        })
    }
}

async fn connect(config: &RelayConfig) -> Result<PgPool> {
    let url = config.require_database_url()?;
    postgres::connect(url, config.db_max_connections)
        .await
        .context("failed to connect to database")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn migrate(config: &RelayConfig) -> Result<()> {
    let pool = connect(config).await?;
    postgres::migrate(&pool).await.context("migration failed")?;
    Ok(())
}

pub async fn run(config: &RelayConfig, dry_run: bool) -> Result<()> {
    let stores = Stores::open(config).await?;
    let shutdown = shutdown_on_signal();

    let bridge = OutboxBridge::new(
        stores.outbox.clone(),
        stores.queue.clone(),
        config.routes.clone(),
        config.bridge_config(),
    );
    let bridge_token = shutdown.clone();
    let bridge_task = tokio::spawn(async move { bridge.run(bridge_token).await });

    let pool = start_pool(&stores, pool_config(config, None, dry_run)?, shutdown.clone());

    shutdown.cancelled().await;
    let stats = pool.join().await;
    if let Err(error) = bridge_task.await {
        warn!(%error, "bridge task panicked");
    }
    for (worker_id, stats) in stats {
        info!(%worker_id, succeeded = stats.jobs_succeeded, dead = stats.jobs_dead, "worker finished");
    }
    Ok(())
}

pub async fn bridge(config: &RelayConfig, once: bool) -> Result<()> {
    let stores = Stores::open(config).await?;
    let bridge = OutboxBridge::new(
        stores.outbox,
        stores.queue,
        config.routes.clone(),
        config.bridge_config(),
    );

    if once {
        let report = bridge.run_once().await.context("bridge cycle failed")?;
        return print_json(&report);
    }

    bridge.run(shutdown_on_signal()).await;
    Ok(())
}

pub async fn worker(config: &RelayConfig, concurrency: Option<usize>, dry_run: bool) -> Result<()> {
    let stores = Stores::open(config).await?;
    let shutdown = shutdown_on_signal();
    let pool = start_pool(&stores, pool_config(config, concurrency, dry_run)?, shutdown.clone());

    shutdown.cancelled().await;
    for (worker_id, stats) in pool.join().await {
        info!(%worker_id, succeeded = stats.jobs_succeeded, dead = stats.jobs_dead, "worker finished");
    }
    Ok(())
}

pub async fn stats(config: &RelayConfig) -> Result<()> {
    let stores = Stores::open(config).await?;
    let report = StatsService::new(
        stores.outbox,
        stores.queue,
        stores.heartbeats,
        config.stats_config(),
    )
    .snapshot()
    .await
    .context("failed to collect stats")?;
    print_json(&report)
}

pub async fn replay(config: &RelayConfig, job_id: JobId) -> Result<()> {
    let stores = Stores::open(config).await?;
    let replayed = stores
        .queue
        .replay_dead(job_id)
        .await
        .with_context(|| format!("failed to replay job {job_id}"))?;
    print_json(&json!({ "replayed_from": job_id, "job_id": replayed }))
}

pub async fn prune(config: &RelayConfig, older_than_hours: u64) -> Result<()> {
    let hours = i64::try_from(older_than_hours).context("--older-than-hours is too large")?;
    let cutoff = chrono::Duration::try_hours(hours)
        .and_then(|age| chrono::Utc::now().checked_sub_signed(age))
        .context("--older-than-hours is too large")?;

    let stores = Stores::open(config).await?;
    let deleted = stores
        .queue
        .prune_done(cutoff)
        .await
        .context("failed to prune done jobs")?;
    print_json(&json!({ "deleted": deleted, "cutoff": cutoff }))
}

/// No job handlers are compiled into this binary, so workers can only
/// simulate; live handlers are registered by embedding `jobrelay-infra`.
fn pool_config(config: &RelayConfig, concurrency: Option<usize>, dry_run: bool) -> Result<PoolConfig> {
    let mut pool = config.pool_config();
    pool.worker.dry_run |= dry_run;
    if let Some(n) = concurrency {
        pool.concurrency = n.max(1);
    }
    if !pool.worker.dry_run {
        bail!("this binary has no live job handlers; pass --dry-run or set RELAY_DRY_RUN=true");
    }
    Ok(pool)
}

fn start_pool(
    stores: &Stores,
    config: PoolConfig,
    shutdown: CancellationToken,
) -> jobrelay_infra::jobs::PoolHandle {
    let handlers = HandlerRegistry::new().with("*", DryRunHandler);
    WorkerPool::new(
        stores.queue.clone(),
        stores.heartbeats.clone(),
        Arc::new(handlers),
        config,
    )
    .spawn(shutdown)
}

/// Token cancelled on Ctrl-C or SIGTERM.
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        trigger.cancel();
    });
    token
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!(%error, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
