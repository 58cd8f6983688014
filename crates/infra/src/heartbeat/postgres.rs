//! Postgres-backed heartbeat registry (`worker_heartbeats`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use jobrelay_core::WorkerId;

use super::store::{Heartbeat, HeartbeatStore};
use crate::error::StoreError;
use crate::postgres::map_sqlx_error;

#[derive(Debug, Clone)]
pub struct PostgresHeartbeats {
    pool: Arc<PgPool>,
}

impl PostgresHeartbeats {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl HeartbeatStore for PostgresHeartbeats {
    #[instrument(skip(self, metadata), fields(worker_id = %worker_id), err)]
    async fn beat(
        &self,
        worker_id: &WorkerId,
        status: &str,
        metadata: JsonValue,
    ) -> Result<Heartbeat, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (worker_id, last_seen, status, metadata)
            VALUES ($1, NOW(), $2, $3)
            ON CONFLICT (worker_id)
            DO UPDATE SET
                last_seen = EXCLUDED.last_seen,
                status = EXCLUDED.status,
                metadata = EXCLUDED.metadata
            RETURNING worker_id, last_seen, status, metadata
            "#,
        )
        .bind(worker_id.as_str())
        .bind(status)
        .bind(&metadata)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("beat", e))?;

        decode_row(&row)
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn get(&self, worker_id: &WorkerId) -> Result<Option<Heartbeat>, StoreError> {
        let row = sqlx::query(
            "SELECT worker_id, last_seen, status, metadata FROM worker_heartbeats WHERE worker_id = $1",
        )
        .bind(worker_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_heartbeat", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<Heartbeat>, StoreError> {
        let rows = sqlx::query(
            "SELECT worker_id, last_seen, status, metadata FROM worker_heartbeats ORDER BY worker_id",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_heartbeats", e))?;

        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Heartbeat, StoreError> {
    HeartbeatRow::from_row(row)
        .map(Into::into)
        .map_err(|e| StoreError::storage(format!("failed to deserialize heartbeat row: {e}")))
}

#[derive(Debug)]
struct HeartbeatRow {
    worker_id: WorkerId,
    last_seen: DateTime<Utc>,
    status: Option<String>,
    metadata: Option<JsonValue>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for HeartbeatRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let worker_id: String = row.try_get("worker_id")?;
        Ok(HeartbeatRow {
            worker_id: WorkerId::parse(worker_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            last_seen: row.try_get("last_seen")?,
            status: row.try_get("status")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl From<HeartbeatRow> for Heartbeat {
    fn from(row: HeartbeatRow) -> Self {
        Heartbeat {
            worker_id: row.worker_id,
            last_seen: row.last_seen,
            status: row.status,
            metadata: row.metadata,
        }
    }
}
