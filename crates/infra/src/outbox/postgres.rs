//! Postgres-backed outbox.
//!
//! Reads and the `bridged` flip go through the pool. Producers that need the
//! outbox row to commit with their own business write use
//! [`PostgresOutbox::append_in_tx`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use jobrelay_core::EventId;
use jobrelay_events::{NewOutboxEvent, OutboxEvent, ProcessStatus, QueueStatus};

use super::r#trait::{OutboxCounts, OutboxStore};
use crate::error::StoreError;
use crate::postgres::{decode_status, map_sqlx_error};

const OUTBOX_COLUMNS: &str = "id, event_name, created_at, company_id, driver_id, request_id, \
     metadata, process_status, queue_status, queued_at, send_attempts, last_error, processed_at";

#[derive(Debug, Clone)]
pub struct PostgresOutbox {
    pool: Arc<PgPool>,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Append inside the caller's transaction. The row becomes visible to the
    /// bridge only when the caller commits.
    #[instrument(skip(tx, event), fields(event_name = %event.event_name), err)]
    pub async fn append_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        event: NewOutboxEvent,
    ) -> Result<OutboxEvent, StoreError> {
        event.validate()?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO event_outbox (event_name, company_id, driver_id, request_id, metadata)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(&event.event_name)
        .bind(event.company_id)
        .bind(event.driver_id)
        .bind(&event.request_id)
        .bind(&event.metadata)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("append_outbox_event", e))?;

        decode_row(&row)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    #[instrument(skip(self, event), fields(event_name = %event.event_name), err)]
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let stored = Self::append_in_tx(&mut tx, event).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM event_outbox WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_outbox_event", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn fetch_unbridged(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM event_outbox
            WHERE queue_status <> 'bridged' AND process_status <> 'failed'
            ORDER BY id ASC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_unbridged", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn mark_bridged(&self, id: EventId) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE event_outbox
            SET queue_status = 'bridged', queued_at = NOW()
            WHERE id = $1 AND queue_status <> 'bridged'
            "#,
        )
        .bind(id.get())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_bridged", e))?
        .rows_affected();

        if updated == 1 {
            return Ok(true);
        }

        // Distinguish "already bridged" from "no such row".
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM event_outbox WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_bridged", e))?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::not_found(format!("event {id}"))),
        }
    }

    #[instrument(skip(self, reason), fields(event_id = %id), err)]
    async fn mark_rejected(&self, id: EventId, reason: &str) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE event_outbox
            SET process_status = 'failed',
                last_error = $2,
                send_attempts = send_attempts + 1,
                processed_at = NOW()
            WHERE id = $1 AND queue_status <> 'bridged' AND process_status <> 'failed'
            "#,
        )
        .bind(id.get())
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_rejected", e))?
        .rows_affected();

        if updated == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::not_found(format!("event {id}"))),
        }
    }

    #[instrument(skip(self), err)]
    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT queue_status,
                   (process_status = 'failed' AND queue_status <> 'bridged') AS rejected,
                   COUNT(*) AS n
            FROM event_outbox
            GROUP BY 1, 2
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_counts", e))?;

        let mut counts = OutboxCounts::default();
        for row in rows {
            let status: String = row
                .try_get("queue_status")
                .map_err(|e| map_sqlx_error("outbox_counts", e))?;
            let rejected: bool = row
                .try_get("rejected")
                .map_err(|e| map_sqlx_error("outbox_counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("outbox_counts", e))?;
            let status = status.parse::<QueueStatus>()?;
            counts.add(status, rejected, n.max(0) as u64);
        }
        Ok(counts)
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEvent, StoreError> {
    OutboxRow::from_row(row)
        .map(Into::into)
        .map_err(|e| StoreError::storage(format!("failed to deserialize outbox row: {e}")))
}

#[derive(Debug)]
struct OutboxRow {
    id: i64,
    event_name: String,
    created_at: DateTime<Utc>,
    company_id: Option<Uuid>,
    driver_id: Option<Uuid>,
    request_id: Option<String>,
    metadata: JsonValue,
    process_status: ProcessStatus,
    queue_status: QueueStatus,
    queued_at: Option<DateTime<Utc>>,
    send_attempts: i32,
    last_error: Option<String>,
    processed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            event_name: row.try_get("event_name")?,
            created_at: row.try_get("created_at")?,
            company_id: row.try_get("company_id")?,
            driver_id: row.try_get("driver_id")?,
            request_id: row.try_get("request_id")?,
            metadata: row.try_get("metadata")?,
            process_status: decode_status(row.try_get("process_status")?)?,
            queue_status: decode_status(row.try_get("queue_status")?)?,
            queued_at: row.try_get("queued_at")?,
            send_attempts: row.try_get("send_attempts")?,
            last_error: row.try_get("last_error")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

impl From<OutboxRow> for OutboxEvent {
    fn from(row: OutboxRow) -> Self {
        OutboxEvent {
            id: EventId::new(row.id),
            event_name: row.event_name,
            created_at: row.created_at,
            company_id: row.company_id,
            driver_id: row.driver_id,
            request_id: row.request_id,
            metadata: row.metadata,
            process_status: row.process_status,
            queue_status: row.queue_status,
            queued_at: row.queued_at,
            send_attempts: row.send_attempts.max(0) as u32,
            last_error: row.last_error,
            processed_at: row.processed_at,
        }
    }
}
