//! Shared Postgres plumbing: pool construction, schema, and error mapping.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | handled by callers as a duplicate, see [`is_unique_violation`] |
//! | Database (check constraint violation) | `23514` | `Invalid` |
//! | Database (foreign key violation) | `23503` | `Invalid` |
//! | Database (other) | any | `Storage` |
//! | RowNotFound | N/A | `NotFound` |
//! | PoolClosed, Io, Tls, ... | N/A | `Storage` |

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::error::StoreError;

/// Schema applied by [`migrate`].
pub const SCHEMA: &str = include_str!("../migrations/0001_jobrelay_schema.sql");

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Apply the relay schema. Safe to run repeatedly.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    info!("jobrelay schema applied");
    Ok(())
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint / foreign key violation
                Some("23514") | Some("23503") => StoreError::Invalid(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("row not found in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Decode a TEXT status column through its `FromStr` impl.
pub(crate) fn decode_status<T>(raw: String) -> Result<T, sqlx::Error>
where
    T: core::str::FromStr<Err = jobrelay_core::DomainError>,
{
    raw.parse::<T>().map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

/// Seconds as the `double precision` `make_interval(secs => ...)` expects.
pub(crate) fn interval_secs(d: Duration) -> f64 {
    d.as_secs_f64()
}
