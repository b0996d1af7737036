//! Database query functions for the `idempotency_keys` table.
//!
//! Rows carry their own expiry; lookups ignore expired rows and a periodic
//! sweep removes them (lazy TTL).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Record a `(user, key) -> dispatch` mapping.
///
/// An existing mapping is only replaced when it has already expired, so a
/// race between two creates with the same key leaves exactly one live
/// mapping (the first writer wins).
pub async fn put_mapping(
    pool: &PgPool,
    user_id: &str,
    idempotency_key: &str,
    dispatch_id: Uuid,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO idempotency_keys (user_id, idempotency_key, dispatch_id, expires_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (user_id, idempotency_key) DO UPDATE \
         SET dispatch_id = EXCLUDED.dispatch_id, expires_at = EXCLUDED.expires_at \
         WHERE idempotency_keys.expires_at <= NOW()",
    )
    .bind(user_id)
    .bind(idempotency_key)
    .bind(dispatch_id)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("failed to record idempotency mapping")?;

    Ok(())
}

/// Resolve a live `(user, key)` mapping to its dispatch id.
///
/// Expired rows are invisible even before the sweep removes them.
pub async fn get_mapping(
    pool: &PgPool,
    user_id: &str,
    idempotency_key: &str,
) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT dispatch_id FROM idempotency_keys \
         WHERE user_id = $1 AND idempotency_key = $2 AND expires_at > NOW()",
    )
    .bind(user_id)
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await
    .context("failed to look up idempotency mapping")?;

    Ok(row.map(|(id,)| id))
}

/// Remove expired mappings. Returns the number of rows deleted.
pub async fn purge_expired(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= NOW()")
        .execute(pool)
        .await
        .context("failed to purge expired idempotency mappings")?;

    Ok(result.rows_affected())
}
