//! Database query functions for the `dispatch_logs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::DispatchLog;

/// Append a log line for a dispatch.
pub async fn append_line(pool: &PgPool, dispatch_id: Uuid, line: &str) -> Result<()> {
    sqlx::query("INSERT INTO dispatch_logs (dispatch_id, line) VALUES ($1, $2)")
        .bind(dispatch_id)
        .bind(line)
        .execute(pool)
        .await
        .context("failed to append dispatch log line")?;

    Ok(())
}

/// Fetch a page of log lines with sequence ids greater than `after_id`.
///
/// Returns at most `limit` rows in ascending sequence order; the caller
/// derives the next continuation token from the last row's id.
pub async fn page_lines(
    pool: &PgPool,
    dispatch_id: Uuid,
    after_id: i64,
    limit: i64,
) -> Result<Vec<DispatchLog>> {
    let lines = sqlx::query_as::<_, DispatchLog>(
        "SELECT * FROM dispatch_logs \
         WHERE dispatch_id = $1 AND id > $2 \
         ORDER BY id ASC \
         LIMIT $3",
    )
    .bind(dispatch_id)
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to page dispatch logs")?;

    Ok(lines)
}
