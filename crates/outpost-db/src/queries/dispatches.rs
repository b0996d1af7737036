//! Database query functions for the `dispatches` table.
//!
//! All lifecycle transitions go through [`transition_dispatch`], a single
//! conditional UPDATE guarded by the record version. Zero rows affected
//! means the guard failed; callers re-read to distinguish a stale version
//! from a missing row.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::cursor::PageCursor;
use crate::models::{Dispatch, DispatchStatus, NewDispatch, StatusPatch};

/// Insert a new dispatch record at version 1 with status `PENDING`.
///
/// Returns `None` when a record with the same `dispatch_id` already exists
/// (`ON CONFLICT DO NOTHING` yields no row).
pub async fn insert_dispatch(pool: &PgPool, new: &NewDispatch) -> Result<Option<Dispatch>> {
    let dispatch = sqlx::query_as::<_, Dispatch>(
        "INSERT INTO dispatches (dispatch_id, user_id, agent_kind, model_id, task, \
                                 repo_url, branch, workspace_init_mode, timeout_seconds, \
                                 cpu_units, memory_mb, disk_gb, additional_secrets, tags, \
                                 idempotency_key, workspace_id, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
         ON CONFLICT (dispatch_id) DO NOTHING \
         RETURNING *",
    )
    .bind(new.dispatch_id)
    .bind(&new.user_id)
    .bind(new.agent_kind)
    .bind(&new.model_id)
    .bind(&new.task)
    .bind(&new.repo_url)
    .bind(&new.branch)
    .bind(new.workspace_init_mode)
    .bind(new.timeout_seconds)
    .bind(new.cpu_units)
    .bind(new.memory_mb)
    .bind(new.disk_gb)
    .bind(&new.additional_secrets)
    .bind(&new.tags)
    .bind(&new.idempotency_key)
    .bind(new.workspace_id)
    .bind(new.expires_at)
    .fetch_optional(pool)
    .await
    .context("failed to insert dispatch")?;

    Ok(dispatch)
}

/// Fetch a single dispatch by ID.
pub async fn get_dispatch(pool: &PgPool, id: Uuid) -> Result<Option<Dispatch>> {
    let dispatch = sqlx::query_as::<_, Dispatch>("SELECT * FROM dispatches WHERE dispatch_id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch dispatch")?;

    Ok(dispatch)
}

/// Fetch a dispatch by the ARN of its launched task.
///
/// Used by the reconciler when an inbound event carries no embedded
/// dispatch id.
pub async fn get_dispatch_by_task_arn(pool: &PgPool, task_arn: &str) -> Result<Option<Dispatch>> {
    let dispatch = sqlx::query_as::<_, Dispatch>("SELECT * FROM dispatches WHERE task_arn = $1")
        .bind(task_arn)
        .fetch_optional(pool)
        .await
        .context("failed to fetch dispatch by task arn")?;

    Ok(dispatch)
}

/// Atomically transition a dispatch to `new_status`, applying patch fields.
///
/// The UPDATE's WHERE clause includes both the version guard
/// (`version = $expected`) and the set of statuses from which `new_status`
/// is reachable, so an accepted write is always a legal edge of the
/// lifecycle graph. On success the version is bumped by exactly one and
/// the updated row is returned. `None` means the guard failed: the row is
/// missing, the version is stale, or the current status does not permit
/// the transition.
pub async fn transition_dispatch(
    pool: &PgPool,
    id: Uuid,
    expected_version: i32,
    new_status: DispatchStatus,
    patch: &StatusPatch,
) -> Result<Option<Dispatch>> {
    let sources: Vec<String> = DispatchStatus::valid_sources(new_status)
        .iter()
        .map(|s| s.to_string())
        .collect();

    let dispatch = sqlx::query_as::<_, Dispatch>(
        "UPDATE dispatches \
         SET status = $3, \
             version = version + 1, \
             task_arn = COALESCE($4, task_arn), \
             workspace_id = COALESCE($5, workspace_id), \
             artifacts_url = COALESCE($6, artifacts_url), \
             error_message = COALESCE($7, error_message), \
             ended_at = COALESCE($8, ended_at), \
             exit_code = COALESCE($9, exit_code), \
             stopped_reason = COALESCE($10, stopped_reason) \
         WHERE dispatch_id = $1 \
           AND version = $2 \
           AND status = ANY($11) \
         RETURNING *",
    )
    .bind(id)
    .bind(expected_version)
    .bind(new_status)
    .bind(&patch.task_arn)
    .bind(patch.workspace_id)
    .bind(&patch.artifacts_url)
    .bind(&patch.error_message)
    .bind(patch.ended_at)
    .bind(patch.exit_code)
    .bind(&patch.stopped_reason)
    .bind(&sources)
    .fetch_optional(pool)
    .await
    .context("failed to transition dispatch")?;

    Ok(dispatch)
}

/// Stamp an error message on a dispatch that is still `RUNNING`.
///
/// Used by cancellation to record the caller's reason while the terminal
/// event is still in flight. Not a lifecycle transition, so the version is
/// left untouched.
pub async fn set_error_message_if_running(pool: &PgPool, id: Uuid, message: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE dispatches SET error_message = $2 \
         WHERE dispatch_id = $1 AND status = 'RUNNING'",
    )
    .bind(id)
    .bind(message)
    .execute(pool)
    .await
    .context("failed to stamp error message")?;

    Ok(result.rows_affected())
}

/// List dispatches for a user, newest first, with optional status and tag
/// filters and keyset pagination.
///
/// The tag filter uses JSONB containment, which gives AND semantics across
/// all supplied key-value pairs.
pub async fn list_for_user(
    pool: &PgPool,
    user_id: &str,
    limit: i64,
    cursor: Option<PageCursor>,
    status: Option<DispatchStatus>,
    tags: Option<&serde_json::Value>,
) -> Result<Vec<Dispatch>> {
    let dispatches = sqlx::query_as::<_, Dispatch>(
        "SELECT * FROM dispatches \
         WHERE user_id = $1 \
           AND ($2::text IS NULL OR status = $2) \
           AND ($3::jsonb IS NULL OR tags @> $3) \
           AND ($4::timestamptz IS NULL OR (started_at, dispatch_id) < ($4, $5::uuid)) \
         ORDER BY started_at DESC, dispatch_id DESC \
         LIMIT $6",
    )
    .bind(user_id)
    .bind(status.map(|s| s.to_string()))
    .bind(tags)
    .bind(cursor.map(|c| c.started_at))
    .bind(cursor.map(|c| c.dispatch_id))
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list dispatches for user")?;

    Ok(dispatches)
}

/// Count a user's live (PENDING or RUNNING) dispatches.
pub async fn count_active_for_user(pool: &PgPool, user_id: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM dispatches \
         WHERE user_id = $1 AND status IN ('PENDING', 'RUNNING')",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("failed to count active dispatches")?;

    Ok(row.0)
}

/// Delete dispatches whose retention window has passed.
///
/// Log rows go with them via the foreign-key cascade. Returns the number
/// of dispatch rows removed.
pub async fn purge_expired(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM dispatches WHERE expires_at <= $1")
        .bind(now)
        .execute(pool)
        .await
        .context("failed to purge expired dispatches")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Aggregation
// -----------------------------------------------------------------------

/// Counts of dispatches by status.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub timeout: i64,
    pub cancelled: i64,
}

/// Per-agent aggregate over the metrics window.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct AgentAggregate {
    pub agent_kind: crate::models::AgentKind,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub avg_duration_ms: Option<f64>,
}

/// Aggregate dispatch metrics over a trailing window.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatchMetrics {
    pub total: i64,
    pub by_status: StatusCounts,
    pub by_agent: Vec<AgentAggregate>,
}

/// Aggregate metrics over records started at or after `since`.
///
/// `failed` counts both `FAILED` and `TIMEOUT` outcomes; cancellations are
/// counted in the status breakdown but excluded from the per-agent failure
/// rate inputs.
pub async fn dispatch_metrics(pool: &PgPool, since: DateTime<Utc>) -> Result<DispatchMetrics> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) \
         FROM dispatches \
         WHERE started_at >= $1 \
         GROUP BY status",
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .context("failed to aggregate dispatch status counts")?;

    let mut metrics = DispatchMetrics::default();
    for (status, count) in &rows {
        match status.as_str() {
            "PENDING" => metrics.by_status.pending = *count,
            "RUNNING" => metrics.by_status.running = *count,
            "COMPLETED" => metrics.by_status.completed = *count,
            "FAILED" => metrics.by_status.failed = *count,
            "TIMEOUT" => metrics.by_status.timeout = *count,
            "CANCELLED" => metrics.by_status.cancelled = *count,
            _ => {}
        }
        metrics.total += count;
    }

    metrics.by_agent = sqlx::query_as::<_, AgentAggregate>(
        "SELECT agent_kind, \
                COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed, \
                COUNT(*) FILTER (WHERE status IN ('FAILED', 'TIMEOUT')) AS failed, \
                AVG((EXTRACT(EPOCH FROM (ended_at - started_at)) * 1000.0)::float8) \
                    FILTER (WHERE ended_at IS NOT NULL) AS avg_duration_ms \
         FROM dispatches \
         WHERE started_at >= $1 \
         GROUP BY agent_kind \
         ORDER BY agent_kind",
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .context("failed to aggregate per-agent dispatch metrics")?;

    Ok(metrics)
}
