//! The dispatch record store.
//!
//! Wraps the raw conditional queries in `outpost-db` with lifecycle
//! semantics: every transition is a single version-guarded write, and a
//! failed guard is re-read and classified into the error taxonomy so
//! callers can decide whether to retry (reconciler) or surface the
//! conflict (orchestrator).

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use outpost_db::cursor::PageCursor;
use outpost_db::models::{Dispatch, DispatchStatus, NewDispatch, StatusPatch};
use outpost_db::queries::dispatches as db;
use outpost_db::queries::idempotency as idem_db;

use crate::config::RetentionConfig;
use crate::error::{Error, Result};

pub use outpost_db::queries::dispatches::{AgentAggregate, DispatchMetrics, StatusCounts};

/// A page of dispatches plus the continuation token for the next page.
#[derive(Debug, Clone)]
pub struct DispatchPage {
    pub items: Vec<Dispatch>,
    pub next_cursor: Option<String>,
}

/// Durable dispatch records with version-guarded transitions.
#[derive(Clone)]
pub struct DispatchStore {
    pool: PgPool,
    dispatch_retention: Duration,
    idempotency_ttl: Duration,
}

impl DispatchStore {
    pub fn new(pool: PgPool, retention: &RetentionConfig) -> Self {
        Self {
            pool,
            dispatch_retention: Duration::days(retention.dispatch_days),
            idempotency_ttl: Duration::hours(retention.idempotency_hours),
        }
    }

    /// The underlying connection pool (log and workspace queries share it).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new record at version 1 with status `PENDING` and a
    /// computed retention deadline.
    ///
    /// The idempotency-map write is best-effort: a failure is logged and
    /// the create still succeeds (replays within the window will miss and
    /// produce a fresh dispatch).
    pub async fn create(&self, mut new: NewDispatch) -> Result<Dispatch> {
        let now = Utc::now();
        new.expires_at = now + self.dispatch_retention;

        let dispatch = db::insert_dispatch(&self.pool, &new)
            .await?
            .ok_or_else(|| {
                Error::conflict(format!("dispatch {} already exists", new.dispatch_id))
            })?;

        if let Some(key) = &new.idempotency_key {
            let expires_at = now + self.idempotency_ttl;
            if let Err(err) = idem_db::put_mapping(
                &self.pool,
                &new.user_id,
                key,
                new.dispatch_id,
                expires_at,
            )
            .await
            {
                warn!(
                    dispatch_id = %new.dispatch_id,
                    user_id = %new.user_id,
                    error = %err,
                    "idempotency map write failed (best-effort, create succeeded)"
                );
            }
        }

        Ok(dispatch)
    }

    /// Resolve a live `(user, idempotency key)` pair to its dispatch.
    ///
    /// Returns `None` on a map miss, an expired mapping, a dangling
    /// mapping (record already purged), or a map read failure -- the
    /// caller proceeds with a fresh create in all of those cases.
    pub async fn find_by_idempotency(&self, user_id: &str, key: &str) -> Result<Option<Dispatch>> {
        let mapped = match idem_db::get_mapping(&self.pool, user_id, key).await {
            Ok(mapped) => mapped,
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    error = %err,
                    "idempotency map lookup failed, treating as miss"
                );
                return Ok(None);
            }
        };

        match mapped {
            Some(dispatch_id) => Ok(db::get_dispatch(&self.pool, dispatch_id).await?),
            None => Ok(None),
        }
    }

    /// Fetch a dispatch; fails with `NotFound` when absent.
    pub async fn get(&self, dispatch_id: Uuid) -> Result<Dispatch> {
        db::get_dispatch(&self.pool, dispatch_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("dispatch {dispatch_id} not found")))
    }

    /// Fetch a dispatch by the ARN of its launched task.
    pub async fn find_by_task_arn(&self, task_arn: &str) -> Result<Option<Dispatch>> {
        Ok(db::get_dispatch_by_task_arn(&self.pool, task_arn).await?)
    }

    /// Execute a version-guarded status transition.
    ///
    /// On success the returned record carries `version = expected_version
    /// + 1`. On guard failure the record is re-read and the failure is
    /// classified: missing row -> `NotFound`; stale version -> `Conflict`
    /// carrying both versions; version match but illegal edge (e.g. the
    /// record is already terminal) -> `Conflict` describing the current
    /// status.
    pub async fn update_status(
        &self,
        dispatch_id: Uuid,
        expected_version: i32,
        new_status: DispatchStatus,
        patch: StatusPatch,
    ) -> Result<Dispatch> {
        let updated =
            db::transition_dispatch(&self.pool, dispatch_id, expected_version, new_status, &patch)
                .await?;

        if let Some(dispatch) = updated {
            return Ok(dispatch);
        }

        // The guard failed. Re-read to say why.
        let current = db::get_dispatch(&self.pool, dispatch_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("dispatch {dispatch_id} not found")))?;

        if current.version != expected_version {
            Err(Error::version_conflict(
                format!(
                    "dispatch {dispatch_id} is at version {}, expected {}",
                    current.version, expected_version
                ),
                expected_version,
                current.version,
            ))
        } else {
            Err(Error::conflict(format!(
                "dispatch {dispatch_id} cannot transition from {} to {}",
                current.status, new_status
            )))
        }
    }

    /// Transition to `COMPLETED`, stamping `ended_at` when the patch does
    /// not already carry one.
    pub async fn mark_completed(
        &self,
        dispatch_id: Uuid,
        expected_version: i32,
        mut patch: StatusPatch,
    ) -> Result<Dispatch> {
        patch.ended_at.get_or_insert_with(Utc::now);
        self.update_status(dispatch_id, expected_version, DispatchStatus::Completed, patch)
            .await
    }

    /// Transition to `FAILED`, stamping `ended_at` when the patch does not
    /// already carry one.
    pub async fn mark_failed(
        &self,
        dispatch_id: Uuid,
        expected_version: i32,
        mut patch: StatusPatch,
    ) -> Result<Dispatch> {
        patch.ended_at.get_or_insert_with(Utc::now);
        self.update_status(dispatch_id, expected_version, DispatchStatus::Failed, patch)
            .await
    }

    /// Stamp an error message on a still-running dispatch without a
    /// lifecycle transition (cancellation's optimistic note).
    pub async fn stamp_error_message(&self, dispatch_id: Uuid, message: &str) -> Result<()> {
        db::set_error_message_if_running(&self.pool, dispatch_id, message).await?;
        Ok(())
    }

    /// List a user's dispatches, newest first.
    ///
    /// `cursor` is the opaque token from a previous page; a malformed
    /// token fails with `Validation`. The returned `next_cursor` is
    /// present only when the page was full, i.e. more rows may exist.
    pub async fn list_by_user(
        &self,
        user_id: &str,
        limit: i64,
        cursor: Option<&str>,
        status: Option<DispatchStatus>,
        tags: Option<&serde_json::Value>,
    ) -> Result<DispatchPage> {
        let limit = limit.clamp(1, 100);
        let cursor = cursor
            .map(PageCursor::decode)
            .transpose()
            .map_err(|err| Error::validation(format!("invalid cursor: {err}")))?;

        let items = db::list_for_user(&self.pool, user_id, limit, cursor, status, tags).await?;

        let next_cursor = if items.len() as i64 == limit {
            items.last().map(|d| {
                PageCursor {
                    started_at: d.started_at,
                    dispatch_id: d.dispatch_id,
                }
                .encode()
            })
        } else {
            None
        };

        Ok(DispatchPage { items, next_cursor })
    }

    /// Count a user's live dispatches (quota input).
    pub async fn count_active(&self, user_id: &str) -> Result<i64> {
        Ok(db::count_active_for_user(&self.pool, user_id).await?)
    }

    /// Aggregate metrics over records started in the trailing window.
    pub async fn dispatch_metrics(&self, since_hours: i64) -> Result<DispatchMetrics> {
        let since = Utc::now() - Duration::hours(since_hours);
        Ok(db::dispatch_metrics(&self.pool, since).await?)
    }

    /// Remove records whose retention window has passed. Returns the
    /// number of dispatches deleted.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(db::purge_expired(&self.pool, now).await?)
    }

    /// Remove expired idempotency mappings.
    pub async fn purge_expired_idempotency(&self) -> Result<u64> {
        Ok(idem_db::purge_expired(&self.pool).await?)
    }
}
