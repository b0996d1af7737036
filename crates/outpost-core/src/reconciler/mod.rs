//! The state-transition reconciler.
//!
//! Consumes task-terminated events (delivered at-least-once), maps them to
//! terminal dispatch statuses, and applies them through the store's
//! version guard with bounded jittered retries. Replayed events converge
//! to a benign no-op because terminal states are absorbing.

pub mod consumer;
pub mod extract;
pub mod status_map;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use outpost_db::models::{DispatchStatus, StatusPatch};

use crate::error::{Error, Result};
use crate::pool::{SlotOutcome, WarmPool};
use crate::store::DispatchStore;

pub use crate::platform::types::TaskStateEvent;
pub use status_map::{TerminalOutcome, map_terminal};

/// Conflict retry bounds: up to 3 attempts with 20-200 ms jitter.
const MAX_APPLY_ATTEMPTS: u32 = 3;
const RETRY_JITTER_MS: std::ops::RangeInclusive<u64> = 20..=200;

/// What processing an event amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Event was not a termination; nothing to do.
    NotTerminal,
    /// No dispatch id could be resolved; acknowledged and dropped.
    Unmatched,
    /// The dispatch was already terminal; replay converged to a no-op.
    AlreadyTerminal { dispatch_id: Uuid },
    /// A terminal status was applied.
    Applied {
        dispatch_id: Uuid,
        status: DispatchStatus,
    },
}

/// Applies terminal task events to dispatch records.
pub struct Reconciler {
    store: DispatchStore,
    warm_pool: Arc<WarmPool>,
}

impl Reconciler {
    pub fn new(store: DispatchStore, warm_pool: Arc<WarmPool>) -> Self {
        Self { store, warm_pool }
    }

    /// Process one task-state event.
    ///
    /// Safe to call with duplicates: the version guard plus terminal-state
    /// absorption make replays converge without repeated side effects.
    pub async fn process_event(&self, event: &TaskStateEvent) -> Result<ReconcileOutcome> {
        if event.last_status != "STOPPED" {
            return Ok(ReconcileOutcome::NotTerminal);
        }

        let dispatch_id = match self.resolve_dispatch_id(event).await? {
            Some(id) => id,
            None => {
                info!(
                    task_arn = %event.task_arn,
                    "no dispatch resolved for terminated task, dropping event"
                );
                return Ok(ReconcileOutcome::Unmatched);
            }
        };

        let outcome = map_terminal(event);
        if outcome.fell_through {
            warn!(
                dispatch_id = %dispatch_id,
                task_arn = %event.task_arn,
                stopped_reason = event.stopped_reason.as_deref().unwrap_or(""),
                "terminal mapping fell through to default FAILED"
            );
        }

        let applied = self.apply_with_retry(dispatch_id, event, &outcome).await?;

        if matches!(applied, ReconcileOutcome::Applied { .. }) {
            let slot_outcome = if outcome.status == DispatchStatus::Completed {
                SlotOutcome::Clean
            } else {
                SlotOutcome::Faulted
            };
            self.warm_pool
                .release_for_dispatch(dispatch_id, slot_outcome)
                .await;
        }

        Ok(applied)
    }

    async fn resolve_dispatch_id(&self, event: &TaskStateEvent) -> Result<Option<Uuid>> {
        if let Some(id) = extract::dispatch_id_from_event(event) {
            return Ok(Some(id));
        }
        // Fall back to the task-ARN index.
        Ok(self
            .store
            .find_by_task_arn(&event.task_arn)
            .await?
            .map(|d| d.dispatch_id))
    }

    /// Read-then-conditional-write, retried on version conflicts.
    ///
    /// The expected version is re-read immediately before every attempt;
    /// a record observed terminal at any point is a benign no-op.
    async fn apply_with_retry(
        &self,
        dispatch_id: Uuid,
        event: &TaskStateEvent,
        outcome: &TerminalOutcome,
    ) -> Result<ReconcileOutcome> {
        for attempt in 0..MAX_APPLY_ATTEMPTS {
            let current = match self.store.get(dispatch_id).await {
                Ok(current) => current,
                Err(err) if err.is_not_found() => {
                    info!(
                        dispatch_id = %dispatch_id,
                        "dispatch vanished before reconciliation, dropping event"
                    );
                    return Ok(ReconcileOutcome::Unmatched);
                }
                Err(err) => return Err(err),
            };

            if current.status.is_terminal() {
                debug!(
                    dispatch_id = %dispatch_id,
                    status = %current.status,
                    "dispatch already terminal, event is a no-op"
                );
                return Ok(ReconcileOutcome::AlreadyTerminal { dispatch_id });
            }

            let patch = StatusPatch {
                ended_at: Some(event.stopped_at.unwrap_or_else(Utc::now)),
                exit_code: outcome.exit_code,
                error_message: outcome.error_message.clone(),
                stopped_reason: event.stopped_reason.clone(),
                ..Default::default()
            };

            match self
                .store
                .update_status(dispatch_id, current.version, outcome.status, patch)
                .await
            {
                Ok(updated) => {
                    info!(
                        dispatch_id = %dispatch_id,
                        status = %updated.status,
                        version = updated.version,
                        "dispatch reconciled to terminal state"
                    );
                    return Ok(ReconcileOutcome::Applied {
                        dispatch_id,
                        status: updated.status,
                    });
                }
                Err(err) if err.is_conflict() && attempt + 1 < MAX_APPLY_ATTEMPTS => {
                    let backoff = rand::rng().random_range(RETRY_JITTER_MS);
                    debug!(
                        dispatch_id = %dispatch_id,
                        attempt = attempt + 1,
                        backoff_ms = backoff,
                        "version conflict applying terminal status, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::conflict(format!(
            "could not apply terminal status to dispatch {dispatch_id} after {MAX_APPLY_ATTEMPTS} attempts"
        )))
    }
}
