//! The dispatch orchestrator -- the façade for new work.
//!
//! Sequencing for a new dispatch: validate, idempotency check, quota,
//! persist PENDING, warm-pool checkout, launch, flip to RUNNING. Any
//! failure after the record exists finalizes it to FAILED so no dispatch
//! is ever left PENDING with nothing in flight. A version conflict at the
//! final flip means the client cancelled concurrently; the launched task
//! is stopped and the cancellation stands.

pub mod request;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use outpost_db::models::{DispatchStatus, NewDispatch, StatusPatch};
use outpost_db::queries::workspaces as workspace_db;

use crate::agents;
use crate::config::OutpostConfig;
use crate::error::{Error, Result};
use crate::platform::TaskPlatform;
use crate::pool::{Checkout, SlotOutcome, WarmPool};
use crate::runner::TaskRunner;
use crate::store::DispatchStore;

pub use request::{DispatchRequest, ResourceConstraints};

/// Response for an accepted (or replayed) dispatch request.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    pub dispatch_id: Uuid,
    pub status: DispatchStatus,
    pub agent: outpost_db::models::AgentKind,
    pub model_id: String,
    pub estimated_start_time: DateTime<Utc>,
    /// Present and true only for idempotent replays.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
}

/// Response for a cancellation request.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub dispatch_id: Uuid,
    pub status: DispatchStatus,
    pub message: String,
}

/// The façade for new work.
pub struct DispatchOrchestrator {
    store: DispatchStore,
    warm_pool: Arc<WarmPool>,
    runner: TaskRunner,
    platform: Arc<dyn TaskPlatform>,
    config: Arc<OutpostConfig>,
}

impl DispatchOrchestrator {
    pub fn new(
        store: DispatchStore,
        warm_pool: Arc<WarmPool>,
        runner: TaskRunner,
        platform: Arc<dyn TaskPlatform>,
        config: Arc<OutpostConfig>,
    ) -> Self {
        Self {
            store,
            warm_pool,
            runner,
            platform,
            config,
        }
    }

    /// Accept a dispatch request for a tenant.
    pub async fn dispatch(
        &self,
        user_id: &str,
        request: DispatchRequest,
    ) -> Result<DispatchReceipt> {
        request.validate()?;

        // Idempotent replay: same (user, key) within the window returns
        // the original identity.
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency(user_id, key).await? {
                info!(
                    dispatch_id = %existing.dispatch_id,
                    user_id = %user_id,
                    "idempotent replay"
                );
                return Ok(DispatchReceipt {
                    dispatch_id: existing.dispatch_id,
                    status: existing.status,
                    agent: existing.agent_kind,
                    model_id: existing.model_id,
                    estimated_start_time: Utc::now(),
                    idempotent: Some(true),
                });
            }
        }

        // Tenant quota over live dispatches.
        let active = self.store.count_active(user_id).await?;
        let limit = self.config.quota.limit_for(user_id);
        if active >= limit {
            return Err(Error::quota_exceeded(format!(
                "tenant {user_id} has {active} concurrent dispatches (limit {limit})"
            )));
        }

        let dispatch_id = Uuid::new_v4();
        let profile = agents::profile(request.agent);
        let model_id = request
            .model_id
            .clone()
            .unwrap_or_else(|| profile.default_model.to_string());

        // Record the workspace before the dispatch so its id can ride
        // along on the row.
        let workspace_id = match &request.repo {
            Some(repo_url) => Some(
                workspace_db::insert_workspace(
                    self.store.pool(),
                    dispatch_id,
                    repo_url,
                    request.branch.as_deref(),
                    request.workspace_init_mode,
                )
                .await
                .map_err(Error::Internal)?
                .workspace_id,
            ),
            None => None,
        };

        let rc = request.resource_constraints;
        let dispatch = self
            .store
            .create(NewDispatch {
                dispatch_id,
                user_id: user_id.to_string(),
                agent_kind: request.agent,
                model_id: model_id.clone(),
                task: request.task.clone(),
                repo_url: request.repo.clone(),
                branch: request.branch.clone(),
                workspace_init_mode: request.workspace_init_mode,
                timeout_seconds: request.timeout_seconds,
                cpu_units: rc.and_then(|rc| rc.cpu_units),
                memory_mb: rc.and_then(|rc| rc.memory_mb),
                disk_gb: rc.and_then(|rc| rc.disk_gb),
                additional_secrets: request.additional_secrets.clone(),
                tags: request
                    .tags
                    .as_ref()
                    .map(|tags| serde_json::to_value(tags).unwrap_or_default()),
                idempotency_key: request.idempotency_key.clone(),
                workspace_id,
                expires_at: Utc::now(), // store computes the real deadline
            })
            .await?;

        info!(
            dispatch_id = %dispatch_id,
            user_id = %user_id,
            agent = %request.agent,
            "dispatch accepted"
        );

        // Capacity: warm slot, cold slot, or reject at the cap.
        let Some(checkout) = self.warm_pool.checkout(request.agent).await else {
            self.store
                .mark_failed(
                    dispatch_id,
                    dispatch.version,
                    StatusPatch {
                        error_message: Some("pool exhausted".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            warn!(
                dispatch_id = %dispatch_id,
                agent = %request.agent,
                "pool exhausted, dispatch failed"
            );
            return Err(Error::unavailable(format!(
                "no capacity for agent {} (dispatch {dispatch_id} recorded as FAILED), retry shortly",
                request.agent
            )));
        };
        self.warm_pool
            .bind(request.agent, checkout.slot_id, dispatch_id)
            .await;

        // Launch; any failure here finalizes the record.
        let launched = match self.runner.launch(&dispatch, checkout.slot_id).await {
            Ok(launched) => launched,
            Err(err) => {
                self.warm_pool
                    .checkin(request.agent, checkout.slot_id, SlotOutcome::Faulted)
                    .await;
                let _ = self
                    .store
                    .mark_failed(
                        dispatch_id,
                        dispatch.version,
                        StatusPatch {
                            error_message: Some(format!("task failed to start: {err}")),
                            ..Default::default()
                        },
                    )
                    .await;
                return Err(err);
            }
        };

        // PENDING -> RUNNING with the task ARN. A conflict here means the
        // client cancelled while we were launching; honor it.
        match self
            .store
            .update_status(
                dispatch_id,
                dispatch.version,
                DispatchStatus::Running,
                StatusPatch {
                    task_arn: Some(launched.task_arn.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(running) => Ok(DispatchReceipt {
                dispatch_id,
                status: running.status,
                agent: running.agent_kind,
                model_id: running.model_id,
                estimated_start_time: self.estimate_start(&checkout),
                idempotent: None,
            }),
            Err(err) if err.is_conflict() => {
                warn!(
                    dispatch_id = %dispatch_id,
                    "cancelled during launch, stopping task"
                );
                if let Err(stop_err) = self
                    .platform
                    .stop_task(&launched.task_arn, "dispatch cancelled before start")
                    .await
                {
                    warn!(
                        dispatch_id = %dispatch_id,
                        task_arn = %launched.task_arn,
                        error = %stop_err,
                        "failed to stop task for cancelled dispatch"
                    );
                }
                self.warm_pool
                    .checkin(request.agent, checkout.slot_id, SlotOutcome::Faulted)
                    .await;
                let current = self.store.get(dispatch_id).await?;
                Ok(DispatchReceipt {
                    dispatch_id,
                    status: current.status,
                    agent: current.agent_kind,
                    model_id: current.model_id,
                    estimated_start_time: Utc::now(),
                    idempotent: None,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel a dispatch.
    ///
    /// Idempotent: cancelling a terminal dispatch reports its current
    /// status. A RUNNING dispatch gets a stop issued and is finalized
    /// later by the inbound terminal event.
    pub async fn cancel(&self, dispatch_id: Uuid, reason: &str) -> Result<CancelOutcome> {
        let current = self.store.get(dispatch_id).await?;

        if current.status.is_terminal() {
            return Ok(CancelOutcome {
                dispatch_id,
                status: current.status,
                message: format!("dispatch already finalized as {}", current.status),
            });
        }

        if current.status == DispatchStatus::Pending {
            match self
                .store
                .update_status(
                    dispatch_id,
                    current.version,
                    DispatchStatus::Cancelled,
                    StatusPatch {
                        error_message: Some(reason.to_string()),
                        ended_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(cancelled) => {
                    // Nothing launched yet; a racing launch observes this
                    // via its own version conflict and cleans up.
                    return Ok(CancelOutcome {
                        dispatch_id,
                        status: cancelled.status,
                        message: "dispatch cancelled".to_string(),
                    });
                }
                Err(err) if err.is_conflict() => {
                    // Lost the race to the launch path; fall through to
                    // the RUNNING treatment with fresh state.
                }
                Err(err) => return Err(err),
            }
        }

        let current = self.store.get(dispatch_id).await?;
        if current.status.is_terminal() {
            return Ok(CancelOutcome {
                dispatch_id,
                status: current.status,
                message: format!("dispatch already finalized as {}", current.status),
            });
        }

        if let Some(task_arn) = &current.task_arn {
            self.platform
                .stop_task(task_arn, reason)
                .await
                .map_err(|err| Error::unavailable(format!("failed to stop task: {err}")))?;
        }
        // Optimistic note; the terminal event carries the final word.
        self.store.stamp_error_message(dispatch_id, reason).await?;

        info!(dispatch_id = %dispatch_id, reason = %reason, "stop issued for dispatch");
        Ok(CancelOutcome {
            dispatch_id,
            status: DispatchStatus::Cancelled,
            message: "stop issued; finalization pending".to_string(),
        })
    }

    fn estimate_start(&self, checkout: &Checkout) -> DateTime<Utc> {
        if checkout.was_warm {
            Utc::now()
        } else {
            Utc::now() + Duration::seconds(self.config.cold_start_secs)
        }
    }
}
