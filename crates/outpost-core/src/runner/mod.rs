//! The task runner: turns a dispatch record into a launched container
//! task.
//!
//! Builds the run spec from the agent's compile-time profile plus the
//! dispatch's overrides, validates additional secret references, and asks
//! the platform to launch. The dispatch id is embedded redundantly (env
//! var, task group, resource tag) so the reconciler can always resolve a
//! terminal event back to its dispatch.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use outpost_db::models::Dispatch;

use crate::agents;
use crate::error::{Error, Result};
use crate::platform::types::{LaunchedTask, RunTaskSpec};
use crate::platform::TaskPlatform;
use crate::secrets::SecretStore;

/// Launches container tasks from agent templates.
pub struct TaskRunner {
    platform: Arc<dyn TaskPlatform>,
    secrets: Arc<dyn SecretStore>,
}

impl TaskRunner {
    pub fn new(platform: Arc<dyn TaskPlatform>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { platform, secrets }
    }

    /// Launch the container task for a dispatch.
    ///
    /// Fails fast when a secret reference is unknown or the platform
    /// rejects the launch; the caller transitions the dispatch to
    /// `FAILED`.
    pub async fn launch(&self, dispatch: &Dispatch, slot_id: Uuid) -> Result<LaunchedTask> {
        for secret in &dispatch.additional_secrets {
            let known = self.secrets.exists(secret).await.map_err(|err| {
                Error::unavailable(format!("secret store unavailable: {err}"))
            })?;
            if !known {
                return Err(Error::validation(format!(
                    "unknown secret reference: {secret}"
                )));
            }
        }

        let spec = build_run_spec(dispatch);

        let launched = self
            .platform
            .run_task(&spec)
            .await
            .map_err(|err| Error::unavailable(err.to_string()))?;

        info!(
            dispatch_id = %dispatch.dispatch_id,
            slot_id = %slot_id,
            task_arn = %launched.task_arn,
            "task launched"
        );

        Ok(launched)
    }
}

/// Build the platform run spec for a dispatch.
fn build_run_spec(dispatch: &Dispatch) -> RunTaskSpec {
    let profile = agents::profile(dispatch.agent_kind);

    let mut env = vec![
        ("DISPATCH_ID".to_string(), dispatch.dispatch_id.to_string()),
        ("TASK".to_string(), dispatch.task.clone()),
        ("MODEL_ID".to_string(), dispatch.model_id.clone()),
        (
            "TIMEOUT_SECONDS".to_string(),
            dispatch.timeout_seconds.to_string(),
        ),
        (
            "WORKSPACE_INIT_MODE".to_string(),
            dispatch.workspace_init_mode.to_string(),
        ),
    ];
    if let Some(repo_url) = &dispatch.repo_url {
        env.push(("REPO_URL".to_string(), repo_url.clone()));
    }
    if let Some(branch) = &dispatch.branch {
        env.push(("BRANCH".to_string(), branch.clone()));
    }

    let mut secret_refs: Vec<String> =
        profile.secret_names.iter().map(|s| s.to_string()).collect();
    secret_refs.extend(dispatch.additional_secrets.iter().cloned());

    RunTaskSpec {
        dispatch_id: dispatch.dispatch_id,
        agent_kind: dispatch.agent_kind,
        template: profile.task_template.to_string(),
        group: format!("dispatch:{}", dispatch.dispatch_id),
        env,
        secret_refs,
        cpu_units: dispatch.cpu_units.or(Some(profile.default_cpu_units)),
        memory_mb: dispatch.memory_mb.or(Some(profile.default_memory_mb)),
        tags: vec![(
            "dispatch_id".to_string(),
            dispatch.dispatch_id.to_string(),
        )],
    }
}
