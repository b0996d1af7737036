//! The `TaskPlatform` trait -- the adapter interface for the container
//! platform that actually runs agent tasks.
//!
//! The production implementation drives Amazon ECS; tests substitute an
//! in-process fake. The trait is intentionally object-safe so it can be
//! shared as `Arc<dyn TaskPlatform>` between the orchestrator and the
//! runner.

pub mod ecs;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;

pub use ecs::EcsTaskPlatform;
pub use types::{LaunchedTask, RunTaskSpec, StopCode, TaskStateEvent};

/// Adapter interface for launching and stopping one-shot container tasks.
#[async_trait]
pub trait TaskPlatform: Send + Sync {
    /// Launch a task from the given spec.
    ///
    /// Returns once the platform has *accepted* the task; the task may not
    /// be running yet. Implementations must fail (rather than return an
    /// empty ARN) when the platform reports a placement failure.
    async fn run_task(&self, spec: &RunTaskSpec) -> Result<LaunchedTask>;

    /// Request that a running task stop.
    ///
    /// The terminal state arrives later via the event stream; this call
    /// only issues the stop.
    async fn stop_task(&self, task_arn: &str, reason: &str) -> Result<()>;

    /// Describe a task's current state, if the platform still knows it.
    async fn describe_task(&self, task_arn: &str) -> Result<Option<TaskStateEvent>>;
}

// Compile-time assertion: TaskPlatform must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn TaskPlatform) {}
};
