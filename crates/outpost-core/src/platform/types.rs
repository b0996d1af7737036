//! Wire types shared between the task platform and the reconciler.
//!
//! [`TaskStateEvent`] mirrors the relevant slice of the ECS
//! task-state-change event (EventBridge `detail` payload, camelCase
//! fields). Unknown fields are ignored so upstream additions do not break
//! deserialization.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use outpost_db::models::AgentKind;

/// Why the platform stopped a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCode {
    TaskFailedToStart,
    EssentialContainerExited,
    UserInitiated,
    ServiceSchedulerInitiated,
    SpotInterruption,
    TerminationNotice,
}

impl fmt::Display for StopCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskFailedToStart => "TaskFailedToStart",
            Self::EssentialContainerExited => "EssentialContainerExited",
            Self::UserInitiated => "UserInitiated",
            Self::ServiceSchedulerInitiated => "ServiceSchedulerInitiated",
            Self::SpotInterruption => "SpotInterruption",
            Self::TerminationNotice => "TerminationNotice",
        };
        f.write_str(s)
    }
}

impl FromStr for StopCode {
    type Err = StopCodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TaskFailedToStart" => Ok(Self::TaskFailedToStart),
            "EssentialContainerExited" => Ok(Self::EssentialContainerExited),
            "UserInitiated" => Ok(Self::UserInitiated),
            "ServiceSchedulerInitiated" => Ok(Self::ServiceSchedulerInitiated),
            "SpotInterruption" => Ok(Self::SpotInterruption),
            "TerminationNotice" => Ok(Self::TerminationNotice),
            other => Err(StopCodeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StopCode`] string.
#[derive(Debug, Clone)]
pub struct StopCodeParseError(pub String);

impl fmt::Display for StopCodeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid stop code: {:?}", self.0)
    }
}

impl std::error::Error for StopCodeParseError {}

/// One name/value pair in a container environment override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvPair {
    pub name: String,
    pub value: String,
}

/// Environment overrides for a single container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerOverride {
    pub name: Option<String>,
    pub environment: Vec<EnvPair>,
}

/// Task-level overrides attached to the original run request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskOverrides {
    pub container_overrides: Vec<ContainerOverride>,
}

/// A resource tag on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskTag {
    pub key: String,
    pub value: String,
}

/// Per-container detail in a task-state-change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerDetail {
    pub name: Option<String>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// A task-state-change event as delivered by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskStateEvent {
    pub task_arn: String,
    pub cluster_arn: Option<String>,
    pub last_status: String,
    pub desired_status: Option<String>,
    #[serde(deserialize_with = "lenient_stop_code")]
    pub stop_code: Option<StopCode>,
    pub stopped_reason: Option<String>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub started_by: Option<String>,
    pub group: Option<String>,
    pub containers: Vec<ContainerDetail>,
    pub overrides: Option<TaskOverrides>,
    pub tags: Vec<TaskTag>,
}

/// Tolerate stop codes this build does not know about: they decode to
/// `None` instead of failing the whole event.
fn lenient_stop_code<'de, D>(deserializer: D) -> Result<Option<StopCode>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

impl TaskStateEvent {
    /// The container whose exit code decides the dispatch outcome: the one
    /// named `worker` if present, else the first container.
    pub fn main_container(&self) -> Option<&ContainerDetail> {
        self.containers
            .iter()
            .find(|c| c.name.as_deref() == Some("worker"))
            .or_else(|| self.containers.first())
    }
}

// ---------------------------------------------------------------------------
// Launch request
// ---------------------------------------------------------------------------

/// Everything the platform needs to launch one agent task.
#[derive(Debug, Clone)]
pub struct RunTaskSpec {
    pub dispatch_id: Uuid,
    pub agent_kind: AgentKind,
    /// Task-definition family to launch from.
    pub template: String,
    /// Task group, `dispatch:{dispatch_id}`.
    pub group: String,
    /// Environment for the worker container.
    pub env: Vec<(String, String)>,
    /// Secret names the container resolves at start.
    pub secret_refs: Vec<String>,
    pub cpu_units: Option<i32>,
    pub memory_mb: Option<i32>,
    /// Resource tags, always including `dispatch_id`.
    pub tags: Vec<(String, String)>,
}

/// A task accepted by the platform (not necessarily running yet).
#[derive(Debug, Clone)]
pub struct LaunchedTask {
    pub task_arn: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_code_display_roundtrip() {
        let variants = [
            StopCode::TaskFailedToStart,
            StopCode::EssentialContainerExited,
            StopCode::UserInitiated,
            StopCode::ServiceSchedulerInitiated,
            StopCode::SpotInterruption,
            StopCode::TerminationNotice,
        ];
        for v in &variants {
            let parsed: StopCode = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
        assert!("Mystery".parse::<StopCode>().is_err());
    }

    #[test]
    fn event_deserializes_from_camel_case_detail() {
        let json = serde_json::json!({
            "taskArn": "arn:aws:ecs:us-east-1:123456789012:task/outpost/abc",
            "clusterArn": "arn:aws:ecs:us-east-1:123456789012:cluster/outpost",
            "lastStatus": "STOPPED",
            "desiredStatus": "STOPPED",
            "stopCode": "EssentialContainerExited",
            "stoppedReason": "Essential container in task exited",
            "stoppedAt": "2026-01-01T00:10:00Z",
            "group": "dispatch:0a361a70-71c1-4b5c-9d96-c7a3806ecb63",
            "containers": [
                { "name": "worker", "exitCode": 0 }
            ],
            "overrides": {
                "containerOverrides": [
                    {
                        "name": "worker",
                        "environment": [
                            { "name": "DISPATCH_ID", "value": "0a361a70-71c1-4b5c-9d96-c7a3806ecb63" }
                        ]
                    }
                ]
            },
            "unknownFutureField": true
        });
        let event: TaskStateEvent = serde_json::from_value(json).expect("should deserialize");
        assert_eq!(event.last_status, "STOPPED");
        assert_eq!(event.stop_code, Some(StopCode::EssentialContainerExited));
        assert_eq!(event.main_container().unwrap().exit_code, Some(0));
    }

    #[test]
    fn unknown_stop_code_decodes_to_none() {
        let json = serde_json::json!({
            "taskArn": "arn:x",
            "lastStatus": "STOPPED",
            "stopCode": "SomethingNew"
        });
        let event: TaskStateEvent = serde_json::from_value(json).expect("should deserialize");
        assert_eq!(event.stop_code, None);
    }

    #[test]
    fn main_container_prefers_worker() {
        let event = TaskStateEvent {
            containers: vec![
                ContainerDetail {
                    name: Some("sidecar".to_string()),
                    exit_code: Some(1),
                    ..Default::default()
                },
                ContainerDetail {
                    name: Some("worker".to_string()),
                    exit_code: Some(0),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(event.main_container().unwrap().exit_code, Some(0));
    }

    #[test]
    fn main_container_falls_back_to_first() {
        let event = TaskStateEvent {
            containers: vec![ContainerDetail {
                name: Some("main".to_string()),
                exit_code: Some(2),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(event.main_container().unwrap().exit_code, Some(2));
    }
}
