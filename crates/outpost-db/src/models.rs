use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a dispatch.
///
/// `PENDING` and `RUNNING` are live; the other four are terminal and
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DispatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl DispatchStatus {
    /// Whether this status is terminal (absorbing).
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the lifecycle graph permits a `from -> to` edge.
    ///
    /// ```text
    /// PENDING -> RUNNING | CANCELLED | FAILED
    /// RUNNING -> COMPLETED | FAILED | TIMEOUT | CANCELLED
    /// ```
    pub fn can_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Timeout)
                | (Self::Running, Self::Cancelled)
        )
    }

    /// The set of source statuses from which `to` is reachable.
    pub fn valid_sources(to: Self) -> &'static [Self] {
        match to {
            Self::Running => &[Self::Pending],
            Self::Completed | Self::Timeout => &[Self::Running],
            Self::Failed | Self::Cancelled => &[Self::Pending, Self::Running],
            Self::Pending => &[],
        }
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

impl FromStr for DispatchStatus {
    type Err = DispatchStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "TIMEOUT" => Ok(Self::Timeout),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(DispatchStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DispatchStatus`] string.
#[derive(Debug, Clone)]
pub struct DispatchStatusParseError(pub String);

impl fmt::Display for DispatchStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid dispatch status: {:?}", self.0)
    }
}

impl std::error::Error for DispatchStatusParseError {}

// ---------------------------------------------------------------------------

/// The closed set of supported agent identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
    Aider,
    Grok,
}

impl AgentKind {
    /// All supported agent kinds, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Claude,
        Self::Codex,
        Self::Gemini,
        Self::Aider,
        Self::Grok,
    ];
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Aider => "aider",
            Self::Grok => "grok",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentKind {
    type Err = AgentKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            "aider" => Ok(Self::Aider),
            "grok" => Ok(Self::Grok),
            other => Err(AgentKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentKind`] string.
#[derive(Debug, Clone)]
pub struct AgentKindParseError(pub String);

impl fmt::Display for AgentKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent kind: {:?}", self.0)
    }
}

impl std::error::Error for AgentKindParseError {}

// ---------------------------------------------------------------------------

/// How much of the repository checkout to prepare before the agent starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceInitMode {
    Full,
    Minimal,
    None,
}

impl fmt::Display for WorkspaceInitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Full => "full",
            Self::Minimal => "minimal",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkspaceInitMode {
    type Err = WorkspaceInitModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "minimal" => Ok(Self::Minimal),
            "none" => Ok(Self::None),
            other => Err(WorkspaceInitModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkspaceInitMode`] string.
#[derive(Debug, Clone)]
pub struct WorkspaceInitModeParseError(pub String);

impl fmt::Display for WorkspaceInitModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workspace init mode: {:?}", self.0)
    }
}

impl std::error::Error for WorkspaceInitModeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A dispatch -- one scheduled execution of an agent against a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Dispatch {
    pub dispatch_id: Uuid,
    pub user_id: String,
    pub agent_kind: AgentKind,
    pub model_id: String,
    pub task: String,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub workspace_init_mode: WorkspaceInitMode,
    pub timeout_seconds: i64,
    pub cpu_units: Option<i32>,
    pub memory_mb: Option<i32>,
    pub disk_gb: Option<i32>,
    pub additional_secrets: Vec<String>,
    pub tags: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub status: DispatchStatus,
    pub version: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub task_arn: Option<String>,
    pub workspace_id: Option<Uuid>,
    pub artifacts_url: Option<String>,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub stopped_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Input for inserting a new dispatch record.
#[derive(Debug, Clone)]
pub struct NewDispatch {
    pub dispatch_id: Uuid,
    pub user_id: String,
    pub agent_kind: AgentKind,
    pub model_id: String,
    pub task: String,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub workspace_init_mode: WorkspaceInitMode,
    pub timeout_seconds: i64,
    pub cpu_units: Option<i32>,
    pub memory_mb: Option<i32>,
    pub disk_gb: Option<i32>,
    pub additional_secrets: Vec<String>,
    pub tags: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub workspace_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

/// Fields applied alongside a status transition.
///
/// `None` leaves the stored value untouched (COALESCE semantics in the
/// conditional update).
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub task_arn: Option<String>,
    pub workspace_id: Option<Uuid>,
    pub artifacts_url: Option<String>,
    pub error_message: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stopped_reason: Option<String>,
}

/// An idempotency mapping row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IdempotencyMapping {
    pub user_id: String,
    pub idempotency_key: String,
    pub dispatch_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// A log line captured from a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DispatchLog {
    pub id: i64,
    pub dispatch_id: Uuid,
    pub line: String,
    pub recorded_at: DateTime<Utc>,
}

/// A repository checkout prepared for a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workspace {
    pub workspace_id: Uuid,
    pub dispatch_id: Uuid,
    pub repo_url: String,
    pub branch: Option<String>,
    pub init_mode: WorkspaceInitMode,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_status_display_roundtrip() {
        let variants = [
            DispatchStatus::Pending,
            DispatchStatus::Running,
            DispatchStatus::Completed,
            DispatchStatus::Failed,
            DispatchStatus::Timeout,
            DispatchStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: DispatchStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn dispatch_status_invalid() {
        assert!("DONE".parse::<DispatchStatus>().is_err());
        assert!("pending".parse::<DispatchStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!DispatchStatus::Pending.is_terminal());
        assert!(!DispatchStatus::Running.is_terminal());
        assert!(DispatchStatus::Completed.is_terminal());
        assert!(DispatchStatus::Failed.is_terminal());
        assert!(DispatchStatus::Timeout.is_terminal());
        assert!(DispatchStatus::Cancelled.is_terminal());
    }

    #[test]
    fn transition_graph_edges() {
        use DispatchStatus::*;
        // Legal edges.
        assert!(DispatchStatus::can_transition(Pending, Running));
        assert!(DispatchStatus::can_transition(Pending, Cancelled));
        assert!(DispatchStatus::can_transition(Pending, Failed));
        assert!(DispatchStatus::can_transition(Running, Completed));
        assert!(DispatchStatus::can_transition(Running, Failed));
        assert!(DispatchStatus::can_transition(Running, Timeout));
        assert!(DispatchStatus::can_transition(Running, Cancelled));
        // Terminal states are absorbing.
        for from in [Completed, Failed, Timeout, Cancelled] {
            for to in [Pending, Running, Completed, Failed, Timeout, Cancelled] {
                assert!(!DispatchStatus::can_transition(from, to));
            }
        }
        // No skipping PENDING -> COMPLETED/TIMEOUT.
        assert!(!DispatchStatus::can_transition(Pending, Completed));
        assert!(!DispatchStatus::can_transition(Pending, Timeout));
    }

    #[test]
    fn valid_sources_match_graph() {
        use DispatchStatus::*;
        for to in [Running, Completed, Failed, Timeout, Cancelled] {
            for from in [Pending, Running, Completed, Failed, Timeout, Cancelled] {
                let in_sources = DispatchStatus::valid_sources(to).contains(&from);
                assert_eq!(in_sources, DispatchStatus::can_transition(from, to));
            }
        }
    }

    #[test]
    fn agent_kind_display_roundtrip() {
        for v in AgentKind::ALL {
            let parsed: AgentKind = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn agent_kind_invalid() {
        assert!("copilot".parse::<AgentKind>().is_err());
    }

    #[test]
    fn workspace_init_mode_roundtrip() {
        for v in [
            WorkspaceInitMode::Full,
            WorkspaceInitMode::Minimal,
            WorkspaceInitMode::None,
        ] {
            let parsed: WorkspaceInitMode = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&DispatchStatus::Pending).unwrap();
        assert_eq!(json, "\"PENDING\"");
        let json = serde_json::to_string(&AgentKind::Claude).unwrap();
        assert_eq!(json, "\"claude\"");
    }
}
