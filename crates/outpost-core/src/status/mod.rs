//! The read path: current record, paginated logs, derived progress.

use serde::Serialize;
use uuid::Uuid;

use chrono::{DateTime, Utc};
use outpost_db::cursor;
use outpost_db::models::{AgentKind, DispatchStatus};
use outpost_db::queries::dispatch_logs as log_db;

use crate::error::{Error, Result};
use crate::store::DispatchStore;

/// Cap on a single log page.
pub const LOG_LIMIT_MAX: i64 = 1000;
const LOG_LIMIT_DEFAULT: i64 = 100;

/// Options for a status read.
#[derive(Debug, Clone, Default)]
pub struct StatusQuery {
    /// Continuation token from the previous page.
    pub log_offset: Option<String>,
    /// Page size, capped at [`LOG_LIMIT_MAX`].
    pub log_limit: Option<i64>,
    /// Skip the log fetch entirely.
    pub skip_logs: bool,
}

/// The status view returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStatusView {
    pub dispatch_id: Uuid,
    pub status: DispatchStatus,
    pub agent: AgentKind,
    pub model_id: String,
    /// 0 while PENDING, 50 while RUNNING, 100 once terminal.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
    /// Continuation token for the next log page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_offset: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Derive the coarse progress figure from the lifecycle status.
pub fn progress_for(status: DispatchStatus) -> u8 {
    match status {
        DispatchStatus::Pending => 0,
        DispatchStatus::Running => 50,
        _ => 100,
    }
}

/// Read-side access to dispatch status and logs.
#[derive(Clone)]
pub struct StatusTracker {
    store: DispatchStore,
}

impl StatusTracker {
    pub fn new(store: DispatchStore) -> Self {
        Self { store }
    }

    /// Fetch the current record and, unless skipped, a page of logs.
    pub async fn status(&self, dispatch_id: Uuid, query: StatusQuery) -> Result<DispatchStatusView> {
        let dispatch = self.store.get(dispatch_id).await?;

        let (logs, log_offset) = if query.skip_logs {
            (None, None)
        } else {
            let limit = query
                .log_limit
                .unwrap_or(LOG_LIMIT_DEFAULT)
                .clamp(1, LOG_LIMIT_MAX);
            let after_id = match &query.log_offset {
                Some(token) => cursor::decode_log_offset(token)
                    .map_err(|err| Error::validation(format!("invalid log offset: {err}")))?,
                None => 0,
            };
            let lines = log_db::page_lines(self.store.pool(), dispatch_id, after_id, limit).await?;
            let next = if lines.len() as i64 == limit {
                lines.last().map(|l| cursor::encode_log_offset(l.id))
            } else {
                None
            };
            (
                Some(lines.into_iter().map(|l| l.line).collect()),
                next,
            )
        };

        Ok(DispatchStatusView {
            dispatch_id: dispatch.dispatch_id,
            status: dispatch.status,
            agent: dispatch.agent_kind,
            model_id: dispatch.model_id,
            progress: progress_for(dispatch.status),
            logs,
            log_offset,
            started_at: dispatch.started_at,
            ended_at: dispatch.ended_at,
            task_arn: dispatch.task_arn,
            exit_code: dispatch.exit_code,
            error_message: dispatch.error_message,
        })
    }
}
