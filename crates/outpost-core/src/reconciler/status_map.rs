//! Terminal-status mapping rules.
//!
//! Maps a STOPPED task event to a dispatch outcome. The substring rules on
//! `stopped_reason` are matched in lowercase and ordered first-match-wins;
//! keep them in one place so wording drift upstream is a one-file change.
//! Events that fall through to the default are flagged so the caller can
//! log them for drift detection.

use outpost_db::models::DispatchStatus;

use crate::platform::types::{StopCode, TaskStateEvent};

/// The outcome derived from a terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalOutcome {
    pub status: DispatchStatus,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    /// True when no rule matched and the default (`FAILED`) was used.
    pub fell_through: bool,
}

/// Map a STOPPED event to its dispatch outcome. First match wins.
pub fn map_terminal(event: &TaskStateEvent) -> TerminalOutcome {
    let main = event.main_container();
    let exit_code = main.and_then(|c| c.exit_code);
    let never_started = main.is_none_or(|c| c.started_at.is_none());
    let reason = event.stopped_reason.clone().unwrap_or_default();
    let reason_lower = reason.to_lowercase();

    let outcome = |status, error_message: Option<String>| TerminalOutcome {
        status,
        error_message,
        exit_code,
        fell_through: false,
    };

    if event.stop_code == Some(StopCode::UserInitiated)
        && (reason_lower.contains("cancel") || reason_lower.contains("abort"))
    {
        return outcome(DispatchStatus::Cancelled, non_empty(reason));
    }

    if event.stop_code == Some(StopCode::UserInitiated) && exit_code.is_none() && never_started {
        return outcome(DispatchStatus::Cancelled, non_empty(reason));
    }

    if reason_lower.contains("timeout")
        || reason_lower.contains("timed out")
        || reason_lower.contains("exceeded time limit")
    {
        return outcome(DispatchStatus::Timeout, non_empty(reason));
    }

    if reason_lower.contains("error")
        || reason_lower.contains("failed")
        || reason_lower.contains("oom")
        || reason_lower.contains("out of memory")
    {
        return outcome(DispatchStatus::Failed, non_empty(reason));
    }

    if event.stop_code == Some(StopCode::TaskFailedToStart) {
        return outcome(DispatchStatus::Failed, non_empty(reason));
    }

    match exit_code {
        Some(0) => return outcome(DispatchStatus::Completed, None),
        Some(code) => {
            return outcome(
                DispatchStatus::Failed,
                Some(format!("container exited with code {code}")),
            );
        }
        None => {}
    }

    if matches!(
        event.stop_code,
        Some(StopCode::SpotInterruption) | Some(StopCode::TerminationNotice)
    ) {
        return outcome(DispatchStatus::Failed, non_empty(reason));
    }

    TerminalOutcome {
        status: DispatchStatus::Failed,
        error_message: non_empty(reason).or_else(|| Some("task stopped".to_string())),
        exit_code,
        fell_through: true,
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}
