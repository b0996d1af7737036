//! Dispatch request shape and validation.
//!
//! Validation happens before any record is written; a rejected request
//! leaves no trace.

use std::collections::BTreeMap;

use serde::Deserialize;

use outpost_db::models::{AgentKind, WorkspaceInitMode};

use crate::error::{Error, Result};

/// Bounds from the public contract.
pub const TASK_MIN_CHARS: usize = 10;
pub const TASK_MAX_CHARS: usize = 50_000;
pub const TIMEOUT_MIN_SECS: i64 = 30;
pub const TIMEOUT_MAX_SECS: i64 = 86_400;

const REPO_MAX_LEN: usize = 512;
const BRANCH_MAX_LEN: usize = 255;
const IDEMPOTENCY_KEY_MAX_LEN: usize = 128;
const MAX_TAGS: usize = 25;
const MAX_ADDITIONAL_SECRETS: usize = 10;

/// Requested CPU/memory/disk overrides.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConstraints {
    pub cpu_units: Option<i32>,
    pub memory_mb: Option<i32>,
    pub disk_gb: Option<i32>,
}

/// A validated-on-entry dispatch request.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub agent: AgentKind,
    pub task: String,
    pub model_id: Option<String>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    #[serde(default = "default_init_mode")]
    pub workspace_init_mode: WorkspaceInitMode,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub additional_secrets: Vec<String>,
    pub idempotency_key: Option<String>,
    pub tags: Option<BTreeMap<String, String>>,
    pub resource_constraints: Option<ResourceConstraints>,
}

fn default_init_mode() -> WorkspaceInitMode {
    WorkspaceInitMode::Full
}

fn default_timeout() -> i64 {
    3600
}

impl DispatchRequest {
    /// Check every bound and character rule. The first violation wins.
    pub fn validate(&self) -> Result<()> {
        let task_chars = self.task.chars().count();
        if task_chars < TASK_MIN_CHARS {
            return Err(Error::validation(format!(
                "task must be at least {TASK_MIN_CHARS} characters, got {task_chars}"
            )));
        }
        if task_chars > TASK_MAX_CHARS {
            return Err(Error::validation(format!(
                "task must be at most {TASK_MAX_CHARS} characters, got {task_chars}"
            )));
        }

        if self.timeout_seconds < TIMEOUT_MIN_SECS || self.timeout_seconds > TIMEOUT_MAX_SECS {
            return Err(Error::validation(format!(
                "timeout_seconds must be within [{TIMEOUT_MIN_SECS}, {TIMEOUT_MAX_SECS}], got {}",
                self.timeout_seconds
            )));
        }

        if let Some(repo) = &self.repo {
            validate_repo(repo)?;
        }

        if let Some(branch) = &self.branch {
            validate_branch(branch)?;
            if self.repo.is_none() {
                return Err(Error::validation(
                    "branch was supplied without a repository",
                ));
            }
        }

        if let Some(key) = &self.idempotency_key {
            if key.is_empty() || key.len() > IDEMPOTENCY_KEY_MAX_LEN {
                return Err(Error::validation(format!(
                    "idempotency_key must be 1-{IDEMPOTENCY_KEY_MAX_LEN} characters"
                )));
            }
            if !key.chars().all(|c| c.is_ascii_graphic()) {
                return Err(Error::validation(
                    "idempotency_key must be printable ASCII",
                ));
            }
        }

        if let Some(tags) = &self.tags {
            if tags.len() > MAX_TAGS {
                return Err(Error::validation(format!(
                    "at most {MAX_TAGS} tags are allowed"
                )));
            }
            for (key, value) in tags {
                if key.is_empty() || key.len() > 64 || value.len() > 256 {
                    return Err(Error::validation(format!(
                        "tag {key:?} is out of bounds (key 1-64 chars, value up to 256)"
                    )));
                }
            }
        }

        if self.additional_secrets.len() > MAX_ADDITIONAL_SECRETS {
            return Err(Error::validation(format!(
                "at most {MAX_ADDITIONAL_SECRETS} additional secrets are allowed"
            )));
        }
        for secret in &self.additional_secrets {
            if secret.is_empty()
                || !secret
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "/_+=.@-".contains(c))
            {
                return Err(Error::validation(format!(
                    "invalid secret reference: {secret:?}"
                )));
            }
        }

        if let Some(rc) = &self.resource_constraints {
            if let Some(cpu) = rc.cpu_units {
                if !(256..=16_384).contains(&cpu) {
                    return Err(Error::validation(format!(
                        "cpu_units must be within [256, 16384], got {cpu}"
                    )));
                }
            }
            if let Some(memory) = rc.memory_mb {
                if !(512..=122_880).contains(&memory) {
                    return Err(Error::validation(format!(
                        "memory_mb must be within [512, 122880], got {memory}"
                    )));
                }
            }
            if let Some(disk) = rc.disk_gb {
                if !(20..=200).contains(&disk) {
                    return Err(Error::validation(format!(
                        "disk_gb must be within [20, 200], got {disk}"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Repository identifiers: an https URL or a `host/owner/repo` /
/// `owner/repo` shorthand. No whitespace, a bounded length, and a
/// conservative character set.
fn validate_repo(repo: &str) -> Result<()> {
    if repo.is_empty() || repo.len() > REPO_MAX_LEN {
        return Err(Error::validation(format!(
            "repository identifier must be 1-{REPO_MAX_LEN} characters"
        )));
    }
    let rest = repo.strip_prefix("https://").unwrap_or(repo);
    if !rest.contains('/') {
        return Err(Error::validation(format!(
            "repository identifier {repo:?} must contain a '/'"
        )));
    }
    if !rest
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._-/:@".contains(c))
    {
        return Err(Error::validation(format!(
            "repository identifier {repo:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Branch names: git-plausible, no traversal.
fn validate_branch(branch: &str) -> Result<()> {
    if branch.is_empty() || branch.len() > BRANCH_MAX_LEN {
        return Err(Error::validation(format!(
            "branch must be 1-{BRANCH_MAX_LEN} characters"
        )));
    }
    if branch.contains("..")
        || branch.starts_with('/')
        || branch.ends_with('/')
        || !branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/".contains(c))
    {
        return Err(Error::validation(format!("invalid branch name: {branch:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(task_len: usize, timeout: i64) -> DispatchRequest {
        DispatchRequest {
            agent: AgentKind::Claude,
            task: "x".repeat(task_len),
            model_id: None,
            repo: None,
            branch: None,
            workspace_init_mode: WorkspaceInitMode::Full,
            timeout_seconds: timeout,
            additional_secrets: Vec::new(),
            idempotency_key: None,
            tags: None,
            resource_constraints: None,
        }
    }

    #[test]
    fn task_length_boundaries() {
        assert!(request(10, 3600).validate().is_ok());
        assert!(request(9, 3600).validate().is_err());
        assert!(request(50_000, 3600).validate().is_ok());
        assert!(request(50_001, 3600).validate().is_err());
    }

    #[test]
    fn task_length_counts_chars_not_bytes() {
        let mut req = request(0, 3600);
        req.task = "é".repeat(10); // 10 chars, 20 bytes
        assert!(req.validate().is_ok());
    }

    #[test]
    fn timeout_boundaries() {
        assert!(request(100, 30).validate().is_ok());
        assert!(request(100, 29).validate().is_err());
        assert!(request(100, 86_400).validate().is_ok());
        assert!(request(100, 86_401).validate().is_err());
    }

    #[test]
    fn repo_forms() {
        for repo in [
            "github.com/acme/auth-service",
            "acme/auth-service",
            "https://github.com/acme/auth.service",
            "git.internal:8443/acme/infra",
        ] {
            let mut req = request(100, 3600);
            req.repo = Some(repo.to_string());
            assert!(req.validate().is_ok(), "repo: {repo}");
        }
        for repo in ["", "justaname", "has space/repo", "bad;chars/repo"] {
            let mut req = request(100, 3600);
            req.repo = Some(repo.to_string());
            assert!(req.validate().is_err(), "repo: {repo}");
        }
    }

    #[test]
    fn branch_requires_repo() {
        let mut req = request(100, 3600);
        req.branch = Some("main".to_string());
        assert!(req.validate().is_err());

        req.repo = Some("acme/auth".to_string());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn branch_rejects_traversal() {
        let mut req = request(100, 3600);
        req.repo = Some("acme/auth".to_string());
        for branch in ["../etc", "feature/../../x", "/leading", "trailing/"] {
            req.branch = Some(branch.to_string());
            assert!(req.validate().is_err(), "branch: {branch}");
        }
        req.branch = Some("feature/pkce-flow".to_string());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn idempotency_key_bounds() {
        let mut req = request(100, 3600);
        req.idempotency_key = Some("k-42".to_string());
        assert!(req.validate().is_ok());

        req.idempotency_key = Some(String::new());
        assert!(req.validate().is_err());

        req.idempotency_key = Some("x".repeat(129));
        assert!(req.validate().is_err());

        req.idempotency_key = Some("has space".to_string());
        assert!(req.validate().is_err());
    }

    #[test]
    fn resource_constraint_bounds() {
        let mut req = request(100, 3600);
        req.resource_constraints = Some(ResourceConstraints {
            cpu_units: Some(255),
            memory_mb: None,
            disk_gb: None,
        });
        assert!(req.validate().is_err());

        req.resource_constraints = Some(ResourceConstraints {
            cpu_units: Some(256),
            memory_mb: Some(512),
            disk_gb: Some(20),
        });
        assert!(req.validate().is_ok());
    }

    #[test]
    fn secret_reference_charset() {
        let mut req = request(100, 3600);
        req.additional_secrets = vec!["outpost/team-a_key+v2".to_string()];
        assert!(req.validate().is_ok());

        req.additional_secrets = vec!["bad secret".to_string()];
        assert!(req.validate().is_err());
    }

    #[test]
    fn defaults_deserialize() {
        let req: DispatchRequest = serde_json::from_value(serde_json::json!({
            "agent": "claude",
            "task": "Refactor the auth module to use PKCE flow."
        }))
        .expect("should deserialize");
        assert_eq!(req.timeout_seconds, 3600);
        assert_eq!(req.workspace_init_mode, WorkspaceInitMode::Full);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn unknown_agent_is_rejected_at_parse() {
        let result = serde_json::from_value::<DispatchRequest>(serde_json::json!({
            "agent": "copilot",
            "task": "Do something useful here."
        }));
        assert!(result.is_err());
    }
}
