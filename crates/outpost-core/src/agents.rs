//! Per-agent configuration.
//!
//! Agent kind is a closed enum, so the per-agent settings (container
//! image, task template, default model, secrets, sizing) live in a
//! compile-time table rather than behind any open-set registry.

use outpost_db::models::AgentKind;

/// Static configuration for one agent kind.
#[derive(Debug, Clone, Copy)]
pub struct AgentProfile {
    pub kind: AgentKind,
    /// ECS task-definition family the agent launches from.
    pub task_template: &'static str,
    /// Container image reference (informational; the template pins it).
    pub container_image: &'static str,
    /// Model used when the request does not name one.
    pub default_model: &'static str,
    /// Secrets the agent container needs at start.
    pub secret_names: &'static [&'static str],
    pub default_cpu_units: i32,
    pub default_memory_mb: i32,
    /// Warm slots kept provisioned for this agent.
    pub pool_size: usize,
    /// Hard ceiling on concurrent tasks for this agent.
    pub max_concurrent: usize,
}

static CLAUDE: AgentProfile = AgentProfile {
    kind: AgentKind::Claude,
    task_template: "outpost-agent-claude",
    container_image: "outpost/agent-claude:latest",
    default_model: "claude-opus-4-5-20251101",
    secret_names: &["outpost/anthropic-api-key"],
    default_cpu_units: 1024,
    default_memory_mb: 4096,
    pool_size: 4,
    max_concurrent: 16,
};

static CODEX: AgentProfile = AgentProfile {
    kind: AgentKind::Codex,
    task_template: "outpost-agent-codex",
    container_image: "outpost/agent-codex:latest",
    default_model: "gpt-5.1-codex",
    secret_names: &["outpost/openai-api-key"],
    default_cpu_units: 1024,
    default_memory_mb: 4096,
    pool_size: 4,
    max_concurrent: 16,
};

static GEMINI: AgentProfile = AgentProfile {
    kind: AgentKind::Gemini,
    task_template: "outpost-agent-gemini",
    container_image: "outpost/agent-gemini:latest",
    default_model: "gemini-2.5-pro",
    secret_names: &["outpost/gemini-api-key"],
    default_cpu_units: 1024,
    default_memory_mb: 4096,
    pool_size: 2,
    max_concurrent: 8,
};

static AIDER: AgentProfile = AgentProfile {
    kind: AgentKind::Aider,
    task_template: "outpost-agent-aider",
    container_image: "outpost/agent-aider:latest",
    default_model: "gpt-5.1",
    secret_names: &["outpost/openai-api-key"],
    default_cpu_units: 512,
    default_memory_mb: 2048,
    pool_size: 2,
    max_concurrent: 8,
};

static GROK: AgentProfile = AgentProfile {
    kind: AgentKind::Grok,
    task_template: "outpost-agent-grok",
    container_image: "outpost/agent-grok:latest",
    default_model: "grok-code-fast-1",
    secret_names: &["outpost/xai-api-key"],
    default_cpu_units: 512,
    default_memory_mb: 2048,
    pool_size: 2,
    max_concurrent: 8,
};

/// Look up the profile for an agent kind.
pub fn profile(kind: AgentKind) -> &'static AgentProfile {
    match kind {
        AgentKind::Claude => &CLAUDE,
        AgentKind::Codex => &CODEX,
        AgentKind::Gemini => &GEMINI,
        AgentKind::Aider => &AIDER,
        AgentKind::Grok => &GROK,
    }
}
