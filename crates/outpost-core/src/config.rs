//! Runtime configuration, loaded once at startup into an immutable struct.
//!
//! Values come from a TOML config file merged with environment overrides;
//! everything has a usable default so a bare `OutpostConfig::from_env()`
//! works against local infrastructure.

use std::collections::HashMap;
use std::env;

use serde::Deserialize;

/// Top-level configuration for the control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutpostConfig {
    /// AWS region; `None` lets the SDK's default provider chain decide.
    pub region: Option<String>,
    /// S3 bucket holding dispatch artifacts.
    pub artifacts_bucket: String,
    /// ECS cluster that runs agent tasks.
    pub cluster: String,
    /// Subnets for task network placement.
    pub subnets: Vec<String>,
    /// Security groups for task network placement.
    pub security_groups: Vec<String>,
    /// Whether launched tasks get a public IP.
    pub assign_public_ip: bool,
    /// SQS queue delivering task-state-change events.
    pub events_queue_url: Option<String>,
    pub quota: QuotaConfig,
    pub warm_pool: WarmPoolConfig,
    pub retention: RetentionConfig,
    pub artifacts: ArtifactConfig,
    /// Fleet-health snapshot cache lifetime in seconds.
    pub health_cache_secs: u64,
    /// Estimated cold-start latency used for `estimated_start_time` when no
    /// warm slot is available.
    pub cold_start_secs: i64,
}

/// Per-tenant concurrency limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Default ceiling on a tenant's concurrent (PENDING + RUNNING) jobs.
    pub max_concurrent_jobs: i64,
    /// Per-tenant overrides keyed by user id.
    pub overrides: HashMap<String, i64>,
}

impl QuotaConfig {
    /// The concurrency ceiling for a given tenant.
    pub fn limit_for(&self, user_id: &str) -> i64 {
        self.overrides
            .get(user_id)
            .copied()
            .unwrap_or(self.max_concurrent_jobs)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            overrides: HashMap::new(),
        }
    }
}

/// Warm-pool tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarmPoolConfig {
    /// Idle slots older than this are destroyed by the reaper.
    pub idle_ttl_secs: u64,
    /// How often the reaper runs.
    pub reap_interval_secs: u64,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 900,
            reap_interval_secs: 60,
        }
    }
}

/// Retention windows.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Days a dispatch record lives before the retention sweep removes it.
    pub dispatch_days: i64,
    /// Days an artifact object lives before the storage sweep removes it.
    pub artifact_days: i64,
    /// Hours an idempotency mapping stays authoritative.
    pub idempotency_hours: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            dispatch_days: 90,
            artifact_days: 30,
            idempotency_hours: 24,
        }
    }
}

/// Artifact upload tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Payloads at or above this size go through multipart upload.
    pub multipart_threshold: usize,
    /// Part size for multipart uploads.
    pub part_size: usize,
    /// Default presigned-URL lifetime in seconds.
    pub default_presign_secs: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: 5 * 1024 * 1024,
            part_size: 5 * 1024 * 1024,
            default_presign_secs: 3600,
        }
    }
}

impl Default for OutpostConfig {
    fn default() -> Self {
        Self {
            region: None,
            artifacts_bucket: "outpost-artifacts".to_string(),
            cluster: "outpost".to_string(),
            subnets: Vec::new(),
            security_groups: Vec::new(),
            assign_public_ip: false,
            events_queue_url: None,
            quota: QuotaConfig::default(),
            warm_pool: WarmPoolConfig::default(),
            retention: RetentionConfig::default(),
            artifacts: ArtifactConfig::default(),
            health_cache_secs: 30,
            cold_start_secs: 45,
        }
    }
}

impl OutpostConfig {
    /// Build a config from defaults plus environment overrides.
    ///
    /// Recognized variables: `AWS_REGION`, `ARTIFACTS_BUCKET`,
    /// `OUTPOST_CLUSTER`, `OUTPOST_EVENTS_QUEUE_URL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay environment variables onto an existing config (e.g. one
    /// loaded from a TOML file).
    pub fn apply_env(&mut self) {
        if let Ok(region) = env::var("AWS_REGION") {
            self.region = Some(region);
        }
        if let Ok(bucket) = env::var("ARTIFACTS_BUCKET") {
            self.artifacts_bucket = bucket;
        }
        if let Ok(cluster) = env::var("OUTPOST_CLUSTER") {
            self.cluster = cluster;
        }
        if let Ok(queue) = env::var("OUTPOST_EVENTS_QUEUE_URL") {
            self.events_queue_url = Some(queue);
        }
    }
}
