//! Fleet-health aggregation under a bounded-staleness cache.
//!
//! A snapshot combines warm-pool metrics, the last hour of dispatch
//! history, and local process/CPU/memory readings. Snapshots are cached
//! for a short window (default 30 s) so the health endpoints stay cheap
//! under polling.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use outpost_db::models::AgentKind;

use crate::agents;
use crate::error::Result;
use crate::pool::{PoolMetrics, WarmPool};
use crate::store::{DispatchMetrics, DispatchStore};

/// Window of dispatch history feeding the snapshot.
const DISPATCH_WINDOW_HOURS: i64 = 1;

/// Overall fleet condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health view of one agent kind.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub kind: AgentKind,
    pub available: bool,
    pub idle: usize,
    pub in_use: usize,
    pub max_concurrent: usize,
    /// Percentage in [0, 100]; 100 when there is no data.
    pub success_rate: f64,
    pub avg_duration_ms: Option<f64>,
}

/// Local process and host readings.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f64,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
}

/// One full fleet snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub status: HealthStatus,
    pub pool: PoolMetrics,
    pub agents: Vec<AgentHealth>,
    pub system: SystemMetrics,
    pub dispatches: DispatchMetrics,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregates fleet health with a bounded-staleness cache.
pub struct FleetHealth {
    store: DispatchStore,
    warm_pool: Arc<WarmPool>,
    cache_ttl: std::time::Duration,
    started_at: Instant,
    cache: RwLock<Option<(Instant, FleetSnapshot)>>,
}

impl FleetHealth {
    pub fn new(store: DispatchStore, warm_pool: Arc<WarmPool>, cache_ttl_secs: u64) -> Self {
        Self {
            store,
            warm_pool,
            cache_ttl: std::time::Duration::from_secs(cache_ttl_secs),
            started_at: Instant::now(),
            cache: RwLock::new(None),
        }
    }

    /// The current snapshot, served from cache when fresh enough.
    pub async fn snapshot(&self) -> Result<FleetSnapshot> {
        if let Some((taken_at, snapshot)) = self.cache.read().await.as_ref() {
            if taken_at.elapsed() < self.cache_ttl {
                return Ok(snapshot.clone());
            }
        }

        let snapshot = self.compute_snapshot().await?;
        *self.cache.write().await = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }

    async fn compute_snapshot(&self) -> Result<FleetSnapshot> {
        let (pool, dispatches, system) = tokio::join!(
            self.warm_pool.aggregate_metrics(),
            self.store.dispatch_metrics(DISPATCH_WINDOW_HOURS),
            sample_system_metrics(),
        );
        let dispatches = dispatches?;

        let agents = build_agent_health(&pool, &dispatches);
        let status = derive_status(&agents, &system);
        debug!(?status, "fleet snapshot computed");

        Ok(FleetSnapshot {
            status,
            pool,
            agents,
            system,
            dispatches,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            timestamp: Utc::now(),
        })
    }
}

/// Read CPU and memory usage from the host.
///
/// CPU usage needs two samples separated by a short interval, so this
/// runs on the blocking pool.
async fn sample_system_metrics() -> SystemMetrics {
    let sampled = tokio::task::spawn_blocking(|| {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();

        let total = sys.total_memory();
        let used = sys.used_memory();
        SystemMetrics {
            cpu_percent: sys.global_cpu_usage(),
            memory_percent: if total == 0 {
                0.0
            } else {
                used as f64 / total as f64 * 100.0
            },
            total_memory_bytes: total,
            used_memory_bytes: used,
        }
    })
    .await;

    sampled.unwrap_or(SystemMetrics {
        cpu_percent: 0.0,
        memory_percent: 0.0,
        total_memory_bytes: 0,
        used_memory_bytes: 0,
    })
}

/// Join pool occupancy with dispatch history per agent kind.
fn build_agent_health(pool: &PoolMetrics, dispatches: &DispatchMetrics) -> Vec<AgentHealth> {
    AgentKind::ALL
        .iter()
        .map(|&kind| {
            let profile = agents::profile(kind);
            let (idle, in_use) = pool
                .by_agent
                .iter()
                .find(|m| m.kind == kind)
                .map(|m| (m.idle, m.in_use))
                .unwrap_or((0, 0));
            let history = dispatches.by_agent.iter().find(|a| a.agent_kind == kind);
            let (completed, failed) = history.map(|h| (h.completed, h.failed)).unwrap_or((0, 0));

            let success_rate = if completed + failed == 0 {
                100.0
            } else {
                completed as f64 / (completed + failed) as f64 * 100.0
            };

            AgentHealth {
                kind,
                available: idle > 0 || in_use < profile.max_concurrent,
                idle,
                in_use,
                max_concurrent: profile.max_concurrent,
                success_rate,
                avg_duration_ms: history.and_then(|h| h.avg_duration_ms),
            }
        })
        .collect()
}

/// Overall status from agent availability, success rates, and host load.
fn derive_status(agents: &[AgentHealth], system: &SystemMetrics) -> HealthStatus {
    if agents.iter().all(|a| !a.available) {
        return HealthStatus::Unhealthy;
    }

    let avg_success = if agents.is_empty() {
        100.0
    } else {
        agents.iter().map(|a| a.success_rate).sum::<f64>() / agents.len() as f64
    };

    if agents.iter().any(|a| !a.available)
        || avg_success < 80.0
        || system.memory_percent > 90.0
        || system.cpu_percent > 95.0
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
