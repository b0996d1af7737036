//! Per-agent warm pools of pre-provisioned task slots.
//!
//! A slot is a capacity token for one concurrent task of a given agent
//! kind. Checkout and return are serialized per agent pool behind a
//! mutex; the reaper re-checks state under the same lock before
//! destroying anything, so an idle slot can never be reaped out from
//! under a concurrent checkout.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use outpost_db::models::AgentKind;

use crate::agents;
use crate::config::WarmPoolConfig;

/// State of one warm slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    InUse,
    Draining,
}

/// How a slot came back from its dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The task completed normally; the slot can be reused.
    Clean,
    /// The task failed or was cancelled; drain and destroy the slot.
    Faulted,
}

/// A pre-provisioned task slot.
#[derive(Debug, Clone)]
pub struct WarmSlot {
    pub slot_id: Uuid,
    pub agent_kind: AgentKind,
    pub state: SlotState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub current_dispatch_id: Option<Uuid>,
}

/// Result of a successful checkout.
#[derive(Debug, Clone, Copy)]
pub struct Checkout {
    pub slot_id: Uuid,
    /// Whether an already-provisioned idle slot was reused (warm path).
    pub was_warm: bool,
}

/// Slot counts for one agent kind.
#[derive(Debug, Clone, Serialize)]
pub struct AgentPoolMetrics {
    pub kind: AgentKind,
    pub idle: usize,
    pub in_use: usize,
    pub total: usize,
}

/// Aggregate slot counts across all pools.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub by_agent: Vec<AgentPoolMetrics>,
    pub total_idle: usize,
    pub total_in_use: usize,
    pub total: usize,
}

struct AgentPool {
    kind: AgentKind,
    slots: Vec<WarmSlot>,
}

impl AgentPool {
    fn idle_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Idle)
            .count()
    }

    fn in_use_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::InUse)
            .count()
    }
}

/// The warm-pool manager: one lock-protected slot table per agent kind.
pub struct WarmPool {
    pools: [Mutex<AgentPool>; AgentKind::ALL.len()],
    idle_ttl: Duration,
}

impl WarmPool {
    pub fn new(config: &WarmPoolConfig) -> Self {
        let pools = AgentKind::ALL.map(|kind| {
            Mutex::new(AgentPool {
                kind,
                slots: Vec::new(),
            })
        });
        Self {
            pools,
            idle_ttl: Duration::seconds(config.idle_ttl_secs as i64),
        }
    }

    fn pool_for(&self, kind: AgentKind) -> &Mutex<AgentPool> {
        &self.pools[kind as usize]
    }

    /// Fill each pool up to its configured size with idle slots.
    pub async fn prewarm(&self) {
        for kind in AgentKind::ALL {
            let target = agents::profile(kind).pool_size;
            let mut pool = self.pool_for(kind).lock().await;
            while pool.slots.len() < target {
                pool.slots.push(new_slot(kind, SlotState::Idle));
            }
            debug!(agent = %kind, slots = pool.slots.len(), "pool prewarmed");
        }
    }

    /// Check out a slot for an agent kind.
    ///
    /// Reuses an idle slot when one exists; otherwise provisions a fresh
    /// slot (cold path) while the pool is below the agent's
    /// `max_concurrent`. Returns `None` at the cap -- the caller decides
    /// whether to queue or reject.
    pub async fn checkout(&self, kind: AgentKind) -> Option<Checkout> {
        let mut pool = self.pool_for(kind).lock().await;

        if let Some(slot) = pool.slots.iter_mut().find(|s| s.state == SlotState::Idle) {
            slot.state = SlotState::InUse;
            slot.last_used_at = Utc::now();
            return Some(Checkout {
                slot_id: slot.slot_id,
                was_warm: true,
            });
        }

        let max = agents::profile(kind).max_concurrent;
        if pool.slots.len() < max {
            let slot = new_slot(kind, SlotState::InUse);
            let slot_id = slot.slot_id;
            pool.slots.push(slot);
            return Some(Checkout {
                slot_id,
                was_warm: false,
            });
        }

        None
    }

    /// Record which dispatch a checked-out slot is serving.
    pub async fn bind(&self, kind: AgentKind, slot_id: Uuid, dispatch_id: Uuid) {
        let mut pool = self.pool_for(kind).lock().await;
        if let Some(slot) = pool.slots.iter_mut().find(|s| s.slot_id == slot_id) {
            slot.current_dispatch_id = Some(dispatch_id);
        }
    }

    /// Return a slot.
    ///
    /// A `Faulted` outcome destroys the slot, as does an idle count
    /// already at the agent's pool size (high-watermark); otherwise the
    /// slot goes back to idle with a fresh `last_used_at`.
    pub async fn checkin(&self, kind: AgentKind, slot_id: Uuid, outcome: SlotOutcome) {
        let mut pool = self.pool_for(kind).lock().await;

        let Some(pos) = pool.slots.iter().position(|s| s.slot_id == slot_id) else {
            return;
        };

        let high_watermark = agents::profile(kind).pool_size;
        if outcome == SlotOutcome::Faulted || pool.idle_count() >= high_watermark {
            pool.slots[pos].state = SlotState::Draining;
            pool.slots.remove(pos);
            debug!(agent = %kind, slot_id = %slot_id, ?outcome, "slot destroyed on return");
        } else {
            let slot = &mut pool.slots[pos];
            slot.state = SlotState::Idle;
            slot.last_used_at = Utc::now();
            slot.current_dispatch_id = None;
        }
    }

    /// Return the slot bound to a dispatch, if any.
    ///
    /// Idempotent: a second release for the same dispatch finds no bound
    /// slot and reports `false`.
    pub async fn release_for_dispatch(&self, dispatch_id: Uuid, outcome: SlotOutcome) -> bool {
        for kind in AgentKind::ALL {
            let found = {
                let pool = self.pool_for(kind).lock().await;
                pool.slots
                    .iter()
                    .find(|s| s.current_dispatch_id == Some(dispatch_id))
                    .map(|s| s.slot_id)
            };
            if let Some(slot_id) = found {
                self.checkin(kind, slot_id, outcome).await;
                return true;
            }
        }
        false
    }

    /// Destroy idle slots older than the idle TTL. Returns how many were
    /// reaped.
    pub async fn reap(&self) -> usize {
        let cutoff = Utc::now() - self.idle_ttl;
        let mut reaped = 0;

        for kind in AgentKind::ALL {
            let mut pool = self.pool_for(kind).lock().await;
            let before = pool.slots.len();
            pool.slots
                .retain(|s| s.state != SlotState::Idle || s.last_used_at > cutoff);
            reaped += before - pool.slots.len();
        }

        if reaped > 0 {
            info!(reaped, "reaped idle warm slots");
        }
        reaped
    }

    /// Slot counts per agent and in total.
    pub async fn aggregate_metrics(&self) -> PoolMetrics {
        let mut by_agent = Vec::with_capacity(AgentKind::ALL.len());
        let (mut total_idle, mut total_in_use, mut total) = (0, 0, 0);

        for kind in AgentKind::ALL {
            let pool = self.pool_for(kind).lock().await;
            let idle = pool.idle_count();
            let in_use = pool.in_use_count();
            total_idle += idle;
            total_in_use += in_use;
            total += pool.slots.len();
            by_agent.push(AgentPoolMetrics {
                kind: pool.kind,
                idle,
                in_use,
                total: pool.slots.len(),
            });
        }

        PoolMetrics {
            by_agent,
            total_idle,
            total_in_use,
            total,
        }
    }

    /// Spawn the periodic reaper. Runs until the token is cancelled.
    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: StdDuration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.reap().await;
                    }
                    _ = cancel.cancelled() => {
                        debug!("warm-pool reaper stopped");
                        break;
                    }
                }
            }
        })
    }
}

fn new_slot(kind: AgentKind, state: SlotState) -> WarmSlot {
    let now = Utc::now();
    WarmSlot {
        slot_id: Uuid::new_v4(),
        agent_kind: kind,
        state,
        created_at: now,
        last_used_at: now,
        current_dispatch_id: None,
    }
}
