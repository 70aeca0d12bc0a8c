//! Epsilon-greedy arm selection with durable learning state.
//!
//! Each arm is a strategy (model, template, retrieval size). With
//! probability `epsilon` a uniformly random arm is explored; otherwise the arm
//! with the strictly highest `wins / plays` is exploited, an unplayed arm
//! counting as rate 0 and ties going to the first-seen arm.
//!
//! Every update is upserted to the [`BanditStore`] before `update_arm`
//! returns. Writes that keep failing are buffered as dirty arms and retried
//! on the next write or [`ArmSelector::flush`]. Store writes and their retry
//! delays run outside the selection lock.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use coc_state::{ArmRecord, BanditStore, StorageError};

use crate::error::{CocError, Result};
use crate::metrics::METRICS;

/// Bandit arm, as persisted.
pub type Arm = ArmRecord;

/// Rewards at or above this count as a win.
pub const WIN_THRESHOLD: f64 = 0.5;

/// Upsert attempts per dirty arm before it stays buffered.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Which arms compete for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmScope {
    /// One pool shared by every role.
    #[default]
    Global,
    /// Each role learns over its own copies of the shared strategies.
    PerRole,
}

impl FromStr for ArmScope {
    type Err = CocError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "global" => Ok(ArmScope::Global),
            "per_role" | "role" => Ok(ArmScope::PerRole),
            other => Err(CocError::InvalidConfig(format!(
                "unknown arm scope '{other}' (expected global or per_role)"
            ))),
        }
    }
}

impl fmt::Display for ArmScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArmScope::Global => f.write_str("global"),
            ArmScope::PerRole => f.write_str("per_role"),
        }
    }
}

/// Strategies seeded when nothing has been persisted yet.
pub fn default_arms() -> Vec<Arm> {
    let mut short = Arm::new("arm-short-context");
    short.model_name = Some("granite4:micro".to_string());
    short.context = Some("short".to_string());
    short.top_k = Some(3);

    let mut large = Arm::new("arm-large-context");
    large.model_name = Some("llama3.1:8b".to_string());
    large.context = Some("large".to_string());
    large.top_k = Some(8);

    vec![short, large]
}

/// Observed win rate; zero plays count as 0.
pub fn win_rate(arm: &Arm) -> f64 {
    if arm.plays == 0 {
        0.0
    } else {
        arm.wins as f64 / arm.plays as f64
    }
}

/// Per-arm statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    pub id: String,
    pub role: Option<String>,
    pub model_name: Option<String>,
    pub wins: u64,
    pub plays: u64,
    pub win_rate: f64,
}

/// Result of one `update_arm` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmUpdate {
    pub arm: Arm,
    /// False when the write is buffered for a later flush.
    pub persisted: bool,
}

struct SelectorState {
    arms: Vec<Arm>,
    rng: StdRng,
    dirty: BTreeSet<String>,
    last_error: Option<StorageError>,
}

/// Epsilon-greedy selector over a persisted arm set.
///
/// Arm state sits behind one async mutex, so concurrent workers see atomic
/// wins/plays increments. A second mutex makes persistence rounds take turns,
/// giving the store a single writer.
pub struct ArmSelector {
    epsilon: f64,
    scope: ArmScope,
    store: Arc<dyn BanditStore>,
    state: Mutex<SelectorState>,
    writer: Mutex<()>,
}

impl ArmSelector {
    /// Load persisted arms from `store`, seeding the defaults when the shared
    /// pool is empty.
    ///
    /// A corrupt store starts fresh. The store is expected to set the bad
    /// contents aside so the next write replaces them.
    pub async fn load(
        store: Arc<dyn BanditStore>,
        epsilon: f64,
        scope: ArmScope,
        seed: u64,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&epsilon) {
            return Err(CocError::InvalidConfig(format!(
                "epsilon must be in [0, 1], got {epsilon}"
            )));
        }

        let mut arms = match store.load_arms().await {
            Ok(arms) => arms,
            Err(err @ StorageError::Corrupt { .. }) => {
                warn!(error = %err, "bandit state unreadable, starting fresh");
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };

        let mut dirty = BTreeSet::new();
        for arm in arms.iter_mut() {
            if arm.wins > arm.plays {
                warn!(arm = %arm.id, wins = arm.wins, plays = arm.plays, "clamping wins to plays");
                arm.wins = arm.plays;
                dirty.insert(arm.id.clone());
            }
        }

        if !arms.iter().any(|a| a.role.is_none()) {
            for arm in default_arms() {
                if !arms.iter().any(|a| a.id == arm.id) {
                    dirty.insert(arm.id.clone());
                    arms.push(arm);
                }
            }
            info!("seeded default bandit arms");
        }

        let selector = Self {
            epsilon,
            scope,
            store,
            state: Mutex::new(SelectorState {
                arms,
                rng: StdRng::seed_from_u64(seed),
                dirty,
                last_error: None,
            }),
            writer: Mutex::new(()),
        };
        selector.persist_dirty().await;
        Ok(selector)
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn scope(&self) -> ArmScope {
        self.scope
    }

    /// Pick an arm for a task of `role`.
    pub async fn select_arm(&self, role: &str) -> Result<Arm> {
        let (arm, pool_created) = self.pick(role).await?;
        if pool_created {
            self.persist_dirty().await;
        }
        Ok(arm)
    }

    async fn pick(&self, role: &str) -> Result<(Arm, bool)> {
        let mut state = self.state.lock().await;
        let pool_created = self.scope == ArmScope::PerRole && ensure_role_pool(&mut state, role);

        let candidates: Vec<usize> = state
            .arms
            .iter()
            .enumerate()
            .filter(|(_, arm)| self.competes(arm, role))
            .map(|(idx, _)| idx)
            .collect();
        if candidates.is_empty() {
            return Err(CocError::NoArms {
                role: role.to_string(),
            });
        }

        let explore = state.rng.gen::<f64>() < self.epsilon;
        let chosen = if explore {
            candidates[state.rng.gen_range(0..candidates.len())]
        } else {
            let mut best = candidates[0];
            for &idx in &candidates[1..] {
                if win_rate(&state.arms[idx]) > win_rate(&state.arms[best]) {
                    best = idx;
                }
            }
            best
        };

        let arm = state.arms[chosen].clone();
        debug!(role = %role, arm = %arm.id, explore, "arm selected");
        Ok((arm, pool_created))
    }

    /// Record one play of `arm_id`; a win when `reward >= 0.5`.
    pub async fn update_arm(&self, arm_id: &str, reward: f64) -> Result<ArmUpdate> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let arm = state
                .arms
                .iter_mut()
                .find(|a| a.id == arm_id)
                .ok_or_else(|| CocError::UnknownArm(arm_id.to_string()))?;
            arm.plays += 1;
            if reward >= WIN_THRESHOLD {
                arm.wins += 1;
            }
            let snapshot = arm.clone();
            state.dirty.insert(snapshot.id.clone());
            snapshot
        };

        self.persist_dirty().await;
        let persisted = !self.state.lock().await.dirty.contains(&snapshot.id);
        Ok(ArmUpdate {
            arm: snapshot,
            persisted,
        })
    }

    /// Register an arm. An existing arm keeps its counters and takes the new
    /// strategy descriptor.
    pub async fn add_arm(&self, arm: Arm) -> Result<Arm> {
        if arm.id.trim().is_empty() {
            return Err(CocError::InvalidConfig("arm id must not be empty".into()));
        }
        let mut state = self.state.lock().await;
        let stored = match state.arms.iter_mut().find(|a| a.id == arm.id) {
            Some(existing) => {
                existing.role = arm.role;
                existing.model_name = arm.model_name;
                existing.prompt_template = arm.prompt_template;
                existing.context = arm.context;
                existing.top_k = arm.top_k;
                existing.meta = arm.meta;
                existing.clone()
            }
            None => {
                let mut fresh = arm;
                fresh.wins = fresh.wins.min(fresh.plays);
                state.arms.push(fresh.clone());
                fresh
            }
        };
        state.dirty.insert(stored.id.clone());
        drop(state);

        self.persist_dirty().await;
        Ok(stored)
    }

    /// Write every buffered arm. Fails when any arm is still unsaved.
    pub async fn flush(&self) -> Result<()> {
        self.persist_dirty().await;
        let mut state = self.state.lock().await;
        if state.dirty.is_empty() {
            return Ok(());
        }
        let unsaved = state.dirty.len();
        let err = state
            .last_error
            .take()
            .unwrap_or_else(|| StorageError::WriteRejected(format!("{unsaved} arm(s) left unsaved")));
        Err(CocError::Persistence(err))
    }

    /// Number of arms waiting to be persisted.
    pub async fn pending_writes(&self) -> usize {
        self.state.lock().await.dirty.len()
    }

    /// Snapshot of every arm, in first-seen order.
    pub async fn arms(&self) -> Vec<Arm> {
        self.state.lock().await.arms.clone()
    }

    pub async fn stats(&self) -> Vec<ArmStats> {
        self.state
            .lock()
            .await
            .arms
            .iter()
            .map(|arm| ArmStats {
                id: arm.id.clone(),
                role: arm.role.clone(),
                model_name: arm.model_name.clone(),
                wins: arm.wins,
                plays: arm.plays,
                win_rate: win_rate(arm),
            })
            .collect()
    }

    fn competes(&self, arm: &Arm, role: &str) -> bool {
        match self.scope {
            ArmScope::Global => arm.role.is_none(),
            ArmScope::PerRole => arm.role.as_deref() == Some(role),
        }
    }

    /// Upsert every dirty arm, retrying each with a growing delay.
    ///
    /// The state lock is held only to snapshot and to settle; an arm changed
    /// while its write was in flight stays dirty for the next round.
    async fn persist_dirty(&self) {
        let _writer = self.writer.lock().await;
        let pending: Vec<(String, Option<Arm>)> = {
            let state = self.state.lock().await;
            state
                .dirty
                .iter()
                .map(|id| (id.clone(), state.arms.iter().find(|a| &a.id == id).cloned()))
                .collect()
        };
        if pending.is_empty() {
            return;
        }

        let mut written = Vec::new();
        let mut last_error = None;
        for (id, arm) in pending {
            let Some(arm) = arm else {
                written.push((id, None));
                continue;
            };
            for attempt in 1..=PERSIST_ATTEMPTS {
                match self.store.upsert_arm(&arm).await {
                    Ok(()) => {
                        written.push((id.clone(), Some(arm.clone())));
                        break;
                    }
                    Err(err) => {
                        METRICS.inc_persistence_retries();
                        warn!(arm = %id, attempt, error = %err, "bandit state write failed");
                        last_error = Some(err);
                        if attempt < PERSIST_ATTEMPTS {
                            tokio::time::sleep(PERSIST_RETRY_DELAY * attempt).await;
                        }
                    }
                }
            }
        }

        let mut state = self.state.lock().await;
        for (id, arm) in written {
            let current = state.arms.iter().find(|a| a.id == id);
            if current == arm.as_ref() {
                state.dirty.remove(&id);
            }
        }
        if let Some(err) = last_error {
            state.last_error = Some(err);
        }
        if state.dirty.is_empty() {
            state.last_error = None;
        }
    }
}

/// Clone the shared strategies into `<role>/<arm>` the first time a role is
/// seen. Returns true when a pool was created.
fn ensure_role_pool(state: &mut SelectorState, role: &str) -> bool {
    if state.arms.iter().any(|a| a.role.as_deref() == Some(role)) {
        return false;
    }
    let templates: Vec<Arm> = state
        .arms
        .iter()
        .filter(|a| a.role.is_none())
        .cloned()
        .collect();
    for template in templates {
        let mut arm = template;
        arm.id = format!("{role}/{}", arm.id);
        arm.role = Some(role.to_string());
        arm.wins = 0;
        arm.plays = 0;
        state.dirty.insert(arm.id.clone());
        state.arms.push(arm);
    }
    info!(role = %role, "created per-role arm pool");
    true
}
