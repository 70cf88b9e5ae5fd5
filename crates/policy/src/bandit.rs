use crate::linalg::{
    diagonal_is_sane, dot, mat_vec, quadratic_form, scaled_identity, sherman_morrison_update,
};
use crate::PolicyError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use execbandit_config::BanditConfig;
use execbandit_core_types::{Arm, BanditStateRow};
use execbandit_storage::SqliteStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct ArmState {
    ainv: Vec<f64>,
    b: Vec<f64>,
    updates: u64,
    theta: Option<Vec<f64>>,
}

impl ArmState {
    fn prior(dim: usize, ridge_lambda: f64) -> Self {
        Self {
            ainv: scaled_identity(dim, 1.0 / ridge_lambda),
            b: vec![0.0; dim],
            updates: 0,
            theta: None,
        }
    }

    fn from_row(row: BanditStateRow) -> Self {
        Self {
            ainv: row.ainv,
            b: row.b,
            updates: row.updates,
            theta: None,
        }
    }

    fn to_row(&self, arm_id: &str) -> BanditStateRow {
        BanditStateRow {
            arm_id: arm_id.to_string(),
            ainv: self.ainv.clone(),
            b: self.b.clone(),
            updates: self.updates,
        }
    }

    fn theta(&mut self, dim: usize) -> &[f64] {
        let (ainv, b) = (&self.ainv, &self.b);
        self.theta.get_or_insert_with(|| mat_vec(ainv, dim, b))
    }

    fn score(&mut self, dim: usize, alpha: f64, x: &[f64]) -> (f64, f64) {
        let predicted = dot(self.theta(dim), x);
        let variance = quadratic_form(&self.ainv, dim, x).max(0.0);
        (predicted, alpha * variance.sqrt())
    }
}

/// Per-arm score breakdown for one context.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmScore {
    pub arm_id: String,
    pub predicted_value: f64,
    pub bonus: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub arm: Arm,
    /// Exact probability of this arm under the epsilon-greedy mixture that drew it.
    pub logged_propensity: f64,
    pub predicted_value: f64,
    pub score: f64,
    pub greedy_arm_id: String,
    pub explored: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArmUpdate {
    pub state: BanditStateRow,
    pub reset_to_prior: bool,
}

/// Disjoint LinUCB over a fixed arm catalog with an epsilon floor on exploration.
///
/// Each arm's statistics sit behind their own mutex so updates to one arm never block
/// scoring of the others.
pub struct LinUcbSelector {
    arms: Vec<Arm>,
    arm_index: HashMap<String, usize>,
    states: Vec<Mutex<ArmState>>,
    dim: usize,
    alpha: f64,
    ridge_lambda: f64,
    epsilon: f64,
    rng: Mutex<StdRng>,
}

fn lock_arm(state: &Mutex<ArmState>) -> MutexGuard<'_, ArmState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LinUcbSelector {
    pub fn new(config: &BanditConfig) -> Result<Self> {
        if config.arms.is_empty() {
            return Err(PolicyError::EmptyCatalog.into());
        }
        let dim = config.feature_dim;
        let arm_index = config
            .arms
            .iter()
            .enumerate()
            .map(|(idx, arm)| (arm.id.clone(), idx))
            .collect();
        let states = config
            .arms
            .iter()
            .map(|_| Mutex::new(ArmState::prior(dim, config.ridge_lambda)))
            .collect();
        let rng = if config.seed == 0 {
            StdRng::from_os_rng()
        } else {
            StdRng::seed_from_u64(config.seed)
        };
        Ok(Self {
            arms: config.arms.clone(),
            arm_index,
            states,
            dim,
            alpha: config.alpha,
            ridge_lambda: config.ridge_lambda,
            epsilon: config.epsilon_floor,
            rng: Mutex::new(rng),
        })
    }

    /// Restores persisted arm rows that fit the current catalog and dimension, then writes a
    /// prior row for every arm that had none, so the store holds exactly one row per arm.
    pub fn bootstrap(
        config: &BanditConfig,
        store: &SqliteStore,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let selector = Self::new(config)?;
        let mut restored = HashSet::new();
        for row in store
            .load_bandit_states()
            .context("failed to load persisted bandit state")?
        {
            let Some(&idx) = selector.arm_index.get(&row.arm_id) else {
                debug!(arm_id = %row.arm_id, "ignoring persisted state for arm outside catalog");
                continue;
            };
            if row.dim() != selector.dim {
                warn!(
                    arm_id = %row.arm_id,
                    persisted_dim = row.dim(),
                    feature_dim = selector.dim,
                    "persisted arm state has a different dimension, starting from ridge prior"
                );
                continue;
            }
            if !diagonal_is_sane(&row.ainv, selector.dim) {
                warn!(arm_id = %row.arm_id, "persisted arm state is degenerate, starting from ridge prior");
                continue;
            }
            restored.insert(row.arm_id.clone());
            *lock_arm(&selector.states[idx]) = ArmState::from_row(row);
        }

        let mut initialized = 0usize;
        for arm in &selector.arms {
            if restored.contains(&arm.id) {
                continue;
            }
            store.upsert_bandit_state(&selector.snapshot(&arm.id)?, now)?;
            initialized += 1;
        }
        info!(
            restored = restored.len(),
            initialized,
            arms = selector.arms.len(),
            feature_dim = selector.dim,
            "bandit state bootstrapped"
        );
        Ok(selector)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn arms(&self) -> &[Arm] {
        &self.arms
    }

    pub fn arm(&self, arm_id: &str) -> Option<&Arm> {
        self.arm_index.get(arm_id).map(|&idx| &self.arms[idx])
    }

    pub fn validate_context(&self, context: &[f64]) -> Result<(), PolicyError> {
        if context.len() != self.dim {
            return Err(PolicyError::DimensionMismatch {
                expected: self.dim,
                actual: context.len(),
            });
        }
        if let Some(index) = context.iter().position(|value| !value.is_finite()) {
            return Err(PolicyError::NonFiniteFeature { index });
        }
        Ok(())
    }

    pub fn scores(&self, context: &[f64]) -> Result<Vec<ArmScore>> {
        self.validate_context(context)?;
        Ok(self
            .arms
            .iter()
            .zip(&self.states)
            .map(|(arm, state)| {
                let (predicted_value, bonus) =
                    lock_arm(state).score(self.dim, self.alpha, context);
                ArmScore {
                    arm_id: arm.id.clone(),
                    predicted_value,
                    bonus,
                    score: predicted_value + bonus,
                }
            })
            .collect())
    }

    pub fn select(&self, context: &[f64]) -> Result<Selection> {
        let scores = self.scores(context)?;
        // First maximum in catalog order wins ties.
        let mut greedy = 0usize;
        for (idx, score) in scores.iter().enumerate().skip(1) {
            if score.score > scores[greedy].score {
                greedy = idx;
            }
        }

        let (explored, chosen) = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            if rng.random::<f64>() < self.epsilon {
                (true, rng.random_range(0..self.arms.len()))
            } else {
                (false, greedy)
            }
        };
        let logged_propensity = self.propensity(chosen == greedy);

        Ok(Selection {
            arm: self.arms[chosen].clone(),
            logged_propensity,
            predicted_value: scores[chosen].predicted_value,
            score: scores[chosen].score,
            greedy_arm_id: scores[greedy].arm_id.clone(),
            explored,
        })
    }

    /// `ε/K + (1 − ε)·1[greedy]`.
    pub fn propensity(&self, is_greedy: bool) -> f64 {
        let uniform = self.epsilon / self.arms.len() as f64;
        if is_greedy {
            uniform + (1.0 - self.epsilon)
        } else {
            uniform
        }
    }

    /// Rank-one update of one arm. A degenerate result resets the arm to the ridge prior.
    pub fn update(&self, arm_id: &str, context: &[f64], reward: f64) -> Result<ArmUpdate> {
        self.update_with(arm_id, context, reward, |_| Ok(()))
    }

    /// Same as [`Self::update`], but `persist` runs while the arm lock is still held so
    /// rows for one arm reach storage in the order the updates were applied.
    pub fn update_with<F>(
        &self,
        arm_id: &str,
        context: &[f64],
        reward: f64,
        persist: F,
    ) -> Result<ArmUpdate>
    where
        F: FnOnce(&BanditStateRow) -> Result<()>,
    {
        self.validate_context(context)?;
        let idx = *self
            .arm_index
            .get(arm_id)
            .ok_or_else(|| PolicyError::UnknownArm(arm_id.to_string()))?;

        let mut state = lock_arm(&self.states[idx]);
        sherman_morrison_update(&mut state.ainv, self.dim, context);
        for (bi, xi) in state.b.iter_mut().zip(context) {
            *bi += reward * xi;
        }
        state.updates = state.updates.saturating_add(1);
        state.theta = None;

        let reset_to_prior = !diagonal_is_sane(&state.ainv, self.dim)
            || state.b.iter().any(|value| !value.is_finite());
        if reset_to_prior {
            warn!(
                arm_id,
                updates = state.updates,
                reward,
                "arm state numerically unstable after update, reset to ridge prior"
            );
            *state = ArmState::prior(self.dim, self.ridge_lambda);
        }
        let row = state.to_row(arm_id);
        persist(&row)?;
        Ok(ArmUpdate {
            state: row,
            reset_to_prior,
        })
    }

    pub fn snapshot(&self, arm_id: &str) -> Result<BanditStateRow> {
        let idx = *self
            .arm_index
            .get(arm_id)
            .ok_or_else(|| PolicyError::UnknownArm(arm_id.to_string()))?;
        Ok(lock_arm(&self.states[idx]).to_row(arm_id))
    }
}
