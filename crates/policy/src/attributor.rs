use crate::bandit::LinUcbSelector;
use crate::reward::RewardFunction;
use crate::PolicyError;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use execbandit_core_types::{PendingSelection, PolicyFamily, SettlementPayload};
use execbandit_storage::{SetRewardOutcome, SqliteStore};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

static ATTRIBUTION_FAULT_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Number of resolved selections that had no action-log record, process-wide.
pub fn attribution_fault_snapshot() -> u64 {
    ATTRIBUTION_FAULT_TOTAL.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub correlation_id: String,
    pub arm_id: String,
    pub reward: f64,
    pub outcome: SetRewardOutcome,
    pub arm_reset: bool,
}

pub struct RewardAttributor {
    reward_fn: Box<dyn RewardFunction>,
}

impl RewardAttributor {
    pub fn new(reward_fn: Box<dyn RewardFunction>) -> Self {
        Self { reward_fn }
    }

    pub fn family(&self) -> PolicyFamily {
        self.reward_fn.family()
    }

    /// Records the reward once, then feeds the same reward to the selector.
    ///
    /// The action log is written first: a reward that was already recorded (duplicate
    /// delivery racing this call) never reaches the bandit a second time.
    pub fn attribute(
        &self,
        store: &SqliteStore,
        selector: &LinUcbSelector,
        entry: &PendingSelection,
        payload: &SettlementPayload,
        now: DateTime<Utc>,
    ) -> Result<Attribution> {
        let arm = selector
            .arm(&entry.arm_id)
            .ok_or_else(|| PolicyError::UnknownArm(entry.arm_id.clone()))?;
        let reward = self.reward_fn.reward(&entry.context, arm, payload);
        if !reward.is_finite() {
            return Err(anyhow!(
                "reward function produced non-finite reward {reward} for correlation_id={}",
                entry.correlation_id
            ));
        }

        let outcome = store.set_policy_action_reward(&entry.correlation_id, reward, now)?;
        match outcome {
            SetRewardOutcome::Applied => {
                let update =
                    selector.update_with(&entry.arm_id, &entry.context, reward, |row| {
                        store.upsert_bandit_state(row, now)
                    })?;
                info!(
                    correlation_id = %entry.correlation_id,
                    arm_id = %entry.arm_id,
                    outcome = outcome.as_str(),
                    reward,
                    predicted_value = entry.predicted_value,
                    arm_updates = update.state.updates,
                    "reward attributed"
                );
                Ok(Attribution {
                    correlation_id: entry.correlation_id.clone(),
                    arm_id: entry.arm_id.clone(),
                    reward,
                    outcome,
                    arm_reset: update.reset_to_prior,
                })
            }
            SetRewardOutcome::AlreadySet => {
                debug!(
                    correlation_id = %entry.correlation_id,
                    outcome = outcome.as_str(),
                    "reward already recorded, skipping bandit update"
                );
                Ok(Attribution {
                    correlation_id: entry.correlation_id.clone(),
                    arm_id: entry.arm_id.clone(),
                    reward,
                    outcome,
                    arm_reset: false,
                })
            }
            SetRewardOutcome::NotFound => {
                let total = ATTRIBUTION_FAULT_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    correlation_id = %entry.correlation_id,
                    instrument_id = %entry.instrument_id,
                    arm_id = %entry.arm_id,
                    outcome = outcome.as_str(),
                    attribution_fault_total = total,
                    "resolved selection has no policy action record"
                );
                let details = json!({
                    "correlation_id": entry.correlation_id,
                    "instrument_id": entry.instrument_id,
                    "arm_id": entry.arm_id,
                    "reward": reward,
                })
                .to_string();
                if let Err(event_error) =
                    store.insert_system_event("attribution_fault", "error", now, Some(&details))
                {
                    warn!(error = %event_error, "failed to record attribution fault event");
                }
                Err(PolicyError::MissingActionRecord(entry.correlation_id.clone()).into())
            }
        }
    }
}
