use crate::attributor::RewardAttributor;
use crate::bandit::LinUcbSelector;
use crate::pending::{EnqueueResult, PendingSelectionQueue};
use crate::reward::reward_function_for;
use crate::PolicyError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use execbandit_config::AppConfig;
use execbandit_core_types::{
    ArmBundle, PendingSelection, PolicyActionRecord, PolicyFamily, SettlementEvent,
};
use execbandit_storage::{SetRewardOutcome, SqliteStore};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionDecision {
    pub correlation_id: String,
    pub instrument_id: String,
    pub arm_id: String,
    pub parameters: ArmBundle,
    pub logged_propensity: f64,
    pub predicted_value: f64,
    pub explored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPath {
    CorrelationId,
    Instrument,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettleOutcome {
    Attributed {
        correlation_id: String,
        arm_id: String,
        reward: f64,
        matched_by: MatchPath,
    },
    /// The reward was recorded by an earlier settlement.
    DuplicateIgnored { correlation_id: String },
    /// The selection expired from the pending queue before its settlement arrived.
    LateAfterExpiry { correlation_id: String },
    UnknownCorrelation { correlation_id: String },
    NoPendingForInstrument { instrument_id: String },
}

impl SettleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attributed { .. } => "attributed",
            Self::DuplicateIgnored { .. } => "duplicate_ignored",
            Self::LateAfterExpiry { .. } => "late_after_expiry",
            Self::UnknownCorrelation { .. } => "unknown_correlation",
            Self::NoPendingForInstrument { .. } => "no_pending_for_instrument",
        }
    }
}

/// Online decision path: selection, pending reconciliation and reward attribution.
///
/// Shared behind an `Arc`; every method takes `&self`. Storage is passed per call so each
/// request flow can use its own SQLite connection.
pub struct DecisionEngine {
    selector: LinUcbSelector,
    queue: PendingSelectionQueue,
    attributor: RewardAttributor,
}

impl DecisionEngine {
    pub fn bootstrap(config: &AppConfig, store: &SqliteStore, now: DateTime<Utc>) -> Result<Self> {
        let selector = LinUcbSelector::bootstrap(&config.bandit, store, now)?;
        let queue = PendingSelectionQueue::new(
            config.pending.expiry_ms,
            config.pending.instrument_match_jitter_ms,
        );
        let attributor = RewardAttributor::new(reward_function_for(&config.reward));
        Ok(Self {
            selector,
            queue,
            attributor,
        })
    }

    pub fn selector(&self) -> &LinUcbSelector {
        &self.selector
    }

    pub fn queue(&self) -> &PendingSelectionQueue {
        &self.queue
    }

    pub fn reward_family(&self) -> PolicyFamily {
        self.attributor.family()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.size()
    }

    pub fn select(
        &self,
        store: &SqliteStore,
        context: &[f64],
        instrument_id: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SelectionDecision> {
        self.select_with_metadata(store, context, instrument_id, correlation_id, Value::Null, now)
    }

    /// Chooses an arm, appends the action record, then parks the selection until settlement.
    ///
    /// `metadata` is stored verbatim next to the features; baseline models read their
    /// inputs (fill probability, expected PnL) from it at evaluation time.
    pub fn select_with_metadata(
        &self,
        store: &SqliteStore,
        context: &[f64],
        instrument_id: &str,
        correlation_id: &str,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Result<SelectionDecision> {
        if correlation_id.trim().is_empty() {
            return Err(PolicyError::EmptyCorrelationId.into());
        }
        let selection = self.selector.select(context)?;
        let parameters = serde_json::to_value(&selection.arm.bundle)
            .context("failed to serialize arm parameters")?;
        let record = PolicyActionRecord {
            correlation_id: correlation_id.to_string(),
            arm_id: selection.arm.id.clone(),
            instrument_id: instrument_id.to_string(),
            context: json!({
                "features": context,
                "predicted_value": selection.predicted_value,
                "score": selection.score,
                "greedy_arm_id": selection.greedy_arm_id,
                "explored": selection.explored,
                "epsilon": self.selector.epsilon(),
                "metadata": metadata,
            }),
            parameters,
            logged_propensity: selection.logged_propensity,
            reward: None,
            created_at: now,
            updated_at: now,
        };
        store.append_policy_action(&record)?;

        let pending = PendingSelection {
            correlation_id: correlation_id.to_string(),
            instrument_id: instrument_id.to_string(),
            arm_id: selection.arm.id.clone(),
            context: context.to_vec(),
            predicted_value: selection.predicted_value,
            logged_propensity: selection.logged_propensity,
            created_at: now,
        };
        if self.queue.enqueue(pending) == EnqueueResult::Replaced {
            warn!(correlation_id, "pending selection replaced an entry with the same id");
        }

        info!(
            correlation_id,
            instrument_id,
            arm_id = %selection.arm.id,
            propensity = selection.logged_propensity,
            predicted_value = selection.predicted_value,
            explored = selection.explored,
            pending = self.queue.size(),
            "arm selected"
        );
        Ok(SelectionDecision {
            correlation_id: correlation_id.to_string(),
            instrument_id: instrument_id.to_string(),
            arm_id: selection.arm.id.clone(),
            parameters: selection.arm.bundle,
            logged_propensity: selection.logged_propensity,
            predicted_value: selection.predicted_value,
            explored: selection.explored,
        })
    }

    /// Resolves a settlement to its pending selection and attributes the reward.
    ///
    /// A correlation id that is present but no longer pending is classified against the
    /// action log and never falls back to instrument matching.
    pub fn settle(
        &self,
        store: &SqliteStore,
        event: &SettlementEvent,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        let correlation_id = event
            .correlation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());

        let (entry, matched_by) = match correlation_id {
            Some(id) => match self.queue.resolve_by_id(id) {
                Some(entry) => (entry, MatchPath::CorrelationId),
                None => return self.classify_unmatched(store, id, event, now),
            },
            None => match self
                .queue
                .resolve_by_instrument(&event.instrument_id, event.settled_at)
            {
                Some(entry) => (entry, MatchPath::Instrument),
                None => {
                    warn!(
                        instrument_id = %event.instrument_id,
                        settled_at = %event.settled_at,
                        "settlement without correlation id has no pending selection"
                    );
                    return Ok(SettleOutcome::NoPendingForInstrument {
                        instrument_id: event.instrument_id.clone(),
                    });
                }
            },
        };

        let result = self
            .attributor
            .attribute(store, &self.selector, &entry, &event.payload, now);
        self.queue.finish_settlement(&entry.correlation_id);
        let attribution = result?;
        Ok(match attribution.outcome {
            SetRewardOutcome::Applied => SettleOutcome::Attributed {
                correlation_id: attribution.correlation_id,
                arm_id: attribution.arm_id,
                reward: attribution.reward,
                matched_by,
            },
            _ => SettleOutcome::DuplicateIgnored {
                correlation_id: attribution.correlation_id,
            },
        })
    }

    fn classify_unmatched(
        &self,
        store: &SqliteStore,
        correlation_id: &str,
        event: &SettlementEvent,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome> {
        if self.queue.is_settling(correlation_id) {
            debug!(correlation_id, "settlement already in progress, duplicate ignored");
            return Ok(SettleOutcome::DuplicateIgnored {
                correlation_id: correlation_id.to_string(),
            });
        }
        let outcome = match store.get_policy_action(correlation_id)? {
            Some(record) if record.reward.is_some() => {
                debug!(correlation_id, "duplicate settlement ignored");
                SettleOutcome::DuplicateIgnored {
                    correlation_id: correlation_id.to_string(),
                }
            }
            Some(_) => {
                info!(
                    correlation_id,
                    instrument_id = %event.instrument_id,
                    "settlement arrived after selection expired, left censored"
                );
                SettleOutcome::LateAfterExpiry {
                    correlation_id: correlation_id.to_string(),
                }
            }
            None => {
                warn!(
                    correlation_id,
                    instrument_id = %event.instrument_id,
                    "settlement references a correlation id that was never selected"
                );
                let details = json!({
                    "correlation_id": correlation_id,
                    "instrument_id": event.instrument_id,
                    "settled_at": event.settled_at.to_rfc3339(),
                })
                .to_string();
                if let Err(error) =
                    store.insert_system_event("unknown_correlation_id", "warn", now, Some(&details))
                {
                    warn!(error = %error, "failed to record unknown correlation id event");
                }
                SettleOutcome::UnknownCorrelation {
                    correlation_id: correlation_id.to_string(),
                }
            }
        };
        Ok(outcome)
    }

    /// Expires stale selections and records each as a censored observation.
    pub fn prune_expired(&self, store: &SqliteStore, now: DateTime<Utc>) -> usize {
        let expired = self.queue.prune(now, |entry| {
            let age_ms = (now - entry.created_at).num_milliseconds();
            info!(
                correlation_id = %entry.correlation_id,
                instrument_id = %entry.instrument_id,
                arm_id = %entry.arm_id,
                age_ms,
                "pending selection expired without settlement"
            );
            let details = json!({
                "correlation_id": entry.correlation_id,
                "instrument_id": entry.instrument_id,
                "arm_id": entry.arm_id,
                "logged_propensity": entry.logged_propensity,
                "age_ms": age_ms,
            })
            .to_string();
            if let Err(error) =
                store.insert_system_event("selection_expired", "info", now, Some(&details))
            {
                warn!(
                    error = %error,
                    correlation_id = %entry.correlation_id,
                    "failed to record selection expiry event"
                );
            }
        });
        if expired > 0 {
            info!(expired, pending = self.queue.size(), "pending selection sweep");
        }
        expired
    }
}
