use crate::baseline::{baseline_for_policy, BaselineModel};
use crate::estimators::{EstimatorSet, OpeSample};
use crate::gate::{gate_failures, GateFailure, GateThresholds};
use crate::segments::SegmentJoiner;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use execbandit_config::{AppConfig, OpeConfig, RewardConfig, SegmentConfig};
use execbandit_core_types::PolicyActionRecord;
use execbandit_storage::SqliteStore;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub policy: String,
    pub baseline: &'static str,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub overall: EstimatorSet,
    /// Diagnostic breakdown only; never part of the verdict.
    pub segments: BTreeMap<String, EstimatorSet>,
    pub pass: bool,
    pub failures: Vec<GateFailure>,
    pub thresholds: GateThresholds,
    pub records_scanned: usize,
    /// Records without a reward (expired or still pending), excluded from every estimator.
    pub censored: usize,
    /// Samples whose baseline was unavailable and fell back to `q = 0`.
    pub baseline_fallback_samples: usize,
}

/// Batch evaluator over the policy action log. Read-only with respect to all state.
#[derive(Debug, Clone)]
pub struct OfflineEvaluator {
    ope: OpeConfig,
    segments: SegmentConfig,
    reward: RewardConfig,
}

impl OfflineEvaluator {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            ope: config.ope.clone(),
            segments: config.segments.clone(),
            reward: config.reward.clone(),
        }
    }

    pub fn thresholds(&self) -> GateThresholds {
        GateThresholds::from(&self.ope)
    }

    pub fn evaluate(
        &self,
        store: &SqliteStore,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        policy: &str,
    ) -> Result<EvaluationReport> {
        if from > to {
            return Err(anyhow!(
                "evaluation range is empty: from={} is after to={}",
                from.to_rfc3339(),
                to.to_rfc3339()
            ));
        }
        let baseline = baseline_for_policy(policy, &self.reward)?;
        let records = store
            .list_policy_actions_in_range(from, to)
            .context("failed to load policy actions for evaluation")?;
        let joiner = if self.segments.enabled {
            Some(SegmentJoiner::load(store, from, to, &self.segments)?)
        } else {
            None
        };

        let report = self.evaluate_records(
            policy,
            from,
            to,
            &records,
            baseline.as_ref(),
            joiner.as_ref(),
        );
        let failures: Vec<String> = report.failures.iter().map(ToString::to_string).collect();
        info!(
            policy,
            from = %from.to_rfc3339(),
            to = %to.to_rfc3339(),
            n = report.overall.ips.n,
            ess = report.overall.ips.ess,
            ips = report.overall.ips.estimate,
            wis = report.overall.wis.estimate,
            dr = report.overall.dr.estimate,
            censored = report.censored,
            baseline_fallback_samples = report.baseline_fallback_samples,
            pass = report.pass,
            failures = ?failures,
            "offline policy evaluation"
        );
        Ok(report)
    }

    pub fn evaluate_records(
        &self,
        policy: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        records: &[PolicyActionRecord],
        baseline: &dyn BaselineModel,
        joiner: Option<&SegmentJoiner>,
    ) -> EvaluationReport {
        let mut overall = Vec::with_capacity(records.len());
        let mut by_segment: BTreeMap<String, Vec<OpeSample>> = BTreeMap::new();
        let mut censored = 0usize;
        let mut baseline_fallback_samples = 0usize;

        for record in records {
            let Some(reward) = record.reward else {
                censored += 1;
                continue;
            };
            let q = match baseline.estimate(record) {
                Some(q) => q,
                None => {
                    baseline_fallback_samples += 1;
                    0.0
                }
            };
            let sample = OpeSample::from_propensity(
                record.logged_propensity,
                self.ope.propensity_floor,
                reward,
                q,
            );
            overall.push(sample);
            if let Some(joiner) = joiner {
                for label in joiner.labels(&record.instrument_id, record.created_at) {
                    by_segment.entry(label).or_default().push(sample);
                }
            }
        }

        let thresholds = self.thresholds();
        let overall = EstimatorSet::compute(&overall);
        let failures = gate_failures(&overall, &thresholds);
        EvaluationReport {
            policy: policy.to_string(),
            baseline: baseline.name(),
            from,
            to,
            overall,
            segments: by_segment
                .into_iter()
                .map(|(label, samples)| (label, EstimatorSet::compute(&samples)))
                .collect(),
            pass: failures.is_empty(),
            failures,
            thresholds,
            records_scanned: records.len(),
            censored,
            baseline_fallback_samples,
        }
    }
}
