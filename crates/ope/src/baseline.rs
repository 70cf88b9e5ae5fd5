use execbandit_config::RewardConfig;
use execbandit_core_types::{PolicyActionRecord, PolicyFamily};
use execbandit_policy::PolicyError;
use serde_json::Value;

/// Value model `q̂` used by the doubly-robust estimator. `None` means no estimate could be
/// formed for this record.
pub trait BaselineModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate(&self, record: &PolicyActionRecord) -> Option<f64>;
}

fn metadata_f64(record: &PolicyActionRecord, key: &str) -> Option<f64> {
    record
        .context
        .get("metadata")
        .and_then(|metadata| metadata.get(key))
        .and_then(Value::as_f64)
        .filter(|value| value.is_finite())
}

/// Expected fee reward given the caller's fill probability estimate.
#[derive(Debug, Clone)]
pub struct FeeBaseline {
    pub budget_bps: f64,
    pub unfilled_penalty: f64,
}

impl BaselineModel for FeeBaseline {
    fn name(&self) -> &'static str {
        "fee"
    }

    fn estimate(&self, record: &PolicyActionRecord) -> Option<f64> {
        let p_fill = metadata_f64(record, "p_fill")?.clamp(0.0, 1.0);
        // the arm's slippage tolerance bounds the expected slippage when none was supplied
        let expected_slippage_bps = metadata_f64(record, "expected_slippage_bps").or_else(|| {
            record
                .parameters
                .get("slippage_bps")
                .and_then(Value::as_f64)
        })?;
        let fee_bps = metadata_f64(record, "fee_bps").unwrap_or(0.0);
        let headroom = (self.budget_bps - expected_slippage_bps - fee_bps).max(0.0);
        Some(p_fill * headroom - (1.0 - p_fill) * self.unfilled_penalty * headroom)
    }
}

#[derive(Debug, Clone)]
pub struct SizingBaseline {
    pub mae_weight: f64,
    pub slippage_weight: f64,
}

impl BaselineModel for SizingBaseline {
    fn name(&self) -> &'static str {
        "sizing"
    }

    fn estimate(&self, record: &PolicyActionRecord) -> Option<f64> {
        let pnl = metadata_f64(record, "expected_pnl_sol")?;
        let mae = metadata_f64(record, "expected_mae_sol").unwrap_or(0.0).abs();
        let slippage = metadata_f64(record, "expected_slippage_cost_sol")
            .unwrap_or(0.0)
            .abs();
        Some(pnl - self.mae_weight * mae - self.slippage_weight * slippage)
    }
}

/// The selector's own `θ·x` prediction, logged at selection time.
#[derive(Debug, Clone, Default)]
pub struct PredictedValueBaseline;

impl BaselineModel for PredictedValueBaseline {
    fn name(&self) -> &'static str {
        "predicted_value"
    }

    fn estimate(&self, record: &PolicyActionRecord) -> Option<f64> {
        record
            .context
            .get("predicted_value")
            .and_then(Value::as_f64)
            .filter(|value| value.is_finite())
    }
}

/// Resolves an evaluation policy name: `fee` and `sizing` use their family's value model,
/// `linucb` uses the logged predictions.
pub fn baseline_for_policy(
    policy: &str,
    reward: &RewardConfig,
) -> Result<Box<dyn BaselineModel>, PolicyError> {
    if policy.trim().eq_ignore_ascii_case("linucb") {
        return Ok(Box::new(PredictedValueBaseline));
    }
    match PolicyFamily::parse(policy) {
        Some(PolicyFamily::Fee) => Ok(Box::new(FeeBaseline {
            budget_bps: reward.fee_budget_bps,
            unfilled_penalty: reward.unfilled_penalty,
        })),
        Some(PolicyFamily::Sizing) => Ok(Box::new(SizingBaseline {
            mae_weight: reward.sizing_mae_weight,
            slippage_weight: reward.sizing_slippage_weight,
        })),
        None => Err(PolicyError::UnknownPolicyFamily(policy.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn record(context: Value) -> PolicyActionRecord {
        PolicyActionRecord {
            correlation_id: "order-1".to_string(),
            arm_id: "bulk-sniper".to_string(),
            instrument_id: "mint-a".to_string(),
            context,
            parameters: json!({ "slippage_bps": 300 }),
            logged_propensity: 0.5,
            reward: Some(1.0),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn fee_baseline_requires_fill_probability() {
        let baseline = baseline_for_policy("fee", &RewardConfig::default()).expect("fee");
        assert_eq!(baseline.name(), "fee");
        assert_eq!(baseline.estimate(&record(json!({ "features": [1.0] }))), None);

        let with_fill = record(json!({
            "metadata": { "p_fill": 0.8, "expected_slippage_bps": 40.0, "fee_bps": 20.0 }
        }));
        // headroom 60: 0.8 * 60 - 0.2 * 0.5 * 60
        let estimate = baseline.estimate(&with_fill).expect("estimate");
        assert!((estimate - 42.0).abs() < 1e-9);

        let tolerance_only = record(json!({ "metadata": { "p_fill": 1.0 } }));
        assert_eq!(baseline.estimate(&tolerance_only), Some(0.0));
    }

    #[test]
    fn sizing_and_predicted_baselines_read_their_own_fields() {
        let sizing = baseline_for_policy("Sizing", &RewardConfig::default()).expect("sizing");
        let row = record(json!({
            "predicted_value": 0.25,
            "metadata": { "expected_pnl_sol": 1.0, "expected_mae_sol": -0.4 }
        }));
        assert!((sizing.estimate(&row).expect("estimate") - 0.8).abs() < 1e-12);
        let predicted = baseline_for_policy("linucb", &RewardConfig::default()).expect("linucb");
        assert_eq!(predicted.estimate(&row), Some(0.25));
    }

    #[test]
    fn unknown_policy_name_is_typed_error() {
        let error = baseline_for_policy("momentum", &RewardConfig::default())
            .err()
            .expect("unknown policy");
        assert!(matches!(error, PolicyError::UnknownPolicyFamily(name) if name == "momentum"));
    }
}
