use anyhow::{anyhow, Result};
use execbandit_core_types::{Arm, ArmBundle, GateStrictness, TipPercentile};
use std::collections::HashSet;

use super::{
    AppConfig, BANDIT_ARM_COUNT_MAX, BANDIT_FEATURE_DIM_MAX, OPE_LOOKBACK_HOURS_MAX,
    PENDING_WINDOW_MS_MAX,
};

pub(crate) fn parse_env_bool(value: String) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses `id:gate:slippage_bps:tip_percentile:size_multiplier` tokens separated by commas.
pub(crate) fn parse_arm_catalog_env(csv: &str, env_name: &str) -> Result<Vec<Arm>> {
    let mut arms = Vec::new();
    let mut seen_normalized = HashSet::new();
    for token in csv.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let parts: Vec<&str> = token.split(':').map(str::trim).collect();
        let [id, gate, slippage_bps, tip_percentile, size_multiplier] = parts.as_slice() else {
            return Err(anyhow!(
                "{env_name} contains malformed token (expected id:gate:slippage_bps:tip_percentile:size_multiplier): {}",
                token
            ));
        };
        let id = id.to_ascii_lowercase();
        if id.is_empty() {
            return Err(anyhow!("{env_name} contains empty arm id in token: {}", token));
        }
        let Some(gate) = GateStrictness::parse(gate) else {
            return Err(anyhow!(
                "{env_name} contains invalid gate for arm={}: {}",
                id,
                gate
            ));
        };
        let Some(slippage_bps) = slippage_bps.parse::<u32>().ok() else {
            return Err(anyhow!(
                "{env_name} contains invalid numeric value for arm={}: {}",
                id,
                slippage_bps
            ));
        };
        let Some(tip_percentile) = TipPercentile::parse(tip_percentile) else {
            return Err(anyhow!(
                "{env_name} contains invalid tip percentile for arm={}: {}",
                id,
                tip_percentile
            ));
        };
        let Some(size_multiplier) = size_multiplier.parse::<f64>().ok() else {
            return Err(anyhow!(
                "{env_name} contains invalid numeric value for arm={}: {}",
                id,
                size_multiplier
            ));
        };
        if !seen_normalized.insert(id.clone()) {
            return Err(anyhow!(
                "{env_name} contains duplicate arm after normalization: {}",
                id
            ));
        }
        arms.push(Arm {
            label: id.clone(),
            id,
            bundle: ArmBundle {
                gate,
                slippage_bps,
                tip_percentile,
                size_multiplier,
            },
        });
    }
    Ok(arms)
}

pub fn validate_app_config(config: &AppConfig) -> Result<()> {
    let bandit = &config.bandit;
    if bandit.feature_dim == 0 || bandit.feature_dim > BANDIT_FEATURE_DIM_MAX {
        return Err(anyhow!(
            "bandit.feature_dim must be in 1..={}, got {}",
            BANDIT_FEATURE_DIM_MAX,
            bandit.feature_dim
        ));
    }
    if !bandit.alpha.is_finite() || bandit.alpha < 0.0 {
        return Err(anyhow!(
            "bandit.alpha must be finite and >= 0, got {}",
            bandit.alpha
        ));
    }
    if !bandit.ridge_lambda.is_finite() || bandit.ridge_lambda <= 0.0 {
        return Err(anyhow!(
            "bandit.ridge_lambda must be finite and > 0, got {}",
            bandit.ridge_lambda
        ));
    }
    if !bandit.epsilon_floor.is_finite()
        || bandit.epsilon_floor <= 0.0
        || bandit.epsilon_floor > 1.0
    {
        return Err(anyhow!(
            "bandit.epsilon_floor must be in (0, 1], got {}",
            bandit.epsilon_floor
        ));
    }
    if bandit.arms.is_empty() {
        return Err(anyhow!("bandit.arms must contain at least one arm"));
    }
    if bandit.arms.len() > BANDIT_ARM_COUNT_MAX {
        return Err(anyhow!(
            "bandit.arms must contain at most {} arms, got {}",
            BANDIT_ARM_COUNT_MAX,
            bandit.arms.len()
        ));
    }
    let mut seen_normalized = HashSet::new();
    for arm in &bandit.arms {
        let normalized = arm.id.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(anyhow!("bandit.arms contains an arm with empty id"));
        }
        if !seen_normalized.insert(normalized.clone()) {
            return Err(anyhow!(
                "bandit.arms contains duplicate arm after normalization: {}",
                normalized
            ));
        }
        if !arm.bundle.size_multiplier.is_finite() || arm.bundle.size_multiplier <= 0.0 {
            return Err(anyhow!(
                "bandit.arms size_multiplier must be finite and > 0 for arm={}",
                arm.id
            ));
        }
    }

    let pending = &config.pending;
    if pending.expiry_ms == 0 || pending.expiry_ms > PENDING_WINDOW_MS_MAX {
        return Err(anyhow!(
            "pending.expiry_ms must be in 1..={}, got {}",
            PENDING_WINDOW_MS_MAX,
            pending.expiry_ms
        ));
    }
    if pending.instrument_match_jitter_ms > PENDING_WINDOW_MS_MAX {
        return Err(anyhow!(
            "pending.instrument_match_jitter_ms must be <= {}, got {}",
            PENDING_WINDOW_MS_MAX,
            pending.instrument_match_jitter_ms
        ));
    }

    let ope = &config.ope;
    if !ope.min_ess.is_finite() || ope.min_ess < 0.0 {
        return Err(anyhow!("ope.min_ess must be finite and >= 0, got {}", ope.min_ess));
    }
    for (name, value) in [
        ("ope.min_ips", ope.min_ips),
        ("ope.min_wis", ope.min_wis),
        ("ope.min_dr", ope.min_dr),
    ] {
        if !value.is_finite() {
            return Err(anyhow!("{name} must be finite, got {value}"));
        }
    }
    if !ope.propensity_floor.is_finite()
        || ope.propensity_floor <= 0.0
        || ope.propensity_floor > 1.0
    {
        return Err(anyhow!(
            "ope.propensity_floor must be in (0, 1], got {}",
            ope.propensity_floor
        ));
    }

    if ope.schedule_lookback_hours == 0 || ope.schedule_lookback_hours > OPE_LOOKBACK_HOURS_MAX {
        return Err(anyhow!(
            "ope.schedule_lookback_hours must be in 1..={}, got {}",
            OPE_LOOKBACK_HOURS_MAX,
            ope.schedule_lookback_hours
        ));
    }

    for (name, value) in [
        (
            "segments.fill_match_tolerance_ms",
            config.segments.fill_match_tolerance_ms,
        ),
        (
            "segments.migration_match_tolerance_ms",
            config.segments.migration_match_tolerance_ms,
        ),
    ] {
        if value > PENDING_WINDOW_MS_MAX {
            return Err(anyhow!(
                "{name} must be <= {PENDING_WINDOW_MS_MAX}, got {value}"
            ));
        }
    }

    let quantile = config.segments.regime_quantile;
    if !quantile.is_finite() || quantile <= 0.0 || quantile >= 1.0 {
        return Err(anyhow!(
            "segments.regime_quantile must be in (0, 1), got {}",
            quantile
        ));
    }

    let reward = &config.reward;
    for (name, value) in [
        ("reward.fee_budget_bps", reward.fee_budget_bps),
        ("reward.unfilled_penalty", reward.unfilled_penalty),
        ("reward.sizing_mae_weight", reward.sizing_mae_weight),
        ("reward.sizing_slippage_weight", reward.sizing_slippage_weight),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow!("{name} must be finite and >= 0, got {value}"));
        }
    }

    Ok(())
}
