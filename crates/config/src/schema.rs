use execbandit_core_types::{Arm, ArmBundle, GateStrictness, PolicyFamily, TipPercentile};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub system: SystemConfig,
    pub sqlite: SqliteConfig,
    pub bandit: BanditConfig,
    pub pending: PendingConfig,
    pub reward: RewardConfig,
    pub ope: OpeConfig,
    pub segments: SegmentConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub env: String,
    pub log_level: String,
    pub log_json: bool,
    pub heartbeat_seconds: u64,
    pub migrations_dir: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            heartbeat_seconds: 30,
            migrations_dir: "migrations".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "state/execbandit.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    /// Context vector length `d`; the selector and the evaluator must agree on it.
    pub feature_dim: usize,
    pub alpha: f64,
    pub ridge_lambda: f64,
    pub epsilon_floor: f64,
    /// 0 seeds the exploration RNG from OS entropy.
    pub seed: u64,
    pub arms: Vec<Arm>,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            feature_dim: 7,
            alpha: 1.0,
            ridge_lambda: 1.0,
            epsilon_floor: 0.02,
            seed: 0,
            arms: default_arms(),
        }
    }
}

fn default_arms() -> Vec<Arm> {
    vec![
        arm(
            "aggressive-entry",
            "Aggressive Entry",
            GateStrictness::Loose,
            700,
            TipPercentile::P75,
            0.7,
        ),
        arm(
            "bulk-sniper",
            "Bulk Sniper",
            GateStrictness::Normal,
            300,
            TipPercentile::P50,
            1.0,
        ),
        arm(
            "conservative",
            "Conservative",
            GateStrictness::Strict,
            100,
            TipPercentile::P25,
            0.5,
        ),
        arm(
            "hvy-chase",
            "HVY Chase",
            GateStrictness::Loose,
            850,
            TipPercentile::P90,
            0.85,
        ),
    ]
}

fn arm(
    id: &str,
    label: &str,
    gate: GateStrictness,
    slippage_bps: u32,
    tip_percentile: TipPercentile,
    size_multiplier: f64,
) -> Arm {
    Arm {
        id: id.to_string(),
        label: label.to_string(),
        bundle: ArmBundle {
            gate,
            slippage_bps,
            tip_percentile,
            size_multiplier,
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingConfig {
    pub expiry_ms: u64,
    pub instrument_match_jitter_ms: u64,
    pub prune_interval_ms: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 30 * 60 * 1_000,
            instrument_match_jitter_ms: 5_000,
            prune_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub family: PolicyFamily,
    pub fee_budget_bps: f64,
    pub unfilled_penalty: f64,
    pub sizing_mae_weight: f64,
    pub sizing_slippage_weight: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            family: PolicyFamily::Fee,
            fee_budget_bps: 120.0,
            unfilled_penalty: 0.5,
            sizing_mae_weight: 0.5,
            sizing_slippage_weight: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpeConfig {
    pub sample_min: u64,
    pub min_ess: f64,
    pub min_ips: f64,
    pub min_wis: f64,
    pub min_dr: f64,
    /// Lower clamp applied to logged propensities before inverting them into weights.
    pub propensity_floor: f64,
    /// 0 disables scheduled evaluation in the app.
    pub schedule_seconds: u64,
    pub schedule_lookback_hours: u64,
}

impl Default for OpeConfig {
    fn default() -> Self {
        Self {
            sample_min: 200,
            min_ess: 50.0,
            min_ips: 0.0,
            min_wis: 0.0,
            min_dr: 0.0,
            propensity_floor: 1e-6,
            schedule_seconds: 0,
            schedule_lookback_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub enabled: bool,
    pub regime_quantile: f64,
    pub fill_match_tolerance_ms: u64,
    pub migration_match_tolerance_ms: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            regime_quantile: 0.75,
            fill_match_tolerance_ms: 5_000,
            migration_match_tolerance_ms: 10 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}
