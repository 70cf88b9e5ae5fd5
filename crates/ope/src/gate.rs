use crate::estimators::EstimatorSet;
use execbandit_config::OpeConfig;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GateThresholds {
    pub sample_min: u64,
    pub min_ess: f64,
    pub min_ips: f64,
    pub min_wis: f64,
    pub min_dr: f64,
}

impl From<&OpeConfig> for GateThresholds {
    fn from(config: &OpeConfig) -> Self {
        Self {
            sample_min: config.sample_min,
            min_ess: config.min_ess,
            min_ips: config.min_ips,
            min_wis: config.min_wis,
            min_dr: config.min_dr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum GateFailure {
    InsufficientSamples { n: usize, required: u64 },
    InsufficientEss { ess: f64, required: f64 },
    IpsBelowMinimum { estimate: f64, minimum: f64 },
    WisBelowMinimum { estimate: f64, minimum: f64 },
    DrBelowMinimum { estimate: f64, minimum: f64 },
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientSamples { n, required } => {
                write!(f, "sample count {n} below required {required}")
            }
            Self::InsufficientEss { ess, required } => {
                write!(f, "effective sample size {ess:.2} below required {required:.2}")
            }
            Self::IpsBelowMinimum { estimate, minimum } => {
                write!(f, "IPS estimate {estimate:.6} below minimum {minimum:.6}")
            }
            Self::WisBelowMinimum { estimate, minimum } => {
                write!(f, "WIS estimate {estimate:.6} below minimum {minimum:.6}")
            }
            Self::DrBelowMinimum { estimate, minimum } => {
                write!(f, "DR estimate {estimate:.6} below minimum {minimum:.6}")
            }
        }
    }
}

// NaN never meets a threshold.
fn meets(value: f64, minimum: f64) -> bool {
    value >= minimum
}

/// Conjunctive promotion gate. Every failing condition is listed, not just the first.
pub fn gate_failures(stats: &EstimatorSet, thresholds: &GateThresholds) -> Vec<GateFailure> {
    let mut failures = Vec::new();
    let n = stats.ips.n;
    if (n as u64) < thresholds.sample_min {
        failures.push(GateFailure::InsufficientSamples {
            n,
            required: thresholds.sample_min,
        });
    }
    if !meets(stats.ips.ess, thresholds.min_ess) {
        failures.push(GateFailure::InsufficientEss {
            ess: stats.ips.ess,
            required: thresholds.min_ess,
        });
    }
    if !meets(stats.ips.estimate, thresholds.min_ips) {
        failures.push(GateFailure::IpsBelowMinimum {
            estimate: stats.ips.estimate,
            minimum: thresholds.min_ips,
        });
    }
    if !meets(stats.wis.estimate, thresholds.min_wis) {
        failures.push(GateFailure::WisBelowMinimum {
            estimate: stats.wis.estimate,
            minimum: thresholds.min_wis,
        });
    }
    if !meets(stats.dr.estimate, thresholds.min_dr) {
        failures.push(GateFailure::DrBelowMinimum {
            estimate: stats.dr.estimate,
            minimum: thresholds.min_dr,
        });
    }
    failures
}
