use serde::Serialize;

/// One logged decision as seen by the estimators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpeSample {
    pub weight: f64,
    pub reward: f64,
    /// Baseline value estimate `q`; 0 when no baseline was available.
    pub baseline: f64,
}

impl OpeSample {
    /// Builds a sample whose weight is `1 / max(floor, propensity)`.
    pub fn from_propensity(propensity: f64, propensity_floor: f64, reward: f64, baseline: f64) -> Self {
        Self {
            weight: 1.0 / propensity.max(propensity_floor),
            reward,
            baseline,
        }
    }
}

/// Point estimate with its standard error. The error is infinite below two samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OpeStats {
    pub estimate: f64,
    pub std_error: f64,
    pub n: usize,
    pub ess: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EstimatorSet {
    pub ips: OpeStats,
    pub wis: OpeStats,
    pub dr: OpeStats,
}

impl EstimatorSet {
    pub fn compute(samples: &[OpeSample]) -> Self {
        Self {
            ips: ips(samples),
            wis: wis(samples),
            dr: doubly_robust(samples),
        }
    }
}

/// `(Σw)² / Σw²`; never exceeds the sample count.
pub fn effective_sample_size(samples: &[OpeSample]) -> f64 {
    let sum: f64 = samples.iter().map(|sample| sample.weight).sum();
    let sum_sq: f64 = samples.iter().map(|sample| sample.weight * sample.weight).sum();
    if sum_sq <= 0.0 {
        return 0.0;
    }
    sum * sum / sum_sq
}

fn mean_with_std_error(terms: &[f64]) -> (f64, f64) {
    let n = terms.len();
    if n == 0 {
        return (0.0, f64::INFINITY);
    }
    let mean = terms.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, f64::INFINITY);
    }
    let variance = terms
        .iter()
        .map(|term| (term - mean).powi(2))
        .sum::<f64>()
        / (n - 1) as f64;
    (mean, (variance / n as f64).sqrt())
}

pub fn ips(samples: &[OpeSample]) -> OpeStats {
    let terms: Vec<f64> = samples
        .iter()
        .map(|sample| sample.weight * sample.reward)
        .collect();
    let (estimate, std_error) = mean_with_std_error(&terms);
    OpeStats {
        estimate,
        std_error,
        n: samples.len(),
        ess: effective_sample_size(samples),
    }
}

pub fn wis(samples: &[OpeSample]) -> OpeStats {
    let n = samples.len();
    let ess = effective_sample_size(samples);
    let weight_sum: f64 = samples.iter().map(|sample| sample.weight).sum();
    if n == 0 || weight_sum <= 0.0 {
        return OpeStats {
            estimate: 0.0,
            std_error: f64::INFINITY,
            n,
            ess,
        };
    }

    let estimate = samples
        .iter()
        .map(|sample| sample.weight * sample.reward)
        .sum::<f64>()
        / weight_sum;
    let std_error = if n < 2 {
        f64::INFINITY
    } else {
        // normalized weights average to 1
        let variance = samples
            .iter()
            .map(|sample| {
                let normalized = n as f64 * sample.weight / weight_sum;
                normalized * normalized * (sample.reward - estimate).powi(2)
            })
            .sum::<f64>()
            / (n - 1) as f64;
        (variance / n as f64).sqrt()
    };
    OpeStats {
        estimate,
        std_error,
        n,
        ess,
    }
}

pub fn doubly_robust(samples: &[OpeSample]) -> OpeStats {
    let terms: Vec<f64> = samples
        .iter()
        .map(|sample| sample.baseline + sample.weight * (sample.reward - sample.baseline))
        .collect();
    let (estimate, std_error) = mean_with_std_error(&terms);
    OpeStats {
        estimate,
        std_error,
        n: samples.len(),
        ess: effective_sample_size(samples),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn on_policy(rewards: &[f64]) -> Vec<OpeSample> {
        rewards
            .iter()
            .map(|&reward| OpeSample::from_propensity(1.0, 1e-6, reward, 0.3))
            .collect()
    }

    #[test]
    fn unit_weights_reduce_every_estimator_to_the_empirical_mean() {
        let samples = on_policy(&[1.0, 2.0, 3.0, 6.0]);
        let set = EstimatorSet::compute(&samples);
        for stats in [set.ips, set.wis, set.dr] {
            assert!((stats.estimate - 3.0).abs() < 1e-12, "{stats:?}");
            assert_eq!(stats.n, 4);
            assert!((stats.ess - 4.0).abs() < 1e-12);
        }
        // sample sd of [1,2,3,6] is sqrt(14/3)
        let expected_se = (14.0_f64 / 3.0 / 4.0).sqrt();
        assert!((set.ips.std_error - expected_se).abs() < 1e-12);
        assert!((set.wis.std_error - expected_se).abs() < 1e-12);
    }

    #[test]
    fn floor_caps_weight_of_tiny_propensities() {
        let sample = OpeSample::from_propensity(1e-9, 0.01, 1.0, 0.0);
        assert_eq!(sample.weight, 100.0);
    }

    #[test]
    fn single_sample_reports_infinite_error() {
        let set = EstimatorSet::compute(&on_policy(&[5.0]));
        assert_eq!(set.ips.estimate, 5.0);
        assert!(set.ips.std_error.is_infinite());
        assert!(set.wis.std_error.is_infinite());
        assert!(set.dr.std_error.is_infinite());
    }

    #[test]
    fn empty_sample_set_is_zero_with_infinite_error() {
        let set = EstimatorSet::compute(&[]);
        assert_eq!(set.ips.n, 0);
        assert_eq!(set.wis.estimate, 0.0);
        assert_eq!(set.dr.ess, 0.0);
        assert!(set.dr.std_error.is_infinite());
    }

    #[test]
    fn dr_with_zero_baseline_matches_ips() {
        let samples = vec![
            OpeSample::from_propensity(0.5, 1e-6, 1.0, 0.0),
            OpeSample::from_propensity(0.25, 1e-6, -1.0, 0.0),
            OpeSample::from_propensity(1.0, 1e-6, 2.0, 0.0),
        ];
        assert_eq!(ips(&samples), doubly_robust(&samples));
        let wis = wis(&samples);
        assert!((wis.estimate - (2.0 - 4.0 + 2.0) / 7.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn ess_never_exceeds_sample_count(
            propensities in proptest::collection::vec(0.001f64..=1.0, 1..64)
        ) {
            let samples: Vec<OpeSample> = propensities
                .iter()
                .map(|&p| OpeSample::from_propensity(p, 1e-6, 1.0, 0.0))
                .collect();
            let ess = effective_sample_size(&samples);
            prop_assert!(ess > 0.0);
            prop_assert!(ess <= samples.len() as f64 * (1.0 + 1e-9));
        }

        #[test]
        fn equal_weights_give_full_ess(n in 1usize..64, p in 0.01f64..=1.0) {
            let samples = vec![OpeSample::from_propensity(p, 1e-6, 0.0, 0.0); n];
            prop_assert!((effective_sample_size(&samples) - n as f64).abs() < 1e-9 * n as f64);
        }
    }
}
