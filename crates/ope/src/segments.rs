use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use execbandit_config::SegmentConfig;
use execbandit_core_types::{ExecOutcomeRow, FillRow, MigrationEventRow};
use execbandit_storage::SqliteStore;
use std::collections::HashMap;

/// Lower-index quantile: element `floor((n - 1) * p)` of the sorted values.
pub fn quantile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).floor() as usize;
    sorted.get(idx).copied()
}

/// Nearest item by timestamp, scanning every item. For small unsorted sets.
pub fn nearest_linear<T, F>(items: &[T], target: DateTime<Utc>, ts: F) -> Option<&T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    items
        .iter()
        .min_by_key(|item| (ts(item) - target).num_milliseconds().unsigned_abs())
}

/// Nearest item by timestamp in a time-sorted slice, or `None` if the nearest one is
/// further than `tolerance` away.
pub fn nearest_within<T, F>(
    sorted: &[T],
    target: DateTime<Utc>,
    tolerance: Duration,
    ts: F,
) -> Option<&T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    let split = sorted.partition_point(|item| ts(item) < target);
    let before = split.checked_sub(1).and_then(|idx| sorted.get(idx));
    let after = sorted.get(split);
    let nearest = match (before, after) {
        (Some(left), Some(right)) => {
            if target - ts(left) <= ts(right) - target {
                left
            } else {
                right
            }
        }
        (Some(only), None) | (None, Some(only)) => only,
        (None, None) => return None,
    };
    ((ts(nearest) - target).abs() <= tolerance).then_some(nearest)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeThresholds {
    pub time_to_land_ms: f64,
    pub priority_fee_lamports: f64,
}

/// Labels logged actions with `regime:*`, `route:*` and `source:*` segments by joining
/// on time against streams that share no key with the action log.
#[derive(Debug, Clone)]
pub struct SegmentJoiner {
    exec_outcomes: Vec<ExecOutcomeRow>,
    thresholds: Option<RegimeThresholds>,
    fills_by_instrument: HashMap<String, Vec<FillRow>>,
    migrations_by_instrument: HashMap<String, Vec<MigrationEventRow>>,
    fill_tolerance: Duration,
    migration_tolerance: Duration,
}

fn tolerance_from_ms(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

impl SegmentJoiner {
    pub fn new(
        exec_outcomes: Vec<ExecOutcomeRow>,
        fills: Vec<FillRow>,
        migrations: Vec<MigrationEventRow>,
        config: &SegmentConfig,
    ) -> Self {
        let thresholds = if exec_outcomes.is_empty() {
            None
        } else {
            let ttl: Vec<f64> = exec_outcomes
                .iter()
                .map(|row| row.time_to_land_ms.unwrap_or(0) as f64)
                .collect();
            let fees: Vec<f64> = exec_outcomes
                .iter()
                .map(|row| row.priority_fee_lamports.unwrap_or(0) as f64)
                .collect();
            quantile(&ttl, config.regime_quantile)
                .zip(quantile(&fees, config.regime_quantile))
                .map(|(time_to_land_ms, priority_fee_lamports)| RegimeThresholds {
                    time_to_land_ms,
                    priority_fee_lamports,
                })
        };

        let mut fills_by_instrument: HashMap<String, Vec<FillRow>> = HashMap::new();
        for fill in fills {
            fills_by_instrument
                .entry(fill.instrument_id.clone())
                .or_default()
                .push(fill);
        }
        for rows in fills_by_instrument.values_mut() {
            rows.sort_by_key(|row| row.ts);
        }
        let mut migrations_by_instrument: HashMap<String, Vec<MigrationEventRow>> =
            HashMap::new();
        for event in migrations {
            migrations_by_instrument
                .entry(event.instrument_id.clone())
                .or_default()
                .push(event);
        }
        for rows in migrations_by_instrument.values_mut() {
            rows.sort_by_key(|row| row.ts);
        }

        Self {
            exec_outcomes,
            thresholds,
            fills_by_instrument,
            migrations_by_instrument,
            fill_tolerance: tolerance_from_ms(config.fill_match_tolerance_ms),
            migration_tolerance: tolerance_from_ms(config.migration_match_tolerance_ms),
        }
    }

    /// Loads the auxiliary streams for `[from, to]`. Fill and migration windows are widened
    /// by their tolerance so actions near the edges can still match.
    pub fn load(
        store: &SqliteStore,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        config: &SegmentConfig,
    ) -> Result<Self> {
        let fill_tolerance = tolerance_from_ms(config.fill_match_tolerance_ms);
        let migration_tolerance = tolerance_from_ms(config.migration_match_tolerance_ms);
        let exec_outcomes = store.list_exec_outcomes_in_range(from, to)?;
        let fills = store.list_fills_in_range(from - fill_tolerance, to + fill_tolerance)?;
        let migrations = store
            .list_migration_events_in_range(from - migration_tolerance, to + migration_tolerance)?;
        Ok(Self::new(exec_outcomes, fills, migrations, config))
    }

    pub fn thresholds(&self) -> Option<RegimeThresholds> {
        self.thresholds
    }

    pub fn regime(&self, ts: DateTime<Utc>) -> Option<&'static str> {
        let thresholds = self.thresholds?;
        let nearest = nearest_linear(&self.exec_outcomes, ts, |row| row.ts)?;
        let ttl = nearest.time_to_land_ms.unwrap_or(0) as f64;
        let fee = nearest.priority_fee_lamports.unwrap_or(0) as f64;
        let congested =
            ttl > thresholds.time_to_land_ms || fee > thresholds.priority_fee_lamports;
        Some(if congested { "congested" } else { "calm" })
    }

    pub fn route(&self, instrument_id: &str, ts: DateTime<Utc>) -> Option<&str> {
        let fills = self.fills_by_instrument.get(instrument_id)?;
        nearest_within(fills, ts, self.fill_tolerance, |row| row.ts).map(|row| row.route.as_str())
    }

    pub fn is_migration(&self, instrument_id: &str, ts: DateTime<Utc>) -> bool {
        self.migrations_by_instrument
            .get(instrument_id)
            .and_then(|events| nearest_within(events, ts, self.migration_tolerance, |row| row.ts))
            .is_some()
    }

    pub fn labels(&self, instrument_id: &str, ts: DateTime<Utc>) -> Vec<String> {
        let mut labels = Vec::with_capacity(3);
        if let Some(regime) = self.regime(ts) {
            labels.push(format!("regime:{regime}"));
        }
        if let Some(route) = self.route(instrument_id, ts) {
            labels.push(format!("route:{route}"));
        }
        let source = if self.is_migration(instrument_id, ts) {
            "migration"
        } else {
            "other"
        };
        labels.push(format!("source:{source}"));
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().expect("valid timestamp")
    }

    fn outcome(ms: i64, ttl: u64, fee: u64) -> ExecOutcomeRow {
        ExecOutcomeRow {
            ts: at(ms),
            filled: true,
            time_to_land_ms: Some(ttl),
            priority_fee_lamports: Some(fee),
            route: None,
        }
    }

    #[test]
    fn quantile_uses_lower_index() {
        assert_eq!(quantile(&[4.0, 1.0, 3.0, 2.0], 0.75), Some(3.0));
        assert_eq!(quantile(&[7.0], 0.75), Some(7.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn nearest_within_rejects_stale_matches() {
        let rows: Vec<i64> = vec![1_000, 5_000, 9_000];
        let ts = |ms: &i64| at(*ms);
        let tolerance = Duration::milliseconds(1_500);
        assert_eq!(nearest_within(&rows, at(5_900), tolerance, ts), Some(&5_000));
        assert_eq!(nearest_within(&rows, at(8_000), tolerance, ts), Some(&9_000));
        assert_eq!(nearest_within(&rows, at(7_000), tolerance, ts), None);
        assert_eq!(nearest_within(&rows, at(0), tolerance, ts), Some(&1_000));
        assert_eq!(nearest_within(&rows, at(20_000), tolerance, ts), None);
        assert_eq!(nearest_within(&[] as &[i64], at(0), tolerance, ts), None);
    }

    #[test]
    fn labels_join_regime_route_and_source() {
        let config = SegmentConfig::default();
        let joiner = SegmentJoiner::new(
            vec![
                outcome(0, 400, 1_000),
                outcome(10_000, 500, 2_000),
                outcome(20_000, 600, 3_000),
                outcome(30_000, 5_000, 90_000),
            ],
            vec![FillRow {
                ts: at(20_500),
                instrument_id: "mint-a".to_string(),
                route: "jito".to_string(),
            }],
            vec![MigrationEventRow {
                ts: at(0),
                instrument_id: "mint-a".to_string(),
            }],
            &config,
        );
        let thresholds = joiner.thresholds().expect("thresholds");
        assert_eq!(thresholds.time_to_land_ms, 600.0);
        assert_eq!(thresholds.priority_fee_lamports, 3_000.0);

        assert_eq!(
            joiner.labels("mint-a", at(21_000)),
            vec!["regime:calm", "route:jito", "source:migration"]
        );
        assert_eq!(
            joiner.labels("mint-b", at(29_000)),
            vec!["regime:congested", "source:other"]
        );
        // an hour later both the fill and the migration are out of tolerance
        assert_eq!(
            joiner.labels("mint-a", at(3_600_000 + 25_000)),
            vec!["regime:congested", "source:other"]
        );
    }

    #[test]
    fn no_exec_outcomes_means_no_regime_label() {
        let joiner = SegmentJoiner::new(Vec::new(), Vec::new(), Vec::new(), &SegmentConfig::default());
        assert_eq!(joiner.labels("mint-a", at(0)), vec!["source:other"]);
    }
}
