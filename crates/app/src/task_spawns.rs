use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use execbandit_config::OPE_LOOKBACK_HOURS_MAX;
use execbandit_ope::{EvaluationReport, OfflineEvaluator};
use execbandit_policy::DecisionEngine;
use execbandit_storage::{OpeRunRow, SqliteStore};
use std::path::Path;
use std::sync::Arc;

pub(crate) fn spawn_prune_task(
    sqlite_path: String,
    engine: Arc<DecisionEngine>,
    now: DateTime<Utc>,
) -> impl FnOnce() -> Result<usize> {
    move || {
        let store = SqliteStore::open(Path::new(&sqlite_path)).with_context(|| {
            format!("failed to open sqlite db for prune task: {sqlite_path}")
        })?;
        Ok(engine.prune_expired(&store, now))
    }
}

/// Evaluates the trailing `lookback_hours` window and persists the report.
pub(crate) fn spawn_scheduled_ope_task(
    sqlite_path: String,
    evaluator: OfflineEvaluator,
    policy: String,
    lookback_hours: u64,
    now: DateTime<Utc>,
) -> impl FnOnce() -> Result<EvaluationReport> {
    move || {
        let store = SqliteStore::open(Path::new(&sqlite_path)).with_context(|| {
            format!("failed to open sqlite db for scheduled ope task: {sqlite_path}")
        })?;
        let lookback = Duration::hours(lookback_hours.min(OPE_LOOKBACK_HOURS_MAX) as i64);
        let from = now - lookback;
        let report = evaluator.evaluate(&store, from, now, &policy)?;
        let run = OpeRunRow {
            run_id: uuid::Uuid::new_v4().to_string(),
            policy,
            from,
            to: now,
            pass: report.pass,
            report: serde_json::to_value(&report).context("failed to serialize ope report")?,
            created_at: now,
        };
        store.insert_ope_run(&run)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execbandit_config::AppConfig;

    #[test]
    fn scheduled_ope_run_is_persisted_with_verdict() -> Result<()> {
        let temp = tempfile::tempdir().context("failed to create tempdir")?;
        let db_path = temp.path().join("scheduled.db");
        let migration_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        let mut store = SqliteStore::open(&db_path)?;
        store.run_migrations(&migration_dir)?;

        let config = AppConfig::default();
        let now = Utc::now();
        let task = spawn_scheduled_ope_task(
            db_path.to_string_lossy().into_owned(),
            OfflineEvaluator::new(&config),
            "fee".to_string(),
            24,
            now,
        );
        let report = task()?;
        assert!(!report.pass);

        let latest = store.latest_ope_run("fee")?.context("ope run missing")?;
        assert!(!latest.pass);
        assert_eq!(latest.to.timestamp_millis(), now.timestamp_millis());
        assert_eq!(latest.report["policy"], "fee");
        assert!(store.latest_ope_run("sizing")?.is_none());
        Ok(())
    }
}
