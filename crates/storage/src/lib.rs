use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

pub use execbandit_core_types::{
    BanditStateRow, ExecOutcomeRow, FillRow, MigrationEventRow, PolicyActionRecord,
};

const SQLITE_WRITE_MAX_RETRIES: usize = 3;
const SQLITE_WRITE_RETRY_BACKOFF_MS: [u64; SQLITE_WRITE_MAX_RETRIES] = [100, 300, 700];
static SQLITE_WRITE_RETRY_TOTAL: AtomicU64 = AtomicU64::new(0);
static SQLITE_BUSY_ERROR_TOTAL: AtomicU64 = AtomicU64::new(0);

mod aux_streams;
mod bandit_state;
mod migrations;
mod ope_runs;
mod policy_actions;
mod sqlite_retry;
mod system_events;

pub use ope_runs::OpeRunRow;
pub use policy_actions::SetRewardOutcome;
pub use sqlite_retry::is_retryable_sqlite_anyhow_error;

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteContentionSnapshot {
    pub write_retry_total: u64,
    pub busy_error_total: u64,
}

pub fn sqlite_contention_snapshot() -> SqliteContentionSnapshot {
    SqliteContentionSnapshot {
        write_retry_total: SQLITE_WRITE_RETRY_TOTAL.load(Ordering::Relaxed),
        busy_error_total: SQLITE_BUSY_ERROR_TOTAL.load(Ordering::Relaxed),
    }
}

pub fn note_sqlite_write_retry() {
    SQLITE_WRITE_RETRY_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn note_sqlite_busy_error() {
    SQLITE_BUSY_ERROR_TOTAL.fetch_add(1, Ordering::Relaxed);
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create sqlite parent dir: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite db: {}", path.display()))?;
        conn.busy_timeout(StdDuration::from_secs(5))
            .context("failed to set sqlite busy_timeout")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to set sqlite journal mode WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set sqlite synchronous NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable sqlite foreign keys")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")?;

        Ok(Self { conn })
    }

    /// Opens an existing database without write access, for evaluation runs and HTTP reads.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite db read-only: {}", path.display()))?;
        conn.busy_timeout(StdDuration::from_secs(5))
            .context("failed to set sqlite busy_timeout")?;
        Ok(Self { conn })
    }
}

pub(crate) fn ms_to_utc(ms: i64, column: &str) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("invalid {column} epoch millis value: {ms}"))
}

pub(crate) fn parse_f64_vec_json(raw: &str, column: &str) -> Result<Vec<f64>> {
    serde_json::from_str(raw).with_context(|| format!("invalid {column} json array"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::tempdir;

    fn migrated_store(db_path: &Path) -> Result<SqliteStore> {
        let migration_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        let mut store = SqliteStore::open(db_path)?;
        store.run_migrations(&migration_dir)?;
        Ok(store)
    }

    fn action(correlation_id: &str, instrument_id: &str, ts: DateTime<Utc>) -> PolicyActionRecord {
        PolicyActionRecord {
            correlation_id: correlation_id.to_string(),
            arm_id: "bulk-sniper".to_string(),
            instrument_id: instrument_id.to_string(),
            context: json!({ "features": [0.5, 1.0, 0.25] }),
            parameters: json!({ "slippage_bps": 300 }),
            logged_propensity: 0.985,
            reward: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn migrations_are_idempotent() -> Result<()> {
        let temp = tempdir().context("failed to create tempdir")?;
        let db_path = temp.path().join("migrations.db");
        let migration_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");

        let mut store = SqliteStore::open(&db_path)?;
        let first = store.run_migrations(&migration_dir)?;
        let second = store.run_migrations(&migration_dir)?;
        assert!(first >= 4, "expected all migrations applied, got {first}");
        assert_eq!(second, 0);
        Ok(())
    }

    #[test]
    fn set_reward_applies_exactly_once_under_parallel_settlement() -> Result<()> {
        let temp = tempdir().context("failed to create tempdir")?;
        let db_path = temp.path().join("reward-race.db");
        let now = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);

        let seed_store = migrated_store(&db_path)?;
        seed_store.append_policy_action(&action("order-1", "mint-a", now))?;
        drop(seed_store);

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(3));
        let mut workers = Vec::new();
        for reward in [1.5_f64, -2.0_f64] {
            let db_path = db_path.clone();
            let barrier = barrier.clone();
            workers.push(std::thread::spawn(move || -> Result<SetRewardOutcome> {
                let store = SqliteStore::open(&db_path)?;
                barrier.wait();
                store.set_policy_action_reward("order-1", reward, now + Duration::seconds(5))
            }));
        }

        barrier.wait();
        let mut outcomes = Vec::new();
        for worker in workers {
            outcomes.push(worker.join().expect("worker thread panicked")?);
        }
        let applied = outcomes
            .iter()
            .filter(|outcome| **outcome == SetRewardOutcome::Applied)
            .count();
        let already_set = outcomes
            .iter()
            .filter(|outcome| **outcome == SetRewardOutcome::AlreadySet)
            .count();
        assert_eq!(applied, 1, "reward must be applied exactly once: {outcomes:?}");
        assert_eq!(already_set, 1, "second writer must be rejected: {outcomes:?}");

        let verify = SqliteStore::open(&db_path)?;
        let record = verify
            .get_policy_action("order-1")?
            .context("record must exist")?;
        let reward = record.reward.context("reward must be set")?;
        assert!(reward == 1.5 || reward == -2.0);
        Ok(())
    }

    #[test]
    fn set_reward_outcomes_carry_stable_log_labels() -> Result<()> {
        let temp = tempdir().context("failed to create tempdir")?;
        let store = migrated_store(&temp.path().join("reward-labels.db"))?;
        let now = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        store.append_policy_action(&action("order-1", "mint-a", now))?;

        let labels = [
            store.set_policy_action_reward("order-1", 1.0, now)?.as_str(),
            store.set_policy_action_reward("order-1", 2.0, now)?.as_str(),
            store.set_policy_action_reward("order-404", 1.0, now)?.as_str(),
        ];
        assert_eq!(labels, ["applied", "already_set", "not_found"]);
        Ok(())
    }

    #[test]
    fn policy_action_log_is_append_only_and_range_scannable() -> Result<()> {
        let temp = tempdir().context("failed to create tempdir")?;
        let store = migrated_store(&temp.path().join("action-log.db"))?;
        let base = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);

        for idx in 0..5 {
            store.append_policy_action(&action(
                &format!("order-{idx}"),
                "mint-a",
                base + Duration::minutes(idx),
            ))?;
        }
        assert!(
            store
                .append_policy_action(&action("order-2", "mint-b", base))
                .is_err(),
            "duplicate correlation id must be rejected"
        );

        let mut with_reward = action("order-9", "mint-a", base);
        with_reward.reward = Some(1.0);
        assert!(store.append_policy_action(&with_reward).is_err());

        let mut zero_propensity = action("order-10", "mint-a", base);
        zero_propensity.logged_propensity = 0.0;
        assert!(store.append_policy_action(&zero_propensity).is_err());

        let rows = store
            .list_policy_actions_in_range(base + Duration::minutes(1), base + Duration::minutes(3))?;
        let ids: Vec<&str> = rows.iter().map(|row| row.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["order-1", "order-2", "order-3"]);
        assert_eq!(rows[0].features(), Some(vec![0.5, 1.0, 0.25]));

        assert_eq!(
            store.set_policy_action_reward("order-3", 0.75, base)?,
            SetRewardOutcome::Applied
        );
        assert_eq!(
            store.set_policy_action_reward("order-3", 0.10, base)?,
            SetRewardOutcome::AlreadySet
        );
        assert_eq!(
            store.set_policy_action_reward("missing", 0.10, base)?,
            SetRewardOutcome::NotFound
        );
        let record = store
            .get_policy_action("order-3")?
            .context("record must exist")?;
        assert_eq!(record.reward, Some(0.75));
        Ok(())
    }

    #[test]
    fn bandit_state_upsert_keeps_one_row_per_arm() -> Result<()> {
        let temp = tempdir().context("failed to create tempdir")?;
        let store = migrated_store(&temp.path().join("bandit-state.db"))?;
        let now = Utc::now();

        let prior = BanditStateRow {
            arm_id: "conservative".to_string(),
            ainv: vec![1.0, 0.0, 0.0, 1.0],
            b: vec![0.0, 0.0],
            updates: 0,
        };
        store.upsert_bandit_state(&prior, now)?;
        let updated = BanditStateRow {
            ainv: vec![0.5, -0.25, -0.25, 0.5],
            b: vec![1.0, 0.5],
            updates: 1,
            ..prior.clone()
        };
        store.upsert_bandit_state(&updated, now)?;

        let rows = store.load_bandit_states()?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], updated);

        let poisoned = BanditStateRow {
            ainv: vec![f64::NAN, 0.0, 0.0, 1.0],
            ..prior
        };
        assert!(store.upsert_bandit_state(&poisoned, now).is_err());
        Ok(())
    }

    #[test]
    fn system_events_are_counted_by_type() -> Result<()> {
        let temp = tempdir().context("failed to create tempdir")?;
        let store = migrated_store(&temp.path().join("events.db"))?;
        let now = Utc::now();
        store.record_heartbeat("execbandit-app", "startup")?;
        store.insert_system_event("selection_expired", "info", now, Some("{}"))?;
        store.insert_system_event("selection_expired", "info", now, None)?;
        store.insert_system_event("unknown_correlation_id", "warn", now, None)?;
        assert_eq!(store.system_event_count_by_type("selection_expired")?, 2);
        assert_eq!(store.system_event_count_by_type("attribution_fault")?, 0);
        Ok(())
    }
}
