use super::{ms_to_utc, SqliteStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

/// One persisted scheduled evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct OpeRunRow {
    pub run_id: String,
    pub policy: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub pass: bool,
    pub report: Value,
    pub created_at: DateTime<Utc>,
}

impl SqliteStore {
    pub fn insert_ope_run(&self, run: &OpeRunRow) -> Result<()> {
        let report_json =
            serde_json::to_string(&run.report).context("failed to serialize ope report")?;
        self.write_with_retry(|conn| {
            conn.execute(
                "INSERT INTO ope_runs(run_id, policy, from_ts_ms, to_ts_ms, pass, report_json, created_ts_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.run_id,
                    run.policy,
                    run.from.timestamp_millis(),
                    run.to.timestamp_millis(),
                    run.pass,
                    report_json,
                    run.created_at.timestamp_millis(),
                ],
            )
        })
        .with_context(|| format!("failed to insert ope run run_id={}", run.run_id))?;
        Ok(())
    }

    pub fn latest_ope_run(&self, policy: &str) -> Result<Option<OpeRunRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, policy, from_ts_ms, to_ts_ms, pass, report_json, created_ts_ms
                 FROM ope_runs
                 WHERE policy = ?1
                 ORDER BY created_ts_ms DESC, rowid DESC
                 LIMIT 1",
                params![policy],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()
            .context("failed to query latest ope run")?;
        let Some((run_id, policy, from_ms, to_ms, pass, report_raw, created_ms)) = row else {
            return Ok(None);
        };
        Ok(Some(OpeRunRow {
            report: serde_json::from_str(&report_raw)
                .with_context(|| format!("invalid ope_runs.report_json for run_id={run_id}"))?,
            run_id,
            policy,
            from: ms_to_utc(from_ms, "ope_runs.from_ts_ms")?,
            to: ms_to_utc(to_ms, "ope_runs.to_ts_ms")?,
            pass,
            created_at: ms_to_utc(created_ms, "ope_runs.created_ts_ms")?,
        }))
    }
}
