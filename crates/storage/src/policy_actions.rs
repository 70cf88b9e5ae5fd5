use super::{ms_to_utc, PolicyActionRecord, SqliteStore};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetRewardOutcome {
    Applied,
    AlreadySet,
    NotFound,
}

impl SetRewardOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadySet => "already_set",
            Self::NotFound => "not_found",
        }
    }
}

const POLICY_ACTION_COLUMNS: &str = "correlation_id, arm_id, instrument_id, context_json,
    parameters_json, logged_propensity, reward, created_ts_ms, updated_ts_ms";

impl SqliteStore {
    /// Appends one selection record. Records are never rewritten except for the one-time
    /// reward assignment.
    pub fn append_policy_action(&self, record: &PolicyActionRecord) -> Result<()> {
        if !(record.logged_propensity > 0.0 && record.logged_propensity <= 1.0) {
            return Err(anyhow!(
                "logged propensity must be in (0, 1], got {} for correlation_id={}",
                record.logged_propensity,
                record.correlation_id
            ));
        }
        if record.reward.is_some() {
            return Err(anyhow!(
                "policy action correlation_id={} must be appended without a reward",
                record.correlation_id
            ));
        }

        let context_json = serde_json::to_string(&record.context)
            .context("failed to serialize policy action context")?;
        let parameters_json = serde_json::to_string(&record.parameters)
            .context("failed to serialize policy action parameters")?;
        self.write_with_retry(|conn| {
            conn.execute(
                "INSERT INTO policy_actions(
                    correlation_id, arm_id, instrument_id, context_json, parameters_json,
                    logged_propensity, reward, created_ts_ms, updated_ts_ms, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9)",
                params![
                    record.correlation_id,
                    record.arm_id,
                    record.instrument_id,
                    context_json,
                    parameters_json,
                    record.logged_propensity,
                    record.created_at.timestamp_millis(),
                    record.updated_at.timestamp_millis(),
                    record.created_at.to_rfc3339(),
                ],
            )
        })
        .with_context(|| {
            format!(
                "failed to append policy action correlation_id={}",
                record.correlation_id
            )
        })?;
        Ok(())
    }

    /// Sets the reward if and only if none is recorded yet. The conditional update makes
    /// concurrent settlements of the same id race safely: exactly one caller sees `Applied`.
    pub fn set_policy_action_reward(
        &self,
        correlation_id: &str,
        reward: f64,
        now: DateTime<Utc>,
    ) -> Result<SetRewardOutcome> {
        if !reward.is_finite() {
            return Err(anyhow!(
                "refusing non-finite reward {reward} for correlation_id={correlation_id}"
            ));
        }
        let changed = self
            .write_with_retry(|conn| {
                conn.execute(
                    "UPDATE policy_actions
                     SET reward = ?1, updated_ts_ms = ?2
                     WHERE correlation_id = ?3 AND reward IS NULL",
                    params![reward, now.timestamp_millis(), correlation_id],
                )
            })
            .with_context(|| {
                format!("failed to set policy action reward correlation_id={correlation_id}")
            })?;
        if changed > 0 {
            return Ok(SetRewardOutcome::Applied);
        }

        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM policy_actions WHERE correlation_id = ?1",
                params![correlation_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to check policy action existence")?;
        Ok(if exists.is_some() {
            SetRewardOutcome::AlreadySet
        } else {
            SetRewardOutcome::NotFound
        })
    }

    pub fn get_policy_action(&self, correlation_id: &str) -> Result<Option<PolicyActionRecord>> {
        let sql = format!(
            "SELECT {POLICY_ACTION_COLUMNS} FROM policy_actions WHERE correlation_id = ?1"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare policy action lookup")?;
        let row = stmt
            .query_row(params![correlation_id], |row| Ok(policy_action_from_row(row)))
            .optional()
            .context("failed to query policy action")?;
        row.transpose()
    }

    /// Records created in `[from, to]` (inclusive), ordered by creation time then insertion.
    pub fn list_policy_actions_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PolicyActionRecord>> {
        let sql = format!(
            "SELECT {POLICY_ACTION_COLUMNS}
             FROM policy_actions
             WHERE created_ts_ms >= ?1 AND created_ts_ms <= ?2
             ORDER BY created_ts_ms ASC, id ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("failed to prepare policy action range query")?;
        let mut rows = stmt
            .query(params![from.timestamp_millis(), to.timestamp_millis()])
            .context("failed to query policy actions in range")?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().context("failed iterating policy action rows")? {
            records.push(policy_action_from_row(row)?);
        }
        Ok(records)
    }
}

fn policy_action_from_row(row: &Row<'_>) -> Result<PolicyActionRecord> {
    let correlation_id: String = row
        .get(0)
        .context("failed reading policy_actions.correlation_id")?;
    let context_raw: String = row
        .get(3)
        .context("failed reading policy_actions.context_json")?;
    let parameters_raw: String = row
        .get(4)
        .context("failed reading policy_actions.parameters_json")?;
    let created_ts_ms: i64 = row
        .get(7)
        .context("failed reading policy_actions.created_ts_ms")?;
    let updated_ts_ms: i64 = row
        .get(8)
        .context("failed reading policy_actions.updated_ts_ms")?;

    Ok(PolicyActionRecord {
        arm_id: row.get(1).context("failed reading policy_actions.arm_id")?,
        instrument_id: row
            .get(2)
            .context("failed reading policy_actions.instrument_id")?,
        context: serde_json::from_str(&context_raw).with_context(|| {
            format!("invalid policy_actions.context_json for correlation_id={correlation_id}")
        })?,
        parameters: serde_json::from_str(&parameters_raw).with_context(|| {
            format!("invalid policy_actions.parameters_json for correlation_id={correlation_id}")
        })?,
        logged_propensity: row
            .get(5)
            .context("failed reading policy_actions.logged_propensity")?,
        reward: row.get(6).context("failed reading policy_actions.reward")?,
        created_at: ms_to_utc(created_ts_ms, "policy_actions.created_ts_ms")?,
        updated_at: ms_to_utc(updated_ts_ms, "policy_actions.updated_ts_ms")?,
        correlation_id,
    })
}
