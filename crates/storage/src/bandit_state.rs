use super::{parse_f64_vec_json, BanditStateRow, SqliteStore};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

impl SqliteStore {
    pub fn load_bandit_states(&self) -> Result<Vec<BanditStateRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT arm_id, dim, ainv_json, b_json, updates
                 FROM bandit_state
                 ORDER BY arm_id ASC",
            )
            .context("failed to prepare bandit_state query")?;
        let mut rows = stmt.query([]).context("failed to query bandit_state")?;
        let mut states = Vec::new();
        while let Some(row) = rows.next().context("failed iterating bandit_state rows")? {
            states.push(bandit_state_from_row(row)?);
        }
        Ok(states)
    }

    pub fn get_bandit_state(&self, arm_id: &str) -> Result<Option<BanditStateRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT arm_id, dim, ainv_json, b_json, updates
                 FROM bandit_state
                 WHERE arm_id = ?1",
            )
            .context("failed to prepare bandit_state lookup")?;
        let row = stmt
            .query_row(params![arm_id], |row| Ok(bandit_state_from_row(row)))
            .optional()
            .context("failed to query bandit_state by arm")?;
        row.transpose()
    }

    /// Replaces the persisted statistics for one arm. Non-finite entries are rejected so a
    /// poisoned matrix never reaches disk.
    pub fn upsert_bandit_state(&self, state: &BanditStateRow, now: DateTime<Utc>) -> Result<()> {
        let dim = state.dim();
        if dim == 0 || state.ainv.len() != dim * dim {
            return Err(anyhow!(
                "bandit state for arm={} has inconsistent shape: b={} ainv={}",
                state.arm_id,
                dim,
                state.ainv.len()
            ));
        }
        if state
            .ainv
            .iter()
            .chain(state.b.iter())
            .any(|value| !value.is_finite())
        {
            return Err(anyhow!(
                "bandit state for arm={} contains non-finite values",
                state.arm_id
            ));
        }

        let ainv_json =
            serde_json::to_string(&state.ainv).context("failed to serialize bandit ainv")?;
        let b_json = serde_json::to_string(&state.b).context("failed to serialize bandit b")?;
        let updates = i64::try_from(state.updates).context("bandit update count overflow")?;
        let dim = i64::try_from(dim).context("bandit dim overflow")?;
        self.write_with_retry(|conn| {
            conn.execute(
                "INSERT INTO bandit_state(arm_id, dim, ainv_json, b_json, updates, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(arm_id) DO UPDATE SET
                    dim = excluded.dim,
                    ainv_json = excluded.ainv_json,
                    b_json = excluded.b_json,
                    updates = excluded.updates,
                    updated_at = excluded.updated_at",
                params![
                    state.arm_id,
                    dim,
                    ainv_json,
                    b_json,
                    updates,
                    now.to_rfc3339()
                ],
            )
        })
        .with_context(|| format!("failed to upsert bandit state arm={}", state.arm_id))?;
        Ok(())
    }
}

fn bandit_state_from_row(row: &Row<'_>) -> Result<BanditStateRow> {
    let arm_id: String = row.get(0).context("failed reading bandit_state.arm_id")?;
    let dim: i64 = row.get(1).context("failed reading bandit_state.dim")?;
    let ainv_raw: String = row.get(2).context("failed reading bandit_state.ainv_json")?;
    let b_raw: String = row.get(3).context("failed reading bandit_state.b_json")?;
    let updates: i64 = row.get(4).context("failed reading bandit_state.updates")?;

    let ainv = parse_f64_vec_json(&ainv_raw, "bandit_state.ainv_json")?;
    let b = parse_f64_vec_json(&b_raw, "bandit_state.b_json")?;
    let dim = usize::try_from(dim).context("negative bandit_state.dim")?;
    if b.len() != dim || ainv.len() != dim * dim {
        return Err(anyhow!(
            "bandit_state row for arm={arm_id} does not match dim={dim}"
        ));
    }
    Ok(BanditStateRow {
        arm_id,
        ainv,
        b,
        updates: updates.max(0) as u64,
    })
}
