use super::{ms_to_utc, ExecOutcomeRow, FillRow, MigrationEventRow, SqliteStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

fn optional_u64_to_i64(value: Option<u64>, column: &str) -> Result<Option<i64>> {
    value
        .map(|value| i64::try_from(value).with_context(|| format!("{column} overflows i64")))
        .transpose()
}

impl SqliteStore {
    pub fn insert_exec_outcome(&self, row: &ExecOutcomeRow) -> Result<()> {
        let time_to_land_ms = optional_u64_to_i64(row.time_to_land_ms, "time_to_land_ms")?;
        let priority_fee = optional_u64_to_i64(row.priority_fee_lamports, "priority_fee_lamports")?;
        self.write_with_retry(|conn| {
            conn.execute(
                "INSERT INTO exec_outcomes(ts_ms, filled, time_to_land_ms, priority_fee_lamports, route)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.ts.timestamp_millis(),
                    row.filled,
                    time_to_land_ms,
                    priority_fee,
                    row.route,
                ],
            )
        })
        .context("failed to insert exec outcome")?;
        Ok(())
    }

    pub fn list_exec_outcomes_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ExecOutcomeRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ts_ms, filled, time_to_land_ms, priority_fee_lamports, route
                 FROM exec_outcomes
                 WHERE ts_ms >= ?1 AND ts_ms <= ?2
                 ORDER BY ts_ms ASC, id ASC",
            )
            .context("failed to prepare exec outcome range query")?;
        let mut rows = stmt
            .query(params![from.timestamp_millis(), to.timestamp_millis()])
            .context("failed to query exec outcomes")?;
        let mut outcomes = Vec::new();
        while let Some(row) = rows.next().context("failed iterating exec outcome rows")? {
            let ts_ms: i64 = row.get(0).context("failed reading exec_outcomes.ts_ms")?;
            let time_to_land_ms: Option<i64> = row
                .get(2)
                .context("failed reading exec_outcomes.time_to_land_ms")?;
            let priority_fee: Option<i64> = row
                .get(3)
                .context("failed reading exec_outcomes.priority_fee_lamports")?;
            outcomes.push(ExecOutcomeRow {
                ts: ms_to_utc(ts_ms, "exec_outcomes.ts_ms")?,
                filled: row.get(1).context("failed reading exec_outcomes.filled")?,
                time_to_land_ms: time_to_land_ms.map(|value| value.max(0) as u64),
                priority_fee_lamports: priority_fee.map(|value| value.max(0) as u64),
                route: row.get(4).context("failed reading exec_outcomes.route")?,
            });
        }
        Ok(outcomes)
    }

    pub fn insert_fill(&self, row: &FillRow) -> Result<()> {
        self.write_with_retry(|conn| {
            conn.execute(
                "INSERT INTO fills(ts_ms, instrument_id, route) VALUES (?1, ?2, ?3)",
                params![row.ts.timestamp_millis(), row.instrument_id, row.route],
            )
        })
        .context("failed to insert fill")?;
        Ok(())
    }

    pub fn list_fills_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FillRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ts_ms, instrument_id, route
                 FROM fills
                 WHERE ts_ms >= ?1 AND ts_ms <= ?2
                 ORDER BY ts_ms ASC, id ASC",
            )
            .context("failed to prepare fill range query")?;
        let mut rows = stmt
            .query(params![from.timestamp_millis(), to.timestamp_millis()])
            .context("failed to query fills")?;
        let mut fills = Vec::new();
        while let Some(row) = rows.next().context("failed iterating fill rows")? {
            let ts_ms: i64 = row.get(0).context("failed reading fills.ts_ms")?;
            fills.push(FillRow {
                ts: ms_to_utc(ts_ms, "fills.ts_ms")?,
                instrument_id: row.get(1).context("failed reading fills.instrument_id")?,
                route: row.get(2).context("failed reading fills.route")?,
            });
        }
        Ok(fills)
    }

    pub fn insert_migration_event(&self, row: &MigrationEventRow) -> Result<()> {
        self.write_with_retry(|conn| {
            conn.execute(
                "INSERT INTO migration_events(ts_ms, instrument_id) VALUES (?1, ?2)",
                params![row.ts.timestamp_millis(), row.instrument_id],
            )
        })
        .context("failed to insert migration event")?;
        Ok(())
    }

    pub fn list_migration_events_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MigrationEventRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ts_ms, instrument_id
                 FROM migration_events
                 WHERE ts_ms >= ?1 AND ts_ms <= ?2
                 ORDER BY ts_ms ASC, id ASC",
            )
            .context("failed to prepare migration event range query")?;
        let mut rows = stmt
            .query(params![from.timestamp_millis(), to.timestamp_millis()])
            .context("failed to query migration events")?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().context("failed iterating migration event rows")? {
            let ts_ms: i64 = row.get(0).context("failed reading migration_events.ts_ms")?;
            events.push(MigrationEventRow {
                ts: ms_to_utc(ts_ms, "migration_events.ts_ms")?,
                instrument_id: row
                    .get(1)
                    .context("failed reading migration_events.instrument_id")?,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use crate::SqliteStore;
    use anyhow::{Context, Result};
    use chrono::{DateTime, Duration, Utc};
    use execbandit_core_types::{ExecOutcomeRow, FillRow, MigrationEventRow};
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn aux_streams_are_range_filtered_and_time_ordered() -> Result<()> {
        let temp = tempdir().context("failed to create tempdir")?;
        let migration_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        let mut store = SqliteStore::open(&temp.path().join("aux.db"))?;
        store.run_migrations(&migration_dir)?;
        let base = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);

        store.insert_exec_outcome(&ExecOutcomeRow {
            ts: base + Duration::seconds(30),
            filled: true,
            time_to_land_ms: Some(900),
            priority_fee_lamports: Some(12_000),
            route: Some("jito".to_string()),
        })?;
        store.insert_exec_outcome(&ExecOutcomeRow {
            ts: base + Duration::seconds(10),
            filled: false,
            time_to_land_ms: None,
            priority_fee_lamports: None,
            route: None,
        })?;
        store.insert_fill(&FillRow {
            ts: base + Duration::hours(2),
            instrument_id: "mint-a".to_string(),
            route: "rpc".to_string(),
        })?;
        store.insert_fill(&FillRow {
            ts: base,
            instrument_id: "mint-a".to_string(),
            route: "jito".to_string(),
        })?;
        store.insert_migration_event(&MigrationEventRow {
            ts: base,
            instrument_id: "mint-b".to_string(),
        })?;

        let to = base + Duration::hours(1);
        let outcomes = store.list_exec_outcomes_in_range(base, to)?;
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].filled);
        assert_eq!(outcomes[1].time_to_land_ms, Some(900));

        let fills = store.list_fills_in_range(base, to)?;
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].route, "jito");

        let migrations = store.list_migration_events_in_range(base, to)?;
        assert_eq!(migrations[0].instrument_id, "mint-b");
        Ok(())
    }
}
