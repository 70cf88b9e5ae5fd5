use super::SqliteStore;
use anyhow::{anyhow, Context, Result};
use rusqlite::params;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

impl SqliteStore {
    /// Applies every `*.sql` file in `migrations_dir` not yet recorded in
    /// `schema_migrations`, in filename order, inside one transaction.
    pub fn run_migrations(&mut self, migrations_dir: &Path) -> Result<usize> {
        let pending = self.pending_migrations(migrations_dir)?;
        if pending.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to open sqlite migration transaction")?;
        for (version, path) in &pending {
            let sql = fs::read_to_string(path)
                .with_context(|| format!("failed reading migration file {}", path.display()))?;
            tx.execute_batch(&sql)
                .with_context(|| format!("failed applying migration {version}"))?;
            tx.execute(
                "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, datetime('now'))",
                params![version],
            )
            .with_context(|| format!("failed recording migration {version}"))?;
            tracing::info!(version = version.as_str(), "migration applied");
        }
        tx.commit().context("failed to commit migrations")?;
        Ok(pending.len())
    }

    fn pending_migrations(&self, dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        if !dir.is_dir() {
            return Err(anyhow!("migrations directory not found: {}", dir.display()));
        }

        let applied = self.applied_migration_versions()?;
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to read migrations dir {}", dir.display()))?;
        let mut pending = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to read entry in {}", dir.display()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
                continue;
            }
            let version = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("invalid migration filename: {}", path.display()))?
                .to_string();
            if !applied.contains(&version) {
                pending.push((version, path));
            }
        }
        pending.sort_by(|left, right| left.0.cmp(&right.0));
        Ok(pending)
    }

    fn applied_migration_versions(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM schema_migrations")
            .context("failed to prepare applied migrations query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to query applied migrations")?;
        let mut versions = HashSet::new();
        for row in rows {
            versions.insert(row.context("failed reading applied migration version")?);
        }
        Ok(versions)
    }
}
