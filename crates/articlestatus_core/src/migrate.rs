use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use tracing::debug;

use crate::catalog::{ensure_db_parent, open_connection};
use crate::runtime::ResolvedPaths;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "catalog",
        sql: include_str!("migrations/v001_catalog.sql"),
    },
    Migration {
        version: 2,
        name: "indexes",
        sql: include_str!("migrations/v002_indexes.sql"),
    },
];

/// Report returned after running migrations.
#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

/// Run all pending migrations against the database at `paths.db_path`.
/// Creates the database and parent directories if they do not exist.
pub fn run_migrations(paths: &ResolvedPaths) -> Result<MigrateReport> {
    ensure_db_parent(&paths.db_path)?;
    let connection = open_connection(&paths.db_path)?;
    migrate_connection(&connection)
}

pub(crate) fn migrate_connection(connection: &Connection) -> Result<MigrateReport> {
    ensure_schema_migrations_table(connection)?;

    let current = current_version(connection)?;
    let mut applied = Vec::new();

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to apply migration v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        debug!(version = migration.version, name = migration.name, "applied migration");
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    let final_version = current_version(connection)?;
    Ok(MigrateReport {
        applied,
        current_version: final_version,
    })
}

/// Returns the number of migrations that have not yet been applied.
pub fn pending_migration_count(paths: &ResolvedPaths) -> Result<usize> {
    if !paths.db_path.exists() {
        return Ok(MIGRATIONS.len());
    }
    let connection = open_connection(&paths.db_path)?;
    ensure_schema_migrations_table(&connection)?;
    let current = current_version(&connection)?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > current).count())
}

/// Returns the highest applied migration version, or 0 if none applied.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read current migration version")?;
    u32::try_from(version).context("migration version does not fit into u32")
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn apply_migration(connection: &Connection, migration: &Migration) -> Result<()> {
    connection
        .execute_batch("SAVEPOINT migration_apply")
        .context("failed to create savepoint")?;

    let result = (|| -> Result<()> {
        connection
            .execute_batch(migration.sql)
            .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;

        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![
                    i64::from(migration.version),
                    migration.name,
                    crate::catalog::unix_now()?,
                ],
            )
            .context("failed to record migration")?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            connection
                .execute_batch("RELEASE SAVEPOINT migration_apply")
                .context("failed to release savepoint")?;
            Ok(())
        }
        Err(err) => {
            let _ = connection.execute_batch("ROLLBACK TO SAVEPOINT migration_apply");
            let _ = connection.execute_batch("RELEASE SAVEPOINT migration_apply");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::runtime::ValueSource;

    fn test_paths() -> (tempfile::TempDir, ResolvedPaths) {
        let temp = tempdir().expect("tempdir");
        let project_root = temp.path().join("project");
        fs::create_dir_all(&project_root).expect("create root");
        let paths = ResolvedPaths {
            db_path: project_root.join(".articlestatus/data/catalog.db"),
            state_dir: project_root.join(".articlestatus"),
            data_dir: project_root.join(".articlestatus/data"),
            config_path: project_root.join(".articlestatus/config.toml"),
            project_root,
            root_source: ValueSource::Flag,
            data_source: ValueSource::Default,
            config_source: ValueSource::Default,
        };
        (temp, paths)
    }

    #[test]
    fn migrations_apply_on_fresh_db() {
        let (_temp, paths) = test_paths();
        let report = run_migrations(&paths).expect("run_migrations");
        assert_eq!(report.applied.len(), MIGRATIONS.len());
        assert_eq!(report.current_version, 2);
        assert!(paths.db_path.exists());
    }

    #[test]
    fn migrations_are_idempotent() {
        let (_temp, paths) = test_paths();
        let first = run_migrations(&paths).expect("first run");
        assert_eq!(first.applied.len(), MIGRATIONS.len());

        let second = run_migrations(&paths).expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(second.current_version, 2);
    }

    #[test]
    fn pending_count_tracks_applied_migrations() {
        let (_temp, paths) = test_paths();
        assert_eq!(
            pending_migration_count(&paths).expect("pending count"),
            MIGRATIONS.len()
        );
        run_migrations(&paths).expect("run_migrations");
        assert_eq!(pending_migration_count(&paths).expect("pending count"), 0);
    }
}
