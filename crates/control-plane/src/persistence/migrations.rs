use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::migrate::{AppliedMigration, Migrate};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use uuid::Uuid;

use super::Db;
use crate::Result;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub const fn migrator() -> &'static sqlx::migrate::Migrator {
    &MIGRATOR
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationLabel {
    pub version: i64,
    pub description: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MigrationSnapshot {
    pub latest_applied: Option<i64>,
    pub latest_available: Option<i64>,
    pub applied: Vec<MigrationLabel>,
    pub pending: Vec<MigrationLabel>,
}

pub async fn init_pool(database_url: &str) -> Result<Db> {
    let is_memory_request = database_url.starts_with("sqlite::memory");
    let resolved_url = if is_memory_request {
        let db_path = std::env::temp_dir().join(format!("canopy-cp-test-{}.sqlite", Uuid::new_v4()));
        format!("sqlite://{}", db_path.display())
    } else {
        database_url.to_string()
    };

    ensure_db_dir(&resolved_url)?;

    let mut opts = SqliteConnectOptions::from_str(&resolved_url)?;
    opts = opts.create_if_missing(true);
    if is_memory_request {
        // With the default settings each connection to an in-memory SQLite URL
        // gets its own private database, which makes pooled queries land on
        // different databases and tests flaky. A shared cache plus a single
        // connection keeps the database consistent while still exercising the
        // pool API surface.
        opts = opts.shared_cache(true);
    } else {
        opts = opts.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_opts = if is_memory_request {
        SqlitePoolOptions::new().max_connections(1)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_opts
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await?;

    Ok(pool)
}

fn ensure_db_dir(database_url: &str) -> Result<()> {
    if let Some(path_str) = database_url.strip_prefix("sqlite://")
        && !database_url.starts_with("sqlite::memory")
    {
        let path = Path::new(path_str);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn latest_migration_version() -> Option<i64> {
    migrator().iter().map(|m| m.version).max()
}

pub async fn migration_snapshot(pool: &Db) -> Result<MigrationSnapshot> {
    let applied = fetch_applied_migrations(pool).await?;
    let descriptions: HashMap<i64, String> = migrator()
        .iter()
        .map(|m| (m.version, m.description.to_string()))
        .collect();
    let applied_labels: Vec<MigrationLabel> = applied
        .iter()
        .map(|m| MigrationLabel {
            version: m.version,
            description: descriptions
                .get(&m.version)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
        })
        .collect();

    let applied_versions: HashSet<i64> = applied.iter().map(|m| m.version).collect();
    let pending: Vec<MigrationLabel> = migrator()
        .iter()
        .filter(|m| !applied_versions.contains(&m.version))
        .map(|m| MigrationLabel {
            version: m.version,
            description: m.description.to_string(),
        })
        .collect();

    let latest_applied = applied.iter().map(|m| m.version).max();

    Ok(MigrationSnapshot {
        latest_applied,
        latest_available: latest_migration_version(),
        applied: applied_labels,
        pending,
    })
}

pub async fn validate_migrations(pool: &Db) -> Result<()> {
    let applied = fetch_applied_migrations(pool).await?;
    let known: HashMap<i64, &sqlx::migrate::Migration> =
        migrator().iter().map(|m| (m.version, m)).collect();

    for migration in &applied {
        let Some(defined) = known.get(&migration.version) else {
            anyhow::bail!(
                "database has unknown migration version {}",
                migration.version
            );
        };

        if defined.checksum != migration.checksum {
            anyhow::bail!(
                "migration {} checksum mismatch between database and binary",
                migration.version
            );
        }
    }

    Ok(())
}

pub async fn run_migrations(pool: &Db) -> Result<MigrationSnapshot> {
    validate_migrations(pool).await?;

    migrator()
        .run(pool)
        .await
        .context("applying database migrations failed")?;

    migration_snapshot(pool).await
}

async fn fetch_applied_migrations(pool: &Db) -> Result<Vec<AppliedMigration>> {
    let mut conn = pool.acquire().await?;
    conn.ensure_migrations_table()
        .await
        .context("ensure migrations table exists")?;

    if let Some(version) = conn.dirty_version().await? {
        anyhow::bail!("database is in a dirty migration state at version {version}");
    }

    let applied = conn
        .list_applied_migrations()
        .await
        .context("list applied migrations")?;

    Ok(applied)
}
