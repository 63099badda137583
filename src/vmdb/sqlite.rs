//! SQLite-backed [`VmStore`].
//!
//! Timestamps are stored as RFC 3339 text. The schema migration is applied
//! inline via `include_str!` on open.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use super::{VmDbEntry, VmStore, VmStoreError};

type VmRow = (String, String, Option<String>, String, Option<String>, i64);

/// VM database stored in a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteVmStore {
    pool: SqlitePool,
}

impl SqliteVmStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the database
    /// cannot be opened, or the migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create vm database directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open vm database at {}", path.display()))?;

        let migration_sql = include_str!("../../migrations/001_vmdb_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply vm database schema")?;

        debug!(path = %path.display(), "vm database opened");
        Ok(Self { pool })
    }
}

fn parse_time(id: &str, field: &str, raw: &str) -> Result<DateTime<Utc>, VmStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VmStoreError::Corrupt {
            id: id.to_owned(),
            reason: format!("{field}: {e}"),
        })
}

fn row_into_entry(row: VmRow) -> Result<VmDbEntry, VmStoreError> {
    let (id, name, config_source, created_at, last_run_at, run_count) = row;
    let created_at = parse_time(&id, "created_at", &created_at)?;
    let last_run_at = match last_run_at {
        Some(raw) => Some(parse_time(&id, "last_run_at", &raw)?),
        None => None,
    };
    let run_count = u64::try_from(run_count).map_err(|_| VmStoreError::Corrupt {
        id: id.clone(),
        reason: format!("negative run_count {run_count}"),
    })?;
    Ok(VmDbEntry {
        id,
        name,
        config_source,
        created_at,
        last_run_at,
        run_count,
    })
}

#[async_trait]
impl VmStore for SqliteVmStore {
    async fn get(&self, id: &str) -> Result<Option<VmDbEntry>, VmStoreError> {
        let row: Option<VmRow> = sqlx::query_as(
            "SELECT id, name, config_source, created_at, last_run_at, run_count
             FROM vms WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_into_entry).transpose()
    }

    async fn insert(&self, entry: &VmDbEntry) -> Result<(), VmStoreError> {
        let run_count = i64::try_from(entry.run_count).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "INSERT INTO vms (id, name, config_source, created_at, last_run_at, run_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&entry.id)
        .bind(&entry.name)
        .bind(&entry.config_source)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.last_run_at.map(|t| t.to_rfc3339()))
        .bind(run_count)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(VmStoreError::Duplicate(entry.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_run(&self, id: &str, at: DateTime<Utc>) -> Result<VmDbEntry, VmStoreError> {
        let updated = sqlx::query(
            "UPDATE vms SET run_count = run_count + 1, last_run_at = ?2 WHERE id = ?1",
        )
        .bind(id)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(VmStoreError::NotFound(id.to_owned()));
        }
        self.get(id)
            .await?
            .ok_or_else(|| VmStoreError::NotFound(id.to_owned()))
    }

    async fn list(&self) -> Result<Vec<VmDbEntry>, VmStoreError> {
        let rows: Vec<VmRow> = sqlx::query_as(
            "SELECT id, name, config_source, created_at, last_run_at, run_count
             FROM vms ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_into_entry).collect()
    }
}
