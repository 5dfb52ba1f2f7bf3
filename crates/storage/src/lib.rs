use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{InboxVersion, UserId};

const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredInboxVersion {
    pub user_id: UserId,
    pub version: InboxVersion,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite database url '{database_url}'"))?
            .create_if_missing(true);
        let pool_options = if database_url.starts_with(MEMORY_DATABASE_URL) {
            // Every connection to an in-memory database sees its own empty
            // schema, so keep exactly one alive for the pool's lifetime.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open sqlite database '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn load_inbox_version(&self, user_id: UserId) -> Result<Option<InboxVersion>> {
        let row = sqlx::query("SELECT version FROM inbox_versions WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load inbox version for user {}", user_id.0))?;
        row.map(|r| version_from_column(r.get::<i64, _>(0)))
            .transpose()
    }

    /// Records `version` for the user. A stored version is never lowered.
    pub async fn store_inbox_version(&self, user_id: UserId, version: InboxVersion) -> Result<()> {
        let raw = i64::try_from(version.0)
            .with_context(|| format!("inbox version {} does not fit in sqlite", version.0))?;
        sqlx::query(
            "INSERT INTO inbox_versions (user_id, version, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at
             WHERE excluded.version > inbox_versions.version",
        )
        .bind(user_id.0)
        .bind(raw)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store inbox version for user {}", user_id.0))?;
        Ok(())
    }

    pub async fn clear_inbox_version(&self, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM inbox_versions WHERE user_id = ?")
            .bind(user_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_inbox_versions(&self) -> Result<Vec<StoredInboxVersion>> {
        let rows = sqlx::query(
            "SELECT user_id, version, updated_at FROM inbox_versions ORDER BY user_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredInboxVersion {
                    user_id: UserId(row.get::<i64, _>("user_id")),
                    version: version_from_column(row.get::<i64, _>("version"))?,
                    updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
                })
            })
            .collect()
    }
}

fn version_from_column(raw: i64) -> Result<InboxVersion> {
    let version = u64::try_from(raw)
        .with_context(|| format!("stored inbox version {raw} is negative"))?;
    Ok(InboxVersion(version))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == MEMORY_DATABASE_URL || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
