use crate::backup::Drive;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Read side of drive persistence, as far as the watcher core needs it.
#[async_trait]
pub trait DriveSource: Send + Sync {
    async fn list_drives(&self) -> Result<Vec<Drive>>;
    async fn get_drive(&self, path: &Path) -> Result<Option<Drive>>;
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct DriveRow {
    path: String,
    backup_path: String,
    credential: String,
    auto_backup: bool,
}

impl From<DriveRow> for Drive {
    fn from(row: DriveRow) -> Self {
        Drive {
            path: PathBuf::from(row.path),
            backup_path: PathBuf::from(row.backup_path),
            credential: row.credential,
            auto_backup_enabled: row.auto_backup,
        }
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create database file if it doesn't exist
        if !database_url.contains(":memory:") {
            let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to :memory: is its own database, so pin to one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drives (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                backup_path TEXT NOT NULL,
                credential TEXT NOT NULL,
                auto_backup BOOLEAN NOT NULL DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_drive(&self, drive: &Drive) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO drives (path, backup_path, credential, auto_backup)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(drive.path.to_string_lossy().as_ref())
        .bind(drive.backup_path.to_string_lossy().as_ref())
        .bind(&drive.credential)
        .bind(drive.auto_backup_enabled)
        .execute(&self.pool)
        .await?;

        info!("Created drive {}", drive.path.display());
        Ok(())
    }

    pub async fn delete_drive(&self, path: &Path) -> Result<bool> {
        let result = sqlx::query("DELETE FROM drives WHERE path = ?1")
            .bind(path.to_string_lossy().as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_auto_backup(&self, path: &Path, enabled: bool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE drives
            SET auto_backup = ?2, updated_at = CURRENT_TIMESTAMP
            WHERE path = ?1
            "#,
        )
        .bind(path.to_string_lossy().as_ref())
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DriveSource for Storage {
    async fn list_drives(&self) -> Result<Vec<Drive>> {
        let rows = sqlx::query_as::<_, DriveRow>(
            "SELECT path, backup_path, credential, auto_backup FROM drives ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Drive::from).collect())
    }

    async fn get_drive(&self, path: &Path) -> Result<Option<Drive>> {
        let row = sqlx::query_as::<_, DriveRow>(
            "SELECT path, backup_path, credential, auto_backup FROM drives WHERE path = ?1",
        )
        .bind(path.to_string_lossy().as_ref())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Drive::from))
    }
}
