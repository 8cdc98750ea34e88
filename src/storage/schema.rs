use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StorageError;

// ============================================================================
// Database
// ============================================================================

/// The local catalog.
///
/// Opened once at startup and handed to every collaborator by reference;
/// cloning shares the underlying pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// `":memory:"` opens a private in-memory catalog (used by tests).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `StorageError::Migration` if the schema cannot be created.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // Restrict the catalog file to the owner before SQLite creates it
        #[cfg(unix)]
        if !in_memory {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Set through the options so every pooled
        // connection inherits it.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StorageError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        // Each in-memory connection would otherwise see its own empty database
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StorageError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| match StorageError::from_sqlx(e) {
            StorageError::InstanceLocked => StorageError::InstanceLocked,
            other => StorageError::Migration(other.to_string()),
        })?;
        tracing::debug!(path = %path, "Library database opened");
        Ok(db)
    }

    /// Close the pool, waiting for in-flight queries to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op. A failure rolls the whole migration back.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Podcasts are identified by canonical feed URL. tombstoned_at is NULL
        // for active subscriptions. from_remote marks rows last modified by
        // the sync service, which are never pushed back.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS podcasts (
                url TEXT PRIMARY KEY NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                image_url TEXT,
                link TEXT,
                last_refreshed INTEGER,
                subscribed_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                tombstoned_at INTEGER,
                extra_attributes TEXT NOT NULL DEFAULT '[]',
                from_remote INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // ON UPDATE CASCADE carries episodes along when the sync service
        // rewrites a feed URL.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                podcast_url TEXT NOT NULL
                    REFERENCES podcasts(url) ON DELETE CASCADE ON UPDATE CASCADE,
                episode_key TEXT NOT NULL,
                guid TEXT,
                title TEXT NOT NULL,
                published INTEGER,
                duration INTEGER,
                enclosure_url TEXT NOT NULL,
                local_path TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                play_state TEXT NOT NULL DEFAULT 'new',
                download_state TEXT NOT NULL DEFAULT 'not_downloaded',
                download_error TEXT,
                discovered_at INTEGER NOT NULL,
                modified_at INTEGER,
                last_action TEXT,
                from_remote INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (podcast_url, episode_key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_podcasts_modified ON podcasts(modified_at)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_episodes_modified ON episodes(modified_at)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_episodes_discovered ON episodes(discovered_at)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_episodes_download_state ON episodes(download_state)",
        )
        .execute(&mut *tx)
        .await?;

        // Single-row table holding the sync cursor
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                token TEXT,
                watermark INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
