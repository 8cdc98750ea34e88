use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{StorageError, SyncCursor};
use crate::codec::{FieldCodec, TimestampCodec};

pub(crate) async fn fetch_cursor(conn: &mut SqliteConnection) -> Result<SyncCursor, StorageError> {
    let row: Option<(Option<String>, Option<i64>)> =
        sqlx::query_as("SELECT token, watermark FROM sync_state WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?;

    let Some((token, watermark)) = row else {
        return Ok(SyncCursor::default());
    };
    let watermark = watermark
        .map(|w| TimestampCodec::decode(&w))
        .transpose()
        .map_err(|source| StorageError::Decode {
            column: "watermark",
            source,
        })?;
    Ok(SyncCursor { token, watermark })
}

/// Persist `cursor` unless it would move the watermark backwards.
///
/// Returns whether the stored cursor changed.
pub(crate) async fn store_cursor_in(
    conn: &mut SqliteConnection,
    cursor: &SyncCursor,
) -> Result<bool, StorageError> {
    let current = fetch_cursor(conn).await?;
    if current == *cursor {
        return Ok(false);
    }
    if let (Some(stored), Some(proposed)) = (current.watermark, cursor.watermark) {
        if proposed < stored {
            tracing::warn!(
                stored = %stored,
                proposed = %proposed,
                "Ignoring sync cursor that would move backwards"
            );
            return Ok(false);
        }
    }

    sqlx::query(
        r#"
        INSERT INTO sync_state (id, token, watermark) VALUES (1, ?, ?)
        ON CONFLICT(id) DO UPDATE SET token = excluded.token, watermark = excluded.watermark
    "#,
    )
    .bind(cursor.token.as_deref())
    .bind(cursor.watermark.map(|w| TimestampCodec::encode(&w)))
    .execute(&mut *conn)
    .await?;
    Ok(true)
}

impl Database {
    // ========================================================================
    // Sync Cursor
    // ========================================================================

    /// The cursor of the last successful sync, or the empty cursor.
    pub async fn load_cursor(&self) -> Result<SyncCursor, StorageError> {
        let mut conn = self.pool.acquire().await?;
        fetch_cursor(&mut conn).await
    }

    /// Persist a new cursor. Watermarks never move backwards; an older
    /// cursor is ignored and `false` returned.
    pub async fn store_cursor(&self, cursor: &SyncCursor) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let stored = store_cursor_in(&mut tx, cursor).await?;
        tx.commit().await?;
        Ok(stored)
    }

    /// Forget the cursor so the next sync starts from scratch.
    pub async fn reset_cursor(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_state")
            .execute(&self.pool)
            .await?;
        tracing::info!("Sync cursor reset");
        Ok(())
    }
}
