use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{PodcastRow, StorageError, UpsertOutcome};
use crate::codec::{FeedUrl, FeedUrlCodec, FieldCodec, TimestampCodec};
use crate::model::{Podcast, PodcastState};

// ============================================================================
// Connection-level helpers (shared with write batches)
// ============================================================================

pub(crate) async fn fetch_podcast(
    conn: &mut SqliteConnection,
    url: &FeedUrl,
) -> Result<Option<Podcast>, StorageError> {
    let row: Option<PodcastRow> = sqlx::query_as(
        r#"
        SELECT url, title, description, image_url, link, last_refreshed,
               subscribed_at, modified_at, tombstoned_at, extra_attributes, from_remote
        FROM podcasts
        WHERE url = ?
    "#,
    )
    .bind(FeedUrlCodec::encode(url))
    .fetch_optional(&mut *conn)
    .await?;

    row.map(PodcastRow::into_podcast).transpose()
}

pub(crate) async fn upsert_podcast_in(
    conn: &mut SqliteConnection,
    podcast: &Podcast,
) -> Result<UpsertOutcome, StorageError> {
    let outcome = match fetch_podcast(conn, podcast.url()).await? {
        Some(stored) if stored == *podcast => return Ok(UpsertOutcome::Unchanged),
        Some(_) => UpsertOutcome::Updated,
        None => UpsertOutcome::Inserted,
    };

    let tombstoned_at = match podcast.state() {
        PodcastState::Subscribed => None,
        PodcastState::Tombstoned { at } => Some(TimestampCodec::encode(&at)),
    };
    // Vec<(String, String)> always serializes
    let extra = serde_json::to_string(podcast.extra_attributes()).unwrap_or_else(|_| "[]".into());

    // ON CONFLICT DO UPDATE rather than INSERT OR REPLACE: a replace would
    // delete the row and cascade to its episodes.
    sqlx::query(
        r#"
        INSERT INTO podcasts (url, title, description, image_url, link, last_refreshed,
                              subscribed_at, modified_at, tombstoned_at, extra_attributes,
                              from_remote)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(url) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            image_url = excluded.image_url,
            link = excluded.link,
            last_refreshed = excluded.last_refreshed,
            subscribed_at = excluded.subscribed_at,
            modified_at = excluded.modified_at,
            tombstoned_at = excluded.tombstoned_at,
            extra_attributes = excluded.extra_attributes,
            from_remote = excluded.from_remote
    "#,
    )
    .bind(FeedUrlCodec::encode(podcast.url()))
    .bind(podcast.title())
    .bind(podcast.description())
    .bind(podcast.image_url())
    .bind(podcast.link())
    .bind(podcast.last_refreshed().map(|t| TimestampCodec::encode(&t)))
    .bind(TimestampCodec::encode(&podcast.subscribed_at()))
    .bind(TimestampCodec::encode(&podcast.modified_at()))
    .bind(tombstoned_at)
    .bind(extra)
    .bind(podcast.from_remote())
    .execute(&mut *conn)
    .await?;

    Ok(outcome)
}

pub(crate) async fn purge_podcast_in(
    conn: &mut SqliteConnection,
    url: &FeedUrl,
) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM podcasts WHERE url = ?")
        .bind(FeedUrlCodec::encode(url))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Move a podcast (and, through the cascade, its episodes) to a new URL.
///
/// Returns `false` without writing when `from` is unknown or `to` is already
/// taken.
pub(crate) async fn rename_podcast_in(
    conn: &mut SqliteConnection,
    from: &FeedUrl,
    to: &FeedUrl,
) -> Result<bool, StorageError> {
    if from == to || fetch_podcast(conn, to).await?.is_some() {
        return Ok(false);
    }
    let result = sqlx::query("UPDATE podcasts SET url = ? WHERE url = ?")
        .bind(FeedUrlCodec::encode(to))
        .bind(FeedUrlCodec::encode(from))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

impl Database {
    // ========================================================================
    // Podcast Operations
    // ========================================================================

    /// Look up a podcast by feed URL, tombstoned ones included.
    pub async fn get_podcast(&self, url: &FeedUrl) -> Result<Option<Podcast>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        fetch_podcast(&mut conn, url).await
    }

    /// All podcasts ordered by title.
    pub async fn list_podcasts(
        &self,
        include_tombstoned: bool,
    ) -> Result<Vec<Podcast>, StorageError> {
        let rows: Vec<PodcastRow> = sqlx::query_as(
            r#"
            SELECT url, title, description, image_url, link, last_refreshed,
                   subscribed_at, modified_at, tombstoned_at, extra_attributes, from_remote
            FROM podcasts
            WHERE ? OR tombstoned_at IS NULL
            ORDER BY title COLLATE NOCASE, url
        "#,
        )
        .bind(include_tombstoned)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PodcastRow::into_podcast).collect()
    }

    /// Insert or update a podcast. Writing the stored value again is a no-op.
    pub async fn upsert_podcast(&self, podcast: &Podcast) -> Result<UpsertOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_podcast_in(&mut tx, podcast).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Physically delete a podcast and its episodes. Returns whether a row
    /// existed.
    pub async fn purge_podcast(&self, url: &FeedUrl) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let purged = purge_podcast_in(&mut tx, url).await?;
        tx.commit().await?;
        if purged {
            tracing::debug!(podcast = %url, "Podcast purged");
        }
        Ok(purged)
    }
}
