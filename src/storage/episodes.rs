use sqlx::SqliteConnection;

use super::podcasts::fetch_podcast;
use super::schema::Database;
use super::types::{EpisodeRow, StorageError, UpsertOutcome};
use crate::codec::{
    DownloadState, DownloadStateCodec, EpisodeActionKindCodec, FeedUrl, FeedUrlCodec, FieldCodec,
    PlayStateCodec, SecondsCodec, TimestampCodec,
};
use crate::model::{Episode, EpisodeKey};

pub(crate) async fn fetch_episode(
    conn: &mut SqliteConnection,
    podcast: &FeedUrl,
    key: &EpisodeKey,
) -> Result<Option<Episode>, StorageError> {
    let row: Option<EpisodeRow> = sqlx::query_as(
        r#"
        SELECT podcast_url, episode_key, guid, title, published, duration, enclosure_url,
               local_path, position, play_state, download_state, download_error,
               discovered_at, modified_at, last_action, from_remote
        FROM episodes
        WHERE podcast_url = ? AND episode_key = ?
    "#,
    )
    .bind(FeedUrlCodec::encode(podcast))
    .bind(key.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    row.map(EpisodeRow::into_episode).transpose()
}

pub(crate) async fn upsert_episode_in(
    conn: &mut SqliteConnection,
    episode: &Episode,
) -> Result<UpsertOutcome, StorageError> {
    let outcome = match fetch_episode(conn, episode.podcast(), episode.key()).await? {
        Some(stored) if stored == *episode => return Ok(UpsertOutcome::Unchanged),
        Some(_) => UpsertOutcome::Updated,
        None => {
            if fetch_podcast(conn, episode.podcast()).await?.is_none() {
                return Err(StorageError::MissingPodcast(episode.podcast().clone()));
            }
            UpsertOutcome::Inserted
        }
    };

    sqlx::query(
        r#"
        INSERT INTO episodes (podcast_url, episode_key, guid, title, published, duration,
                              enclosure_url, local_path, position, play_state, download_state,
                              download_error, discovered_at, modified_at, last_action,
                              from_remote)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(podcast_url, episode_key) DO UPDATE SET
            guid = excluded.guid,
            title = excluded.title,
            published = excluded.published,
            duration = excluded.duration,
            enclosure_url = excluded.enclosure_url,
            local_path = excluded.local_path,
            position = excluded.position,
            play_state = excluded.play_state,
            download_state = excluded.download_state,
            download_error = excluded.download_error,
            discovered_at = excluded.discovered_at,
            modified_at = excluded.modified_at,
            last_action = excluded.last_action,
            from_remote = excluded.from_remote
    "#,
    )
    .bind(FeedUrlCodec::encode(episode.podcast()))
    .bind(episode.key().as_str())
    .bind(episode.guid())
    .bind(episode.title())
    .bind(episode.published().map(|t| TimestampCodec::encode(&t)))
    .bind(episode.duration().map(|d| SecondsCodec::encode(&d)))
    .bind(episode.enclosure_url())
    .bind(episode.local_path().map(|p| p.to_string_lossy().into_owned()))
    .bind(SecondsCodec::encode(&episode.position()))
    .bind(PlayStateCodec::encode(&episode.play_state()))
    .bind(DownloadStateCodec::encode(&episode.download_state()))
    .bind(episode.download_error())
    .bind(TimestampCodec::encode(&episode.discovered_at()))
    .bind(episode.modified_at().map(|t| TimestampCodec::encode(&t)))
    .bind(episode.last_action().map(|a| EpisodeActionKindCodec::encode(&a)))
    .bind(episode.from_remote())
    .execute(&mut *conn)
    .await?;

    Ok(outcome)
}

impl Database {
    // ========================================================================
    // Episode Operations
    // ========================================================================

    pub async fn get_episode(
        &self,
        podcast: &FeedUrl,
        key: &EpisodeKey,
    ) -> Result<Option<Episode>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        fetch_episode(&mut conn, podcast, key).await
    }

    /// Episodes of one podcast, newest first. Undated episodes sort last.
    pub async fn list_episodes(&self, podcast: &FeedUrl) -> Result<Vec<Episode>, StorageError> {
        let rows: Vec<EpisodeRow> = sqlx::query_as(
            r#"
            SELECT podcast_url, episode_key, guid, title, published, duration, enclosure_url,
                   local_path, position, play_state, download_state, download_error,
                   discovered_at, modified_at, last_action, from_remote
            FROM episodes
            WHERE podcast_url = ?
            ORDER BY published IS NULL, published DESC, discovered_at DESC, episode_key
        "#,
        )
        .bind(FeedUrlCodec::encode(podcast))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EpisodeRow::into_episode).collect()
    }

    /// Insert or update an episode. Writing the stored value again is a no-op.
    ///
    /// # Errors
    ///
    /// `StorageError::MissingPodcast` if the owning podcast is not stored.
    pub async fn upsert_episode(&self, episode: &Episode) -> Result<UpsertOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_episode_in(&mut tx, episode).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Episodes in a given download state across all podcasts, oldest
    /// discovery first.
    pub async fn episodes_in_download_state(
        &self,
        state: DownloadState,
    ) -> Result<Vec<Episode>, StorageError> {
        let rows: Vec<EpisodeRow> = sqlx::query_as(
            r#"
            SELECT podcast_url, episode_key, guid, title, published, duration, enclosure_url,
                   local_path, position, play_state, download_state, download_error,
                   discovered_at, modified_at, last_action, from_remote
            FROM episodes
            WHERE download_state = ?
            ORDER BY discovered_at, podcast_url, episode_key
        "#,
        )
        .bind(DownloadStateCodec::encode(&state))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EpisodeRow::into_episode).collect()
    }
}
