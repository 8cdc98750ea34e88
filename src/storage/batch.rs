use super::cursor::store_cursor_in;
use super::episodes::upsert_episode_in;
use super::podcasts::{purge_podcast_in, rename_podcast_in, upsert_podcast_in};
use super::schema::Database;
use super::types::{BatchOutcome, StorageError, WriteBatch};

impl Database {
    /// Apply a write batch atomically.
    ///
    /// Renames run first so the podcasts and episodes in the batch may
    /// already use the new URLs. A rename whose target exists is skipped with
    /// a warning. Any other failure rolls back the whole batch, cursor
    /// included.
    pub async fn apply_batch(&self, batch: &WriteBatch) -> Result<BatchOutcome, StorageError> {
        let mut outcome = BatchOutcome::default();
        if batch.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;

        for (from, to) in &batch.renames {
            if rename_podcast_in(&mut tx, from, to).await? {
                outcome.renamed += 1;
            } else {
                tracing::warn!(from = %from, to = %to, "Skipping feed URL rewrite");
            }
        }

        for podcast in &batch.podcasts {
            if upsert_podcast_in(&mut tx, podcast).await?.is_write() {
                outcome.podcasts_written += 1;
            }
        }

        for episode in &batch.episodes {
            if upsert_episode_in(&mut tx, episode).await?.is_write() {
                outcome.episodes_written += 1;
            }
        }

        for url in &batch.purges {
            if purge_podcast_in(&mut tx, url).await? {
                outcome.purged += 1;
            }
        }

        if let Some(cursor) = &batch.cursor {
            store_cursor_in(&mut tx, cursor).await?;
        }

        tx.commit().await?;

        tracing::debug!(
            renamed = outcome.renamed,
            podcasts = outcome.podcasts_written,
            episodes = outcome.episodes_written,
            purged = outcome.purged,
            "Write batch committed"
        );
        Ok(outcome)
    }
}
