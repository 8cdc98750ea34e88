use super::schema::Database;
use super::types::{
    Change, ChangeKind, ChangedEntity, EpisodeRow, PodcastRow, StorageError, SyncCursor,
};
use crate::codec::{FieldCodec, TimestampCodec};

impl Database {
    /// Entities changed after the cursor's watermark, oldest first.
    ///
    /// Podcasts count as changed when subscribed, resubscribed or tombstoned
    /// after the watermark; episodes when discovered or locally modified
    /// after it. Ties on the timestamp are broken by feed URL, with a podcast
    /// ahead of its own episodes, then by episode key. A cursor without a
    /// watermark returns every entity.
    ///
    /// Rows whose last modification was applied from the sync service are
    /// not local changes and are left out until the next local mutation.
    pub async fn changes_since(&self, cursor: &SyncCursor) -> Result<Vec<Change>, StorageError> {
        // i64::MIN stands in for "never synced"
        let watermark = cursor
            .watermark
            .map(|w| TimestampCodec::encode(&w))
            .unwrap_or(i64::MIN);

        let mut tx = self.pool.begin().await?;

        let podcast_rows: Vec<PodcastRow> = sqlx::query_as(
            r#"
            SELECT url, title, description, image_url, link, last_refreshed,
                   subscribed_at, modified_at, tombstoned_at, extra_attributes, from_remote
            FROM podcasts
            WHERE modified_at > ? AND from_remote = 0
        "#,
        )
        .bind(watermark)
        .fetch_all(&mut *tx)
        .await?;

        let episode_rows: Vec<EpisodeRow> = sqlx::query_as(
            r#"
            SELECT podcast_url, episode_key, guid, title, published, duration, enclosure_url,
                   local_path, position, play_state, download_state, download_error,
                   discovered_at, modified_at, last_action, from_remote
            FROM episodes
            WHERE (modified_at > ? OR discovered_at > ?) AND from_remote = 0
        "#,
        )
        .bind(watermark)
        .bind(watermark)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut changes = Vec::with_capacity(podcast_rows.len() + episode_rows.len());

        for row in podcast_rows {
            let podcast = row.into_podcast()?;
            let kind = if podcast.is_tombstoned() {
                ChangeKind::Tombstoned
            } else if cursor.is_after(podcast.subscribed_at()) {
                ChangeKind::Created
            } else {
                ChangeKind::Updated
            };
            changes.push(Change {
                at: podcast.modified_at(),
                kind,
                entity: ChangedEntity::Podcast(podcast),
            });
        }

        for row in episode_rows {
            let episode = row.into_episode()?;
            let kind = if cursor.is_after(episode.discovered_at()) {
                ChangeKind::Created
            } else {
                ChangeKind::Updated
            };
            let at = episode
                .modified_at()
                .map_or(episode.discovered_at(), |m| m.max(episode.discovered_at()));
            changes.push(Change {
                at,
                kind,
                entity: ChangedEntity::Episode(episode),
            });
        }

        changes.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FeedUrl, Seconds, Timestamp};
    use crate::model::{Episode, EpisodeKey, Podcast};
    use pretty_assertions::assert_eq;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_epoch_secs(secs).unwrap()
    }

    fn url(s: &str) -> FeedUrl {
        FeedUrl::parse(s).unwrap()
    }

    fn episode(podcast: &FeedUrl, key: &str, discovered: i64) -> Episode {
        Episode::new(
            podcast.clone(),
            EpisodeKey::new(key).unwrap(),
            key,
            format!("{podcast}/{key}.mp3"),
            ts(discovered),
        )
    }

    fn describe(changes: &[Change]) -> Vec<(i64, String, ChangeKind)> {
        changes
            .iter()
            .map(|c| {
                let name = match &c.entity {
                    ChangedEntity::Podcast(p) => p.url().to_string(),
                    ChangedEntity::Episode(e) => e.id().to_string(),
                };
                (c.at.as_epoch_secs(), name, c.kind)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_empty_cursor_returns_everything() {
        let db = Database::open(":memory:").await.unwrap();
        let a = url("https://a.test/rss");
        db.upsert_podcast(&Podcast::new(a.clone(), "A", ts(10))).await.unwrap();
        db.upsert_episode(&episode(&a, "e1", 10)).await.unwrap();

        let changes = db.changes_since(&SyncCursor::default()).await.unwrap();
        assert_eq!(
            describe(&changes),
            vec![
                (10, "https://a.test/rss".to_string(), ChangeKind::Created),
                (10, "https://a.test/rss#e1".to_string(), ChangeKind::Created),
            ]
        );
    }

    #[tokio::test]
    async fn test_watermark_excludes_older_changes() {
        let db = Database::open(":memory:").await.unwrap();
        let a = url("https://a.test/rss");
        db.upsert_podcast(&Podcast::new(a.clone(), "A", ts(10))).await.unwrap();

        let mut old = episode(&a, "old", 10);
        db.upsert_episode(&old).await.unwrap();
        db.upsert_episode(&episode(&a, "fresh", 60)).await.unwrap();

        let cursor = SyncCursor::new("50", ts(50));
        assert_eq!(
            describe(&db.changes_since(&cursor).await.unwrap()),
            vec![(60, "https://a.test/rss#fresh".to_string(), ChangeKind::Created)]
        );

        old.set_position(Seconds::new(12), ts(70));
        db.upsert_episode(&old).await.unwrap();
        assert_eq!(
            describe(&db.changes_since(&cursor).await.unwrap()),
            vec![
                (60, "https://a.test/rss#fresh".to_string(), ChangeKind::Created),
                (70, "https://a.test/rss#old".to_string(), ChangeKind::Updated),
            ]
        );
    }

    #[tokio::test]
    async fn test_tombstones_reported() {
        let db = Database::open(":memory:").await.unwrap();
        let mut p = Podcast::new(url("https://a.test/rss"), "A", ts(10));
        db.upsert_podcast(&p).await.unwrap();
        p.unsubscribe(ts(80));
        db.upsert_podcast(&p).await.unwrap();

        let changes = db.changes_since(&SyncCursor::new("20", ts(20))).await.unwrap();
        assert_eq!(
            describe(&changes),
            vec![(80, "https://a.test/rss".to_string(), ChangeKind::Tombstoned)]
        );
    }

    #[tokio::test]
    async fn test_ties_ordered_by_identity() {
        let db = Database::open(":memory:").await.unwrap();
        let b = url("https://b.test/rss");
        let a = url("https://a.test/rss");
        db.upsert_podcast(&Podcast::new(b.clone(), "B", ts(5))).await.unwrap();
        db.upsert_podcast(&Podcast::new(a.clone(), "A", ts(5))).await.unwrap();
        db.upsert_episode(&episode(&b, "z", 5)).await.unwrap();
        db.upsert_episode(&episode(&a, "y", 5)).await.unwrap();
        db.upsert_episode(&episode(&a, "x", 5)).await.unwrap();

        let order: Vec<String> = describe(&db.changes_since(&SyncCursor::default()).await.unwrap())
            .into_iter()
            .map(|(_, name, _)| name)
            .collect();
        assert_eq!(
            order,
            vec![
                "https://a.test/rss",
                "https://a.test/rss#x",
                "https://a.test/rss#y",
                "https://b.test/rss",
                "https://b.test/rss#z",
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_upsert_records_one_change() {
        let db = Database::open(":memory:").await.unwrap();
        let a = url("https://a.test/rss");
        db.upsert_podcast(&Podcast::new(a.clone(), "A", ts(1))).await.unwrap();

        let mut ep = episode(&a, "e1", 1);
        ep.set_position(Seconds::new(30), ts(40));
        db.upsert_episode(&ep).await.unwrap();
        db.upsert_episode(&ep).await.unwrap();

        let changes = db.changes_since(&SyncCursor::new("10", ts(10))).await.unwrap();
        assert_eq!(changes.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_applied_rows_are_not_local_changes() {
        let db = Database::open(":memory:").await.unwrap();
        let a = url("https://a.test/rss");
        let mut podcast = Podcast::new(a.clone(), "A", ts(100));
        podcast.mark_from_remote();
        db.upsert_podcast(&podcast).await.unwrap();

        let mut ep = episode(&a, "e1", 100);
        ep.set_position(Seconds::new(42), ts(100));
        ep.mark_from_remote();
        db.upsert_episode(&ep).await.unwrap();

        let cursor = SyncCursor::new("50", ts(50));
        assert!(db.changes_since(&cursor).await.unwrap().is_empty());

        ep.set_position(Seconds::new(60), ts(120));
        db.upsert_episode(&ep).await.unwrap();
        assert_eq!(
            describe(&db.changes_since(&cursor).await.unwrap()),
            vec![(120, "https://a.test/rss#e1".to_string(), ChangeKind::Created)]
        );
    }

    #[tokio::test]
    async fn test_corrupt_column_does_not_hide_changes() {
        let db = Database::open(":memory:").await.unwrap();
        let a = url("https://a.test/rss");
        db.upsert_podcast(&Podcast::new(a.clone(), "A", ts(10))).await.unwrap();
        db.upsert_episode(&episode(&a, "e1", 10)).await.unwrap();
        db.upsert_episode(&episode(&a, "e2", 10)).await.unwrap();
        sqlx::query("UPDATE episodes SET last_action = 'bogus' WHERE episode_key = 'e2'")
            .execute(&db.pool)
            .await
            .unwrap();

        let changes = db.changes_since(&SyncCursor::default()).await.unwrap();
        assert_eq!(changes.len(), 3);
    }
}
