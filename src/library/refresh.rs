//! The feed-refresh collaborator's side of the library.
//!
//! Fetching and parsing feed XML happens elsewhere; the parser hands over a
//! [`FeedSnapshot`] and the library reconciles it with the catalog.

use std::collections::{HashMap, HashSet};

use super::{Library, LibraryError};
use crate::codec::{FeedUrl, Seconds, Timestamp};
use crate::model::{Episode, EpisodeKey, Podcast};
use crate::storage::WriteBatch;

/// One `<item>` as the feed parser saw it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEpisode {
    pub guid: Option<String>,
    pub title: String,
    pub published: Option<Timestamp>,
    pub duration: Option<Seconds>,
    pub enclosure_url: String,
}

/// A parsed feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub link: Option<String>,
    pub episodes: Vec<FeedEpisode>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub new_episodes: usize,
    pub updated_episodes: usize,
    /// Items with neither GUID nor enclosure, or repeating an earlier key.
    pub skipped: usize,
}

impl Library {
    /// Apply a parsed feed to a podcast.
    ///
    /// Unknown episodes are created; known ones get their metadata
    /// refreshed with playback and download state left alone. The podcast's
    /// last-refreshed time is set. All of it is written in one transaction.
    pub async fn apply_feed_snapshot(
        &self,
        url: &FeedUrl,
        snapshot: FeedSnapshot,
    ) -> Result<RefreshOutcome, LibraryError> {
        let _guard = self.locks.lock(url).await;
        let now = Timestamp::now();

        let mut podcast = self
            .db
            .get_podcast(url)
            .await?
            .ok_or_else(|| LibraryError::PodcastNotFound(url.clone()))?;
        podcast.refresh_metadata(
            &snapshot.title,
            snapshot.description.as_deref(),
            snapshot.image_url.as_deref(),
            snapshot.link.as_deref(),
            now,
        );

        let mut known: HashMap<EpisodeKey, Episode> = self
            .db
            .list_episodes(url)
            .await?
            .into_iter()
            .map(|e| (e.key().clone(), e))
            .collect();

        let mut outcome = RefreshOutcome::default();
        let mut seen = HashSet::new();
        let mut episodes = Vec::with_capacity(snapshot.episodes.len());

        for item in snapshot.episodes {
            let Some(key) = EpisodeKey::derive(item.guid.as_deref(), &item.enclosure_url) else {
                tracing::debug!(podcast = %url, title = %item.title, "Feed item has no GUID or enclosure, skipping");
                outcome.skipped += 1;
                continue;
            };
            if !seen.insert(key.clone()) {
                outcome.skipped += 1;
                continue;
            }

            match known.remove(&key) {
                Some(mut episode) => {
                    let before = episode.clone();
                    episode.refresh_metadata(
                        &item.title,
                        item.published,
                        item.duration,
                        &item.enclosure_url,
                    );
                    if episode != before {
                        outcome.updated_episodes += 1;
                        episodes.push(episode);
                    }
                }
                None => {
                    outcome.new_episodes += 1;
                    episodes.push(new_episode(&podcast, key, item, now));
                }
            }
        }

        self.db
            .apply_batch(&WriteBatch {
                podcasts: vec![podcast],
                episodes,
                ..WriteBatch::default()
            })
            .await?;

        tracing::info!(
            podcast = %url,
            new = outcome.new_episodes,
            updated = outcome.updated_episodes,
            skipped = outcome.skipped,
            "Feed snapshot applied"
        );
        Ok(outcome)
    }

    /// Subscribed podcasts due for a refresh at `now`.
    pub async fn stale_podcasts(&self, now: Timestamp) -> Result<Vec<Podcast>, LibraryError> {
        let interval = self.settings.refresh_interval;
        Ok(self
            .db
            .list_podcasts(false)
            .await?
            .into_iter()
            .filter(|p| p.is_stale(now, interval))
            .collect())
    }
}

fn new_episode(podcast: &Podcast, key: EpisodeKey, item: FeedEpisode, now: Timestamp) -> Episode {
    let mut episode = Episode::new(
        podcast.url().clone(),
        key,
        item.title.trim(),
        item.enclosure_url.trim(),
        now,
    );
    if let Some(guid) = item.guid.filter(|g| !g.trim().is_empty()) {
        episode = episode.with_guid(guid);
    }
    if let Some(published) = item.published {
        episode = episode.with_published(published);
    }
    if let Some(duration) = item.duration {
        episode = episode.with_duration(duration);
    }
    episode
}
