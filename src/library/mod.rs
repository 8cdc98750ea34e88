//! The library: the catalog plus the locking discipline around it.
//!
//! [`Library`] is opened once, owns the [`Database`] and the per-podcast
//! lock map, and is the only place local mutations come from. Every method
//! that writes holds the lock of each podcast it touches for the whole
//! read-modify-write, so feed refreshes, download reports, playback updates,
//! imports and the sync commit never interleave on the same podcast while
//! unrelated podcasts proceed in parallel.

mod downloads;
mod interchange;
mod refresh;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::codec::{FeedUrl, PlayState, Seconds, Timestamp};
use crate::config::Config;
use crate::model::{Episode, EpisodeId, Podcast};
use crate::opml::{ExportError, ParseError};
use crate::storage::{Database, StorageError};
use crate::sync::{RemoteService, SyncClient};
use crate::util::{KeyedLocks, UrlValidationError};

pub use downloads::DownloadRequest;
pub use refresh::{FeedEpisode, FeedSnapshot, RefreshOutcome};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Podcast {0} is not in the library")]
    PodcastNotFound(FeedUrl),

    #[error("Episode {0} is not in the library")]
    EpisodeNotFound(EpisodeId),

    #[error("Invalid feed URL '{url}': {source}")]
    InvalidFeedUrl {
        url: String,
        #[source]
        source: UrlValidationError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings the library takes from [`Config`].
#[derive(Debug, Clone)]
pub struct LibrarySettings {
    pub library_dir: PathBuf,
    pub refresh_interval: Duration,
    pub smart_mark: Seconds,
}

impl From<&Config> for LibrarySettings {
    fn from(config: &Config) -> Self {
        Self {
            library_dir: config.library_dir(),
            refresh_interval: config.refresh_interval(),
            smart_mark: config.smart_mark(),
        }
    }
}

pub struct Library {
    db: Database,
    locks: Arc<KeyedLocks<FeedUrl>>,
    sync_guard: Arc<Mutex<()>>,
    settings: LibrarySettings,
}

impl Library {
    pub fn new(db: Database, settings: LibrarySettings) -> Self {
        Self {
            db,
            locks: Arc::new(KeyedLocks::new()),
            sync_guard: Arc::new(Mutex::new(())),
            settings,
        }
    }

    /// Open the catalog named by the config, creating its directory.
    pub async fn open(config: &Config) -> Result<Self, LibraryError> {
        let path = config.database_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Database::open(&path.to_string_lossy()).await?;
        tracing::info!(path = %path.display(), "Library opened");
        Ok(Self::new(db, LibrarySettings::from(config)))
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &LibrarySettings {
        &self.settings
    }

    pub fn library_dir(&self) -> &Path {
        &self.settings.library_dir
    }

    /// A sync client bound to this library's catalog, locks and guard.
    pub fn sync_client(&self, remote: Arc<dyn RemoteService>) -> SyncClient {
        SyncClient::new(
            self.db.clone(),
            Arc::clone(&self.locks),
            remote,
            Arc::clone(&self.sync_guard),
            self.settings.smart_mark,
        )
    }

    /// Forget the sync cursor so the next cycle pulls and pushes everything.
    pub async fn full_resync(&self) -> Result<(), LibraryError> {
        self.db.reset_cursor().await?;
        tracing::info!("Sync cursor reset, next sync is a full resync");
        Ok(())
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to a feed, or revive a tombstoned subscription.
    ///
    /// Subscribing to a feed that is already subscribed changes nothing.
    pub async fn subscribe(&self, url: &str, title: Option<&str>) -> Result<Podcast, LibraryError> {
        let url = parse_feed_url(url)?;
        let _guard = self.locks.lock(&url).await;
        let now = Timestamp::now();

        let podcast = match self.db.get_podcast(&url).await? {
            Some(existing) if existing.is_subscribed() => return Ok(existing),
            Some(mut existing) => {
                existing.resubscribe(now);
                existing.adopt_outline_metadata(title, None, &[]);
                existing
            }
            None => {
                let title = title
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .unwrap_or(url.as_str());
                Podcast::new(url.clone(), title, now)
            }
        };

        self.db.upsert_podcast(&podcast).await?;
        tracing::info!(url = %url, "Subscribed");
        Ok(podcast)
    }

    /// Tombstone a subscription. It is purged once the sync service has
    /// acknowledged the removal. Returns `false` if it was already
    /// unsubscribed.
    pub async fn unsubscribe(&self, url: &FeedUrl) -> Result<bool, LibraryError> {
        let _guard = self.locks.lock(url).await;
        let mut podcast = self
            .db
            .get_podcast(url)
            .await?
            .ok_or_else(|| LibraryError::PodcastNotFound(url.clone()))?;

        if !podcast.unsubscribe(Timestamp::now()) {
            return Ok(false);
        }
        self.db.upsert_podcast(&podcast).await?;
        tracing::info!(url = %url, "Unsubscribed");
        Ok(true)
    }

    pub async fn podcast(&self, url: &FeedUrl) -> Result<Option<Podcast>, LibraryError> {
        Ok(self.db.get_podcast(url).await?)
    }

    /// Subscribed podcasts, or tombstoned ones too.
    pub async fn podcasts(&self, include_tombstoned: bool) -> Result<Vec<Podcast>, LibraryError> {
        Ok(self.db.list_podcasts(include_tombstoned).await?)
    }

    pub async fn episodes(&self, url: &FeedUrl) -> Result<Vec<Episode>, LibraryError> {
        Ok(self.db.list_episodes(url).await?)
    }

    pub async fn episode(&self, id: &EpisodeId) -> Result<Option<Episode>, LibraryError> {
        Ok(self.db.get_episode(&id.podcast, &id.key).await?)
    }

    // ========================================================================
    // Playback
    // ========================================================================

    pub async fn set_play_state(
        &self,
        id: &EpisodeId,
        state: PlayState,
    ) -> Result<Episode, LibraryError> {
        self.update_episode(id, |e, now| e.set_play_state(state, now))
            .await
            .map(|(episode, ())| episode)
    }

    pub async fn set_position(
        &self,
        id: &EpisodeId,
        position: Seconds,
    ) -> Result<Episode, LibraryError> {
        self.update_episode(id, |e, now| e.set_position(position, now))
            .await
            .map(|(episode, ())| episode)
    }

    /// Record a playback report from the player, applying the smart-mark
    /// threshold.
    pub async fn record_playback(
        &self,
        id: &EpisodeId,
        position: Seconds,
        total: Option<Seconds>,
    ) -> Result<Episode, LibraryError> {
        let smart_mark = self.settings.smart_mark;
        self.update_episode(id, |e, now| e.record_playback(position, total, smart_mark, now))
            .await
            .map(|(episode, ())| episode)
    }

    /// Read-modify-write of one episode under its podcast's lock.
    pub(crate) async fn update_episode<R>(
        &self,
        id: &EpisodeId,
        mutate: impl FnOnce(&mut Episode, Timestamp) -> R,
    ) -> Result<(Episode, R), LibraryError> {
        let _guard = self.locks.lock(&id.podcast).await;
        let mut episode = self
            .db
            .get_episode(&id.podcast, &id.key)
            .await?
            .ok_or_else(|| LibraryError::EpisodeNotFound(id.clone()))?;

        let result = mutate(&mut episode, Timestamp::now());
        self.db.upsert_episode(&episode).await?;
        Ok((episode, result))
    }
}

fn parse_feed_url(input: &str) -> Result<FeedUrl, LibraryError> {
    FeedUrl::parse_untrusted(input).map_err(|source| LibraryError::InvalidFeedUrl {
        url: input.to_string(),
        source,
    })
}
