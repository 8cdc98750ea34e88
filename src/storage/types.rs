use std::path::PathBuf;

use thiserror::Error;

use crate::codec::{
    DecodeError, DownloadState, DownloadStateCodec, EpisodeActionKindCodec, FeedUrl,
    FeedUrlCodec, FieldCodec, PlayState, PlayStateCodec, Seconds, SecondsCodec, Timestamp,
    TimestampCodec,
};
use crate::model::{Episode, EpisodeKey, Podcast, PodcastState};

// ============================================================================
// Error Types
// ============================================================================

/// Storage errors. A failed call leaves the store as it was before the call.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Another process holds the database lock
    #[error("Another podshelf process appears to be using the library. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A persisted scalar could not be decoded
    #[error("Corrupt value in column '{column}': {source}")]
    Decode {
        column: &'static str,
        #[source]
        source: DecodeError,
    },

    /// Episode written for a podcast that is not in the store
    #[error("Podcast {0} is not in the library")]
    MissingPodcast(FeedUrl),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StorageError {
    /// Classify a sqlx error, mapping lock contention to `InstanceLocked`.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StorageError::InstanceLocked;
        }

        StorageError::Other(err)
    }
}

/// Decode an identity column. A corrupt identity makes the row unusable.
fn decode<C: FieldCodec>(column: &'static str, scalar: &C::Scalar) -> Result<C::Value, StorageError> {
    C::decode(scalar).map_err(|source| StorageError::Decode { column, source })
}

/// Decodes the non-identity columns of one row. A corrupt value is logged
/// and replaced by the column's default so the rest of the row stays
/// readable.
struct Columns<'a> {
    entity: &'a str,
}

impl Columns<'_> {
    fn or<C: FieldCodec>(&self, column: &'static str, scalar: &C::Scalar, fallback: C::Value) -> C::Value {
        C::decode(scalar).unwrap_or_else(|error| {
            self.corrupt(column, &error);
            fallback
        })
    }

    fn optional<C: FieldCodec>(&self, column: &'static str, scalar: &Option<C::Scalar>) -> Option<C::Value> {
        let scalar = scalar.as_ref()?;
        match C::decode(scalar) {
            Ok(value) => Some(value),
            Err(error) => {
                self.corrupt(column, &error);
                None
            }
        }
    }

    fn corrupt(&self, column: &'static str, error: &DecodeError) {
        tracing::warn!(entity = %self.entity, column, error = %error, "Corrupt stored value, using default");
    }
}

// ============================================================================
// Results
// ============================================================================

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored row already equalled the value; nothing was written.
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_write(self) -> bool {
        self != UpsertOutcome::Unchanged
    }
}

/// How an entity changed relative to a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Tombstoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangedEntity {
    Podcast(Podcast),
    Episode(Episode),
}

impl ChangedEntity {
    pub fn podcast_url(&self) -> &FeedUrl {
        match self {
            ChangedEntity::Podcast(p) => p.url(),
            ChangedEntity::Episode(e) => e.podcast(),
        }
    }

    fn episode_key(&self) -> Option<&EpisodeKey> {
        match self {
            ChangedEntity::Podcast(_) => None,
            ChangedEntity::Episode(e) => Some(e.key()),
        }
    }
}

/// One entry of [`Database::changes_since`](super::Database::changes_since).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub entity: ChangedEntity,
    pub kind: ChangeKind,
    pub at: Timestamp,
}

impl Change {
    /// Sort key: time, then feed URL, podcast before its episodes, then key.
    pub(crate) fn order_key(&self) -> (Timestamp, &FeedUrl, Option<&EpisodeKey>) {
        (self.at, self.entity.podcast_url(), self.entity.episode_key())
    }
}

/// Persisted position of the last successful sync.
///
/// `token` is the opaque value the service handed out and expects back as
/// `since`; `watermark` bounds which local changes still need pushing.
/// `None` in both means "never synced".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub token: Option<String>,
    pub watermark: Option<Timestamp>,
}

impl SyncCursor {
    pub fn new(token: impl Into<String>, watermark: Timestamp) -> Self {
        Self {
            token: Some(token.into()),
            watermark: Some(watermark),
        }
    }

    /// Whether an entity modified at `at` is newer than this cursor.
    pub fn is_after(&self, at: Timestamp) -> bool {
        self.watermark.map_or(true, |w| at > w)
    }
}

/// A set of writes applied in one transaction by
/// [`Database::apply_batch`](super::Database::apply_batch).
///
/// Order of application: URL renames, podcast upserts, episode upserts,
/// purges, cursor.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub renames: Vec<(FeedUrl, FeedUrl)>,
    pub podcasts: Vec<Podcast>,
    pub episodes: Vec<Episode>,
    pub purges: Vec<FeedUrl>,
    pub cursor: Option<SyncCursor>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
            && self.podcasts.is_empty()
            && self.episodes.is_empty()
            && self.purges.is_empty()
            && self.cursor.is_none()
    }
}

/// Counts of what a batch actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub renamed: usize,
    pub podcasts_written: usize,
    pub episodes_written: usize,
    pub purged: usize,
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for podcast queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PodcastRow {
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub link: Option<String>,
    pub last_refreshed: Option<i64>,
    pub subscribed_at: i64,
    pub modified_at: i64,
    pub tombstoned_at: Option<i64>,
    pub extra_attributes: String,
    pub from_remote: bool,
}

impl PodcastRow {
    pub(crate) fn into_podcast(self) -> Result<Podcast, StorageError> {
        let url = decode::<FeedUrlCodec>("url", &self.url)?;
        let columns = Columns { entity: url.as_str() };

        let modified_at = columns.or::<TimestampCodec>("modified_at", &self.modified_at, Timestamp::EPOCH);
        let state = match self.tombstoned_at {
            Some(at) => PodcastState::Tombstoned {
                at: columns.or::<TimestampCodec>("tombstoned_at", &at, modified_at),
            },
            None => PodcastState::Subscribed,
        };
        let extra_attributes = match serde_json::from_str(&self.extra_attributes) {
            Ok(attributes) => attributes,
            Err(e) => {
                columns.corrupt(
                    "extra_attributes",
                    &DecodeError::Malformed {
                        field: "extra_attributes",
                        value: self.extra_attributes.clone(),
                        reason: e.to_string(),
                    },
                );
                Vec::new()
            }
        };

        Ok(Podcast {
            title: self.title,
            description: self.description,
            image_url: self.image_url,
            link: self.link,
            last_refreshed: columns.optional::<TimestampCodec>("last_refreshed", &self.last_refreshed),
            subscribed_at: columns.or::<TimestampCodec>("subscribed_at", &self.subscribed_at, modified_at),
            modified_at,
            state,
            extra_attributes,
            from_remote: self.from_remote,
            url,
        })
    }
}

/// Internal row type for episode queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EpisodeRow {
    pub podcast_url: String,
    pub episode_key: String,
    pub guid: Option<String>,
    pub title: String,
    pub published: Option<i64>,
    pub duration: Option<i64>,
    pub enclosure_url: String,
    pub local_path: Option<String>,
    pub position: i64,
    pub play_state: String,
    pub download_state: String,
    pub download_error: Option<String>,
    pub discovered_at: i64,
    pub modified_at: Option<i64>,
    pub last_action: Option<String>,
    pub from_remote: bool,
}

impl EpisodeRow {
    pub(crate) fn into_episode(self) -> Result<Episode, StorageError> {
        let podcast = decode::<FeedUrlCodec>("podcast_url", &self.podcast_url)?;
        let key = EpisodeKey::new(self.episode_key.clone()).ok_or_else(|| StorageError::Decode {
            column: "episode_key",
            source: DecodeError::Malformed {
                field: "episode_key",
                value: self.episode_key.clone(),
                reason: "blank key".to_string(),
            },
        })?;
        let entity = format!("{podcast}#{key}");
        let columns = Columns { entity: &entity };

        let discovered_at = columns.or::<TimestampCodec>("discovered_at", &self.discovered_at, Timestamp::EPOCH);

        Ok(Episode {
            guid: self.guid,
            title: self.title,
            published: columns.optional::<TimestampCodec>("published", &self.published),
            duration: columns.optional::<SecondsCodec>("duration", &self.duration),
            enclosure_url: self.enclosure_url,
            local_path: self.local_path.map(PathBuf::from),
            position: columns.or::<SecondsCodec>("position", &self.position, Seconds::ZERO),
            play_state: columns.or::<PlayStateCodec>("play_state", &self.play_state, PlayState::New),
            download_state: columns.or::<DownloadStateCodec>(
                "download_state",
                &self.download_state,
                DownloadState::NotDownloaded,
            ),
            download_error: self.download_error,
            discovered_at,
            modified_at: columns.optional::<TimestampCodec>("modified_at", &self.modified_at),
            last_action: columns.optional::<EpisodeActionKindCodec>("last_action", &self.last_action),
            from_remote: self.from_remote,
            podcast,
            key,
        })
    }
}
