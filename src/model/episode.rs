use std::fmt;
use std::path::{Path, PathBuf};

use crate::codec::{DownloadState, EpisodeActionKind, FeedUrl, PlayState, Seconds, Timestamp};

/// Per-podcast episode identity: the feed GUID, or the enclosure URL when the
/// feed provides no GUID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpisodeKey(String);

impl EpisodeKey {
    /// Derive the key from a GUID, falling back to the enclosure URL.
    ///
    /// Returns `None` when both are missing or blank.
    pub fn derive(guid: Option<&str>, enclosure_url: &str) -> Option<Self> {
        guid.map(str::trim)
            .filter(|g| !g.is_empty())
            .or_else(|| Some(enclosure_url.trim()).filter(|u| !u.is_empty()))
            .map(|k| Self(k.to_owned()))
    }

    /// Wrap an already-derived key (as stored or received from the sync
    /// service). Blank keys are rejected.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EpisodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full episode identity: owning podcast plus per-podcast key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpisodeId {
    pub podcast: FeedUrl,
    pub key: EpisodeKey,
}

impl EpisodeId {
    pub fn new(podcast: FeedUrl, key: EpisodeKey) -> Self {
        Self { podcast, key }
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.podcast, self.key)
    }
}

/// An episode of a podcast, with local playback and download state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Episode {
    pub(crate) podcast: FeedUrl,
    pub(crate) key: EpisodeKey,
    pub(crate) guid: Option<String>,
    pub(crate) title: String,
    pub(crate) published: Option<Timestamp>,
    pub(crate) duration: Option<Seconds>,
    pub(crate) enclosure_url: String,
    pub(crate) local_path: Option<PathBuf>,
    pub(crate) position: Seconds,
    pub(crate) play_state: PlayState,
    pub(crate) download_state: DownloadState,
    pub(crate) download_error: Option<String>,
    pub(crate) discovered_at: Timestamp,
    pub(crate) modified_at: Option<Timestamp>,
    pub(crate) last_action: Option<EpisodeActionKind>,
    /// The last modification was applied from the sync service, so there
    /// is nothing to push for it.
    pub(crate) from_remote: bool,
}

impl Episode {
    /// A freshly discovered episode with no local state.
    pub fn new(
        podcast: FeedUrl,
        key: EpisodeKey,
        title: impl Into<String>,
        enclosure_url: impl Into<String>,
        discovered_at: Timestamp,
    ) -> Self {
        Self {
            podcast,
            key,
            guid: None,
            title: title.into(),
            published: None,
            duration: None,
            enclosure_url: enclosure_url.into(),
            local_path: None,
            position: Seconds::ZERO,
            play_state: PlayState::New,
            download_state: DownloadState::NotDownloaded,
            download_error: None,
            discovered_at,
            modified_at: None,
            last_action: None,
            from_remote: false,
        }
    }

    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }

    pub fn with_published(mut self, published: Timestamp) -> Self {
        self.published = Some(published);
        self
    }

    pub fn with_duration(mut self, duration: Seconds) -> Self {
        self.duration = Some(duration);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> EpisodeId {
        EpisodeId::new(self.podcast.clone(), self.key.clone())
    }

    pub fn podcast(&self) -> &FeedUrl {
        &self.podcast
    }

    pub fn key(&self) -> &EpisodeKey {
        &self.key
    }

    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn published(&self) -> Option<Timestamp> {
        self.published
    }

    pub fn duration(&self) -> Option<Seconds> {
        self.duration
    }

    pub fn enclosure_url(&self) -> &str {
        &self.enclosure_url
    }

    /// Path of the downloaded file; present only in the `Downloaded` state.
    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    pub fn position(&self) -> Seconds {
        self.position
    }

    pub fn play_state(&self) -> PlayState {
        self.play_state
    }

    pub fn download_state(&self) -> DownloadState {
        self.download_state
    }

    pub fn download_error(&self) -> Option<&str> {
        self.download_error.as_deref()
    }

    pub fn discovered_at(&self) -> Timestamp {
        self.discovered_at
    }

    /// Time of the last locally initiated state change, `None` if the
    /// episode was never touched.
    pub fn modified_at(&self) -> Option<Timestamp> {
        self.modified_at
    }

    /// The action the next push reports for this episode.
    pub fn last_action(&self) -> Option<EpisodeActionKind> {
        self.last_action
    }

    // ========================================================================
    // Sync-relevant mutators (all bump `modified_at`)
    // ========================================================================

    fn touch(&mut self, at: Timestamp, action: Option<EpisodeActionKind>) {
        self.modified_at = Some(at);
        self.from_remote = false;
        if action.is_some() {
            self.last_action = action;
        }
    }

    /// Set the play state directly. `New` rewinds to the start, `Played`
    /// clears the resume position.
    pub fn set_play_state(&mut self, state: PlayState, at: Timestamp) {
        self.play_state = state;
        let action = match state {
            PlayState::New => {
                self.position = Seconds::ZERO;
                EpisodeActionKind::New
            }
            PlayState::Played => {
                self.position = Seconds::ZERO;
                EpisodeActionKind::Play
            }
            PlayState::InProgress => EpisodeActionKind::Play,
        };
        self.touch(at, Some(action));
    }

    /// Store a resume position. A new episode becomes in-progress.
    pub fn set_position(&mut self, position: Seconds, at: Timestamp) {
        self.position = position;
        if self.play_state == PlayState::New && position > Seconds::ZERO {
            self.play_state = PlayState::InProgress;
        }
        self.touch(at, Some(EpisodeActionKind::Play));
    }

    /// Record a playback report. When the remaining time is within
    /// `smart_mark` of the known total, the episode counts as played.
    pub fn record_playback(
        &mut self,
        position: Seconds,
        total: Option<Seconds>,
        smart_mark: Seconds,
        at: Timestamp,
    ) {
        let total = total.or(self.duration);
        match total {
            Some(total) if total > Seconds::ZERO && position.saturating_add(smart_mark) >= total => {
                self.play_state = PlayState::Played;
                self.position = Seconds::ZERO;
            }
            _ => {
                self.play_state = PlayState::InProgress;
                self.position = position;
            }
        }
        if self.duration.is_none() {
            self.duration = total;
        }
        self.touch(at, Some(EpisodeActionKind::Play));
    }

    pub fn mark_downloading(&mut self, at: Timestamp) {
        self.download_state = DownloadState::Downloading;
        self.download_error = None;
        self.touch(at, None);
    }

    pub fn mark_downloaded(&mut self, local_path: PathBuf, at: Timestamp) {
        self.download_state = DownloadState::Downloaded;
        self.local_path = Some(local_path);
        self.download_error = None;
        self.touch(at, Some(EpisodeActionKind::Download));
    }

    pub fn mark_download_failed(&mut self, reason: impl Into<String>, at: Timestamp) {
        self.download_state = DownloadState::Failed;
        self.local_path = None;
        self.download_error = Some(reason.into());
        self.touch(at, None);
    }

    /// Forget the local download. Returns the path of the file that was
    /// recorded, so the caller can remove it.
    pub fn clear_download(&mut self, at: Timestamp) -> Option<PathBuf> {
        let previous = self.local_path.take();
        let was_downloaded = self.download_state == DownloadState::Downloaded;
        self.download_state = DownloadState::NotDownloaded;
        self.download_error = None;
        self.touch(at, was_downloaded.then_some(EpisodeActionKind::Delete));
        previous
    }

    // ========================================================================
    // Feed metadata (no modification bump)
    // ========================================================================

    /// Apply metadata from a feed refresh, leaving user state untouched.
    pub fn refresh_metadata(
        &mut self,
        title: &str,
        published: Option<Timestamp>,
        duration: Option<Seconds>,
        enclosure_url: &str,
    ) {
        if !title.trim().is_empty() {
            self.title = title.trim().to_owned();
        }
        if published.is_some() {
            self.published = published;
        }
        if duration.is_some() {
            self.duration = duration;
        }
        if !enclosure_url.trim().is_empty() {
            self.enclosure_url = enclosure_url.trim().to_owned();
        }
    }

    /// Flag the current modification as received from the sync service.
    /// The next local mutation clears the flag.
    pub(crate) fn mark_from_remote(&mut self) {
        self.from_remote = true;
    }

    pub(crate) fn from_remote(&self) -> bool {
        self.from_remote
    }

    pub(crate) fn with_podcast(mut self, podcast: FeedUrl) -> Self {
        self.podcast = podcast;
        self
    }
}
