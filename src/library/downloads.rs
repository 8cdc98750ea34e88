//! The downloader collaborator's side of the library.
//!
//! The library decides what to fetch and where it goes; the transport is
//! external and reports back through `mark_downloading`, `mark_downloaded`
//! and `mark_download_failed`.

use std::path::PathBuf;

use super::{Library, LibraryError};
use crate::codec::DownloadState;
use crate::model::{Episode, EpisodeId};
use crate::util::download_destination;

/// "Fetch this URL to this path."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub episode: EpisodeId,
    pub url: String,
    pub destination: PathBuf,
}

impl Library {
    /// Episodes queued or in flight, with their destinations.
    ///
    /// After a restart this is the list to resume.
    pub async fn pending_downloads(&self) -> Result<Vec<DownloadRequest>, LibraryError> {
        let episodes = self
            .db
            .episodes_in_download_state(DownloadState::Downloading)
            .await?;

        let mut requests = Vec::with_capacity(episodes.len());
        for episode in episodes {
            match self.db.get_podcast(episode.podcast()).await? {
                Some(podcast) => requests.push(DownloadRequest {
                    episode: episode.id(),
                    url: episode.enclosure_url().to_string(),
                    destination: download_destination(self.library_dir(), &podcast, &episode),
                }),
                None => {
                    tracing::warn!(episode = %episode.id(), "Pending download without a podcast");
                }
            }
        }
        Ok(requests)
    }

    /// Queue an episode for download and return the request to hand to the
    /// downloader.
    pub async fn queue_download(&self, id: &EpisodeId) -> Result<DownloadRequest, LibraryError> {
        let podcast = self
            .db
            .get_podcast(&id.podcast)
            .await?
            .ok_or_else(|| LibraryError::PodcastNotFound(id.podcast.clone()))?;

        let (episode, ()) = self
            .update_episode(id, |e, now| e.mark_downloading(now))
            .await?;
        tracing::info!(episode = %id, "Download queued");

        Ok(DownloadRequest {
            episode: id.clone(),
            url: episode.enclosure_url().to_string(),
            destination: download_destination(self.library_dir(), &podcast, &episode),
        })
    }

    pub async fn mark_downloading(&self, id: &EpisodeId) -> Result<Episode, LibraryError> {
        self.update_episode(id, |e, now| e.mark_downloading(now))
            .await
            .map(|(episode, ())| episode)
    }

    pub async fn mark_downloaded(
        &self,
        id: &EpisodeId,
        local_path: PathBuf,
    ) -> Result<Episode, LibraryError> {
        let (episode, ()) = self
            .update_episode(id, |e, now| e.mark_downloaded(local_path, now))
            .await?;
        tracing::info!(episode = %id, path = ?episode.local_path(), "Download complete");
        Ok(episode)
    }

    pub async fn mark_download_failed(
        &self,
        id: &EpisodeId,
        reason: &str,
    ) -> Result<Episode, LibraryError> {
        let (episode, ()) = self
            .update_episode(id, |e, now| e.mark_download_failed(reason, now))
            .await?;
        tracing::warn!(episode = %id, reason = %reason, "Download failed");
        Ok(episode)
    }

    /// Forget a download. Returns the file path that was recorded; removing
    /// the file is the caller's job.
    pub async fn clear_download(&self, id: &EpisodeId) -> Result<Option<PathBuf>, LibraryError> {
        let (_, path) = self.update_episode(id, |e, now| e.clear_download(now)).await?;
        Ok(path)
    }
}
