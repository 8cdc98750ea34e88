//! Pure merge of pulled remote changes into a local view.
//!
//! Nothing here touches the store or the network. The sync cycle runs the
//! merge once to plan the push and again under the podcast locks, against
//! freshly read rows, to build the write batch.
//!
//! Conflict rule: a local entity with a change newer than the cursor keeps
//! that change only when it is strictly newer than the remote one. Equal
//! timestamps resolve to the remote value.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::codec::{
    EpisodeActionKind, FeedUrl, PlayState, Seconds, SubscriptionAction, Timestamp,
};
use crate::model::{Episode, EpisodeId, EpisodeKey, Podcast};
use crate::storage::SyncCursor;

use super::wire::{EpisodeAction, SubscriptionChange};

/// The local state a merge starts from.
#[derive(Debug, Clone, Default)]
pub struct LocalView {
    pub cursor: SyncCursor,
    /// Every podcast, tombstoned ones included.
    pub podcasts: BTreeMap<FeedUrl, Podcast>,
    /// Episodes of the podcasts the pulled actions refer to.
    pub episodes: BTreeMap<EpisodeId, Episode>,
}

impl LocalView {
    fn pending_podcast_change(&self, url: &FeedUrl) -> Option<Timestamp> {
        self.podcasts
            .get(url)
            .map(Podcast::modified_at)
            .filter(|&at| self.cursor.is_after(at))
    }

    fn pending_episode_change(&self, id: &EpisodeId) -> Option<Timestamp> {
        self.episodes
            .get(id)
            .and_then(Episode::modified_at)
            .filter(|&at| self.cursor.is_after(at))
    }
}

/// Counters for the sync report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub subscriptions_applied: usize,
    /// Remote subscription changes that lost to a newer local change, or
    /// changed nothing.
    pub subscriptions_ignored: usize,
    pub actions_applied: usize,
    /// Remote actions older than the local state.
    pub actions_ignored: usize,
    /// Remote entries that could not be used (bad URL, unknown podcast).
    pub skipped: usize,
}

/// Result of [`merge`].
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Podcasts to create or update.
    pub podcasts: BTreeMap<FeedUrl, Podcast>,
    /// Episodes to create or update.
    pub episodes: BTreeMap<EpisodeId, Episode>,
    /// Podcasts removed remotely, to purge with their episodes.
    pub purges: BTreeSet<FeedUrl>,
    /// Files of downloads cleared by a remote `delete`.
    pub removed_files: Vec<PathBuf>,
    /// Podcasts whose pending local change was superseded by the remote.
    pub overridden_podcasts: BTreeSet<FeedUrl>,
    /// Episodes whose pending local change was superseded by the remote.
    pub overridden_episodes: BTreeSet<EpisodeId>,
    pub stats: MergeStats,
}

impl MergeOutcome {
    /// Every podcast the outcome writes to.
    pub fn touched_podcasts(&self) -> BTreeSet<FeedUrl> {
        self.podcasts
            .keys()
            .chain(self.purges.iter())
            .chain(self.episodes.keys().map(|id| &id.podcast))
            .cloned()
            .collect()
    }

    fn current_podcast<'a>(&'a self, local: &'a LocalView, url: &FeedUrl) -> Option<&'a Podcast> {
        if self.purges.contains(url) {
            return None;
        }
        self.podcasts.get(url).or_else(|| local.podcasts.get(url))
    }

    fn drop_podcast(&mut self, local: &LocalView, url: &FeedUrl) {
        self.podcasts.remove(url);
        self.episodes.retain(|id, _| &id.podcast != url);
        if local.podcasts.contains_key(url) {
            self.purges.insert(url.clone());
        }
    }
}

/// Merge pulled subscription changes and episode actions into `local`.
///
/// Both lists are applied in timestamp order (stable for equal
/// timestamps), subscriptions first so actions can refer to podcasts the
/// same pull added.
pub fn merge(
    local: &LocalView,
    subscriptions: &[SubscriptionChange],
    actions: &[EpisodeAction],
    smart_mark: Seconds,
) -> MergeOutcome {
    let mut out = MergeOutcome::default();

    let mut subscriptions: Vec<&SubscriptionChange> = subscriptions.iter().collect();
    subscriptions.sort_by_key(|c| c.timestamp);
    for change in subscriptions {
        merge_subscription(local, &mut out, change);
    }

    let mut actions: Vec<&EpisodeAction> = actions.iter().collect();
    actions.sort_by_key(|a| a.timestamp);
    for action in actions {
        merge_action(local, &mut out, action, smart_mark);
    }

    out
}

fn merge_subscription(local: &LocalView, out: &mut MergeOutcome, change: &SubscriptionChange) {
    // Adds go through the same URL policy as local subscriptions, so every
    // stored feed can be exported and imported again
    let parsed = match change.action {
        SubscriptionAction::Add => FeedUrl::parse_untrusted(&change.feed_url),
        SubscriptionAction::Remove => FeedUrl::parse(&change.feed_url),
    };
    let url = match parsed {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(url = %change.feed_url, error = %e, "Skipping remote subscription with invalid URL");
            out.stats.skipped += 1;
            return;
        }
    };

    if let Some(local_at) = local.pending_podcast_change(&url) {
        if change.timestamp < local_at {
            tracing::debug!(
                url = %url,
                remote = %change.timestamp,
                local = %local_at,
                "Local subscription change is newer, ignoring remote"
            );
            out.stats.subscriptions_ignored += 1;
            return;
        }
    }

    let applied = match change.action {
        SubscriptionAction::Add => apply_remote_add(local, out, &url, change.timestamp),
        SubscriptionAction::Remove => {
            if out.current_podcast(local, &url).is_some() {
                out.drop_podcast(local, &url);
                true
            } else {
                false
            }
        }
    };

    if applied {
        out.stats.subscriptions_applied += 1;
        if local.pending_podcast_change(&url).is_some() {
            out.overridden_podcasts.insert(url);
        }
    } else {
        out.stats.subscriptions_ignored += 1;
    }
}

fn apply_remote_add(
    local: &LocalView,
    out: &mut MergeOutcome,
    url: &FeedUrl,
    at: Timestamp,
) -> bool {
    // Re-added after a remove earlier in the same pull: keep the local row
    if out.purges.remove(url) {
        if let Some(mut podcast) = local.podcasts.get(url).cloned() {
            podcast.resubscribe(at);
            podcast.mark_from_remote();
            out.podcasts.insert(url.clone(), podcast);
            return true;
        }
    }

    match out.current_podcast(local, url).cloned() {
        None => {
            tracing::info!(url = %url, "Subscribing to podcast added remotely");
            let mut podcast = Podcast::new(url.clone(), url.as_str(), at);
            podcast.mark_from_remote();
            out.podcasts.insert(url.clone(), podcast);
            true
        }
        Some(mut podcast) if podcast.is_tombstoned() => {
            podcast.resubscribe(at);
            podcast.mark_from_remote();
            out.podcasts.insert(url.clone(), podcast);
            true
        }
        Some(_) => false,
    }
}

fn merge_action(
    local: &LocalView,
    out: &mut MergeOutcome,
    action: &EpisodeAction,
    smart_mark: Seconds,
) {
    let Ok(podcast) = FeedUrl::parse(&action.podcast_id) else {
        tracing::warn!(podcast = %action.podcast_id, "Skipping episode action with invalid podcast URL");
        out.stats.skipped += 1;
        return;
    };
    if out.current_podcast(local, &podcast).is_none() {
        tracing::warn!(
            podcast = %podcast,
            episode = %action.episode_guid,
            "Skipping episode action for unknown podcast"
        );
        out.stats.skipped += 1;
        return;
    }
    let Some(key) = EpisodeKey::new(action.episode_guid.trim()) else {
        tracing::warn!(podcast = %podcast, "Skipping episode action without episode id");
        out.stats.skipped += 1;
        return;
    };
    let id = EpisodeId::new(podcast, key);

    let existing = out
        .episodes
        .get(&id)
        .or_else(|| local.episodes.get(&id))
        .cloned();

    let created = existing.is_none();
    let mut episode = match existing {
        Some(episode) => {
            if episode.modified_at().is_some_and(|m| action.timestamp < m) {
                tracing::debug!(
                    episode = %id,
                    action = %action.action,
                    remote = %action.timestamp,
                    "Local episode state is newer, ignoring remote action"
                );
                out.stats.actions_ignored += 1;
                return;
            }
            episode
        }
        None => {
            tracing::debug!(episode = %id, "Creating episode from remote action");
            Episode::new(
                id.podcast.clone(),
                id.key.clone(),
                id.key.as_str(),
                id.key.as_str(),
                action.timestamp,
            )
            .with_guid(id.key.as_str())
        }
    };

    match action.action {
        EpisodeActionKind::Play => episode.record_playback(
            action.position.unwrap_or(Seconds::ZERO),
            action.total,
            smart_mark,
            action.timestamp,
        ),
        EpisodeActionKind::New => episode.set_play_state(PlayState::New, action.timestamp),
        EpisodeActionKind::Delete => {
            if let Some(path) = episode.clear_download(action.timestamp) {
                out.removed_files.push(path);
            }
        }
        EpisodeActionKind::Download => {}
    }

    // A remote download leaves the row as it was, so a pending local change
    // on it must still reach the outbox
    if action.action != EpisodeActionKind::Download {
        episode.mark_from_remote();
        if local.pending_episode_change(&id).is_some() {
            out.overridden_episodes.insert(id.clone());
        }
    } else if created {
        episode.mark_from_remote();
    }
    out.stats.actions_applied += 1;
    out.episodes.insert(id, episode);
}
