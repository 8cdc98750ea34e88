use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::error::SyncError;
use super::merge::{merge, LocalView, MergeOutcome, MergeStats};
use super::remote::RemoteService;
use super::wire::{EpisodeAction, EpisodeActionPull, SubscriptionChange, SubscriptionPull};
use crate::codec::{EpisodeActionKind, FeedUrl, Seconds, SubscriptionAction, Timestamp};
use crate::model::{Episode, EpisodeId, Podcast, PodcastState};
use crate::storage::{Change, ChangeKind, ChangedEntity, Database, SyncCursor, WriteBatch};
use crate::util::KeyedLocks;

/// Phase of the current (or last) sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Pulling,
    Merging,
    Pushing,
    Committed,
    Failed,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncState::Committed | SyncState::Failed)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncState::Idle => "idle",
            SyncState::Pulling => "pulling",
            SyncState::Merging => "merging",
            SyncState::Pushing => "pushing",
            SyncState::Committed => "committed",
            SyncState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a committed cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pulled_subscriptions: usize,
    pub pulled_actions: usize,
    pub pushed_subscriptions: usize,
    pub pushed_actions: usize,
    pub merge: MergeStats,
    pub podcasts_written: usize,
    pub episodes_written: usize,
    pub purged: usize,
    pub renamed: usize,
    /// Downloaded files the remote asked to delete. The library forgets
    /// them; removing the files is up to the caller.
    pub removed_files: Vec<PathBuf>,
    pub cursor: SyncCursor,
}

/// Local changes captured at cycle start, as they will be pushed.
#[derive(Debug, Default)]
struct Outbox {
    subscriptions: Vec<SubscriptionChange>,
    actions: Vec<EpisodeAction>,
    /// Tombstones being pushed, with the tombstone time they had.
    tombstones: Vec<(FeedUrl, Timestamp)>,
}

impl Outbox {
    fn from_changes(changes: Vec<Change>, merged: &MergeOutcome) -> Self {
        let mut outbox = Outbox::default();
        for change in changes {
            match change.entity {
                ChangedEntity::Podcast(podcast) => {
                    if merged.overridden_podcasts.contains(podcast.url()) {
                        continue;
                    }
                    outbox.push_podcast(&podcast, change.kind);
                }
                ChangedEntity::Episode(episode) => {
                    if merged.overridden_episodes.contains(&episode.id()) {
                        continue;
                    }
                    if let Some(action) = episode_action(&episode) {
                        outbox.actions.push(action);
                    }
                }
            }
        }
        outbox
    }

    fn push_podcast(&mut self, podcast: &Podcast, kind: ChangeKind) {
        let action = match (kind, podcast.state()) {
            (ChangeKind::Tombstoned, PodcastState::Tombstoned { at }) => {
                self.tombstones.push((podcast.url().clone(), at));
                SubscriptionAction::Remove
            }
            (_, PodcastState::Subscribed) => SubscriptionAction::Add,
            (_, PodcastState::Tombstoned { .. }) => return,
        };
        self.subscriptions.push(SubscriptionChange {
            feed_url: podcast.url().to_string(),
            action,
            timestamp: podcast.modified_at(),
        });
    }
}

/// The action the service should record for a locally changed episode.
fn episode_action(episode: &Episode) -> Option<EpisodeAction> {
    let action = episode.last_action()?;
    let timestamp = episode.modified_at()?;
    let position = match action {
        EpisodeActionKind::Play => Some(episode.position()),
        _ => None,
    };
    Some(EpisodeAction {
        podcast_id: episode.podcast().to_string(),
        episode_guid: episode.key().to_string(),
        action,
        position,
        started: None,
        total: episode.duration(),
        timestamp,
    })
}

/// Runs sync cycles against one [`RemoteService`].
///
/// Cheap to clone; clones share the guard, so at most one cycle runs per
/// library no matter which clone starts it.
#[derive(Clone)]
pub struct SyncClient {
    db: Database,
    locks: Arc<KeyedLocks<FeedUrl>>,
    remote: Arc<dyn RemoteService>,
    guard: Arc<Mutex<()>>,
    state: Arc<watch::Sender<SyncState>>,
    smart_mark: Seconds,
}

impl SyncClient {
    pub fn new(
        db: Database,
        locks: Arc<KeyedLocks<FeedUrl>>,
        remote: Arc<dyn RemoteService>,
        guard: Arc<Mutex<()>>,
        smart_mark: Seconds,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            db,
            locks,
            remote,
            guard,
            state: Arc::new(state),
            smart_mark,
        }
    }

    /// Observe phase changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SyncState) {
        let previous = self.state.send_replace(next);
        tracing::debug!(from = %previous, to = %next, "Sync state changed");
    }

    /// Run one sync cycle.
    ///
    /// Fails with [`SyncError::InProgress`] at once if a cycle is already
    /// running. Cancellation is honoured until the push starts. On any
    /// error the store and the cursor are left untouched.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<SyncReport, SyncError> {
        let _running = match self.guard.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::info!("Sync requested while another cycle is running");
                return Err(SyncError::InProgress);
            }
        };

        let result = self.run_cycle(cancel).await;
        match &result {
            Ok(report) => {
                self.set_state(SyncState::Committed);
                tracing::info!(
                    pulled_subscriptions = report.pulled_subscriptions,
                    pulled_actions = report.pulled_actions,
                    pushed_subscriptions = report.pushed_subscriptions,
                    pushed_actions = report.pushed_actions,
                    podcasts = report.podcasts_written,
                    episodes = report.episodes_written,
                    purged = report.purged,
                    "Sync committed"
                );
            }
            Err(e) => {
                self.set_state(SyncState::Failed);
                tracing::warn!(error = %e, retryable = e.is_retryable(), "Sync failed");
            }
        }
        result
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<SyncReport, SyncError> {
        let started = Timestamp::now();
        let cursor = self.db.load_cursor().await?;
        let changes = self.db.changes_since(&cursor).await?;

        // Pulling
        self.set_state(SyncState::Pulling);
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let since = cursor.token.as_deref();
        let pulls = async {
            tokio::try_join!(
                self.remote.pull_subscriptions(since),
                self.remote.pull_episode_actions(since)
            )
        };
        let (subscriptions, actions): (SubscriptionPull, EpisodeActionPull) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            pulled = pulls => pulled?,
        };
        let pulled_subscriptions = subscriptions.changes.len();
        let pulled_actions = actions.actions.len();
        // Entries without a usable identity or timestamp are dropped one by
        // one so a single bad entry cannot stall the cursor
        let (sub_changes, bad_subscriptions) = subscriptions.decode_changes();
        let (remote_actions, bad_actions) = actions.decode_actions();
        tracing::debug!(
            subscriptions = pulled_subscriptions,
            actions = pulled_actions,
            rejected = bad_subscriptions + bad_actions,
            "Pulled remote changes"
        );

        // Merging
        self.set_state(SyncState::Merging);
        let view = self.load_view(cursor.clone(), &remote_actions).await?;
        let planned = merge(&view, &sub_changes, &remote_actions, self.smart_mark);
        let outbox = Outbox::from_changes(changes, &planned);

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // Pushing: runs to completion or failure once started
        self.set_state(SyncState::Pushing);
        let mut renames = Vec::new();
        if !outbox.subscriptions.is_empty() {
            let response = self.remote.push_subscriptions(&outbox.subscriptions).await?;
            renames = parse_renames(&response.update_urls);
        }
        if !outbox.actions.is_empty() {
            self.remote.push_episode_actions(&outbox.actions).await?;
        }

        // Commit under the locks of every podcast the batch touches
        let mut touched = planned.touched_podcasts();
        touched.extend(outbox.tombstones.iter().map(|(url, _)| url.clone()));
        for (from, to) in &renames {
            touched.insert(from.clone());
            touched.insert(to.clone());
        }
        let _locks = self.locks.lock_many(touched).await;

        let fresh_view = self.load_view(cursor, &remote_actions).await?;
        let mut merged = merge(&fresh_view, &sub_changes, &remote_actions, self.smart_mark);
        merged.stats.skipped += bad_subscriptions + bad_actions;

        let new_cursor = SyncCursor::new(
            subscriptions.timestamp.min(actions.timestamp).to_string(),
            started.saturating_sub_secs(1),
        );
        let batch = build_batch(&merged, &fresh_view, &outbox.tombstones, renames, new_cursor.clone());
        let outcome = self.db.apply_batch(&batch).await?;

        Ok(SyncReport {
            pulled_subscriptions,
            pulled_actions,
            pushed_subscriptions: outbox.subscriptions.len(),
            pushed_actions: outbox.actions.len(),
            merge: merged.stats,
            podcasts_written: outcome.podcasts_written,
            episodes_written: outcome.episodes_written,
            purged: outcome.purged,
            renamed: outcome.renamed,
            removed_files: merged.removed_files,
            cursor: new_cursor,
        })
    }

    /// Every podcast, plus the episodes of the podcasts the actions name.
    async fn load_view(
        &self,
        cursor: SyncCursor,
        actions: &[EpisodeAction],
    ) -> Result<LocalView, SyncError> {
        let podcasts: BTreeMap<FeedUrl, Podcast> = self
            .db
            .list_podcasts(true)
            .await?
            .into_iter()
            .map(|p| (p.url().clone(), p))
            .collect();

        let wanted: BTreeSet<FeedUrl> = actions
            .iter()
            .filter_map(|a| FeedUrl::parse(&a.podcast_id).ok())
            .filter(|url| podcasts.contains_key(url))
            .collect();

        let mut episodes: BTreeMap<EpisodeId, Episode> = BTreeMap::new();
        for url in &wanted {
            for episode in self.db.list_episodes(url).await? {
                episodes.insert(episode.id(), episode);
            }
        }

        Ok(LocalView {
            cursor,
            podcasts,
            episodes,
        })
    }
}

fn parse_renames(update_urls: &[(String, String)]) -> Vec<(FeedUrl, FeedUrl)> {
    update_urls
        .iter()
        .filter_map(|(old, new)| match (FeedUrl::parse(old), FeedUrl::parse_untrusted(new)) {
            (Ok(old), Ok(new)) if old != new => Some((old, new)),
            (Ok(_), Ok(_)) => None,
            _ => {
                tracing::warn!(old = %old, new = %new, "Ignoring invalid URL rewrite from sync service");
                None
            }
        })
        .collect()
}

/// Assemble the commit: server URL rewrites, merged entities (under their
/// rewritten URLs), remote removals and acknowledged tombstones, cursor.
fn build_batch(
    merged: &MergeOutcome,
    fresh: &LocalView,
    tombstones: &[(FeedUrl, Timestamp)],
    renames: Vec<(FeedUrl, FeedUrl)>,
    cursor: SyncCursor,
) -> WriteBatch {
    let rename_map: BTreeMap<&FeedUrl, &FeedUrl> =
        renames.iter().map(|(from, to)| (from, to)).collect();
    let renamed = |url: &FeedUrl| -> FeedUrl { (*rename_map.get(url).unwrap_or(&url)).clone() };

    let podcasts = merged
        .podcasts
        .values()
        .map(|p| {
            let url = renamed(p.url());
            p.clone().with_url(url)
        })
        .collect();

    let episodes = merged
        .episodes
        .values()
        .map(|e| {
            let url = renamed(e.podcast());
            e.clone().with_podcast(url)
        })
        .collect();

    let mut purges: BTreeSet<FeedUrl> = merged.purges.iter().map(&renamed).collect();
    for (url, pushed_at) in tombstones {
        // Resubscribed during the cycle: the tombstone is no longer current
        let still_tombstoned = fresh.podcasts.get(url).is_some_and(|p| {
            p.state() == PodcastState::Tombstoned { at: *pushed_at }
        });
        if still_tombstoned && !merged.podcasts.contains_key(url) {
            purges.insert(renamed(url));
        }
    }

    WriteBatch {
        renames,
        podcasts,
        episodes,
        purges: purges.into_iter().collect(),
        cursor: Some(cursor),
    }
}
