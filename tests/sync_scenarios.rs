//! End-to-end sync cycles against a scripted in-memory service.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use podshelf::codec::{
    DownloadState, EpisodeActionKind, FeedUrl, PlayState, Seconds, SubscriptionAction, Timestamp,
};
use podshelf::library::{Library, LibrarySettings};
use podshelf::model::{Episode, EpisodeId, EpisodeKey};
use podshelf::storage::{Database, SyncCursor};
use podshelf::sync::{
    EpisodeAction, EpisodeActionPull, EpisodeActionPushResponse, RemoteService,
    SubscriptionChange, SubscriptionPull, SubscriptionPushResponse, SyncError, SyncState,
};

// ============================================================================
// Scripted remote
// ============================================================================

#[derive(Default)]
struct FakeRemote {
    subscriptions: Mutex<SubscriptionPull>,
    actions: Mutex<EpisodeActionPull>,
    update_urls: Mutex<Vec<(String, String)>>,
    pushed_subscriptions: Mutex<Vec<SubscriptionChange>>,
    pushed_actions: Mutex<Vec<EpisodeAction>>,
    fail_push: AtomicBool,
    gate: Option<Notify>,
}

impl FakeRemote {
    fn new() -> Self {
        let remote = Self::default();
        remote.subscriptions.lock().unwrap().timestamp = 1000;
        remote.actions.lock().unwrap().timestamp = 1000;
        remote
    }

    /// Pulls block until `release` is called.
    fn gated() -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::new()
        }
    }

    fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    fn serve_subscriptions(&self, changes: Vec<SubscriptionChange>, timestamp: i64) {
        *self.subscriptions.lock().unwrap() = SubscriptionPull {
            changes: changes.into_iter().map(Into::into).collect(),
            timestamp,
        };
    }

    fn serve_actions(&self, actions: Vec<EpisodeAction>, timestamp: i64) {
        *self.actions.lock().unwrap() = EpisodeActionPull {
            actions: actions.into_iter().map(Into::into).collect(),
            timestamp,
        };
    }

    fn pushed_subscriptions(&self) -> Vec<SubscriptionChange> {
        self.pushed_subscriptions.lock().unwrap().clone()
    }

    fn pushed_actions(&self) -> Vec<EpisodeAction> {
        self.pushed_actions.lock().unwrap().clone()
    }

    async fn wait_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    async fn pull_subscriptions(&self, _since: Option<&str>) -> Result<SubscriptionPull, SyncError> {
        self.wait_gate().await;
        Ok(self.subscriptions.lock().unwrap().clone())
    }

    async fn pull_episode_actions(
        &self,
        _since: Option<&str>,
    ) -> Result<EpisodeActionPull, SyncError> {
        Ok(self.actions.lock().unwrap().clone())
    }

    async fn push_subscriptions(
        &self,
        changes: &[SubscriptionChange],
    ) -> Result<SubscriptionPushResponse, SyncError> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(SyncError::Timeout);
        }
        self.pushed_subscriptions
            .lock()
            .unwrap()
            .extend_from_slice(changes);
        Ok(SubscriptionPushResponse {
            timestamp: 1001,
            update_urls: self.update_urls.lock().unwrap().clone(),
        })
    }

    async fn push_episode_actions(
        &self,
        actions: &[EpisodeAction],
    ) -> Result<EpisodeActionPushResponse, SyncError> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(SyncError::Timeout);
        }
        self.pushed_actions.lock().unwrap().extend_from_slice(actions);
        Ok(EpisodeActionPushResponse { timestamp: 1001 })
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn library() -> Library {
    library_with_store().await.0
}

/// A library plus a handle on its store for seeding rows and reading the
/// cursor.
async fn library_with_store() -> (Library, Database) {
    let db = Database::open(":memory:").await.unwrap();
    let lib = Library::new(
        db.clone(),
        LibrarySettings {
            library_dir: PathBuf::from("/lib"),
            refresh_interval: Duration::from_secs(3600),
            smart_mark: Seconds::new(30),
        },
    );
    (lib, db)
}

fn ts(secs: i64) -> Timestamp {
    Timestamp::from_epoch_secs(secs).unwrap()
}

fn url(s: &str) -> FeedUrl {
    FeedUrl::parse(s).unwrap()
}

fn episode_id(feed: &str, key: &str) -> EpisodeId {
    EpisodeId::new(url(feed), EpisodeKey::new(key).unwrap())
}

fn action(feed: &str, guid: &str, kind: EpisodeActionKind, at: i64) -> EpisodeAction {
    EpisodeAction {
        podcast_id: feed.into(),
        episode_guid: guid.into(),
        action: kind,
        position: None,
        started: None,
        total: None,
        timestamp: ts(at),
    }
}

fn subscription(feed: &str, kind: SubscriptionAction, at: i64) -> SubscriptionChange {
    SubscriptionChange {
        feed_url: feed.into(),
        action: kind,
        timestamp: ts(at),
    }
}

async fn sync(lib: &Library, remote: &Arc<FakeRemote>) -> Result<podshelf::sync::SyncReport, SyncError> {
    lib.sync_client(remote.clone()).sync(&CancellationToken::new()).await
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_remote_play_creates_episode_in_progress() {
    let lib = library().await;
    lib.subscribe("https://a.test/feed", Some("A")).await.unwrap();

    let remote = Arc::new(FakeRemote::new());
    let mut play = action("https://a.test/feed", "e1", EpisodeActionKind::Play, 100);
    play.position = Some(Seconds::new(42));
    remote.serve_actions(vec![play], 1000);

    let report = sync(&lib, &remote).await.unwrap();
    assert_eq!(report.merge.actions_applied, 1);

    let e1 = lib
        .episode(&episode_id("https://a.test/feed", "e1"))
        .await
        .unwrap()
        .expect("episode created from remote action");
    assert_eq!(e1.play_state(), PlayState::InProgress);
    assert_eq!(e1.position(), Seconds::new(42));
}

#[tokio::test]
async fn test_stale_remote_action_leaves_download() {
    let (lib, db) = library_with_store().await;
    let podcast = lib.subscribe("https://a.test/feed", Some("A")).await.unwrap();
    let mut e2 = Episode::new(
        podcast.url().clone(),
        EpisodeKey::new("e2").unwrap(),
        "E2",
        "https://a.test/e2.mp3",
        ts(1),
    );
    e2.mark_downloaded(PathBuf::from("/lib/a/e2.mp3"), ts(50));
    db.upsert_episode(&e2).await.unwrap();

    let remote = Arc::new(FakeRemote::new());
    remote.serve_actions(
        vec![action("https://a.test/feed", "e2", EpisodeActionKind::Delete, 10)],
        1000,
    );

    let report = sync(&lib, &remote).await.unwrap();
    assert_eq!(report.merge.actions_ignored, 1);
    assert!(report.removed_files.is_empty());

    let after = lib.episode(&e2.id()).await.unwrap().unwrap();
    assert_eq!(after.download_state(), DownloadState::Downloaded);
    assert_eq!(after.local_path(), Some(PathBuf::from("/lib/a/e2.mp3").as_path()));

    // The newer local state went up instead
    let pushed = remote.pushed_actions();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].action, EpisodeActionKind::Download);
    assert_eq!(pushed[0].timestamp, ts(50));
}

#[tokio::test]
async fn test_newer_remote_delete_reports_file() {
    let (lib, db) = library_with_store().await;
    let podcast = lib.subscribe("https://a.test/feed", Some("A")).await.unwrap();
    let mut e1 = Episode::new(
        podcast.url().clone(),
        EpisodeKey::new("e1").unwrap(),
        "E1",
        "https://a.test/e1.mp3",
        ts(1),
    );
    e1.mark_downloaded(PathBuf::from("/lib/a/e1.mp3"), ts(50));
    db.upsert_episode(&e1).await.unwrap();

    let remote = Arc::new(FakeRemote::new());
    remote.serve_actions(
        vec![action("https://a.test/feed", "e1", EpisodeActionKind::Delete, 60)],
        1000,
    );

    let report = sync(&lib, &remote).await.unwrap();
    assert_eq!(report.removed_files, vec![PathBuf::from("/lib/a/e1.mp3")]);
    let after = lib.episode(&e1.id()).await.unwrap().unwrap();
    assert_eq!(after.download_state(), DownloadState::NotDownloaded);
    assert!(remote.pushed_actions().is_empty(), "overridden local change is not pushed");
}

#[tokio::test]
async fn test_concurrent_sync_rejected() {
    let lib = library().await;
    let remote = Arc::new(FakeRemote::gated());
    let client = lib.sync_client(remote.clone());
    let mut state = client.subscribe();

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.sync(&CancellationToken::new()).await }
    });
    state
        .wait_for(|s| *s == SyncState::Pulling)
        .await
        .unwrap();

    let second = client.sync(&CancellationToken::new()).await;
    assert!(matches!(second, Err(SyncError::InProgress)));

    // A separate client on the same library shares the guard
    let other = lib.sync_client(remote.clone());
    assert!(matches!(
        other.sync(&CancellationToken::new()).await,
        Err(SyncError::InProgress)
    ));

    remote.release();
    first.await.unwrap().unwrap();
    assert_eq!(client.state(), SyncState::Committed);
}

#[tokio::test]
async fn test_failed_push_keeps_cursor_and_store_then_converges() {
    let (lib, db) = library_with_store().await;
    lib.subscribe("https://a.test/feed", Some("A")).await.unwrap();

    let remote = Arc::new(FakeRemote::new());
    let mut play = action("https://a.test/feed", "e1", EpisodeActionKind::Play, 100);
    play.position = Some(Seconds::new(42));
    remote.serve_actions(vec![play], 900);
    remote.serve_subscriptions(vec![], 950);
    remote.fail_push.store(true, Ordering::SeqCst);

    let client = lib.sync_client(remote.clone());
    let err = client.sync(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::Timeout));
    assert!(err.is_retryable());
    assert_eq!(client.state(), SyncState::Failed);
    assert_eq!(db.load_cursor().await.unwrap(), SyncCursor::default());
    assert!(lib
        .episode(&episode_id("https://a.test/feed", "e1"))
        .await
        .unwrap()
        .is_none());

    remote.fail_push.store(false, Ordering::SeqCst);
    let report = client.sync(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.cursor.token.as_deref(), Some("900"));
    assert_eq!(db.load_cursor().await.unwrap(), report.cursor);
    let e1 = lib
        .episode(&episode_id("https://a.test/feed", "e1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(e1.position(), Seconds::new(42));
    assert_eq!(
        remote.pushed_subscriptions(),
        vec![SubscriptionChange {
            feed_url: "https://a.test/feed".into(),
            action: SubscriptionAction::Add,
            timestamp: lib.podcast(&url("https://a.test/feed")).await.unwrap().unwrap().modified_at(),
        }]
    );
}

#[tokio::test]
async fn test_cancelled_before_push_leaves_store_untouched() {
    let (lib, db) = library_with_store().await;
    lib.subscribe("https://a.test/feed", Some("A")).await.unwrap();

    let remote = Arc::new(FakeRemote::new());
    remote.serve_subscriptions(
        vec![subscription("https://b.test/feed", SubscriptionAction::Add, 100)],
        1000,
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = lib.sync_client(remote.clone()).sync(&cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));

    assert!(lib.podcast(&url("https://b.test/feed")).await.unwrap().is_none());
    assert!(remote.pushed_subscriptions().is_empty());
    assert_eq!(db.load_cursor().await.unwrap(), SyncCursor::default());
}

#[tokio::test]
async fn test_cancel_while_pulling() {
    let lib = library().await;
    let remote = Arc::new(FakeRemote::gated());
    let client = lib.sync_client(remote.clone());
    let mut state = client.subscribe();
    let cancel = CancellationToken::new();

    let running = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.sync(&cancel).await }
    });
    state
        .wait_for(|s| *s == SyncState::Pulling)
        .await
        .unwrap();
    cancel.cancel();

    let result = running.await.unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(client.state(), SyncState::Failed);
}

#[tokio::test]
async fn test_tombstone_purged_only_after_acknowledged_push() {
    let lib = library().await;
    let podcast = lib.subscribe("https://a.test/feed", Some("A")).await.unwrap();
    lib.unsubscribe(podcast.url()).await.unwrap();

    let remote = Arc::new(FakeRemote::new());
    remote.fail_push.store(true, Ordering::SeqCst);
    assert!(sync(&lib, &remote).await.is_err());
    assert!(lib.podcast(podcast.url()).await.unwrap().unwrap().is_tombstoned());

    remote.fail_push.store(false, Ordering::SeqCst);
    let report = sync(&lib, &remote).await.unwrap();
    assert_eq!(report.purged, 1);
    assert!(lib.podcast(podcast.url()).await.unwrap().is_none());
    assert_eq!(remote.pushed_subscriptions()[0].action, SubscriptionAction::Remove);
}

#[tokio::test]
async fn test_remote_subscription_changes_applied() {
    let (lib, db) = library_with_store().await;
    lib.subscribe("https://keep.test/feed", Some("Keep")).await.unwrap();
    lib.subscribe("https://drop.test/feed", Some("Drop")).await.unwrap();
    // Past the local changes so the remote sees them as already synced
    db
        .store_cursor(&SyncCursor::new("500", Timestamp::now()))
        .await
        .unwrap();

    let remote = Arc::new(FakeRemote::new());
    remote.serve_subscriptions(
        vec![
            subscription("https://new.test/feed", SubscriptionAction::Add, 100),
            subscription("https://drop.test/feed", SubscriptionAction::Remove, 101),
            subscription("https://never-had.test/feed", SubscriptionAction::Remove, 102),
        ],
        1000,
    );

    let report = sync(&lib, &remote).await.unwrap();
    assert_eq!(report.merge.subscriptions_applied, 2);
    assert_eq!(report.merge.subscriptions_ignored, 1);

    let urls: Vec<String> = lib
        .podcasts(true)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.url().to_string())
        .collect();
    // Ordered by title; the remotely added podcast is titled by its URL
    assert_eq!(urls, vec!["https://new.test/feed", "https://keep.test/feed"]);
}

#[tokio::test]
async fn test_update_urls_rewrites_podcast() {
    let (lib, db) = library_with_store().await;
    let podcast = lib.subscribe("http://a.test/feed", Some("A")).await.unwrap();
    let episode = Episode::new(
        podcast.url().clone(),
        EpisodeKey::new("e1").unwrap(),
        "E1",
        "https://a.test/e1.mp3",
        ts(1),
    );
    db.upsert_episode(&episode).await.unwrap();

    let remote = Arc::new(FakeRemote::new());
    *remote.update_urls.lock().unwrap() =
        vec![("http://a.test/feed".into(), "https://a.test/feed".into())];

    let report = sync(&lib, &remote).await.unwrap();
    assert_eq!(report.renamed, 1);

    assert!(lib.podcast(&url("http://a.test/feed")).await.unwrap().is_none());
    let moved = lib.podcast(&url("https://a.test/feed")).await.unwrap().unwrap();
    assert_eq!(moved.title(), "A");
    let episodes = lib.episodes(moved.url()).await.unwrap();
    assert_eq!(episodes.len(), 1);
    assert_eq!(episodes[0].key().as_str(), "e1");
}

#[tokio::test]
async fn test_local_playback_pushed_with_position() {
    let (lib, db) = library_with_store().await;
    let podcast = lib.subscribe("https://a.test/feed", Some("A")).await.unwrap();
    let episode = Episode::new(
        podcast.url().clone(),
        EpisodeKey::new("e1").unwrap(),
        "E1",
        "https://a.test/e1.mp3",
        ts(1),
    )
    .with_duration(Seconds::new(1800));
    db.upsert_episode(&episode).await.unwrap();
    lib.set_position(&episode.id(), Seconds::new(300)).await.unwrap();

    let remote = Arc::new(FakeRemote::new());
    let report = sync(&lib, &remote).await.unwrap();
    assert_eq!(report.pushed_actions, 1);

    let pushed = remote.pushed_actions();
    assert_eq!(pushed[0].podcast_id, "https://a.test/feed");
    assert_eq!(pushed[0].episode_guid, "e1");
    assert_eq!(pushed[0].action, EpisodeActionKind::Play);
    assert_eq!(pushed[0].position, Some(Seconds::new(300)));
    assert_eq!(pushed[0].total, Some(Seconds::new(1800)));
}

#[tokio::test]
async fn test_cursor_never_moves_backwards() {
    let (lib, db) = library_with_store().await;
    let remote = Arc::new(FakeRemote::new());

    let first = sync(&lib, &remote).await.unwrap();
    let second = sync(&lib, &remote).await.unwrap();
    assert!(second.cursor.watermark >= first.cursor.watermark);

    let stored = db.load_cursor().await.unwrap();
    assert_eq!(stored.watermark, second.cursor.watermark);
}

#[tokio::test]
async fn test_remotely_added_podcasts_survive_export_and_import() {
    let lib = library().await;
    let remote = Arc::new(FakeRemote::new());
    remote.serve_subscriptions(
        vec![
            subscription("https://a.test/feed", SubscriptionAction::Add, 100),
            subscription("http://192.168.1.10/feed", SubscriptionAction::Add, 101),
        ],
        1000,
    );

    let report = sync(&lib, &remote).await.unwrap();
    assert_eq!(report.merge.subscriptions_applied, 1);
    assert_eq!(report.merge.skipped, 1);

    let exported = lib.export_opml().await.unwrap();
    let other = library().await;
    let imported = other.import_opml(&exported).await.unwrap();
    assert!(imported.warnings.is_empty());

    let before: BTreeSet<FeedUrl> = lib
        .podcasts(false)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.url().clone())
        .collect();
    let after: BTreeSet<FeedUrl> = other
        .podcasts(false)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.url().clone())
        .collect();
    assert_eq!(before, after);
    assert_eq!(after.into_iter().collect::<Vec<_>>(), vec![url("https://a.test/feed")]);
}

#[tokio::test]
async fn test_remote_state_not_pushed_back() {
    let lib = library().await;
    lib.subscribe("https://a.test/feed", Some("A")).await.unwrap();

    // Stamped after the cycle starts, so above the next watermark
    let remote = Arc::new(FakeRemote::new());
    let later = Timestamp::now().as_epoch_secs() + 30;
    let mut play = action("https://a.test/feed", "e1", EpisodeActionKind::Play, later);
    play.position = Some(Seconds::new(42));
    remote.serve_actions(vec![play], 1000);

    sync(&lib, &remote).await.unwrap();
    let report = sync(&lib, &remote).await.unwrap();
    assert_eq!(report.pushed_actions, 0);
    assert!(remote.pushed_actions().is_empty());

    // A local change to the same episode goes up again
    remote.serve_actions(vec![], 1000);
    let id = episode_id("https://a.test/feed", "e1");
    lib.set_position(&id, Seconds::new(100)).await.unwrap();
    let report = sync(&lib, &remote).await.unwrap();
    assert_eq!(report.pushed_actions, 1);
    assert_eq!(remote.pushed_actions()[0].position, Some(Seconds::new(100)));
}
