use std::time::Duration;

use crate::codec::{FeedUrl, Timestamp};

/// Lifecycle of a subscription.
///
/// Unsubscribing leaves a tombstone so the removal can be pushed to the sync
/// service; the row is purged once the service has acknowledged it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodcastState {
    Subscribed,
    Tombstoned { at: Timestamp },
}

/// A subscribed (or tombstoned) podcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Podcast {
    pub(crate) url: FeedUrl,
    pub(crate) title: String,
    pub(crate) description: Option<String>,
    pub(crate) image_url: Option<String>,
    pub(crate) link: Option<String>,
    pub(crate) last_refreshed: Option<Timestamp>,
    pub(crate) subscribed_at: Timestamp,
    pub(crate) modified_at: Timestamp,
    pub(crate) state: PodcastState,
    /// OPML outline attributes the library does not interpret, kept so an
    /// export after an import reproduces them.
    pub(crate) extra_attributes: Vec<(String, String)>,
    /// The subscription state was last set by the sync service.
    pub(crate) from_remote: bool,
}

impl Podcast {
    /// A new subscription created at `at`.
    pub fn new(url: FeedUrl, title: impl Into<String>, at: Timestamp) -> Self {
        Self {
            url,
            title: title.into(),
            description: None,
            image_url: None,
            link: None,
            last_refreshed: None,
            subscribed_at: at,
            modified_at: at,
            state: PodcastState::Subscribed,
            extra_attributes: Vec::new(),
            from_remote: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_image_url(mut self, image_url: impl Into<String>) -> Self {
        self.image_url = Some(image_url.into());
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_extra_attributes(mut self, attributes: Vec<(String, String)>) -> Self {
        self.extra_attributes = attributes;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn url(&self) -> &FeedUrl {
        &self.url
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn last_refreshed(&self) -> Option<Timestamp> {
        self.last_refreshed
    }

    pub fn subscribed_at(&self) -> Timestamp {
        self.subscribed_at
    }

    /// Time of the last locally initiated subscription change (subscribe,
    /// resubscribe or unsubscribe).
    pub fn modified_at(&self) -> Timestamp {
        self.modified_at
    }

    pub fn state(&self) -> PodcastState {
        self.state
    }

    pub fn is_subscribed(&self) -> bool {
        self.state == PodcastState::Subscribed
    }

    pub fn is_tombstoned(&self) -> bool {
        matches!(self.state, PodcastState::Tombstoned { .. })
    }

    pub fn extra_attributes(&self) -> &[(String, String)] {
        &self.extra_attributes
    }

    /// Whether the feed should be refreshed: never refreshed, or last
    /// refreshed at least `refresh_interval` before `now`.
    pub fn is_stale(&self, now: Timestamp, refresh_interval: Duration) -> bool {
        match self.last_refreshed {
            None => true,
            Some(refreshed) => now.duration_since(refreshed) >= refresh_interval,
        }
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    /// Tombstone the subscription. Returns `false` if it already was.
    pub fn unsubscribe(&mut self, at: Timestamp) -> bool {
        if self.is_tombstoned() {
            return false;
        }
        self.state = PodcastState::Tombstoned { at };
        self.modified_at = at;
        self.from_remote = false;
        true
    }

    /// Revive a tombstoned subscription. Returns `false` if it was active.
    pub fn resubscribe(&mut self, at: Timestamp) -> bool {
        if self.is_subscribed() {
            return false;
        }
        self.state = PodcastState::Subscribed;
        self.subscribed_at = at;
        self.modified_at = at;
        self.from_remote = false;
        true
    }

    /// Apply metadata from a feed refresh. Not a sync-relevant change.
    pub fn refresh_metadata(
        &mut self,
        title: &str,
        description: Option<&str>,
        image_url: Option<&str>,
        link: Option<&str>,
        refreshed_at: Timestamp,
    ) {
        if !title.trim().is_empty() {
            self.title = title.trim().to_owned();
        }
        if let Some(description) = description {
            self.description = Some(description.to_owned());
        }
        if let Some(image_url) = image_url {
            self.image_url = Some(image_url.to_owned());
        }
        if let Some(link) = link {
            self.link = Some(link.to_owned());
        }
        self.last_refreshed = Some(refreshed_at);
    }

    /// Fill in a title and link learned from an imported outline without
    /// overwriting what the feed already told us.
    pub(crate) fn adopt_outline_metadata(
        &mut self,
        title: Option<&str>,
        link: Option<&str>,
        extra: &[(String, String)],
    ) {
        if let Some(title) = title.filter(|t| !t.trim().is_empty()) {
            if self.title.trim().is_empty() || self.title == self.url.as_str() {
                self.title = title.trim().to_owned();
            }
        }
        if self.link.is_none() {
            self.link = link.map(str::to_owned);
        }
        for (key, value) in extra {
            match self.extra_attributes.iter_mut().find(|(k, _)| k == key) {
                Some(existing) => existing.1 = value.clone(),
                None => self.extra_attributes.push((key.clone(), value.clone())),
            }
        }
    }

    /// Flag the subscription state as received from the sync service.
    /// Unsubscribing or resubscribing locally clears the flag.
    pub(crate) fn mark_from_remote(&mut self) {
        self.from_remote = true;
    }

    pub(crate) fn from_remote(&self) -> bool {
        self.from_remote
    }

    /// Rewrite the identity after the sync service reported a new canonical
    /// URL for this feed.
    pub(crate) fn with_url(mut self, url: FeedUrl) -> Self {
        self.url = url;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_epoch_secs(secs).unwrap()
    }

    fn podcast() -> Podcast {
        Podcast::new(FeedUrl::parse("https://a.test/feed").unwrap(), "A", ts(10))
    }

    #[test]
    fn test_new_podcast_is_subscribed() {
        let p = podcast();
        assert!(p.is_subscribed());
        assert_eq!(p.subscribed_at(), ts(10));
        assert_eq!(p.modified_at(), ts(10));
    }

    #[test]
    fn test_unsubscribe_tombstones_and_bumps() {
        let mut p = podcast();
        assert!(p.unsubscribe(ts(20)));
        assert_eq!(p.state(), PodcastState::Tombstoned { at: ts(20) });
        assert_eq!(p.modified_at(), ts(20));
        assert!(!p.unsubscribe(ts(30)), "second unsubscribe is a no-op");
        assert_eq!(p.modified_at(), ts(20));
    }

    #[test]
    fn test_resubscribe_revives_tombstone() {
        let mut p = podcast();
        p.unsubscribe(ts(20));
        assert!(p.resubscribe(ts(30)));
        assert!(p.is_subscribed());
        assert_eq!(p.subscribed_at(), ts(30));
        assert!(!p.resubscribe(ts(40)));
    }

    #[test]
    fn test_local_subscription_change_clears_remote_flag() {
        let mut p = podcast();
        p.mark_from_remote();
        p.unsubscribe(ts(20));
        assert!(!p.from_remote());
        p.mark_from_remote();
        p.resubscribe(ts(30));
        assert!(!p.from_remote());
    }

    #[test]
    fn test_refresh_metadata_does_not_bump_modification() {
        let mut p = podcast();
        p.refresh_metadata("New title", Some("desc"), None, None, ts(99));
        assert_eq!(p.title(), "New title");
        assert_eq!(p.last_refreshed(), Some(ts(99)));
        assert_eq!(p.modified_at(), ts(10));
    }

    #[test]
    fn test_is_stale() {
        let mut p = podcast();
        let hour = Duration::from_secs(3600);
        assert!(p.is_stale(ts(0), hour), "never refreshed is stale");

        p.refresh_metadata("A", None, None, None, ts(1000));
        assert!(!p.is_stale(ts(1000 + 3599), hour));
        assert!(p.is_stale(ts(1000 + 3600), hour));
        assert!(!p.is_stale(ts(500), hour), "clock behind refresh is fresh");
    }

    #[test]
    fn test_adopt_outline_metadata_keeps_feed_title() {
        let mut p = podcast();
        p.adopt_outline_metadata(
            Some("From OPML"),
            Some("https://a.test"),
            &[("category".into(), "news".into())],
        );
        assert_eq!(p.title(), "A");
        assert_eq!(p.link(), Some("https://a.test"));
        assert_eq!(p.extra_attributes(), &[("category".to_string(), "news".to_string())]);

        let mut untitled = Podcast::new(FeedUrl::parse("https://b.test/rss").unwrap(), "", ts(1));
        untitled.adopt_outline_metadata(Some("B"), None, &[]);
        assert_eq!(untitled.title(), "B");
    }
}
