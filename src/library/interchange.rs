use std::collections::BTreeMap;
use std::path::Path;

use super::{Library, LibraryError};
use crate::codec::{FeedUrl, Timestamp};
use crate::model::Podcast;
use crate::opml::{self, ImportReport, ParsedDocument};
use crate::storage::WriteBatch;

/// Title written into exported documents.
const EXPORT_TITLE: &str = "podshelf subscriptions";

impl Library {
    /// Import an OPML document.
    ///
    /// New feeds are subscribed, tombstoned ones revived; podcasts that are
    /// already subscribed keep their state and only pick up a missing title
    /// or link. Per-outline problems come back as warnings. A document-level
    /// error aborts before anything is written, and the writes themselves
    /// are one transaction.
    pub async fn import_opml(&self, content: &str) -> Result<ImportReport, LibraryError> {
        let document = opml::parse_document(content)?;
        self.apply_import(document).await
    }

    pub async fn import_opml_file(&self, path: &Path) -> Result<ImportReport, LibraryError> {
        let document = opml::parse_file(path).await?;
        self.apply_import(document).await
    }

    async fn apply_import(&self, document: ParsedDocument) -> Result<ImportReport, LibraryError> {
        let urls: Vec<FeedUrl> = document.entries.iter().map(|e| e.feed_url.clone()).collect();
        let _guards = self.locks.lock_many(urls).await;
        let now = Timestamp::now();

        let mut report = ImportReport {
            warnings: document.warnings,
            ..ImportReport::default()
        };
        let mut writes: BTreeMap<FeedUrl, Podcast> = BTreeMap::new();

        for entry in document.entries {
            let url = entry.feed_url;
            let existing = self.db.get_podcast(&url).await?;
            let (mut podcast, newly_subscribed) = match existing {
                Some(podcast) if podcast.is_subscribed() => (podcast, false),
                Some(mut podcast) => {
                    podcast.resubscribe(now);
                    (podcast, true)
                }
                None => {
                    let title = entry.title.as_deref().unwrap_or(url.as_str());
                    (Podcast::new(url.clone(), title, now), true)
                }
            };

            let before = podcast.clone();
            podcast.adopt_outline_metadata(
                entry.title.as_deref(),
                entry.html_url.as_deref(),
                &entry.extra_attributes,
            );

            if newly_subscribed {
                report.imported.push(url.clone());
            } else {
                report.already_subscribed.push(url.clone());
            }
            if newly_subscribed || podcast != before {
                writes.insert(url, podcast);
            }
        }

        let outcome = self
            .db
            .apply_batch(&WriteBatch {
                podcasts: writes.into_values().collect(),
                ..WriteBatch::default()
            })
            .await?;

        tracing::info!(
            imported = report.imported.len(),
            already_subscribed = report.already_subscribed.len(),
            warnings = report.warnings.len(),
            written = outcome.podcasts_written,
            "OPML import complete"
        );
        for warning in &report.warnings {
            tracing::warn!(warning = %warning, "OPML entry skipped");
        }
        Ok(report)
    }

    /// Export the subscribed podcasts as an OPML 2.0 document.
    pub async fn export_opml(&self) -> Result<String, LibraryError> {
        let podcasts = self.db.list_podcasts(false).await?;
        Ok(opml::export_document(&podcasts, EXPORT_TITLE, Timestamp::now())?)
    }

    /// Export to a file, replacing it atomically.
    pub async fn export_opml_to_file(&self, path: &Path) -> Result<usize, LibraryError> {
        let podcasts = self.db.list_podcasts(false).await?;
        let count = podcasts.len();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            opml::export_to_file(&podcasts, EXPORT_TITLE, Timestamp::now(), &path)
        })
        .await
        .map_err(|e| LibraryError::Io(std::io::Error::other(e)))??;
        Ok(count)
    }
}
