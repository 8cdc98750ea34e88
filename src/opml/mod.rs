//! OPML subscription list import and export.
//!
//! Import is split in two: [`parse_document`] turns a document into feed
//! entries plus per-entry warnings without touching the catalog, and
//! [`Library::import_opml`](crate::library::Library::import_opml) applies
//! the entries. Export writes OPML 2.0.
//!
//! # Security
//!
//! - XXE is mitigated because `quick-xml` (0.37) does not parse `<!ENTITY>`
//!   declarations; custom entity references fail to unescape.
//! - Imported feed URLs go through [`validate_url`](crate::util::validate_url),
//!   so a list cannot subscribe the library to localhost or private networks.
//! - Outline nesting is capped at [`MAX_OPML_DEPTH`].

mod export;
mod parse;

use thiserror::Error;

use crate::codec::FeedUrl;
use crate::util::UrlValidationError;

pub use export::{export_document, export_to_file, ExportError};
pub use parse::{parse_document, parse_file};

/// Maximum allowed nesting depth for outline elements.
pub const MAX_OPML_DEPTH: usize = 50;

/// Document-level failure; the import is aborted and nothing is written.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The XML itself is malformed.
    #[error("XML parse error at byte {position}: {message}")]
    Xml { position: u64, message: String },

    /// The first element is not `<opml>`, or there is no element at all.
    #[error("Document has no <opml> root element")]
    MissingRoot,

    /// The document ends with elements still open.
    #[error("Document is truncated: <{0}> is never closed")]
    Truncated(String),

    /// Outline nesting exceeds [`MAX_OPML_DEPTH`].
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// File I/O error.
    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single outline was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WarningReason {
    #[error("outline has no xmlUrl")]
    MissingFeedUrl,

    #[error("feed URL '{url}' rejected: {error}")]
    InvalidFeedUrl {
        url: String,
        error: UrlValidationError,
    },
}

/// A per-entry problem. Collected; the import carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("outline #{index}: {reason}")]
pub struct ImportWarning {
    /// Position of the outline among all `<outline>` elements, from 0.
    pub index: usize,
    pub title: Option<String>,
    pub reason: WarningReason,
}

/// A feed subscription found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineEntry {
    pub index: usize,
    pub feed_url: FeedUrl,
    /// `title`, falling back to `text`.
    pub title: Option<String>,
    pub html_url: Option<String>,
    /// Attributes other than `type`, `text`, `title`, `xmlUrl` and `htmlUrl`.
    pub extra_attributes: Vec<(String, String)>,
}

/// Result of [`parse_document`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDocument {
    /// `<head><title>`, if present.
    pub title: Option<String>,
    /// Entries in document order, duplicates removed.
    pub entries: Vec<OutlineEntry>,
    pub warnings: Vec<ImportWarning>,
}

/// Outcome of applying a document to the library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Feeds that are subscribed after the import and were not before.
    pub imported: Vec<FeedUrl>,
    /// Feeds that were already subscribed.
    pub already_subscribed: Vec<FeedUrl>,
    pub warnings: Vec<ImportWarning>,
}
