//! Utility functions for common operations.
//!
//! This module provides reusable utilities for:
//!
//! - **URL handling**: feed URL canonicalisation plus security-focused
//!   validation to prevent SSRF when ingesting untrusted subscription lists
//! - **Keyed locks**: per-podcast mutual exclusion
//! - **Download paths**: where the downloader should put an episode
//!
//! # Examples
//!
//! ```
//! use podshelf::util::{canonicalize_feed_url, validate_url};
//!
//! // Two spellings of the same feed
//! let a = canonicalize_feed_url("HTTPS://Example.com/feed/").unwrap();
//! let b = canonicalize_feed_url("https://example.com/feed").unwrap();
//! assert_eq!(a, b);
//!
//! // Untrusted input must not point at the local network
//! assert!(validate_url("http://192.168.0.1/feed").is_err());
//! ```

mod download_path;
mod locks;
mod url_validator;

pub use download_path::{download_destination, episode_file_name, podcast_slug};
pub use locks::{KeyGuard, KeyedLocks};
pub use url_validator::{canonicalize_feed_url, validate_url, UrlValidationError};
