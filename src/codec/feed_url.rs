use std::fmt;
use std::str::FromStr;

use super::{DecodeError, FieldCodec};
use crate::util::{canonicalize_feed_url, validate_url, UrlValidationError};

/// The identity of a podcast: its subscription feed URL in canonical form.
///
/// Equality, ordering and hashing all operate on the canonical string, so
/// `HTTPS://A.test/feed/` and `https://a.test/feed` are the same podcast.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedUrl(String);

impl FeedUrl {
    pub fn parse(input: &str) -> Result<Self, UrlValidationError> {
        canonicalize_feed_url(input).map(|url| Self(url.into()))
    }

    /// Parse a URL arriving from outside the library (user input, OPML,
    /// the sync service). Private and loopback hosts are rejected on top of
    /// [`FeedUrl::parse`], so every stored feed survives an export and
    /// re-import.
    pub fn parse_untrusted(input: &str) -> Result<Self, UrlValidationError> {
        validate_url(input).map(|url| Self(url.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl FromStr for FeedUrl {
    type Err = UrlValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FeedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FeedUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Feed URLs as their canonical string.
pub struct FeedUrlCodec;

impl FieldCodec for FeedUrlCodec {
    type Value = FeedUrl;
    type Scalar = String;

    fn encode(value: &FeedUrl) -> String {
        value.0.clone()
    }

    fn decode(scalar: &String) -> Result<FeedUrl, DecodeError> {
        FeedUrl::parse(scalar).map_err(|e| DecodeError::Malformed {
            field: "feed_url",
            value: scalar.clone(),
            reason: e.to_string(),
        })
    }
}

serde_via_codec!(FeedUrl, FeedUrlCodec, String);
