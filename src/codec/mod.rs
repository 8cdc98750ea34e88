//! Field codecs: typed conversions between domain values and the scalars
//! stored in SQLite and sent over the sync protocol.
//!
//! Every codec is a stateless unit struct implementing [`FieldCodec`].
//! The same codec backs the `sqlx` bindings in [`crate::storage`] and the
//! `serde` impls used by [`crate::sync`], so a value always has exactly one
//! serialized form:
//!
//! | Domain value | Scalar |
//! |---|---|
//! | [`Timestamp`] | integer seconds since the Unix epoch |
//! | [`Seconds`] | non-negative integer seconds |
//! | [`PlayState`] | `new`, `in_progress`, `played` |
//! | [`DownloadState`] | `not_downloaded`, `downloading`, `downloaded`, `failed` |
//! | [`EpisodeActionKind`] | `play`, `download`, `delete`, `new` |
//! | [`SubscriptionAction`] | `add`, `remove` |
//! | [`FeedUrl`] | canonical URL string |
//!
//! Codecs obey the round-trip law `decode(encode(x)) == x` and `encode`
//! is infallible for every value the domain type can hold.

use thiserror::Error;

/// Errors produced when a persisted or wire scalar cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Numeric scalar outside the domain's valid range.
    #[error("{field}: value {value} is out of range")]
    OutOfRange { field: &'static str, value: i64 },

    /// String token that names no variant of the enumeration.
    #[error("{field}: unknown token '{token}'")]
    UnknownToken { field: &'static str, token: String },

    /// Required scalar absent or null.
    #[error("{field}: missing")]
    Missing { field: &'static str },

    /// String scalar that could not be parsed at all.
    #[error("{field}: malformed value '{value}': {reason}")]
    Malformed {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// A stateless mapping between a domain value and its serialized scalar.
pub trait FieldCodec {
    /// The domain type.
    type Value;
    /// The persisted / wire representation.
    type Scalar;

    /// Encode a domain value. Never fails.
    fn encode(value: &Self::Value) -> Self::Scalar;

    /// Decode a scalar, rejecting malformed or out-of-range input.
    fn decode(scalar: &Self::Scalar) -> Result<Self::Value, DecodeError>;
}

/// Implements `Serialize`/`Deserialize` for a domain type by delegating to
/// its codec, so the wire format can never drift from the stored one.
macro_rules! serde_via_codec {
    ($ty:ty, $codec:ty, $scalar:ty) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let scalar = <$codec as $crate::codec::FieldCodec>::encode(self);
                serde::Serialize::serialize(&scalar, serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let scalar = <$scalar as serde::Deserialize>::deserialize(deserializer)?;
                <$codec as $crate::codec::FieldCodec>::decode(&scalar)
                    .map_err(serde::de::Error::custom)
            }
        }
    };
}

mod feed_url;
mod state;
mod time;

pub use feed_url::{FeedUrl, FeedUrlCodec};
pub use state::{
    DownloadState, DownloadStateCodec, EpisodeActionKind, EpisodeActionKindCodec, PlayState,
    PlayStateCodec, SubscriptionAction, SubscriptionActionCodec,
};
pub use time::{Seconds, SecondsCodec, Timestamp, TimestampCodec};
