//! JSON bodies of the sync protocol.
//!
//! Outgoing entries serialize their timestamps, positions and action tokens
//! through the field codecs. Pulled entries are kept as raw JSON scalars and
//! decoded one field at a time ([`RawSubscriptionChange::decode`],
//! [`RawEpisodeAction::decode`]): a bad position or total is dropped on its
//! own, and only an entry without a usable identity, action or timestamp is
//! rejected. One bad entry never rejects the whole response. Feed URLs and
//! GUIDs stay plain strings; the merge validates them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{
    DecodeError, EpisodeActionKind, EpisodeActionKindCodec, FieldCodec, Seconds, SecondsCodec,
    SubscriptionAction, SubscriptionActionCodec, Timestamp, TimestampCodec,
};

/// One subscription add/remove, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChange {
    pub feed_url: String,
    pub action: SubscriptionAction,
    pub timestamp: Timestamp,
}

/// A pulled subscription change before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSubscriptionChange {
    pub feed_url: Option<Value>,
    pub action: Option<Value>,
    pub timestamp: Option<Value>,
}

impl RawSubscriptionChange {
    /// Every field is required; any failure rejects this entry only.
    pub fn decode(&self) -> Result<SubscriptionChange, DecodeError> {
        Ok(SubscriptionChange {
            feed_url: string_field("feed_url", self.feed_url.as_ref())?,
            action: SubscriptionActionCodec::decode(&string_field("action", self.action.as_ref())?)?,
            timestamp: TimestampCodec::decode(&int_field("timestamp", self.timestamp.as_ref())?)?,
        })
    }
}

impl From<SubscriptionChange> for RawSubscriptionChange {
    fn from(change: SubscriptionChange) -> Self {
        Self {
            feed_url: Some(Value::from(change.feed_url)),
            action: Some(Value::from(SubscriptionActionCodec::encode(&change.action))),
            timestamp: Some(Value::from(TimestampCodec::encode(&change.timestamp))),
        }
    }
}

/// `GET subscriptions` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPull {
    #[serde(default)]
    pub changes: Vec<RawSubscriptionChange>,
    pub timestamp: i64,
}

impl SubscriptionPull {
    /// Decode every entry, returning the usable ones and how many were
    /// rejected.
    pub fn decode_changes(&self) -> (Vec<SubscriptionChange>, usize) {
        decode_entries("subscription change", &self.changes, RawSubscriptionChange::decode)
    }
}

/// `POST subscriptions` request body.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct SubscriptionPush<'a> {
    pub changes: &'a [SubscriptionChange],
}

/// `POST subscriptions` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPushResponse {
    pub timestamp: i64,
    /// `[old, new]` pairs: the service's canonical form of pushed URLs.
    #[serde(default)]
    pub update_urls: Vec<(String, String)>,
}

/// One episode action, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeAction {
    /// Feed URL of the podcast.
    pub podcast_id: String,
    /// Episode key: the feed GUID, or the enclosure URL.
    pub episode_guid: String,
    pub action: EpisodeActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Seconds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<Seconds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Seconds>,
    pub timestamp: Timestamp,
}

/// A pulled episode action before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEpisodeAction {
    pub podcast_id: Option<Value>,
    pub episode_guid: Option<Value>,
    pub action: Option<Value>,
    pub position: Option<Value>,
    pub started: Option<Value>,
    pub total: Option<Value>,
    pub timestamp: Option<Value>,
}

impl RawEpisodeAction {
    /// Identity, action and timestamp are required. A malformed position,
    /// start or total is logged and treated as absent.
    pub fn decode(&self) -> Result<EpisodeAction, DecodeError> {
        let podcast_id = string_field("podcast_id", self.podcast_id.as_ref())?;
        let episode_guid = string_field("episode_guid", self.episode_guid.as_ref())?;
        let action = EpisodeActionKindCodec::decode(&string_field("action", self.action.as_ref())?)?;
        let timestamp = TimestampCodec::decode(&int_field("timestamp", self.timestamp.as_ref())?)?;

        let seconds = |field: &'static str, value: Option<&Value>| -> Option<Seconds> {
            let value = value.filter(|v| !v.is_null())?;
            match int_field(field, Some(value)).and_then(|n| SecondsCodec::decode(&n)) {
                Ok(seconds) => Some(seconds),
                Err(error) => {
                    tracing::warn!(
                        podcast = %podcast_id,
                        episode = %episode_guid,
                        error = %error,
                        "Ignoring malformed field in episode action"
                    );
                    None
                }
            }
        };

        Ok(EpisodeAction {
            position: seconds("position", self.position.as_ref()),
            started: seconds("started", self.started.as_ref()),
            total: seconds("total", self.total.as_ref()),
            podcast_id,
            episode_guid,
            action,
            timestamp,
        })
    }
}

impl From<EpisodeAction> for RawEpisodeAction {
    fn from(action: EpisodeAction) -> Self {
        let seconds = |s: Option<Seconds>| s.map(|s| Value::from(SecondsCodec::encode(&s)));
        Self {
            podcast_id: Some(Value::from(action.podcast_id)),
            episode_guid: Some(Value::from(action.episode_guid)),
            action: Some(Value::from(EpisodeActionKindCodec::encode(&action.action))),
            position: seconds(action.position),
            started: seconds(action.started),
            total: seconds(action.total),
            timestamp: Some(Value::from(TimestampCodec::encode(&action.timestamp))),
        }
    }
}

/// `GET episode_actions` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeActionPull {
    #[serde(default)]
    pub actions: Vec<RawEpisodeAction>,
    pub timestamp: i64,
}

impl EpisodeActionPull {
    /// Decode every entry, returning the usable ones and how many were
    /// rejected.
    pub fn decode_actions(&self) -> (Vec<EpisodeAction>, usize) {
        decode_entries("episode action", &self.actions, RawEpisodeAction::decode)
    }
}

/// `POST episode_actions` request body.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct EpisodeActionPush<'a> {
    pub actions: &'a [EpisodeAction],
}

/// `POST episode_actions` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeActionPushResponse {
    pub timestamp: i64,
}

fn string_field(field: &'static str, value: Option<&Value>) -> Result<String, DecodeError> {
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(DecodeError::Malformed {
            field,
            value: other.to_string(),
            reason: "expected a string".to_string(),
        }),
        None => Err(DecodeError::Missing { field }),
    }
}

fn int_field(field: &'static str, value: Option<&Value>) -> Result<i64, DecodeError> {
    match value {
        Some(Value::Null) | None => Err(DecodeError::Missing { field }),
        Some(other) => other.as_i64().ok_or_else(|| DecodeError::Malformed {
            field,
            value: other.to_string(),
            reason: "expected an integer".to_string(),
        }),
    }
}

fn decode_entries<R, T>(
    kind: &'static str,
    raw: &[R],
    decode: impl Fn(&R) -> Result<T, DecodeError>,
) -> (Vec<T>, usize) {
    let mut decoded = Vec::with_capacity(raw.len());
    let mut rejected = 0;
    for (index, entry) in raw.iter().enumerate() {
        match decode(entry) {
            Ok(value) => decoded.push(value),
            Err(error) => {
                tracing::warn!(kind, index, error = %error, "Skipping malformed pulled entry");
                rejected += 1;
            }
        }
    }
    (decoded, rejected)
}
