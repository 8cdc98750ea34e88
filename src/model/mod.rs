//! Podcast and episode entities.
//!
//! Entities expose read-only accessors. Every change that matters to sync
//! goes through a mutator that takes the mutation time and bumps the
//! entity's local-modification timestamp in the same call, so the store can
//! always answer "what changed since the last sync".
//!
//! Feed metadata (titles, artwork, publication dates) is refreshed through
//! `refresh_metadata` methods that deliberately leave the modification
//! timestamp alone: a feed refresh is not a user action and must not shadow
//! newer progress from another device.

mod episode;
mod podcast;

pub use episode::{Episode, EpisodeId, EpisodeKey};
pub use podcast::{Podcast, PodcastState};
