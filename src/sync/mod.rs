//! Account sync: subscriptions and episode actions exchanged with a remote
//! service.
//!
//! A cycle moves through [`SyncState`]s:
//!
//! ```text
//! Idle -> Pulling -> Merging -> Pushing -> Committed
//!            \          \          \
//!             +----------+----------+--> Failed
//! ```
//!
//! Only `Committed` writes to the store, in a single batch together with the
//! new cursor.

mod client;
mod error;
mod merge;
mod remote;
mod wire;

pub use client::{SyncClient, SyncReport, SyncState};
pub use error::SyncError;
pub use merge::{merge, LocalView, MergeOutcome, MergeStats};
pub use remote::{HttpRemote, RemoteService};
pub use wire::{
    EpisodeAction, EpisodeActionPull, EpisodeActionPushResponse, RawEpisodeAction,
    RawSubscriptionChange, SubscriptionChange, SubscriptionPull, SubscriptionPushResponse,
};
