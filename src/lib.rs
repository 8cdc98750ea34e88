//! podshelf: a podcast library core.
//!
//! A local catalog of subscriptions and episodes ([`storage`]), kept
//! consistent with an account-based sync service ([`sync`]) and with OPML
//! subscription lists ([`opml`]). [`library::Library`] is the entry point
//! for every local mutation.

pub mod codec;
pub mod config;
pub mod library;
pub mod model;
pub mod opml;
pub mod storage;
pub mod sync;
pub mod util;
