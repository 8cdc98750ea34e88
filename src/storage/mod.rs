//! The durable local catalog: podcasts, episodes and the sync cursor in
//! SQLite.
//!
//! Every public write runs in its own transaction; [`Database::apply_batch`]
//! groups many writes (and the cursor) into one.

mod batch;
mod changes;
mod cursor;
mod episodes;
mod podcasts;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    BatchOutcome, Change, ChangeKind, ChangedEntity, StorageError, SyncCursor, UpsertOutcome,
    WriteBatch,
};
