//! Persistent key-value store.
//!
//! The store is the single owner of durable state:
//! - cache generations (request identity -> captured response)
//! - the pending sync queue (auto-increment id -> operation)
//! - agent metadata such as the active version and user preferences

mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{CachedResponse, PendingOperation, QueuedOperation, Store};
