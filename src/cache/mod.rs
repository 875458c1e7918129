//! Response cache with TTL semantics and no network knowledge.
//!
//! - Keys are derived from `(endpoint, sorted params)`
//! - Entries expire lazily: an expired entry reads as a miss and is dropped
//! - Memory tier for hits within a session, SQLite tier across restarts
//! - Pattern invalidation matches on key or source endpoint

mod entry;
mod layer;
mod policy;
mod storage;

pub use entry::{CacheEntry, CacheKey};
pub use layer::{CacheLayer, CacheMetrics};
pub use policy::{CachePolicy, InvalidationMap, InvalidationRule, TtlRule};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
