//! Process-local caches in front of the key record store and the bucket store.
//! Neither is a source of truth: entries expire quickly and are dropped on writes.

mod active_keys;
mod snapshots;

pub use active_keys::{AccuracyCheck, ActiveKeyCache, CacheStats, CacheStatus};
pub use snapshots::{SnapshotCache, SnapshotLoader};
