use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use moka::sync::Cache;

use crate::bucket::{BucketSnapshot, KeyId};
use crate::db::{BucketPeek, PeekRequest};
use crate::error::{Error, ErrorDetails};

/// How long a per-key invalidation is remembered. Longer than any store timeout, so
/// every batch that could race an invalidation finishes within it.
const INVALIDATION_MEMORY: Duration = Duration::from_secs(60);

type BatchResult = Result<Arc<HashMap<KeyId, BucketPeek>>, Error>;
type SharedBatch = Shared<BoxFuture<'static, BatchResult>>;

/// Loads bucket levels for a batch of keys. Implemented by the bucket manager, which
/// applies the store timeout.
pub type SnapshotLoader =
    Box<dyn FnOnce(Vec<PeekRequest>) -> BoxFuture<'static, Result<Vec<BucketPeek>, Error>> + Send>;

/// Short-lived copies of bucket levels.
///
/// Keys missing from the cache are read in one batch. A key that is already being
/// loaded by another caller is awaited instead of being read again.
pub struct SnapshotCache {
    cache: Cache<KeyId, BucketPeek>,
    inflight: Arc<Mutex<HashMap<KeyId, SharedBatch>>>,
    /// Bumped by every invalidation. A batch only writes back keys that were not
    /// invalidated after it started.
    sequence: AtomicU64,
    /// Sequence number of the last `invalidate_all`
    cleared_at: AtomicU64,
    /// Sequence number of the last `invalidate` per key
    invalidated_at: Cache<KeyId, u64>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            sequence: AtomicU64::new(0),
            cleared_at: AtomicU64::new(0),
            invalidated_at: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl.max(INVALIDATION_MEMORY))
                .build(),
        }
    }

    pub fn get(&self, key_id: KeyId) -> Option<BucketSnapshot> {
        self.cache.get(&key_id).map(|peek| peek.snapshot)
    }

    pub fn insert(&self, peek: BucketPeek) {
        self.cache.insert(peek.snapshot.key_id, peek);
    }

    pub fn invalidate(&self, key_id: KeyId) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.invalidated_at.insert(key_id, sequence);
        self.cache.invalidate(&key_id);
    }

    pub fn invalidate_all(&self) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.cleared_at.store(sequence, Ordering::SeqCst);
        self.cache.invalidate_all();
    }

    /// Whether a level read by a batch that started at `started` is still current.
    fn still_valid(&self, key_id: KeyId, started: u64) -> bool {
        self.cleared_at.load(Ordering::SeqCst) <= started
            && self
                .invalidated_at
                .get(&key_id)
                .is_none_or(|sequence| sequence <= started)
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    /// Returns levels for every request, in request order.
    pub async fn get_many(
        &self,
        requests: &[PeekRequest],
        loader: SnapshotLoader,
    ) -> Result<Vec<BucketPeek>, Error> {
        let mut found: HashMap<KeyId, BucketPeek> = HashMap::with_capacity(requests.len());
        let mut joined: Vec<SharedBatch> = Vec::new();
        let mut to_load: Vec<PeekRequest> = Vec::new();

        for request in requests {
            if let Some(peek) = self.cache.get(&request.key_id) {
                found.insert(request.key_id, peek);
            } else {
                to_load.push(*request);
            }
        }

        let started = self.sequence.load(Ordering::SeqCst);
        let mut own_batch = None;
        if !to_load.is_empty() {
            let mut inflight = self.inflight.lock().map_err(|e| {
                Error::new(ErrorDetails::InternalError {
                    message: format!("snapshot cache lock poisoned: {e}"),
                })
            })?;
            to_load.retain(|request| match inflight.get(&request.key_id) {
                Some(batch) => {
                    if !joined.iter().any(|other| other.ptr_eq(batch)) {
                        joined.push(batch.clone());
                    }
                    false
                }
                None => true,
            });
            if !to_load.is_empty() {
                let load = loader(to_load.clone());
                let batch: SharedBatch = async move {
                    let peeks = load.await?;
                    Ok(Arc::new(
                        peeks
                            .into_iter()
                            .map(|peek| (peek.snapshot.key_id, peek))
                            .collect(),
                    ))
                }
                .boxed()
                .shared();
                for request in &to_load {
                    inflight.insert(request.key_id, batch.clone());
                }
                own_batch = Some(InFlightGuard {
                    inflight: self.inflight.clone(),
                    key_ids: to_load.iter().map(|request| request.key_id).collect(),
                    batch,
                });
            }
        }

        if let Some(guard) = &own_batch {
            let peeks = guard.batch.clone().await?;
            // Only the caller that started a batch writes it into the cache
            for peek in peeks.values() {
                if self.still_valid(peek.snapshot.key_id, started) {
                    self.cache.insert(peek.snapshot.key_id, peek.clone());
                }
            }
            found.extend(peeks.iter().map(|(key_id, peek)| (*key_id, peek.clone())));
        }
        drop(own_batch);
        for batch in joined {
            let peeks = batch.await?;
            found.extend(peeks.iter().map(|(key_id, peek)| (*key_id, peek.clone())));
        }

        requests
            .iter()
            .map(|request| {
                found.get(&request.key_id).cloned().ok_or_else(|| {
                    Error::new(ErrorDetails::InternalError {
                        message: format!("no bucket level loaded for key {}", request.key_id),
                    })
                })
            })
            .collect()
    }
}

/// Removes a batch from the in-flight map once its owner is done with it, including
/// when the owner's future is dropped before completion.
struct InFlightGuard {
    inflight: Arc<Mutex<HashMap<KeyId, SharedBatch>>>,
    key_ids: Vec<KeyId>,
    batch: SharedBatch,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut inflight) = self.inflight.lock() {
            for key_id in &self.key_ids {
                if inflight
                    .get(key_id)
                    .is_some_and(|batch| batch.ptr_eq(&self.batch))
                {
                    inflight.remove(key_id);
                }
            }
        }
    }
}
