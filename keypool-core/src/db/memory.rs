//! In-process bucket store.
//!
//! Implements the same algorithm as the Valkey function library against a map guarded
//! by a `std::sync::Mutex`. The lock is only held for the arithmetic of one call and
//! never across an `.await`, which makes every operation atomic within this process.
//! Only suitable for single-replica deployments and tests, since the state is not shared.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::bucket::{BucketParams, BucketSnapshot, BucketState, KeyId};
use crate::db::{
    BucketPeek, BucketQueries, ConfigureMode, ConsumeReceipt, ConsumeRequest, EvictionReport,
    HealthCheckable, PeekRequest, ScanPage,
};
use crate::error::{Error, ErrorDetails};

/// Source of "now" for bucket arithmetic, in microseconds since the epoch.
pub trait Clock: Send + Sync + Debug {
    fn now_us(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        Utc::now().timestamp_micros()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicI64,
}

impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(start_us),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_us
            .fetch_add(by.as_micros() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    state: BucketState,
    last_used_us: i64,
}

#[derive(Debug)]
pub struct MemoryBucketStore {
    buckets: Mutex<HashMap<KeyId, Entry>>,
    clock: Arc<dyn Clock>,
    bucket_ttl_us: i64,
}

impl MemoryBucketStore {
    pub fn new(bucket_ttl: Duration) -> Self {
        Self::new_with_clock(bucket_ttl, Arc::new(SystemClock))
    }

    pub fn new_with_clock(bucket_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
            bucket_ttl_us: bucket_ttl.as_micros() as i64,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<KeyId, Entry>>, Error> {
        self.buckets.lock().map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("memory bucket store lock poisoned: {e}"),
            })
        })
    }

    fn is_expired(&self, entry: &Entry, now_us: i64) -> bool {
        now_us - entry.last_used_us > self.bucket_ttl_us
    }

    /// Drops every bucket whose TTL has lapsed, mirroring store-side key expiry.
    fn purge_expired(&self, buckets: &mut HashMap<KeyId, Entry>, now_us: i64) {
        buckets.retain(|_, entry| !self.is_expired(entry, now_us));
    }

    fn live_entry<'a>(
        &self,
        buckets: &'a mut HashMap<KeyId, Entry>,
        key_id: KeyId,
        params: BucketParams,
        now_us: i64,
    ) -> &'a mut Entry {
        if buckets
            .get(&key_id)
            .is_some_and(|entry| self.is_expired(entry, now_us))
        {
            buckets.remove(&key_id);
        }
        buckets.entry(key_id).or_insert_with(|| Entry {
            state: BucketState::full(params, now_us),
            last_used_us: now_us,
        })
    }
}

#[async_trait]
impl BucketQueries for MemoryBucketStore {
    async fn consume(&self, request: ConsumeRequest) -> Result<ConsumeReceipt, Error> {
        let now_us = self.clock.now_us();
        let mut buckets = self.lock()?;
        let entry = self.live_entry(&mut buckets, request.key_id, request.params, now_us);
        let consumed = entry
            .state
            .refill_and_try_consume(request.requested_milli, now_us);
        entry.last_used_us = now_us;
        Ok(ConsumeReceipt {
            key_id: request.key_id,
            consumed,
            tokens_remaining: entry.state.snapshot(request.key_id).tokens,
        })
    }

    async fn peek(&self, requests: &[PeekRequest]) -> Result<Vec<BucketPeek>, Error> {
        let now_us = self.clock.now_us();
        let buckets = self.lock()?;
        Ok(requests
            .iter()
            .map(|request| match buckets.get(&request.key_id) {
                Some(entry) if !self.is_expired(entry, now_us) => {
                    let mut state = entry.state;
                    state.refill(now_us);
                    BucketPeek {
                        snapshot: state.snapshot(request.key_id),
                        exists: true,
                    }
                }
                _ => BucketPeek {
                    snapshot: BucketState::full(request.params, now_us).snapshot(request.key_id),
                    exists: false,
                },
            })
            .collect())
    }

    async fn configure(
        &self,
        key_id: KeyId,
        params: BucketParams,
        mode: ConfigureMode,
    ) -> Result<BucketSnapshot, Error> {
        let now_us = self.clock.now_us();
        let mut buckets = self.lock()?;
        let entry = self.live_entry(&mut buckets, key_id, params, now_us);
        match mode {
            ConfigureMode::Ensure => entry.state.refill(now_us),
            ConfigureMode::Reconfigure => entry.state.reconfigure(params, now_us),
            ConfigureMode::Reset => entry.state.reset(params, now_us),
        }
        entry.last_used_us = now_us;
        Ok(entry.state.snapshot(key_id))
    }

    async fn delete(&self, key_ids: &[KeyId]) -> Result<u64, Error> {
        let mut buckets = self.lock()?;
        Ok(key_ids
            .iter()
            .filter(|id| buckets.remove(id).is_some())
            .count() as u64)
    }

    async fn evict(&self, idle_ttl: Duration, max_buckets: u64) -> Result<EvictionReport, Error> {
        let now_us = self.clock.now_us();
        let idle_cutoff_us = now_us - idle_ttl.as_micros() as i64;
        let mut buckets = self.lock()?;
        self.purge_expired(&mut buckets, now_us);

        let before = buckets.len();
        buckets.retain(|_, entry| entry.last_used_us >= idle_cutoff_us);
        let idle_evicted = (before - buckets.len()) as u64;

        let mut lru_evicted = 0;
        let excess = (buckets.len() as u64).saturating_sub(max_buckets);
        if excess > 0 {
            let mut by_age: Vec<(i64, KeyId)> = buckets
                .iter()
                .map(|(id, entry)| (entry.last_used_us, *id))
                .collect();
            by_age.sort_unstable();
            for (_, id) in by_age.into_iter().take(excess as usize) {
                buckets.remove(&id);
                lru_evicted += 1;
            }
        }

        Ok(EvictionReport {
            idle_evicted,
            lru_evicted,
            remaining: buckets.len() as u64,
        })
    }

    async fn scan(&self, cursor: u64, count: usize) -> Result<ScanPage, Error> {
        let now_us = self.clock.now_us();
        let mut buckets = self.lock()?;
        self.purge_expired(&mut buckets, now_us);

        let mut ids: Vec<KeyId> = buckets.keys().copied().collect();
        ids.sort_unstable();
        let start = cursor as usize;
        let page: Vec<BucketSnapshot> = ids
            .iter()
            .skip(start)
            .take(count.max(1))
            .filter_map(|id| {
                buckets.get(id).map(|entry| {
                    let mut state = entry.state;
                    state.refill(now_us);
                    state.snapshot(*id)
                })
            })
            .collect();
        let next = start + page.len();
        Ok(ScanPage {
            cursor: if next >= ids.len() { 0 } else { next as u64 },
            snapshots: page,
        })
    }

    async fn count(&self) -> Result<u64, Error> {
        let now_us = self.clock.now_us();
        let mut buckets = self.lock()?;
        self.purge_expired(&mut buckets, now_us);
        Ok(buckets.len() as u64)
    }
}

#[async_trait]
impl HealthCheckable for MemoryBucketStore {
    async fn health(&self) -> Result<(), Error> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn store_with_clock() -> (MemoryBucketStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000));
        (MemoryBucketStore::new_with_clock(HOUR, clock.clone()), clock)
    }

    fn consume_one(key_id: i64, params: BucketParams) -> ConsumeRequest {
        ConsumeRequest {
            key_id: KeyId(key_id),
            requested_milli: 1_000,
            params,
        }
    }

    #[tokio::test]
    async fn test_scenario_capacity_ten_refill_one() {
        let (store, clock) = store_with_clock();
        let params = BucketParams::new(10, 1.0);
        for _ in 0..10 {
            let receipt = store.consume(consume_one(1, params)).await.unwrap();
            assert!(receipt.consumed);
        }
        let receipt = store.consume(consume_one(1, params)).await.unwrap();
        assert!(!receipt.consumed, "11th consume at t=0 must fail");
        assert_eq!(receipt.tokens_remaining, 0.0);

        clock.advance(Duration::from_secs(5));
        let receipt = store.consume(consume_one(1, params)).await.unwrap();
        assert!(receipt.consumed);
        assert!((receipt.tokens_remaining - 4.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_concurrent_consumes_never_exceed_tokens() {
        let (store, _clock) = store_with_clock();
        let store = Arc::new(store);
        let params = BucketParams::new(7, 0.0);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.consume(consume_one(9, params)).await })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().consumed {
                successes += 1;
            }
        }
        assert_eq!(successes, 7, "exactly T consumes may succeed");
    }

    #[tokio::test]
    async fn test_peek_does_not_create_or_mutate() {
        let (store, clock) = store_with_clock();
        let params = BucketParams::new(10, 1.0);
        let peeks = store
            .peek(&[PeekRequest {
                key_id: KeyId(5),
                params,
            }])
            .await
            .unwrap();
        assert!(!peeks[0].exists);
        assert!((peeks[0].snapshot.tokens - 10.0).abs() < f64::EPSILON);
        assert_eq!(store.count().await.unwrap(), 0);

        store
            .consume(ConsumeRequest {
                key_id: KeyId(5),
                requested_milli: 6_000,
                params,
            })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));
        let peeks = store
            .peek(&[PeekRequest {
                key_id: KeyId(5),
                params,
            }])
            .await
            .unwrap();
        assert!(peeks[0].exists);
        assert!((peeks[0].snapshot.tokens - 6.0).abs() < f64::EPSILON);
        let again = store
            .peek(&[PeekRequest {
                key_id: KeyId(5),
                params,
            }])
            .await
            .unwrap();
        assert_eq!(peeks, again);
    }

    #[tokio::test]
    async fn test_configure_modes() {
        let (store, _clock) = store_with_clock();
        let small = BucketParams::new(5, 0.5);
        let large = BucketParams::new(20, 2.0);

        let snapshot = store
            .configure(KeyId(1), large, ConfigureMode::Ensure)
            .await
            .unwrap();
        assert!((snapshot.tokens - 20.0).abs() < f64::EPSILON);

        // Ensure does not resize an existing bucket
        let snapshot = store
            .configure(KeyId(1), small, ConfigureMode::Ensure)
            .await
            .unwrap();
        assert!((snapshot.capacity - 20.0).abs() < f64::EPSILON);

        let snapshot = store
            .configure(KeyId(1), small, ConfigureMode::Reconfigure)
            .await
            .unwrap();
        assert!((snapshot.capacity - 5.0).abs() < f64::EPSILON);
        assert!((snapshot.tokens - 5.0).abs() < f64::EPSILON);

        store
            .consume(ConsumeRequest {
                key_id: KeyId(1),
                requested_milli: 5_000,
                params: small,
            })
            .await
            .unwrap();
        let snapshot = store
            .configure(KeyId(1), small, ConfigureMode::Reset)
            .await
            .unwrap();
        assert!((snapshot.tokens - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_ttl_expiry_recreates_full_bucket() {
        let (store, clock) = store_with_clock();
        let params = BucketParams::new(3, 0.1);
        for _ in 0..3 {
            store.consume(consume_one(2, params)).await.unwrap();
        }
        clock.advance(HOUR + Duration::from_secs(1));
        assert_eq!(store.count().await.unwrap(), 0);
        let receipt = store.consume(consume_one(2, params)).await.unwrap();
        assert!(receipt.consumed);
        assert!((receipt.tokens_remaining - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_evict_idle_then_lru() {
        let (store, clock) = store_with_clock();
        let params = BucketParams::new(10, 1.0);
        store.consume(consume_one(1, params)).await.unwrap();
        clock.advance(Duration::from_secs(600));
        for id in 2..=5 {
            store.consume(consume_one(id, params)).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let report = store.evict(Duration::from_secs(300), 2).await.unwrap();
        assert_eq!(report.idle_evicted, 1, "key 1 is idle");
        assert_eq!(report.lru_evicted, 2, "keys 2 and 3 are least recently used");
        assert_eq!(report.remaining, 2);

        let page = store.scan(0, 10).await.unwrap();
        let ids: Vec<KeyId> = page.snapshots.iter().map(|s| s.key_id).collect();
        assert_eq!(ids, vec![KeyId(4), KeyId(5)]);
    }

    #[tokio::test]
    async fn test_scan_pages_with_cursor() {
        let (store, _clock) = store_with_clock();
        let params = BucketParams::new(10, 1.0);
        for id in 1..=5 {
            store
                .configure(KeyId(id), params, ConfigureMode::Ensure)
                .await
                .unwrap();
        }
        let first = store.scan(0, 2).await.unwrap();
        assert_eq!(first.snapshots.len(), 2);
        assert_ne!(first.cursor, 0);
        let second = store.scan(first.cursor, 2).await.unwrap();
        let third = store.scan(second.cursor, 2).await.unwrap();
        assert_eq!(third.snapshots.len(), 1);
        assert_eq!(third.cursor, 0);
    }

    #[tokio::test]
    async fn test_delete_reports_count() {
        let (store, _clock) = store_with_clock();
        let params = BucketParams::new(10, 1.0);
        store.consume(consume_one(1, params)).await.unwrap();
        let deleted = store.delete(&[KeyId(1), KeyId(2)]).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
