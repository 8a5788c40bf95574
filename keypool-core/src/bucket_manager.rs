//! Bucket lifecycle: lazy creation from tier defaults, eviction, batch reads and
//! administrative reconfiguration.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::{FutureExt, StreamExt};
use moka::sync::Cache;
use serde::Serialize;
use tokio::time::timeout;
use tracing::instrument;

use crate::bucket::{BucketParams, BucketSnapshot, KeyId, requested_milli};
use crate::cache::SnapshotCache;
use crate::config::{CacheConfig, Config, EvictionConfig, PriorityTier, TierConfig, TierTable};
use crate::db::{
    BucketPeek, BucketQueries, ConfigureMode, ConsumeReceipt, ConsumeRequest, EvictionReport,
    KeyRecordQueries, PeekRequest, ScanPage,
};
use crate::error::{Error, ErrorDetails};

/// Number of buckets read per page when walking the whole keyspace.
const SCAN_PAGE_SIZE: usize = 100;
/// Maximum number of concurrent store calls when reconfiguring a whole tier.
const RECONFIGURE_CONCURRENCY: usize = 16;

/// Health of a single bucket as reported to operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketHealth {
    Healthy,
    Depleted,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BucketStatus {
    #[serde(flatten)]
    pub snapshot: BucketSnapshot,
    pub tier: PriorityTier,
    pub utilization_percent: f64,
    pub status: BucketHealth,
}

impl BucketStatus {
    fn new(snapshot: BucketSnapshot, tier: PriorityTier) -> Self {
        Self {
            utilization_percent: snapshot.utilization_percent(),
            status: if snapshot.is_depleted() {
                BucketHealth::Depleted
            } else {
                BucketHealth::Healthy
            },
            snapshot,
            tier,
        }
    }
}

/// Totals over every tracked bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BucketStatistics {
    pub total_buckets: u64,
    pub depleted_buckets: u64,
    pub total_capacity: f64,
    pub total_available_tokens: f64,
    pub average_capacity: f64,
    pub average_available_tokens: f64,
    pub utilization_percent: f64,
}

impl BucketStatistics {
    fn add(&mut self, snapshot: &BucketSnapshot) {
        self.total_buckets += 1;
        if snapshot.is_depleted() {
            self.depleted_buckets += 1;
        }
        self.total_capacity += snapshot.capacity;
        self.total_available_tokens += snapshot.tokens;
    }

    fn finish(mut self) -> Self {
        if self.total_buckets > 0 {
            self.average_capacity = self.total_capacity / self.total_buckets as f64;
            self.average_available_tokens =
                self.total_available_tokens / self.total_buckets as f64;
        }
        if self.total_capacity > 0.0 {
            self.utilization_percent = (self.total_capacity - self.total_available_tokens)
                / self.total_capacity
                * 100.0;
        }
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TierApplyReport {
    pub tier: PriorityTier,
    pub config: TierConfig,
    pub keys_updated: usize,
    pub keys_failed: usize,
}

/// Owns every interaction with the bucket store.
///
/// Every store call is bounded by the configured timeout; a timeout surfaces as
/// `BucketStoreUnavailable`, the same as an unreachable store.
#[derive(Clone)]
pub struct BucketManager {
    inner: Arc<BucketManagerInner>,
}

struct BucketManagerInner {
    store: Arc<dyn BucketQueries>,
    key_records: Arc<dyn KeyRecordQueries>,
    tiers: ArcSwap<TierTable>,
    key_tiers: Cache<KeyId, PriorityTier>,
    snapshots: SnapshotCache,
    store_timeout: Duration,
    eviction: EvictionConfig,
}

impl BucketManager {
    pub fn new(
        store: Arc<dyn BucketQueries>,
        key_records: Arc<dyn KeyRecordQueries>,
        config: &Config,
    ) -> Self {
        Self::new_with_parts(
            store,
            key_records,
            config.token_bucket.tiers.clone(),
            config.token_bucket.eviction.clone(),
            &config.cache,
            config.bucket_store.timeout(),
        )
    }

    pub fn new_with_parts(
        store: Arc<dyn BucketQueries>,
        key_records: Arc<dyn KeyRecordQueries>,
        tiers: TierTable,
        eviction: EvictionConfig,
        cache: &CacheConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BucketManagerInner {
                store,
                key_records,
                tiers: ArcSwap::from_pointee(tiers),
                key_tiers: Cache::builder()
                    .max_capacity(cache.max_snapshots)
                    .time_to_live(cache.active_keys_ttl())
                    .build(),
                snapshots: SnapshotCache::new(cache.snapshot_ttl(), cache.max_snapshots),
                store_timeout,
                eviction,
            }),
        }
    }

    pub fn tiers(&self) -> Arc<TierTable> {
        self.inner.tiers.load_full()
    }

    pub fn eviction_config(&self) -> &EvictionConfig {
        &self.inner.eviction
    }

    pub fn snapshots(&self) -> &SnapshotCache {
        &self.inner.snapshots
    }

    async fn with_timeout<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        with_store_timeout(self.inner.store_timeout, operation, fut).await
    }

    /// Tier of one key. Falls back to the default tier when the key record store
    /// cannot answer, so a record-store outage never blocks bucket operations.
    pub async fn tier_of(&self, key_id: KeyId) -> PriorityTier {
        if let Some(tier) = self.inner.key_tiers.get(&key_id) {
            return tier;
        }
        match self.inner.key_records.get_key_tier(key_id).await {
            Ok(tier) => {
                self.inner.key_tiers.insert(key_id, tier);
                tier
            }
            Err(e) => {
                tracing::warn!("Using default tier for key {key_id}: {e}");
                PriorityTier::default()
            }
        }
    }

    /// Tiers for many keys with one record-store round trip for the uncached ones.
    pub async fn tiers_of(&self, key_ids: &[KeyId]) -> HashMap<KeyId, PriorityTier> {
        let mut tiers = HashMap::with_capacity(key_ids.len());
        let mut missing = Vec::new();
        for key_id in key_ids {
            match self.inner.key_tiers.get(key_id) {
                Some(tier) => {
                    tiers.insert(*key_id, tier);
                }
                None => missing.push(*key_id),
            }
        }
        if missing.is_empty() {
            return tiers;
        }
        match self.inner.key_records.get_key_tiers(&missing).await {
            Ok(found) => {
                for key_id in missing {
                    let tier = found.get(&key_id).copied().unwrap_or_default();
                    self.inner.key_tiers.insert(key_id, tier);
                    tiers.insert(key_id, tier);
                }
            }
            Err(e) => {
                tracing::warn!(
                    keys = missing.len(),
                    "Using default tier for keys without a cached tier: {e}"
                );
                tiers.extend(missing.into_iter().map(|key_id| (key_id, PriorityTier::default())));
            }
        }
        tiers
    }

    async fn params_of(&self, key_id: KeyId) -> BucketParams {
        self.tiers().params(self.tier_of(key_id).await)
    }

    async fn peek_requests(&self, key_ids: &[KeyId]) -> Vec<PeekRequest> {
        let tiers = self.tiers_of(key_ids).await;
        let table = self.tiers();
        key_ids
            .iter()
            .map(|key_id| PeekRequest {
                key_id: *key_id,
                params: table.params(tiers.get(key_id).copied().unwrap_or_default()),
            })
            .collect()
    }

    /// Creates the bucket at full capacity for `tier` if it does not exist yet.
    /// An existing bucket keeps its parameters.
    #[instrument(skip_all, fields(key_id = %key_id, tier = %tier))]
    pub async fn ensure_bucket(
        &self,
        key_id: KeyId,
        tier: PriorityTier,
    ) -> Result<BucketSnapshot, Error> {
        let params = self.tiers().params(tier);
        self.with_timeout(
            "ensure bucket",
            self.inner
                .store
                .configure(key_id, params, ConfigureMode::Ensure),
        )
        .await
    }

    /// Atomically refills the key's bucket and consumes `requested_tokens` if possible.
    /// A missing bucket is created from the key's tier first.
    #[instrument(skip_all, fields(key_id = %key_id, requested_tokens = requested_tokens))]
    pub async fn refill_and_try_consume(
        &self,
        key_id: KeyId,
        requested_tokens: u32,
    ) -> Result<ConsumeReceipt, Error> {
        let request = ConsumeRequest {
            key_id,
            requested_milli: requested_milli(requested_tokens)?,
            params: self.params_of(key_id).await,
        };
        let result = self
            .with_timeout("consume", self.inner.store.consume(request))
            .await;
        // The cached level is stale whether or not the consume went through
        self.inner.snapshots.invalidate(key_id);
        result
    }

    /// Current token levels through the snapshot cache, in request order.
    pub async fn token_levels(&self, key_ids: &[KeyId]) -> Result<Vec<BucketPeek>, Error> {
        if key_ids.is_empty() {
            return Ok(vec![]);
        }
        let requests = self.peek_requests(key_ids).await;
        let store = self.inner.store.clone();
        let store_timeout = self.inner.store_timeout;
        self.inner
            .snapshots
            .get_many(
                &requests,
                Box::new(move |requests: Vec<PeekRequest>| {
                    async move {
                        with_store_timeout(store_timeout, "peek", store.peek(&requests)).await
                    }
                    .boxed()
                }),
            )
            .await
    }

    /// Cached view of one bucket.
    pub async fn get_bucket_snapshot(&self, key_id: KeyId) -> Result<BucketSnapshot, Error> {
        if let Some(snapshot) = self.inner.snapshots.get(key_id) {
            return Ok(snapshot);
        }
        let peeks = self.token_levels(&[key_id]).await?;
        peeks
            .into_iter()
            .next()
            .map(|peek| peek.snapshot)
            .ok_or_else(|| {
                Error::new(ErrorDetails::InternalError {
                    message: format!("bucket store returned no level for key {key_id}"),
                })
            })
    }

    /// Remaining tokens for each key, read from the store (not the cache).
    /// Keys without a bucket report their tier's full capacity.
    #[instrument(skip_all, fields(keys = key_ids.len()))]
    pub async fn batch_check(&self, key_ids: &[KeyId]) -> Result<HashMap<KeyId, f64>, Error> {
        if key_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let requests = self.peek_requests(key_ids).await;
        let peeks = self
            .with_timeout("batch check", self.inner.store.peek(&requests))
            .await?;
        for peek in &peeks {
            self.inner.snapshots.insert(peek.clone());
        }
        Ok(peeks
            .into_iter()
            .map(|peek| (peek.snapshot.key_id, peek.snapshot.tokens))
            .collect())
    }

    /// Deletes buckets idle for longer than `max_age`, then the least recently used
    /// ones beyond `max_buckets`. Evicted keys start over at full capacity.
    #[instrument(skip_all)]
    pub async fn evict_idle(&self, max_age: Duration) -> Result<EvictionReport, Error> {
        let report = self
            .with_timeout(
                "evict",
                self.inner.store.evict(max_age, self.inner.eviction.max_buckets),
            )
            .await?;
        metrics::counter!("keypool_buckets_evicted_total", "reason" => "idle")
            .increment(report.idle_evicted);
        metrics::counter!("keypool_buckets_evicted_total", "reason" => "lru")
            .increment(report.lru_evicted);
        if report.idle_evicted + report.lru_evicted > 0 {
            self.inner.snapshots.invalidate_all();
            tracing::info!(
                idle_evicted = report.idle_evicted,
                lru_evicted = report.lru_evicted,
                remaining = report.remaining,
                "Evicted token buckets"
            );
        }
        Ok(report)
    }

    /// Runs eviction with the configured idle TTL.
    pub async fn cleanup(&self) -> Result<EvictionReport, Error> {
        self.evict_idle(self.inner.eviction.idle_ttl()).await
    }

    /// Changes the defaults used for buckets created from now on.
    /// Existing buckets keep their parameters until `reconfigure_tier` touches them.
    pub fn set_tier_config(
        &self,
        tier: PriorityTier,
        capacity: u32,
        refill_rate: f64,
    ) -> Result<TierConfig, Error> {
        let config = TierConfig {
            capacity,
            refill_rate,
        };
        let table = self.tiers().with_tier(tier, config)?;
        self.inner.tiers.store(Arc::new(table));
        tracing::info!(%tier, capacity, refill_rate, "Updated tier configuration");
        Ok(config)
    }

    /// Applies explicit parameters to one bucket. Tokens are clamped to the new capacity.
    #[instrument(skip_all, fields(key_id = %key_id))]
    pub async fn configure_bucket(
        &self,
        key_id: KeyId,
        capacity: u32,
        refill_rate: f64,
    ) -> Result<BucketStatus, Error> {
        let tier = self.tier_of(key_id).await;
        let config = TierConfig {
            capacity,
            refill_rate,
        };
        config.validate(tier)?;
        let snapshot = self
            .with_timeout(
                "configure bucket",
                self.inner
                    .store
                    .configure(key_id, config.params(), ConfigureMode::Reconfigure),
            )
            .await?;
        self.inner.snapshots.invalidate(key_id);
        Ok(BucketStatus::new(snapshot, tier))
    }

    /// Refills a bucket to its capacity, keeping its current parameters.
    #[instrument(skip_all, fields(key_id = %key_id))]
    pub async fn reset_bucket(&self, key_id: KeyId) -> Result<BucketStatus, Error> {
        let tier = self.tier_of(key_id).await;
        let request = PeekRequest {
            key_id,
            params: self.tiers().params(tier),
        };
        let current = self
            .with_timeout("peek", self.inner.store.peek(&[request]))
            .await?;
        let params = match current.first() {
            Some(peek) if peek.exists => BucketParams {
                capacity_milli: crate::bucket::tokens_to_milli(peek.snapshot.capacity),
                refill_milli_per_sec: crate::bucket::tokens_to_milli(peek.snapshot.refill_rate),
            },
            _ => request.params,
        };
        let snapshot = self
            .with_timeout(
                "reset bucket",
                self.inner
                    .store
                    .configure(key_id, params, ConfigureMode::Reset),
            )
            .await?;
        self.inner.snapshots.invalidate(key_id);
        Ok(BucketStatus::new(snapshot, tier))
    }

    /// Status of a tracked bucket, read from the store.
    pub async fn bucket_status(&self, key_id: KeyId) -> Result<BucketStatus, Error> {
        let tier = self.tier_of(key_id).await;
        let request = PeekRequest {
            key_id,
            params: self.tiers().params(tier),
        };
        let peeks = self
            .with_timeout("peek", self.inner.store.peek(&[request]))
            .await?;
        match peeks.into_iter().next() {
            Some(peek) if peek.exists => Ok(BucketStatus::new(peek.snapshot, tier)),
            _ => Err(Error::new(ErrorDetails::BucketNotFound { key_id })),
        }
    }

    /// Moves a key to another tier and reconfigures its bucket to match.
    #[instrument(skip_all, fields(key_id = %key_id, tier = %tier))]
    pub async fn apply_tier(
        &self,
        key_id: KeyId,
        tier: PriorityTier,
    ) -> Result<BucketSnapshot, Error> {
        self.inner.key_tiers.insert(key_id, tier);
        let snapshot = self
            .with_timeout(
                "reconfigure bucket",
                self.inner.store.configure(
                    key_id,
                    self.tiers().params(tier),
                    ConfigureMode::Reconfigure,
                ),
            )
            .await?;
        self.inner.snapshots.invalidate(key_id);
        Ok(snapshot)
    }

    /// Applies the tier's current parameters to every key in `key_ids` that belongs to it.
    #[instrument(skip_all, fields(tier = %tier))]
    pub async fn reconfigure_tier(
        &self,
        tier: PriorityTier,
        key_ids: &[KeyId],
    ) -> Result<TierApplyReport, Error> {
        let tiers = self
            .inner
            .key_records
            .get_key_tiers(key_ids)
            .await?;
        let members: Vec<KeyId> = key_ids
            .iter()
            .copied()
            .filter(|key_id| tiers.get(key_id).copied().unwrap_or_default() == tier)
            .collect();
        let params = self.tiers().params(tier);

        let results: Vec<Result<BucketSnapshot, Error>> = futures::stream::iter(members)
            .map(|key_id| async move {
                self.inner.key_tiers.insert(key_id, tier);
                self.inner.snapshots.invalidate(key_id);
                self.with_timeout(
                    "reconfigure bucket",
                    self.inner
                        .store
                        .configure(key_id, params, ConfigureMode::Reconfigure),
                )
                .await
            })
            .buffer_unordered(RECONFIGURE_CONCURRENCY)
            .collect()
            .await;

        let keys_failed = results.iter().filter(|result| result.is_err()).count();
        Ok(TierApplyReport {
            tier,
            config: *self.tiers().get(tier),
            keys_updated: results.len() - keys_failed,
            keys_failed,
        })
    }

    /// Drops local state for a key. The bucket itself is left to expire.
    pub fn forget_key(&self, key_id: KeyId) {
        self.inner.key_tiers.invalidate(&key_id);
        self.inner.snapshots.invalidate(key_id);
    }

    #[instrument(skip_all, fields(keys = key_ids.len()))]
    pub async fn delete_buckets(&self, key_ids: &[KeyId]) -> Result<u64, Error> {
        for key_id in key_ids {
            self.forget_key(*key_id);
        }
        self.with_timeout("delete buckets", self.inner.store.delete(key_ids))
            .await
    }

    /// One page of tracked buckets. Pass the returned cursor back to continue; 0 ends the scan.
    pub async fn list_buckets(&self, cursor: u64, count: usize) -> Result<ScanPage, Error> {
        self.with_timeout("scan", self.inner.store.scan(cursor, count))
            .await
    }

    pub async fn tracked_buckets(&self) -> Result<u64, Error> {
        self.with_timeout("count", self.inner.store.count()).await
    }

    /// Walks every tracked bucket with cursor-based pages.
    #[instrument(skip_all)]
    pub async fn statistics(&self) -> Result<BucketStatistics, Error> {
        let mut stats = BucketStatistics::default();
        let mut cursor = 0;
        loop {
            let page = self.list_buckets(cursor, SCAN_PAGE_SIZE).await?;
            for snapshot in &page.snapshots {
                stats.add(snapshot);
            }
            if page.cursor == 0 {
                break;
            }
            cursor = page.cursor;
        }
        Ok(stats.finish())
    }
}

async fn with_store_timeout<T>(
    store_timeout: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match timeout(store_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::new_quiet(ErrorDetails::BucketStoreUnavailable {
            message: format!(
                "{operation} timed out after {}ms",
                store_timeout.as_millis()
            ),
        })),
    }
}
