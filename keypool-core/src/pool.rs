//! The key pool ties the active-key cache, the bucket manager and the selector together.
//! It is the entry point used by the request-forwarding layer and the admin endpoints.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::bucket::{BucketSnapshot, KeyId};
use crate::bucket_manager::{BucketManager, TierApplyReport};
use crate::cache::ActiveKeyCache;
use crate::config::{Config, PriorityTier};
use crate::db::{BucketQueries, KeyRecordQueries, TimedKeyRecords};
use crate::error::Error;
use crate::selection::{CandidatePoolHint, KeySelector, Selection};

/// External status of a key record.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Inactive,
    Exhausted,
    Error,
}

/// A change made to the key records by another component.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum KeyEvent {
    Created {
        key_id: KeyId,
        #[serde(default)]
        tier: Option<PriorityTier>,
    },
    StatusChanged {
        key_id: KeyId,
        status: KeyStatus,
    },
    TierChanged {
        key_id: KeyId,
        tier: PriorityTier,
    },
    Deleted {
        key_id: KeyId,
    },
}

impl KeyEvent {
    pub fn key_id(&self) -> KeyId {
        match self {
            KeyEvent::Created { key_id, .. }
            | KeyEvent::StatusChanged { key_id, .. }
            | KeyEvent::TierChanged { key_id, .. }
            | KeyEvent::Deleted { key_id } => *key_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KeyEventReport {
    pub key_id: KeyId,
    /// Bucket state after the event, when the event touched the bucket
    pub bucket: Option<BucketSnapshot>,
    pub buckets_deleted: u64,
}

#[derive(Clone)]
pub struct KeyPool {
    inner: Arc<KeyPoolInner>,
}

struct KeyPoolInner {
    active_keys: ActiveKeyCache,
    buckets: BucketManager,
    selector: KeySelector,
}

impl KeyPool {
    pub fn new(
        store: Arc<dyn BucketQueries>,
        key_records: Arc<dyn KeyRecordQueries>,
        config: &Config,
    ) -> Self {
        let key_records: Arc<dyn KeyRecordQueries> = Arc::new(TimedKeyRecords::new(
            key_records,
            config.key_records.timeout(),
        ));
        let buckets = BucketManager::new(store, key_records.clone(), config);
        let selector = KeySelector::new(
            buckets.clone(),
            config.selection.clone(),
            &config.token_bucket,
        );
        Self {
            inner: Arc::new(KeyPoolInner {
                active_keys: ActiveKeyCache::new(key_records, config.cache.active_keys_ttl()),
                buckets,
                selector,
            }),
        }
    }

    pub fn buckets(&self) -> &BucketManager {
        &self.inner.buckets
    }

    pub fn active_keys(&self) -> &ActiveKeyCache {
        &self.inner.active_keys
    }

    pub fn selector(&self) -> &KeySelector {
        &self.inner.selector
    }

    pub async fn active_key_ids(&self) -> Result<Arc<Vec<KeyId>>, Error> {
        self.inner.active_keys.get_active_key_ids().await
    }

    /// Picks a key for one upstream request and reserves its tokens.
    /// When the cache cannot produce the active set, the key record store is asked directly.
    pub async fn select_key(&self, hint: &CandidatePoolHint) -> Result<Selection, Error> {
        let active = match self.active_key_ids().await {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!("Reading active keys directly after a cache failure: {e}");
                Arc::new(self.inner.active_keys.load_uncached().await?)
            }
        };
        self.inner.selector.select_key(&active, hint).await
    }

    /// Brings local state in line with a change to the key records.
    #[instrument(skip_all, fields(key_id = %event.key_id()))]
    pub async fn handle_key_event(&self, event: KeyEvent) -> Result<KeyEventReport, Error> {
        let key_id = event.key_id();
        self.inner.active_keys.invalidate()?;
        self.inner.buckets.forget_key(key_id);

        let mut report = KeyEventReport {
            key_id,
            bucket: None,
            buckets_deleted: 0,
        };
        match event {
            KeyEvent::Created {
                tier: Some(tier), ..
            } => {
                report.bucket = Some(self.inner.buckets.ensure_bucket(key_id, tier).await?);
            }
            KeyEvent::Created { tier: None, .. } | KeyEvent::StatusChanged { .. } => {}
            KeyEvent::TierChanged { tier, .. } => {
                report.bucket = Some(self.inner.buckets.apply_tier(key_id, tier).await?);
            }
            KeyEvent::Deleted { .. } => {
                report.buckets_deleted = self.inner.buckets.delete_buckets(&[key_id]).await?;
            }
        }
        tracing::debug!(?event, "Applied key event");
        Ok(report)
    }

    /// Applies a tier's current parameters to every active key in it.
    pub async fn reconfigure_tier(&self, tier: PriorityTier) -> Result<TierApplyReport, Error> {
        let active = self.inner.active_keys.load_uncached().await?;
        self.inner.buckets.reconfigure_tier(tier, &active).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::db::memory::MemoryBucketStore;
    use crate::db::{InMemoryKeyRecords, MockKeyRecordQueries};
    use crate::error::ErrorDetails;

    fn pool(records: Arc<InMemoryKeyRecords>) -> (KeyPool, Arc<MemoryBucketStore>) {
        let store = Arc::new(MemoryBucketStore::new(Duration::from_secs(3600)));
        (KeyPool::new(store.clone(), records, &Config::default()), store)
    }

    #[tokio::test]
    async fn test_select_key_uses_active_records() {
        let records = Arc::new(InMemoryKeyRecords::with_active([7]));
        let (pool, _) = pool(records);
        let selection = pool.select_key(&CandidatePoolHint::default()).await.unwrap();
        assert_eq!(selection.key_id, KeyId(7));
        assert_eq!(selection.tokens_remaining, Some(9.0));
    }

    #[tokio::test]
    async fn test_empty_pool_is_no_available_key() {
        let (pool, _) = pool(Arc::new(InMemoryKeyRecords::default()));
        let err = pool
            .select_key(&CandidatePoolHint::default())
            .await
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::NoAvailableKey));
    }

    #[tokio::test]
    async fn test_status_change_is_visible_immediately() {
        let records = Arc::new(InMemoryKeyRecords::with_active([1, 2]));
        let (pool, _) = pool(records.clone());
        assert_eq!(pool.active_key_ids().await.unwrap().len(), 2);

        records.upsert(KeyId(1), false, PriorityTier::Normal);
        pool.handle_key_event(KeyEvent::StatusChanged {
            key_id: KeyId(1),
            status: KeyStatus::Exhausted,
        })
        .await
        .unwrap();

        assert_eq!(*pool.active_key_ids().await.unwrap(), vec![KeyId(2)]);
        for _ in 0..20 {
            let selection = pool.select_key(&CandidatePoolHint::default()).await.unwrap();
            assert_eq!(selection.key_id, KeyId(2));
            pool.buckets().reset_bucket(KeyId(2)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_created_with_tier_creates_full_bucket() {
        let records = Arc::new(InMemoryKeyRecords::default());
        let (pool, _) = pool(records.clone());
        assert!(pool.active_key_ids().await.unwrap().is_empty());

        records.upsert(KeyId(5), true, PriorityTier::High);
        let report = pool
            .handle_key_event(KeyEvent::Created {
                key_id: KeyId(5),
                tier: Some(PriorityTier::High),
            })
            .await
            .unwrap();
        let bucket = report.bucket.unwrap();
        assert_eq!(bucket.capacity, 20.0);
        assert_eq!(bucket.tokens, 20.0);
        assert_eq!(*pool.active_key_ids().await.unwrap(), vec![KeyId(5)]);
    }

    #[tokio::test]
    async fn test_tier_change_reconfigures_bucket() {
        let records = Arc::new(InMemoryKeyRecords::with_active([3]));
        let (pool, _) = pool(records.clone());
        pool.select_key(&CandidatePoolHint::default()).await.unwrap();

        records.upsert(KeyId(3), true, PriorityTier::Low);
        let report = pool
            .handle_key_event(KeyEvent::TierChanged {
                key_id: KeyId(3),
                tier: PriorityTier::Low,
            })
            .await
            .unwrap();
        let bucket = report.bucket.unwrap();
        assert_eq!(bucket.capacity, 5.0);
        assert!(bucket.tokens <= 5.0);
        assert_eq!(
            pool.buckets().bucket_status(KeyId(3)).await.unwrap().tier,
            PriorityTier::Low
        );
    }

    #[tokio::test]
    async fn test_deleted_key_loses_its_bucket() {
        let records = Arc::new(InMemoryKeyRecords::with_active([4]));
        let (pool, _) = pool(records.clone());
        pool.select_key(&CandidatePoolHint::default()).await.unwrap();
        assert!(pool.buckets().bucket_status(KeyId(4)).await.is_ok());

        records.remove(KeyId(4));
        let report = pool
            .handle_key_event(KeyEvent::Deleted { key_id: KeyId(4) })
            .await
            .unwrap();
        assert_eq!(report.buckets_deleted, 1);
        let err = pool.buckets().bucket_status(KeyId(4)).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::BucketNotFound { .. }
        ));
        assert!(pool.active_key_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconfigure_tier_touches_only_members() {
        let records = Arc::new(InMemoryKeyRecords::with_active([1, 2]));
        records.upsert(KeyId(2), true, PriorityTier::Low);
        let (pool, _) = pool(records);
        pool.buckets()
            .set_tier_config(PriorityTier::Low, 50, 5.0)
            .unwrap();

        let report = pool.reconfigure_tier(PriorityTier::Low).await.unwrap();
        assert_eq!(report.keys_updated, 1);
        assert_eq!(report.keys_failed, 0);
        let status = pool.buckets().bucket_status(KeyId(2)).await.unwrap();
        assert_eq!(status.snapshot.capacity, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_record_store_cannot_block_selection() {
        let records = Arc::new(InMemoryKeyRecords::with_active([1, 2]));
        records.set_stalled(true);
        let (pool, _) = pool(records);

        let started = tokio::time::Instant::now();
        let err = pool
            .select_key(&CandidatePoolHint::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::KeyRecordStoreUnavailable { .. }
        ));
        // One bounded cache reload plus one bounded direct read
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_record_store_serves_stale_keys_with_default_tier() {
        let records = Arc::new(InMemoryKeyRecords::with_active([6]));
        records.upsert(KeyId(6), true, PriorityTier::High);
        let (pool, _) = pool(records.clone());
        assert_eq!(pool.active_key_ids().await.unwrap().len(), 1);

        records.set_stalled(true);
        pool.active_keys().invalidate().unwrap();
        let selection = pool.select_key(&CandidatePoolHint::default()).await.unwrap();
        assert_eq!(selection.key_id, KeyId(6));
        // The tier lookup timed out, so the bucket was created from the `normal` tier
        assert_eq!(selection.tokens_remaining, Some(9.0));
        assert!(pool.active_keys().is_degraded().unwrap());
    }

    #[tokio::test]
    async fn test_cache_failure_falls_back_to_direct_read() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut records = MockKeyRecordQueries::new();
        // The first read fails, the next one answers
        records.expect_list_active_key_ids().returning(move || {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            Box::pin(async move {
                if first {
                    Err(Error::new(ErrorDetails::KeyRecordStoreUnavailable {
                        message: "connection reset".to_string(),
                    }))
                } else {
                    Ok(vec![KeyId(8)])
                }
            })
        });
        records
            .expect_get_key_tiers()
            .returning(|_| Box::pin(async { Ok(HashMap::new()) }));
        records
            .expect_get_key_tier()
            .returning(|_| Box::pin(async { Ok(PriorityTier::Normal) }));
        let store = Arc::new(MemoryBucketStore::new(Duration::from_secs(3600)));
        let pool = KeyPool::new(store, Arc::new(records), &Config::default());

        let selection = pool.select_key(&CandidatePoolHint::default()).await.unwrap();
        assert_eq!(selection.key_id, KeyId(8));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_key_event_wire_format() {
        let event: KeyEvent =
            serde_json::from_str(r#"{"type": "tier_changed", "key_id": 9, "tier": "medium"}"#)
                .unwrap();
        assert_eq!(
            event,
            KeyEvent::TierChanged {
                key_id: KeyId(9),
                tier: PriorityTier::Normal,
            }
        );
        let event: KeyEvent = serde_json::from_str(r#"{"type": "created", "key_id": 1}"#).unwrap();
        assert_eq!(
            event,
            KeyEvent::Created {
                key_id: KeyId(1),
                tier: None,
            }
        );
    }
}
