use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::time::timeout;

use crate::bucket::KeyId;
use crate::config::PriorityTier;
use crate::error::{Error, ErrorDetails};

/// Read access to the external key records. This is the authoritative source
/// behind the active-key cache.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait KeyRecordQueries: Send + Sync {
    async fn list_active_key_ids(&self) -> Result<Vec<KeyId>, Error>;

    async fn get_key_tier(&self, key_id: KeyId) -> Result<PriorityTier, Error>;

    /// Keys missing from the result are unknown to the record store.
    async fn get_key_tiers(
        &self,
        key_ids: &[KeyId],
    ) -> Result<HashMap<KeyId, PriorityTier>, Error>;
}

/// Bounds every call to the wrapped record store. A call that runs past the timeout
/// fails with `KeyRecordStoreUnavailable`, the same as an unreachable store.
pub struct TimedKeyRecords {
    inner: Arc<dyn KeyRecordQueries>,
    timeout: Duration,
}

impl TimedKeyRecords {
    pub fn new(inner: Arc<dyn KeyRecordQueries>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::new_quiet(ErrorDetails::KeyRecordStoreUnavailable {
                message: format!("{operation} timed out after {}ms", self.timeout.as_millis()),
            })),
        }
    }
}

#[async_trait]
impl KeyRecordQueries for TimedKeyRecords {
    async fn list_active_key_ids(&self) -> Result<Vec<KeyId>, Error> {
        self.bounded("list active keys", self.inner.list_active_key_ids())
            .await
    }

    async fn get_key_tier(&self, key_id: KeyId) -> Result<PriorityTier, Error> {
        self.bounded("get key tier", self.inner.get_key_tier(key_id))
            .await
    }

    async fn get_key_tiers(
        &self,
        key_ids: &[KeyId],
    ) -> Result<HashMap<KeyId, PriorityTier>, Error> {
        self.bounded("get key tiers", self.inner.get_key_tiers(key_ids))
            .await
    }
}

#[cfg(any(test, feature = "e2e_tests"))]
pub use in_memory::InMemoryKeyRecords;

#[cfg(any(test, feature = "e2e_tests"))]
mod in_memory {
    use std::collections::HashMap;
    use std::sync::RwLock;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;

    use super::KeyRecordQueries;
    use crate::bucket::KeyId;
    use crate::config::PriorityTier;
    use crate::error::{Error, ErrorDetails};

    #[derive(Clone, Copy, Debug)]
    struct Record {
        active: bool,
        tier: PriorityTier,
    }

    /// Key records held in memory, for tests.
    #[derive(Debug, Default)]
    pub struct InMemoryKeyRecords {
        records: RwLock<HashMap<KeyId, Record>>,
        unavailable: std::sync::atomic::AtomicBool,
        stalled: std::sync::atomic::AtomicBool,
        list_calls: AtomicU64,
    }

    impl InMemoryKeyRecords {
        pub fn with_active(key_ids: impl IntoIterator<Item = i64>) -> Self {
            let records = Self::default();
            for id in key_ids {
                records.upsert(KeyId(id), true, PriorityTier::Normal);
            }
            records
        }

        pub fn upsert(&self, key_id: KeyId, active: bool, tier: PriorityTier) {
            if let Ok(mut records) = self.records.write() {
                records.insert(key_id, Record { active, tier });
            }
        }

        pub fn remove(&self, key_id: KeyId) {
            if let Ok(mut records) = self.records.write() {
                records.remove(&key_id);
            }
        }

        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::Relaxed);
        }

        /// While set, every call hangs until the caller gives up
        pub fn set_stalled(&self, stalled: bool) {
            self.stalled.store(stalled, Ordering::Relaxed);
        }

        async fn wait_if_stalled(&self) {
            if self.stalled.load(Ordering::Relaxed) {
                std::future::pending::<()>().await;
            }
        }

        /// Number of `list_active_key_ids` calls served so far
        pub fn list_calls(&self) -> u64 {
            self.list_calls.load(Ordering::Relaxed)
        }

        fn check_available(&self) -> Result<(), Error> {
            if self.unavailable.load(Ordering::Relaxed) {
                return Err(Error::new(ErrorDetails::KeyRecordStoreUnavailable {
                    message: "simulated outage".to_string(),
                }));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyRecordQueries for InMemoryKeyRecords {
        async fn list_active_key_ids(&self) -> Result<Vec<KeyId>, Error> {
            self.list_calls.fetch_add(1, Ordering::Relaxed);
            self.wait_if_stalled().await;
            self.check_available()?;
            let records = self.records.read().map_err(|e| {
                Error::new(ErrorDetails::InternalError {
                    message: format!("key record lock poisoned: {e}"),
                })
            })?;
            let mut ids: Vec<KeyId> = records
                .iter()
                .filter(|(_, record)| record.active)
                .map(|(id, _)| *id)
                .collect();
            ids.sort_unstable();
            Ok(ids)
        }

        async fn get_key_tier(&self, key_id: KeyId) -> Result<PriorityTier, Error> {
            let tiers = self.get_key_tiers(&[key_id]).await?;
            Ok(tiers.get(&key_id).copied().unwrap_or_default())
        }

        async fn get_key_tiers(
            &self,
            key_ids: &[KeyId],
        ) -> Result<HashMap<KeyId, PriorityTier>, Error> {
            self.wait_if_stalled().await;
            self.check_available()?;
            let records = self.records.read().map_err(|e| {
                Error::new(ErrorDetails::InternalError {
                    message: format!("key record lock poisoned: {e}"),
                })
            })?;
            Ok(key_ids
                .iter()
                .filter_map(|id| records.get(id).map(|record| (*id, record.tier)))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timed(inner: MockKeyRecordQueries) -> TimedKeyRecords {
        TimedKeyRecords::new(Arc::new(inner), Duration::from_millis(500))
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_record_store_times_out_as_unavailable() {
        let mut inner = MockKeyRecordQueries::new();
        inner
            .expect_list_active_key_ids()
            .returning(|| Box::pin(std::future::pending()));
        inner
            .expect_get_key_tiers()
            .returning(|_| Box::pin(std::future::pending()));
        let records = timed(inner);

        let err = records.list_active_key_ids().await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::KeyRecordStoreUnavailable { .. }
        ));
        let err = records.get_key_tiers(&[KeyId(1)]).await.unwrap_err();
        assert!(err.to_string().contains("timed out after 500ms"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_answers_pass_through() {
        let mut inner = MockKeyRecordQueries::new();
        inner
            .expect_get_key_tier()
            .returning(|_| Box::pin(async { Ok(PriorityTier::High) }));
        let records = timed(inner);
        assert_eq!(
            records.get_key_tier(KeyId(3)).await.unwrap(),
            PriorityTier::High
        );
    }
}
