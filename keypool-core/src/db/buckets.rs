use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::bucket::{BucketParams, BucketSnapshot, KeyId};
use crate::error::Error;

/// Operations against the shared bucket store.
///
/// Every mutating call is a single atomic operation store-side: implementations never
/// read a bucket, compute on the client, and write it back.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait BucketQueries: Send + Sync {
    /// Refill the bucket, then consume `requested_milli` if enough tokens are present.
    /// A missing bucket is created at full capacity from `params` first.
    async fn consume(&self, request: ConsumeRequest) -> Result<ConsumeReceipt, Error>;

    /// Current (refilled) token levels without mutating anything.
    /// Missing buckets are reported at full capacity with `exists = false`.
    /// Results are returned in request order.
    async fn peek(&self, requests: &[PeekRequest]) -> Result<Vec<BucketPeek>, Error>;

    async fn configure(
        &self,
        key_id: KeyId,
        params: BucketParams,
        mode: ConfigureMode,
    ) -> Result<BucketSnapshot, Error>;

    /// Returns how many buckets were actually deleted.
    async fn delete(&self, key_ids: &[KeyId]) -> Result<u64, Error>;

    /// Deletes buckets idle for longer than `idle_ttl`, then least-recently-used
    /// buckets until at most `max_buckets` remain.
    async fn evict(&self, idle_ttl: Duration, max_buckets: u64) -> Result<EvictionReport, Error>;

    /// One page of a cursor-based scan over tracked buckets. A returned cursor of 0 ends the scan.
    async fn scan(&self, cursor: u64, count: usize) -> Result<ScanPage, Error>;

    async fn count(&self) -> Result<u64, Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumeRequest {
    pub key_id: KeyId,
    pub requested_milli: i64,
    pub params: BucketParams,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConsumeReceipt {
    pub key_id: KeyId,
    pub consumed: bool,
    pub tokens_remaining: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeekRequest {
    pub key_id: KeyId,
    pub params: BucketParams,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BucketPeek {
    pub snapshot: BucketSnapshot,
    pub exists: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigureMode {
    /// Create at full capacity if missing, otherwise leave untouched
    Ensure,
    /// Apply new capacity and refill rate, clamping current tokens
    Reconfigure,
    /// Refill to capacity
    Reset,
}

impl ConfigureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigureMode::Ensure => "ensure",
            ConfigureMode::Reconfigure => "reconfigure",
            ConfigureMode::Reset => "reset",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct EvictionReport {
    pub idle_evicted: u64,
    pub lru_evicted: u64,
    pub remaining: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanPage {
    pub cursor: u64,
    pub snapshots: Vec<BucketSnapshot>,
}

/// Backend used when the token bucket subsystem is switched off.
/// Every call fails, which routes selection to the uniform-random path.
pub struct DisabledBucketQueries;

#[async_trait]
impl BucketQueries for DisabledBucketQueries {
    async fn consume(&self, _request: ConsumeRequest) -> Result<ConsumeReceipt, Error> {
        Err(disabled_error())
    }

    async fn peek(&self, _requests: &[PeekRequest]) -> Result<Vec<BucketPeek>, Error> {
        Err(disabled_error())
    }

    async fn configure(
        &self,
        _key_id: KeyId,
        _params: BucketParams,
        _mode: ConfigureMode,
    ) -> Result<BucketSnapshot, Error> {
        Err(disabled_error())
    }

    async fn delete(&self, _key_ids: &[KeyId]) -> Result<u64, Error> {
        Ok(0)
    }

    async fn evict(&self, _idle_ttl: Duration, _max_buckets: u64) -> Result<EvictionReport, Error> {
        Ok(EvictionReport::default())
    }

    async fn scan(&self, _cursor: u64, _count: usize) -> Result<ScanPage, Error> {
        Ok(ScanPage::default())
    }

    async fn count(&self) -> Result<u64, Error> {
        Ok(0)
    }
}

fn disabled_error() -> Error {
    Error::new_quiet(crate::error::ErrorDetails::BucketStoreUnavailable {
        message: "token bucket store is disabled".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_store_fails_reads_and_ignores_maintenance() {
        let store = DisabledBucketQueries;
        let err = store
            .consume(ConsumeRequest {
                key_id: KeyId(1),
                requested_milli: 1_000,
                params: BucketParams::new(10, 1.0),
            })
            .await
            .unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(store.peek(&[]).await.unwrap_err().is_store_unavailable());
        assert_eq!(
            store.evict(Duration::from_secs(60), 10).await.unwrap(),
            EvictionReport::default()
        );
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
