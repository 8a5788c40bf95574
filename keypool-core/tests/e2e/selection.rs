use std::sync::Arc;

use keypool_core::bucket::{BucketParams, KeyId};
use keypool_core::config::Config;
use keypool_core::db::{BucketQueries, ConsumeRequest, InMemoryKeyRecords};
use keypool_core::pool::{KeyEvent, KeyPool};
use keypool_core::selection::{CandidatePoolHint, SelectionMode};

use crate::common::isolated_store;

#[tokio::test(flavor = "multi_thread")]
async fn test_selection_skips_drained_keys() {
    let store = isolated_store().await;
    let records = Arc::new(InMemoryKeyRecords::with_active([1, 2, 3]));
    let pool = KeyPool::new(store.clone(), records, &Config::default());

    for key_id in [1, 2] {
        store
            .consume(ConsumeRequest {
                key_id: KeyId(key_id),
                requested_milli: 10_000,
                params: BucketParams::new(10, 1.0),
            })
            .await
            .unwrap();
    }

    let selection = pool.select_key(&CandidatePoolHint::default()).await.unwrap();
    assert_eq!(selection.key_id, KeyId(3));
    assert_eq!(selection.mode, SelectionMode::Weighted);
    assert_eq!(selection.tokens_remaining, Some(9.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deleted_key_event_removes_bucket() {
    let store = isolated_store().await;
    let records = Arc::new(InMemoryKeyRecords::with_active([5]));
    let pool = KeyPool::new(store.clone(), records.clone(), &Config::default());

    pool.select_key(&CandidatePoolHint::default()).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 1);

    records.remove(KeyId(5));
    let report = pool
        .handle_key_event(KeyEvent::Deleted { key_id: KeyId(5) })
        .await
        .unwrap();
    assert_eq!(report.buckets_deleted, 1);
    assert_eq!(store.count().await.unwrap(), 0);
    assert!(pool.active_key_ids().await.unwrap().is_empty());
}
