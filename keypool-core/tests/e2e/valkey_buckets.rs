use std::time::Duration;

use keypool_core::bucket::{BucketParams, KeyId};
use keypool_core::db::{BucketQueries, ConfigureMode, ConsumeRequest, PeekRequest};

use crate::common::isolated_store;

fn consume_one(key_id: i64, params: BucketParams) -> ConsumeRequest {
    ConsumeRequest {
        key_id: KeyId(key_id),
        requested_milli: 1_000,
        params,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capacity_then_refill() {
    let store = isolated_store().await;
    let params = BucketParams::new(10, 1.0);

    for i in 0..10 {
        let receipt = store.consume(consume_one(1, params)).await.unwrap();
        assert!(receipt.consumed, "consume {i} should succeed");
    }
    let receipt = store.consume(consume_one(1, params)).await.unwrap();
    assert!(!receipt.consumed);
    assert!(receipt.tokens_remaining < 1.0);

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    let receipt = store.consume(consume_one(1, params)).await.unwrap();
    assert!(receipt.consumed);
    assert!(
        (1.0..=10.0).contains(&receipt.tokens_remaining),
        "tokens_remaining = {}",
        receipt.tokens_remaining
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_consumes_never_exceed_tokens() {
    let store = isolated_store().await;
    let params = BucketParams::new(5, 0.0);
    store
        .configure(KeyId(7), params, ConfigureMode::Ensure)
        .await
        .unwrap();

    let attempts = (0..40).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.consume(consume_one(7, params)).await.unwrap() })
    });
    let receipts = futures::future::join_all(attempts).await;
    let successes = receipts
        .into_iter()
        .filter(|receipt| receipt.as_ref().unwrap().consumed)
        .count();
    assert_eq!(successes, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peek_reports_missing_and_existing_buckets() {
    let store = isolated_store().await;
    let params = BucketParams::new(10, 1.0);
    store.consume(consume_one(2, params)).await.unwrap();

    // More keys than fit in one command, so the pipelined path is used
    let requests: Vec<PeekRequest> = (0..250)
        .map(|id| PeekRequest {
            key_id: KeyId(id),
            params,
        })
        .collect();
    let peeks = store.peek(&requests).await.unwrap();
    assert_eq!(peeks.len(), 250);
    for (id, peek) in peeks.iter().enumerate() {
        assert_eq!(peek.snapshot.key_id, KeyId(id as i64));
        assert_eq!(peek.exists, id == 2);
        assert!(peek.snapshot.tokens <= 10.0);
    }
    assert!(peeks[2].snapshot.tokens < 10.0);
    assert_eq!(peeks[3].snapshot.tokens, 10.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_configure_delete_scan_and_evict() {
    let store = isolated_store().await;
    for id in 0..20 {
        store
            .configure(KeyId(id), BucketParams::new(10, 1.0), ConfigureMode::Ensure)
            .await
            .unwrap();
    }
    assert_eq!(store.count().await.unwrap(), 20);

    let snapshot = store
        .configure(KeyId(0), BucketParams::new(4, 2.0), ConfigureMode::Reconfigure)
        .await
        .unwrap();
    assert_eq!(snapshot.capacity, 4.0);
    assert_eq!(snapshot.tokens, 4.0);

    assert_eq!(store.delete(&[KeyId(0), KeyId(99)]).await.unwrap(), 1);

    let mut seen = Vec::new();
    let mut cursor = 0;
    loop {
        let page = store.scan(cursor, 7).await.unwrap();
        seen.extend(page.snapshots.iter().map(|snapshot| snapshot.key_id));
        if page.cursor == 0 {
            break;
        }
        cursor = page.cursor;
    }
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen, (1..20).map(KeyId).collect::<Vec<_>>());

    let report = store.evict(Duration::from_secs(3600), 10).await.unwrap();
    assert_eq!(report.idle_evicted, 0);
    assert_eq!(report.lru_evicted, 9);
    assert_eq!(report.remaining, 10);
    assert_eq!(store.count().await.unwrap(), 10);
}
