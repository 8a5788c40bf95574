use std::sync::Arc;

use keypool_core::config::BucketStoreConfig;
use keypool_core::db::valkey::{ValkeyBucketStore, ValkeyConnectionInfo};

/// Valkey used by the end-to-end tests
pub fn valkey_url() -> String {
    std::env::var("KEYPOOL_VALKEY_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// A bucket store under a fresh key prefix, so concurrent test runs never share buckets.
pub async fn isolated_store() -> Arc<ValkeyBucketStore> {
    let connection = ValkeyConnectionInfo::new(&valkey_url()).await.unwrap();
    let config = BucketStoreConfig {
        key_prefix: format!("keypool-e2e-{:016x}", rand::random::<u64>()),
        ..Default::default()
    };
    Arc::new(ValkeyBucketStore::new(connection, &config))
}
