//! Operator-facing view of the active-key cache.

use serde::Serialize;

use crate::cache::{CacheStats, CacheStatus};
use crate::error::Error;
use crate::pool::KeyPool;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheStatusReport {
    pub status: CacheStatus,
    pub cached_count: usize,
    pub actual_count: usize,
    /// `false` when the counts differ or the key record store could not be asked
    pub accuracy: bool,
    pub ttl_seconds: f64,
    /// The last reload failed and an older set is being served
    pub degraded: bool,
    pub stats: CacheStats,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CacheRefreshReport {
    pub cached_keys_count: usize,
}

impl KeyPool {
    pub async fn get_cache_status(&self) -> Result<CacheStatusReport, Error> {
        let cache = self.active_keys();
        // Read before the accuracy check, which does not count as a cache read
        let status = cache.status()?;
        let (cached_count, actual_count, accuracy) = match cache.check_accuracy().await {
            Ok(check) => (check.cached_count, check.actual_count, check.accurate),
            Err(e) => {
                tracing::warn!("Could not verify active key cache accuracy: {e}");
                let cached_count = cache.cached_count()?;
                let actual_count = cache
                    .last_accuracy()?
                    .map(|check| check.actual_count)
                    .unwrap_or(cached_count);
                (cached_count, actual_count, false)
            }
        };
        Ok(CacheStatusReport {
            status,
            cached_count,
            actual_count,
            accuracy,
            ttl_seconds: cache.ttl().as_secs_f64(),
            degraded: cache.is_degraded()?,
            stats: cache.stats(),
        })
    }

    /// Forces the next read of the active set and of every bucket level to go to the stores.
    pub fn invalidate_cache(&self) -> Result<(), Error> {
        self.active_keys().invalidate()?;
        self.buckets().snapshots().invalidate_all();
        tracing::info!("Invalidated key caches");
        Ok(())
    }

    pub async fn refresh_cache(&self) -> Result<CacheRefreshReport, Error> {
        let keys = self.active_keys().refresh().await?;
        tracing::info!(cached_keys_count = keys.len(), "Refreshed active key cache");
        Ok(CacheRefreshReport {
            cached_keys_count: keys.len(),
        })
    }

    pub fn reset_statistics(&self) {
        self.active_keys().reset_statistics();
    }
}
