//! Periodic maintenance: bucket eviction and, optionally, eager reloads of the
//! active-key cache. Both loops exit when the shutdown token is cancelled.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::pool::KeyPool;

/// Starts the maintenance loops on `tracker`.
pub fn spawn_background_tasks(
    pool: &KeyPool,
    config: &Config,
    tracker: &TaskTracker,
    token: &CancellationToken,
) {
    tracing::info!(
        interval_s = config.token_bucket.eviction.interval_s,
        "Starting bucket eviction loop"
    );
    tracker.spawn(eviction_loop(
        pool.clone(),
        config.token_bucket.eviction.interval(),
        token.clone(),
    ));

    if let Some(interval) = config.cache.refresh_interval() {
        tracing::info!(
            interval_s = interval.as_secs(),
            "Starting active key refresh loop"
        );
        tracker.spawn(refresh_loop(pool.clone(), interval, token.clone()));
    }
}

fn skipping_interval(period: Duration) -> time::Interval {
    // The first tick would fire immediately
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub async fn eviction_loop(pool: KeyPool, period: Duration, token: CancellationToken) {
    let mut interval = skipping_interval(period);
    loop {
        tokio::select! {
            () = token.cancelled() => {
                tracing::debug!("Eviction loop stopped");
                break;
            }
            _ = interval.tick() => {}
        }
        if let Err(e) = pool.buckets().cleanup().await {
            tracing::warn!("Scheduled bucket eviction failed: {e}");
        }
    }
}

pub async fn refresh_loop(pool: KeyPool, period: Duration, token: CancellationToken) {
    let mut interval = skipping_interval(period);
    loop {
        tokio::select! {
            () = token.cancelled() => {
                tracing::debug!("Active key refresh loop stopped");
                break;
            }
            _ = interval.tick() => {}
        }
        // The cache keeps serving the previous set when a refresh fails
        if let Err(e) = pool.active_keys().refresh().await {
            tracing::warn!("Scheduled active key refresh failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing_test::traced_test;

    use super::*;
    use crate::bucket::KeyId;
    use crate::config::PriorityTier;
    use crate::db::memory::{ManualClock, MemoryBucketStore};
    use crate::db::{BucketQueries, InMemoryKeyRecords};
    use crate::selection::CandidatePoolHint;

    const START_US: i64 = 1_700_000_000_000_000;

    #[tokio::test(start_paused = true)]
    async fn test_eviction_loop_runs_on_schedule_and_stops() {
        let clock = Arc::new(ManualClock::new(START_US));
        let store = Arc::new(MemoryBucketStore::new_with_clock(
            Duration::from_secs(86_400),
            clock.clone(),
        ));
        let records = Arc::new(InMemoryKeyRecords::with_active([1]));
        let pool = KeyPool::new(store.clone(), records, &Config::default());
        pool.select_key(&CandidatePoolHint::default()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        spawn_background_tasks(&pool, &Config::default(), &tracker, &token);

        clock.advance(Duration::from_secs(2 * 3600));
        time::sleep(Duration::from_secs(299)).await;
        assert_eq!(store.count().await.unwrap(), 1);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.count().await.unwrap(), 0);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_picks_up_new_keys() {
        let store = Arc::new(MemoryBucketStore::new(Duration::from_secs(3600)));
        let records = Arc::new(InMemoryKeyRecords::with_active([1]));
        let mut config = Config::default();
        config.cache.active_keys_ttl_ms = 600_000;
        config.cache.refresh_interval_s = Some(10);
        let pool = KeyPool::new(store, records.clone(), &config);
        assert_eq!(pool.active_key_ids().await.unwrap().len(), 1);

        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        spawn_background_tasks(&pool, &config, &tracker, &token);

        records.upsert(KeyId(2), true, PriorityTier::Normal);
        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(pool.active_keys().cached_count().unwrap(), 2);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_refresh_loop_survives_record_store_outage() {
        let store = Arc::new(MemoryBucketStore::new(Duration::from_secs(3600)));
        let records = Arc::new(InMemoryKeyRecords::with_active([1]));
        records.set_unavailable(true);
        let pool = KeyPool::new(store, records.clone(), &Config::default());

        let token = CancellationToken::new();
        let run = refresh_loop(pool.clone(), Duration::from_secs(10), token.clone());
        let drive = async {
            time::sleep(Duration::from_secs(11)).await;
            assert_eq!(pool.active_keys().cached_count().unwrap(), 0);

            records.set_unavailable(false);
            time::sleep(Duration::from_secs(10)).await;
            assert_eq!(pool.active_keys().cached_count().unwrap(), 1);
            token.cancel();
        };
        futures::join!(run, drive);

        assert!(logs_contain("Scheduled active key refresh failed"));
    }
}
