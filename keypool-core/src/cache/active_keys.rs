use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::time::Instant;

use crate::bucket::KeyId;
use crate::db::KeyRecordQueries;
use crate::error::{Error, ErrorDetails};

type SharedLoad = Shared<BoxFuture<'static, Result<Arc<Vec<KeyId>>, Error>>>;

/// Whether the last read was served from a fresh entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// Result of comparing the cached set against the authoritative one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AccuracyCheck {
    pub cached_count: usize,
    pub actual_count: usize,
    pub accurate: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_requests: u64,
}

struct Entry {
    keys: Arc<Vec<KeyId>>,
    /// `None` once invalidated. The keys stay around so a failed reload can still serve them.
    fresh_until: Option<Instant>,
}

struct InFlight {
    generation: u64,
    load: SharedLoad,
}

#[derive(Default)]
struct State {
    entry: Option<Entry>,
    generation: u64,
    inflight: Option<InFlight>,
    /// Set when the last reload failed and a stale set was served in its place
    degraded: bool,
    last_accuracy: Option<AccuracyCheck>,
}

/// Short-lived copy of the active key ids.
///
/// An expired entry is reloaded on the next read. Concurrent readers that find the entry
/// expired share one reload. `invalidate` bumps a generation counter so that a reload
/// started before the invalidation can never repopulate the cache.
pub struct ActiveKeyCache {
    source: Arc<dyn KeyRecordQueries>,
    ttl: Duration,
    state: Mutex<State>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ActiveKeyCache {
    pub fn new(source: Arc<dyn KeyRecordQueries>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            state: Mutex::new(State::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, Error> {
        self.state.lock().map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("active key cache lock poisoned: {e}"),
            })
        })
    }

    pub async fn get_active_key_ids(&self) -> Result<Arc<Vec<KeyId>>, Error> {
        let (generation, load) = {
            let mut state = self.lock()?;
            if let Some(entry) = &state.entry
                && entry.fresh_until.is_some_and(|until| Instant::now() < until)
            {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.keys.clone());
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.join_or_start_load(&mut state)
        };
        self.finish_load(generation, load).await
    }

    /// Reloads immediately instead of waiting for the next read.
    pub async fn refresh(&self) -> Result<Arc<Vec<KeyId>>, Error> {
        let (generation, load) = {
            let mut state = self.lock()?;
            state.generation += 1;
            state.inflight = None;
            self.join_or_start_load(&mut state)
        };
        self.finish_load(generation, load).await
    }

    /// The next read goes to the key record store.
    pub fn invalidate(&self) -> Result<(), Error> {
        let mut state = self.lock()?;
        state.generation += 1;
        state.inflight = None;
        if let Some(entry) = &mut state.entry {
            entry.fresh_until = None;
        }
        Ok(())
    }

    /// Reads straight from the key record store, bypassing the cache.
    pub async fn load_uncached(&self) -> Result<Vec<KeyId>, Error> {
        self.source.list_active_key_ids().await
    }

    fn join_or_start_load(&self, state: &mut State) -> (u64, SharedLoad) {
        if let Some(inflight) = &state.inflight
            && inflight.generation == state.generation
        {
            return (inflight.generation, inflight.load.clone());
        }
        let source = self.source.clone();
        let load = async move { source.list_active_key_ids().await.map(Arc::new) }
            .boxed()
            .shared();
        state.inflight = Some(InFlight {
            generation: state.generation,
            load: load.clone(),
        });
        (state.generation, load)
    }

    async fn finish_load(
        &self,
        generation: u64,
        load: SharedLoad,
    ) -> Result<Arc<Vec<KeyId>>, Error> {
        let result = load.await;

        let mut state = self.lock()?;
        if state
            .inflight
            .as_ref()
            .is_some_and(|inflight| inflight.generation == generation)
        {
            state.inflight = None;
        }

        match result {
            Ok(keys) => {
                if generation == state.generation {
                    state.entry = Some(Entry {
                        keys: keys.clone(),
                        fresh_until: Some(Instant::now() + self.ttl),
                    });
                    state.degraded = false;
                    metrics::counter!("keypool_cache_reloads_total", "result" => "ok")
                        .increment(1);
                }
                Ok(keys)
            }
            Err(e) => {
                metrics::counter!("keypool_cache_reloads_total", "result" => "error")
                    .increment(1);
                let stale = state.entry.as_ref().map(|entry| entry.keys.clone());
                match stale {
                    Some(keys) => {
                        state.degraded = true;
                        tracing::warn!(
                            cached_keys = keys.len(),
                            "Serving stale active key set after failed reload: {e}"
                        );
                        Ok(keys)
                    }
                    None => Err(Error::new(ErrorDetails::CacheReload {
                        message: e.to_string(),
                    })),
                }
            }
        }
    }

    /// Compares the cached count against a fresh count from the key record store and
    /// remembers the outcome.
    pub async fn check_accuracy(&self) -> Result<AccuracyCheck, Error> {
        let cached_count = self.cached_count()?;
        let actual_count = self.source.list_active_key_ids().await?.len();
        let check = AccuracyCheck {
            cached_count,
            actual_count,
            accurate: cached_count == actual_count,
            checked_at: Utc::now(),
        };
        self.lock()?.last_accuracy = Some(check);
        Ok(check)
    }

    pub fn last_accuracy(&self) -> Result<Option<AccuracyCheck>, Error> {
        Ok(self.lock()?.last_accuracy)
    }

    pub fn cached_count(&self) -> Result<usize, Error> {
        Ok(self
            .lock()?
            .entry
            .as_ref()
            .map(|entry| entry.keys.len())
            .unwrap_or(0))
    }

    pub fn status(&self) -> Result<CacheStatus, Error> {
        let state = self.lock()?;
        let fresh = state
            .entry
            .as_ref()
            .and_then(|entry| entry.fresh_until)
            .is_some_and(|until| Instant::now() < until);
        Ok(if fresh {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        })
    }

    pub fn is_degraded(&self) -> Result<bool, Error> {
        Ok(self.lock()?.degraded)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            hits as f64 / total_requests as f64
        };
        CacheStats {
            hits,
            misses,
            hit_rate,
            total_requests,
        }
    }

    pub fn reset_statistics(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
