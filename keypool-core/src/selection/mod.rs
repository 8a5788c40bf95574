//! Token-aware key selection.
//!
//! Selection runs in two explicit states. `Weighted` samples the active set, reads
//! bucket levels and reserves a token on the chosen key. Any of three conditions moves
//! it to `Fallback`: the bucket store failing or timing out, every sampled key being
//! out of tokens, or losing the reservation race too many times. `Fallback` picks
//! uniformly from the active set without touching buckets, so a non-empty active set
//! always yields a key unless random fallback is switched off.

mod sampling;
mod weights;

use std::collections::HashSet;
use std::fmt::Display;

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub use sampling::{SampleSchedule, sample_keys};
pub use weights::{Candidate, has_selectable, pick_greedy, pick_weighted, weight};

use crate::bucket::KeyId;
use crate::bucket_manager::BucketManager;
use crate::config::{SelectionConfig, SelectionStrategy, TokenBucketConfig};
use crate::error::{Error, ErrorDetails};

/// Constraints supplied by the caller for one selection.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CandidatePoolHint {
    /// Keys that must not be returned, e.g. ones that just failed upstream
    #[serde(default)]
    pub exclude: HashSet<KeyId>,
    #[serde(default = "default_required_tokens")]
    pub required_tokens: u32,
}

fn default_required_tokens() -> u32 {
    1
}

impl Default for CandidatePoolHint {
    fn default() -> Self {
        Self {
            exclude: HashSet::new(),
            required_tokens: default_required_tokens(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    StoreUnavailable,
    AllExhausted,
    RaceLost,
    Disabled,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::StoreUnavailable => "store_unavailable",
            FallbackReason::AllExhausted => "all_exhausted",
            FallbackReason::RaceLost => "race_lost",
            FallbackReason::Disabled => "disabled",
        }
    }
}

impl Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the returned key was chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectionMode {
    Weighted,
    Greedy,
    Random { reason: FallbackReason },
}

impl SelectionMode {
    fn outcome(&self) -> &'static str {
        match self {
            SelectionMode::Weighted => "weighted",
            SelectionMode::Greedy => "greedy",
            SelectionMode::Random { .. } => "random",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Selection {
    pub key_id: KeyId,
    #[serde(flatten)]
    pub mode: SelectionMode,
    /// Tokens left on the chosen key after the reservation. `None` when no bucket was touched.
    pub tokens_remaining: Option<f64>,
    pub sampled: usize,
    pub attempts: usize,
}

enum SelectionState {
    Weighted,
    Fallback { reason: FallbackReason, sampled: usize },
}

/// Outcome of the token-aware phase.
enum WeightedOutcome {
    Selected(Selection),
    Fallback { reason: FallbackReason, sampled: usize },
}

#[derive(Clone)]
pub struct KeySelector {
    buckets: BucketManager,
    config: SelectionConfig,
    enabled: bool,
    fallback_to_random: bool,
}

impl KeySelector {
    pub fn new(
        buckets: BucketManager,
        config: SelectionConfig,
        token_bucket: &TokenBucketConfig,
    ) -> Self {
        Self {
            buckets,
            config,
            enabled: token_bucket.enabled,
            fallback_to_random: token_bucket.fallback_to_random,
        }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Chooses a key from `active_key_ids` and reserves `hint.required_tokens` on it.
    pub async fn select_key(
        &self,
        active_key_ids: &[KeyId],
        hint: &CandidatePoolHint,
    ) -> Result<Selection, Error> {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        self.select_key_with_rng(active_key_ids, hint, &mut rng)
            .await
    }

    pub async fn select_key_with_rng<R: Rng + Send>(
        &self,
        active_key_ids: &[KeyId],
        hint: &CandidatePoolHint,
        rng: &mut R,
    ) -> Result<Selection, Error> {
        let eligible: Vec<KeyId> = active_key_ids
            .iter()
            .copied()
            .filter(|key_id| !hint.exclude.contains(key_id))
            .collect();
        let result = self.select_from(&eligible, hint, rng).await;
        match &result {
            Ok(selection) => {
                metrics::counter!("keypool_selections_total", "outcome" => selection.mode.outcome())
                    .increment(1);
                tracing::debug!(
                    key_id = %selection.key_id,
                    mode = selection.mode.outcome(),
                    sampled = selection.sampled,
                    attempts = selection.attempts,
                    "Selected key"
                );
            }
            Err(_) => {
                metrics::counter!("keypool_selections_total", "outcome" => "error").increment(1);
            }
        }
        result
    }

    async fn select_from<R: Rng + Send>(
        &self,
        eligible: &[KeyId],
        hint: &CandidatePoolHint,
        rng: &mut R,
    ) -> Result<Selection, Error> {
        if eligible.is_empty() {
            return Err(Error::new(ErrorDetails::NoAvailableKey));
        }

        let mut state = if self.enabled {
            SelectionState::Weighted
        } else {
            SelectionState::Fallback {
                reason: FallbackReason::Disabled,
                sampled: 0,
            }
        };

        loop {
            state = match state {
                SelectionState::Weighted => {
                    match self.select_weighted(eligible, hint, rng).await? {
                        WeightedOutcome::Selected(selection) => return Ok(selection),
                        WeightedOutcome::Fallback { reason, sampled } => {
                            SelectionState::Fallback { reason, sampled }
                        }
                    }
                }
                SelectionState::Fallback { reason, sampled } => {
                    return self.select_random(eligible, reason, sampled, rng);
                }
            };
        }
    }

    async fn select_weighted<R: Rng + Send>(
        &self,
        eligible: &[KeyId],
        hint: &CandidatePoolHint,
        rng: &mut R,
    ) -> Result<WeightedOutcome, Error> {
        let required = f64::from(hint.required_tokens);

        // Grow the sample until it holds a key with enough tokens
        let mut candidates: Vec<Candidate> = Vec::new();
        for size in SampleSchedule::new(&self.config, eligible.len()) {
            let sample = sample_keys(eligible, size, rng);
            let levels = match self.buckets.token_levels(&sample).await {
                Ok(levels) => levels,
                Err(e) if e.is_store_unavailable() => {
                    tracing::warn!("Bucket store unavailable during selection: {e}");
                    return Ok(WeightedOutcome::Fallback {
                        reason: FallbackReason::StoreUnavailable,
                        sampled: sample.len(),
                    });
                }
                Err(e) => return Err(e),
            };
            candidates = levels
                .into_iter()
                .map(|peek| Candidate {
                    key_id: peek.snapshot.key_id,
                    tokens: peek.snapshot.tokens,
                })
                .collect();
            if has_selectable(&candidates, required) {
                break;
            }
        }
        let sampled = candidates.len();

        // Reserve a token, retrying among the rest of the sample when another replica wins
        let mut attempts = 0;
        while attempts <= self.config.max_race_retries {
            let picked = match self.config.strategy {
                SelectionStrategy::Weighted => pick_weighted(&candidates, required, rng),
                SelectionStrategy::Greedy => pick_greedy(&candidates, required, rng),
            };
            let Some(key_id) = picked else {
                let reason = if attempts == 0 {
                    FallbackReason::AllExhausted
                } else {
                    FallbackReason::RaceLost
                };
                return Ok(WeightedOutcome::Fallback { reason, sampled });
            };
            attempts += 1;

            match self
                .buckets
                .refill_and_try_consume(key_id, hint.required_tokens)
                .await
            {
                Ok(receipt) if receipt.consumed => {
                    return Ok(WeightedOutcome::Selected(Selection {
                        key_id,
                        mode: match self.config.strategy {
                            SelectionStrategy::Weighted => SelectionMode::Weighted,
                            SelectionStrategy::Greedy => SelectionMode::Greedy,
                        },
                        tokens_remaining: Some(receipt.tokens_remaining),
                        sampled,
                        attempts,
                    }));
                }
                Ok(receipt) => {
                    let race = Error::new_quiet(ErrorDetails::RaceLost {
                        key_id,
                        tokens_remaining: receipt.tokens_remaining,
                    });
                    tracing::debug!(attempt = attempts, "{race}");
                    candidates.retain(|candidate| candidate.key_id != key_id);
                }
                Err(e) if e.is_store_unavailable() => {
                    tracing::warn!("Bucket store unavailable while reserving a token: {e}");
                    return Ok(WeightedOutcome::Fallback {
                        reason: FallbackReason::StoreUnavailable,
                        sampled,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(WeightedOutcome::Fallback {
            reason: FallbackReason::RaceLost,
            sampled,
        })
    }

    fn select_random<R: Rng>(
        &self,
        eligible: &[KeyId],
        reason: FallbackReason,
        sampled: usize,
        rng: &mut R,
    ) -> Result<Selection, Error> {
        if reason != FallbackReason::Disabled && !self.fallback_to_random {
            return Err(match reason {
                FallbackReason::StoreUnavailable => {
                    Error::new(ErrorDetails::BucketStoreUnavailable {
                        message: "random fallback is disabled".to_string(),
                    })
                }
                _ => Error::new(ErrorDetails::AllKeysExhausted { sampled }),
            });
        }

        metrics::counter!("keypool_fallbacks_total", "reason" => reason.as_str()).increment(1);
        if reason != FallbackReason::Disabled {
            tracing::info!(%reason, sampled, "Falling back to uniform random key selection");
        }
        let key_id = eligible
            .choose(rng)
            .copied()
            .ok_or_else(|| Error::new(ErrorDetails::NoAvailableKey))?;
        Ok(Selection {
            key_id,
            mode: SelectionMode::Random { reason },
            tokens_remaining: None,
            sampled,
            attempts: 0,
        })
    }
}
