use rand::Rng;
use rand::seq::IndexedRandom;

use crate::bucket::KeyId;

/// A sampled key and its remaining tokens.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub key_id: KeyId,
    pub tokens: f64,
}

/// Selection weight of a key. A key that cannot serve `required_tokens` weighs nothing,
/// which drops it from the draw without a separate filtering pass.
pub fn weight(tokens: f64, required_tokens: f64) -> f64 {
    if tokens.is_finite() && tokens >= required_tokens && tokens > 0.0 {
        tokens
    } else {
        0.0
    }
}

pub fn has_selectable(candidates: &[Candidate], required_tokens: f64) -> bool {
    candidates
        .iter()
        .any(|candidate| weight(candidate.tokens, required_tokens) > 0.0)
}

/// Draws one key with probability proportional to its weight.
/// Returns `None` when every candidate weighs zero.
pub fn pick_weighted<R: Rng>(
    candidates: &[Candidate],
    required_tokens: f64,
    rng: &mut R,
) -> Option<KeyId> {
    let total: f64 = candidates
        .iter()
        .map(|candidate| weight(candidate.tokens, required_tokens))
        .sum();
    if total <= 0.0 {
        return None;
    }

    let target = rng.random_range(0.0..total);
    let mut cumulative = 0.0;
    let mut last_selectable = None;
    for candidate in candidates {
        let w = weight(candidate.tokens, required_tokens);
        if w <= 0.0 {
            continue;
        }
        cumulative += w;
        last_selectable = Some(candidate.key_id);
        if target < cumulative {
            return Some(candidate.key_id);
        }
    }
    // Floating point sums can land `target` just past the final boundary
    last_selectable
}

/// Picks a key with the highest weight, choosing uniformly among ties.
pub fn pick_greedy<R: Rng>(
    candidates: &[Candidate],
    required_tokens: f64,
    rng: &mut R,
) -> Option<KeyId> {
    let best = candidates
        .iter()
        .map(|candidate| weight(candidate.tokens, required_tokens))
        .fold(0.0, f64::max);
    if best <= 0.0 {
        return None;
    }
    let tied: Vec<KeyId> = candidates
        .iter()
        .filter(|candidate| weight(candidate.tokens, required_tokens) == best)
        .map(|candidate| candidate.key_id)
        .collect();
    tied.choose(rng).copied()
}
