use rand::Rng;

use crate::bucket::KeyId;
use crate::config::SelectionConfig;

/// Sample sizes tried in order: the initial size, then geometric growth up to the
/// ceiling or the size of the population, whichever comes first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleSchedule {
    next: Option<usize>,
    max: usize,
    growth: usize,
}

impl SampleSchedule {
    pub fn new(config: &SelectionConfig, population: usize) -> Self {
        let first = config.initial_sample_size.min(population);
        Self {
            next: (first > 0).then_some(first),
            max: config.max_sample_size.min(population),
            growth: config.sample_growth_factor.max(2),
        }
    }
}

impl Iterator for SampleSchedule {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.next?;
        self.next = if current >= self.max {
            None
        } else {
            Some(current.saturating_mul(self.growth).min(self.max))
        };
        Some(current)
    }
}

/// Draws `size` distinct keys without replacement. Returns every key when `size`
/// covers the whole set.
pub fn sample_keys<R: Rng>(keys: &[KeyId], size: usize, rng: &mut R) -> Vec<KeyId> {
    if size >= keys.len() {
        return keys.to_vec();
    }
    rand::seq::index::sample(rng, keys.len(), size)
        .into_iter()
        .map(|index| keys[index])
        .collect()
}
