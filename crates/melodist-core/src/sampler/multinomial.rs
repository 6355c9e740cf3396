use itertools::Itertools;

use super::Sampler;

/// Draws a token from the categorical distribution given by the probabilities.
#[derive(Debug, Clone)]
pub struct MultinomialSampler {
    rng: fastrand::Rng,
}

impl MultinomialSampler {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    /// A sampler whose draws are reproducible for a given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }
}

impl Default for MultinomialSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for MultinomialSampler {
    fn sample(&mut self, probs: &[f32]) -> Option<u32> {
        let rand = self.rng.f32();
        // zero-probability tokens are never drawn, even when rounding leaves the sum below 1
        probs
            .iter()
            .enumerate()
            .filter(|(_, &x)| x > 0.0)
            .scan(0.0, |cum, (id, &x)| {
                *cum += x;
                Some((id, *cum))
            })
            .find_or_last(|&(_, cum)| rand < cum)
            .map(|(id, _)| id as u32)
    }
}
