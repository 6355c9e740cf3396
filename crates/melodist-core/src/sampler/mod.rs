pub mod greedy;
pub mod multinomial;

pub use greedy::GreedySampler;
pub use multinomial::MultinomialSampler;

pub trait Sampler {
    /// Select one token from a normalized distribution.
    ///
    /// Returns `None` if no token has a positive probability.
    fn sample(&mut self, probs: &[f32]) -> Option<u32>;
}

impl<S: Sampler + ?Sized> Sampler for &mut S {
    fn sample(&mut self, probs: &[f32]) -> Option<u32> {
        (**self).sample(probs)
    }
}

impl<S: Sampler + ?Sized> Sampler for Box<S> {
    fn sample(&mut self, probs: &[f32]) -> Option<u32> {
        (**self).sample(probs)
    }
}
