use anyhow::Result;

pub mod bigram;

pub use bigram::BigramPredictor;

/// A trained next-token model.
///
/// Implementations must be deterministic for identical input and must not keep
/// per-call state that the decoder could observe.
pub trait Predictor {
    /// Size of the vocabulary, which is also the length of every logit vector.
    fn num_vocab(&self) -> usize;
    /// Unnormalized scores for the token following `context`.
    fn predict(&self, context: &[u32]) -> Result<Vec<f32>>;
}

impl<P: Predictor + ?Sized> Predictor for &P {
    fn num_vocab(&self) -> usize {
        (**self).num_vocab()
    }

    fn predict(&self, context: &[u32]) -> Result<Vec<f32>> {
        (**self).predict(context)
    }
}

impl<P: Predictor + ?Sized> Predictor for Box<P> {
    fn num_vocab(&self) -> usize {
        (**self).num_vocab()
    }

    fn predict(&self, context: &[u32]) -> Result<Vec<f32>> {
        (**self).predict(context)
    }
}
