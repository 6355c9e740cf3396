use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod decoder;
pub mod error;
pub mod logits;
mod ngram;
pub mod predictor;
pub mod sampler;

pub use decoder::{Checkpoint, Decoder, DecoderParams, Generation};
pub use error::{DecodeError, Result};
pub use predictor::Predictor;
pub use sampler::Sampler;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerateKind {
    /// A single melodic line; at most one note sounds at a time.
    #[default]
    Melody,
    /// Chordal accompaniment; notes may overlap.
    #[serde(alias = "acc")]
    Accompaniment,
}

impl GenerateKind {
    pub fn monophonic(self) -> bool {
        matches!(self, Self::Melody)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TokenCounter {
    /// Tokens kept from the seed.
    pub seed: usize,
    /// Tokens appended by generation.
    pub generated: usize,
    pub total: usize,
    pub duration: Duration,
}
