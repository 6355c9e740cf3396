use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("temperature must be finite and greater than 0, got {0}")]
    Temperature(f32),

    #[error("top_k must be in 1..={num_vocab}, got {top_k}")]
    TopK { top_k: usize, num_vocab: usize },

    #[error("ngram_size must be at least 2, got {0}")]
    NgramSize(usize),

    #[error("ngram_penalty must be finite and non-negative, got {0}")]
    NgramPenalty(f32),

    #[error("context_window must be greater than 0")]
    ContextWindow,

    #[error("predictor reports an empty vocabulary")]
    EmptyVocab,

    #[error("predictor failed at step {step}: {source}")]
    Predictor {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("predictor returned {got} logits at step {step}, expected {expected}")]
    LogitLength {
        step: usize,
        expected: usize,
        got: usize,
    },

    #[error("predictor returned {value} for token {token} at step {step}")]
    InvalidLogit { step: usize, token: usize, value: f32 },

    #[error("no token has a finite score at step {step}")]
    NoCandidate { step: usize },

    #[error("generation cancelled after step {step}")]
    Cancelled { step: usize },
}

impl DecodeError {
    /// Whether this error was raised while validating parameters, before any step ran.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Temperature(_)
                | Self::TopK { .. }
                | Self::NgramSize(_)
                | Self::NgramPenalty(_)
                | Self::ContextWindow
                | Self::EmptyVocab
        )
    }
}
