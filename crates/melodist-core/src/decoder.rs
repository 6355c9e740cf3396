use std::{ops::ControlFlow, time::Instant};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

use crate::{
    error::{DecodeError, Result},
    logits,
    ngram::NgramTable,
    predictor::Predictor,
    sampler::{MultinomialSampler, Sampler},
    TokenCounter,
};

#[derive(Debug, Clone, PartialEq, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct DecoderParams {
    /// Longest prefix of the seed that is kept; the rest is dropped.
    #[derivative(Default(value = "10"))]
    pub use_first_n_tokens: usize,
    /// Number of tokens appended to the seed.
    #[derivative(Default(value = "100"))]
    pub tokens_to_generate: usize,
    /// Number of highest-scoring candidates kept before sampling.
    #[derivative(Default(value = "10"))]
    pub top_k: usize,
    /// Scores are divided by this before softmax; higher is more random.
    #[derivative(Default(value = "1.0"))]
    pub temperature: f32,
    /// Trailing tokens fed to the predictor, fixed by how the model was trained.
    #[derivative(Default(value = "64"))]
    pub context_window: usize,
    /// Length of the repeated pattern that is penalized.
    #[derivative(Default(value = "4"))]
    pub ngram_size: usize,
    /// Subtracted from the score of every token that would repeat a seen pattern.
    #[derivative(Default(value = "1e9"))]
    pub ngram_penalty: f32,
    /// Seed for the random source. Unseeded runs differ from each other.
    pub seed: Option<u64>,
}

impl DecoderParams {
    pub fn validate(&self, num_vocab: usize) -> Result<()> {
        if num_vocab == 0 {
            return Err(DecodeError::EmptyVocab);
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(DecodeError::Temperature(self.temperature));
        }
        if self.top_k == 0 || self.top_k > num_vocab {
            return Err(DecodeError::TopK {
                top_k: self.top_k,
                num_vocab,
            });
        }
        if self.context_window == 0 {
            return Err(DecodeError::ContextWindow);
        }
        if self.ngram_size < 2 {
            return Err(DecodeError::NgramSize(self.ngram_size));
        }
        if !(self.ngram_penalty.is_finite() && self.ngram_penalty >= 0.0) {
            return Err(DecodeError::NgramPenalty(self.ngram_penalty));
        }
        Ok(())
    }
}

/// Reported after every appended token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Number of tokens generated so far, starting at 1.
    pub step: usize,
    /// Number of tokens this run will generate.
    pub total: usize,
    /// The token that was just appended.
    pub token: u32,
    /// Length of the whole sequence including the seed.
    pub len: usize,
}

/// The finished sequence, handed over to the caller.
#[derive(Debug, Clone)]
pub struct Generation {
    tokens: Vec<u32>,
    counter: TokenCounter,
}

impl Generation {
    /// The whole sequence: the kept seed followed by generated tokens.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub fn seed(&self) -> &[u32] {
        &self.tokens[..self.counter.seed]
    }

    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.counter.seed..]
    }

    pub fn into_parts(self) -> (Vec<u32>, TokenCounter) {
        (self.tokens, self.counter)
    }
}

/// Continues a seed sequence one token at a time.
///
/// Each step asks the predictor for scores over the trailing context window, then
/// penalizes repeated n-grams, applies temperature, keeps the top-k candidates and
/// samples the next token from the resulting distribution.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Decoder<P, S = MultinomialSampler> {
    params: DecoderParams,
    num_vocab: usize,
    seed_len: usize,
    tokens: Vec<u32>,
    ngrams: NgramTable,
    #[derivative(Debug = "ignore")]
    predictor: P,
    #[derivative(Debug = "ignore")]
    sampler: S,
}

impl<P: Predictor> Decoder<P> {
    pub fn new(seed_tokens: &[u32], params: DecoderParams, predictor: P) -> Result<Self> {
        let sampler = match params.seed {
            Some(seed) => MultinomialSampler::with_seed(seed),
            None => MultinomialSampler::new(),
        };

        let num_vocab = predictor.num_vocab();
        params.validate(num_vocab)?;

        let tokens: Vec<u32> = seed_tokens
            .iter()
            .copied()
            .take(params.use_first_n_tokens)
            .collect();
        let ngrams = NgramTable::new(params.ngram_size, &tokens);

        Ok(Self {
            num_vocab,
            seed_len: tokens.len(),
            tokens,
            ngrams,
            params,
            predictor,
            sampler,
        })
    }
}

impl<P: Predictor, S: Sampler> Decoder<P, S> {
    /// Replace the random source, e.g. with [`GreedySampler`](crate::sampler::GreedySampler)
    /// for reproducible output.
    pub fn with_sampler<T: Sampler>(self, sampler: T) -> Decoder<P, T> {
        let Decoder {
            params,
            num_vocab,
            seed_len,
            tokens,
            ngrams,
            predictor,
            ..
        } = self;
        Decoder {
            params,
            num_vocab,
            seed_len,
            tokens,
            ngrams,
            predictor,
            sampler,
        }
    }

    /// The whole sequence so far: the kept seed followed by generated tokens.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// The trailing slice of the sequence the predictor sees next.
    pub fn context(&self) -> &[u32] {
        let start = self.tokens.len().saturating_sub(self.params.context_window);
        &self.tokens[start..]
    }

    /// Run every step.
    pub fn generate(self) -> Result<Generation> {
        self.generate_with(|_| ControlFlow::Continue(()))
    }

    /// Run every step, calling `observer` after each appended token.
    ///
    /// Breaking from the observer stops generation and discards the sequence.
    pub fn generate_with<F>(mut self, mut observer: F) -> Result<Generation>
    where
        F: FnMut(&Checkpoint) -> ControlFlow<()>,
    {
        let total = self.params.tokens_to_generate;
        let instant = Instant::now();
        log::info!(
            "[generate][start][seed: {}][steps: {total}][vocab: {}]",
            self.seed_len,
            self.num_vocab
        );

        for step in 1..=total {
            let token = self.step(step)?;
            let checkpoint = Checkpoint {
                step,
                total,
                token,
                len: self.tokens.len(),
            };
            if observer(&checkpoint).is_break() {
                log::info!("[generate][cancel][step: {step}]");
                return Err(DecodeError::Cancelled { step });
            }
        }

        let counter = TokenCounter {
            seed: self.seed_len,
            generated: total,
            total: self.tokens.len(),
            duration: instant.elapsed(),
        };
        log::info!(
            "[generate][done][len: {}][duration: {:?}]",
            counter.total,
            counter.duration
        );
        Ok(Generation {
            tokens: self.tokens,
            counter,
        })
    }

    fn step(&mut self, step: usize) -> Result<u32> {
        let mut logits = self
            .predictor
            .predict(self.context())
            .map_err(|source| DecodeError::Predictor { step, source })?;

        if logits.len() != self.num_vocab {
            return Err(DecodeError::LogitLength {
                step,
                expected: self.num_vocab,
                got: logits.len(),
            });
        }
        if let Some((token, &value)) = logits
            .iter()
            .enumerate()
            .find(|(_, x)| x.is_nan() || **x == f32::INFINITY)
        {
            return Err(DecodeError::InvalidLogit { step, token, value });
        }

        let penalized = self
            .ngrams
            .penalize(&self.tokens, &mut logits, self.params.ngram_penalty);
        logits::apply_temperature(&mut logits, self.params.temperature);
        logits::apply_top_k(&mut logits, self.params.top_k);

        let probs = logits::softmax(&logits);
        let token = self
            .sampler
            .sample(&probs)
            .ok_or(DecodeError::NoCandidate { step })?;

        self.tokens.push(token);
        self.ngrams.update(&self.tokens);

        log::trace!("[generate][step: {step}][token: {token}][penalized: {penalized}]");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::sampler::GreedySampler;

    struct Fixed(Vec<f32>);

    impl Predictor for Fixed {
        fn num_vocab(&self) -> usize {
            self.0.len()
        }

        fn predict(&self, _context: &[u32]) -> anyhow::Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn params() -> DecoderParams {
        DecoderParams {
            use_first_n_tokens: usize::MAX,
            tokens_to_generate: 5,
            top_k: 3,
            temperature: 1.0,
            context_window: 4,
            ngram_size: 2,
            ngram_penalty: 1e9,
            seed: Some(0),
        }
    }

    #[test]
    fn test_default_params() {
        let params = DecoderParams::default();
        assert_eq!(params.use_first_n_tokens, 10);
        assert_eq!(params.tokens_to_generate, 100);
        assert_eq!(params.top_k, 10);
        assert_eq!(params.temperature, 1.0);
        assert_eq!(params.context_window, 64);
        assert_eq!(params.ngram_size, 4);
        assert_eq!(params.ngram_penalty, 1e9);
        assert_eq!(params.seed, None);
    }

    #[test]
    fn test_params_from_partial_json() {
        let params: DecoderParams =
            serde_json::from_str(r#"{ "top_k": 3, "temperature": 1.1 }"#).unwrap();
        assert_eq!(params.top_k, 3);
        assert_eq!(params.temperature, 1.1);
        assert_eq!(params.ngram_size, 4);
    }

    #[test]
    fn test_rejects_bad_config() {
        let predictor = Fixed(vec![0.0; 4]);
        let cases = [
            DecoderParams {
                temperature: 0.0,
                ..params()
            },
            DecoderParams {
                temperature: -1.0,
                ..params()
            },
            DecoderParams {
                temperature: f32::NAN,
                ..params()
            },
            DecoderParams {
                top_k: 0,
                ..params()
            },
            DecoderParams {
                top_k: 5,
                ..params()
            },
            DecoderParams {
                ngram_size: 1,
                ..params()
            },
            DecoderParams {
                ngram_penalty: -1.0,
                ..params()
            },
            DecoderParams {
                context_window: 0,
                ..params()
            },
        ];
        for params in cases {
            let err = Decoder::new(&[0], params.clone(), &predictor).unwrap_err();
            assert!(err.is_config(), "{params:?} gave {err}");
        }

        let err = Decoder::new(&[], params(), Fixed(vec![])).unwrap_err();
        assert!(matches!(err, DecodeError::EmptyVocab));
    }

    #[test]
    fn test_seed_truncation() {
        let predictor = Fixed(vec![0.0; 4]);
        let params = DecoderParams {
            use_first_n_tokens: 3,
            ..params()
        };
        let decoder = Decoder::new(&[1, 2, 3, 0, 1], params.clone(), &predictor).unwrap();
        assert_eq!(decoder.tokens(), &[1, 2, 3]);

        let decoder = Decoder::new(&[1, 2], params, &predictor).unwrap();
        assert_eq!(decoder.tokens(), &[1, 2]);
    }

    #[test]
    fn test_context_is_trailing_window() {
        let predictor = Fixed(vec![0.0; 4]);
        let decoder = Decoder::new(&[0, 1, 2, 3, 0, 1], params(), &predictor).unwrap();
        assert_eq!(decoder.context(), &[2, 3, 0, 1]);

        let decoder = Decoder::new(&[3, 2], params(), &predictor).unwrap();
        assert_eq!(decoder.context(), &[3, 2]);
    }

    #[test]
    fn test_length_and_counter() {
        let predictor = Fixed(vec![1.0, 2.0, 3.0, 4.0]);
        let generation = Decoder::new(&[0, 1], params(), &predictor)
            .unwrap()
            .generate()
            .unwrap();
        assert_eq!(generation.tokens().len(), 7);
        assert_eq!(generation.seed(), &[0, 1]);
        assert_eq!(generation.generated().len(), 5);
        assert_eq!(generation.counter().seed, 2);
        assert_eq!(generation.counter().generated, 5);
        assert_eq!(generation.counter().total, 7);
    }

    #[test]
    fn test_wrong_logit_length_is_fatal() {
        struct Short;
        impl Predictor for Short {
            fn num_vocab(&self) -> usize {
                4
            }
            fn predict(&self, _context: &[u32]) -> anyhow::Result<Vec<f32>> {
                Ok(vec![0.0; 3])
            }
        }
        let err = Decoder::new(&[0], params(), Short)
            .unwrap()
            .generate()
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::LogitLength {
                step: 1,
                expected: 4,
                got: 3
            }
        ));
    }

    #[test]
    fn test_predictor_failure_is_fatal() {
        struct Failing;
        impl Predictor for Failing {
            fn num_vocab(&self) -> usize {
                4
            }
            fn predict(&self, context: &[u32]) -> anyhow::Result<Vec<f32>> {
                if context.len() > 2 {
                    bail!("device lost");
                }
                Ok(vec![0.0; 4])
            }
        }
        let err = Decoder::new(&[0], params(), Failing)
            .unwrap()
            .generate()
            .unwrap_err();
        match err {
            DecodeError::Predictor { step, source } => {
                assert_eq!(step, 3);
                assert_eq!(source.to_string(), "device lost");
            }
            err => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn test_nan_logit_is_fatal() {
        let predictor = Fixed(vec![0.0, f32::NAN, 0.0, 0.0]);
        let err = Decoder::new(&[0], params(), &predictor)
            .unwrap()
            .generate()
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidLogit { token: 1, .. }));
    }

    #[test]
    fn test_all_masked_is_fatal() {
        let predictor = Fixed(vec![f32::NEG_INFINITY; 4]);
        let err = Decoder::new(&[0], params(), &predictor)
            .unwrap()
            .generate()
            .unwrap_err();
        assert!(matches!(err, DecodeError::NoCandidate { step: 1 }));
    }

    #[test]
    fn test_tiny_temperature_picks_the_best_score() {
        let predictor = Fixed(vec![0.0, 5.0, 1.0]);
        for (temperature, top_k) in [(1e-3, 3), (1e-38, 3), (1e-38, 1)] {
            let params = DecoderParams {
                tokens_to_generate: 1,
                top_k,
                temperature,
                ..params()
            };
            let sampled = Decoder::new(&[2], params.clone(), &predictor)
                .unwrap()
                .generate()
                .unwrap();
            assert_eq!(sampled.generated(), &[1], "temperature {temperature}");
            let greedy = Decoder::new(&[2], params, &predictor)
                .unwrap()
                .with_sampler(GreedySampler)
                .generate()
                .unwrap();
            assert_eq!(greedy.generated(), &[1], "temperature {temperature}");
        }
    }

    #[test]
    fn test_huge_scores_do_not_overflow() {
        let predictor = Fixed(vec![0.0, 3e38, 1.0]);
        let params = DecoderParams {
            tokens_to_generate: 1,
            temperature: 0.5,
            ..params()
        };
        let generation = Decoder::new(&[2], params, &predictor)
            .unwrap()
            .generate()
            .unwrap();
        assert_eq!(generation.generated(), &[1]);
    }

    #[test]
    fn test_empty_distribution_is_fatal() {
        struct Empty;
        impl Sampler for Empty {
            fn sample(&mut self, _probs: &[f32]) -> Option<u32> {
                None
            }
        }
        let predictor = Fixed(vec![0.0, 1.0, 2.0]);
        let err = Decoder::new(&[0], params(), &predictor)
            .unwrap()
            .with_sampler(Empty)
            .generate()
            .unwrap_err();
        assert!(matches!(err, DecodeError::NoCandidate { step: 1 }));
    }

    #[test]
    fn test_penalty_is_not_exclusion() {
        // every continuation of `0` has been seen, so the top-scoring one still wins
        let predictor = Fixed(vec![0.0, 5.0, 1.0]);
        let params = DecoderParams {
            tokens_to_generate: 1,
            top_k: 3,
            ngram_penalty: 100.0,
            ..params()
        };
        let generation = Decoder::new(&[0, 0, 0, 1, 0, 2, 0], params, &predictor)
            .unwrap()
            .with_sampler(GreedySampler)
            .generate()
            .unwrap();
        assert_eq!(generation.generated(), &[1]);
    }

    #[test]
    fn test_observer_sees_every_step() {
        let predictor = Fixed(vec![0.0, 1.0, 2.0, 3.0]);
        let mut seen = vec![];
        let generation = Decoder::new(&[0], params(), &predictor)
            .unwrap()
            .generate_with(|checkpoint| {
                seen.push(*checkpoint);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(seen.len(), 5);
        for (index, checkpoint) in seen.iter().enumerate() {
            assert_eq!(checkpoint.step, index + 1);
            assert_eq!(checkpoint.total, 5);
            assert_eq!(checkpoint.len, index + 2);
            assert_eq!(checkpoint.token, generation.tokens()[index + 1]);
        }
    }

    #[test]
    fn test_cancel_at_checkpoint() {
        let predictor = Fixed(vec![0.0, 1.0, 2.0, 3.0]);
        let err = Decoder::new(&[0], params(), &predictor)
            .unwrap()
            .generate_with(|checkpoint| match checkpoint.step {
                2 => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            })
            .unwrap_err();
        assert!(matches!(err, DecodeError::Cancelled { step: 2 }));
    }
}
