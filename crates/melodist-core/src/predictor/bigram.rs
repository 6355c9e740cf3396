use anyhow::{bail, Result};
use half::f16;
use safetensors::{tensor::TensorView, Dtype, SafeTensors};

use super::Predictor;

pub const LOGITS_TENSOR: &str = "logits";
pub const INITIAL_TENSOR: &str = "initial";

/// A first-order model: the scores for the next token depend on the last token only.
///
/// Row `i` of `logits` holds the scores that follow token `i`. The optional `initial`
/// row is used for an empty context; without it an empty context is an error.
#[derive(Debug, Clone)]
pub struct BigramPredictor {
    num_vocab: usize,
    logits: Vec<f32>,
    initial: Option<Vec<f32>>,
}

impl BigramPredictor {
    pub fn new(num_vocab: usize, logits: Vec<f32>, initial: Option<Vec<f32>>) -> Result<Self> {
        if num_vocab == 0 {
            bail!("bigram table must have at least one token");
        }
        if logits.len() != num_vocab * num_vocab {
            bail!(
                "bigram table has {} entries, expected {num_vocab} x {num_vocab}",
                logits.len()
            );
        }
        if let Some(initial) = &initial {
            if initial.len() != num_vocab {
                bail!(
                    "initial row has {} entries, expected {num_vocab}",
                    initial.len()
                );
            }
        }
        Ok(Self {
            num_vocab,
            logits,
            initial,
        })
    }

    /// Read the table from a safetensors buffer, usually a memory-mapped file.
    pub fn from_safetensors(data: &[u8]) -> Result<Self> {
        let model = SafeTensors::deserialize(data)?;

        let tensor = model.tensor(LOGITS_TENSOR)?;
        let num_vocab = match tensor.shape() {
            [rows, cols] if rows == cols => *rows,
            shape => bail!("`{LOGITS_TENSOR}` must be a square matrix, got shape {shape:?}"),
        };
        let logits = read_f32(&tensor)?;

        let initial = match model.tensor(INITIAL_TENSOR) {
            Ok(tensor) => {
                if tensor.shape() != [num_vocab] {
                    bail!(
                        "`{INITIAL_TENSOR}` must have shape [{num_vocab}], got {:?}",
                        tensor.shape()
                    );
                }
                Some(read_f32(&tensor)?)
            }
            Err(_) => None,
        };

        log::info!(
            "[bigram] loaded table with {num_vocab} tokens, initial row: {}",
            initial.is_some()
        );
        Self::new(num_vocab, logits, initial)
    }
}

fn read_f32(tensor: &TensorView<'_>) -> Result<Vec<f32>> {
    let data = tensor.data();
    let values = match tensor.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|x| f32::from_le_bytes([x[0], x[1], x[2], x[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|x| f16::from_le_bytes([x[0], x[1]]).to_f32())
            .collect(),
        dtype => bail!("unsupported dtype: {dtype:?}"),
    };
    Ok(values)
}

impl Predictor for BigramPredictor {
    fn num_vocab(&self) -> usize {
        self.num_vocab
    }

    fn predict(&self, context: &[u32]) -> Result<Vec<f32>> {
        let Some(&last) = context.last() else {
            return match &self.initial {
                Some(initial) => Ok(initial.clone()),
                None => bail!("empty context and no `{INITIAL_TENSOR}` row in the table"),
            };
        };
        let row = last as usize;
        if row >= self.num_vocab {
            bail!("token {last} is outside the vocabulary of {}", self.num_vocab);
        }
        let start = row * self.num_vocab;
        Ok(self.logits[start..start + self.num_vocab].to_vec())
    }
}
