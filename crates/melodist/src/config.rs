use std::path::PathBuf;

use derivative::Derivative;
use melodist_core::{DecoderParams, GenerateKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelOption,
    pub decoder: DecoderParams,
    pub output: OutputOption,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ModelOption {
    /// Path to the folder containing all models.
    #[derivative(Default(value = "\"assets/models\".into()"))]
    #[serde(alias = "model_path")]
    pub path: PathBuf,
    /// Name of the model file, relative to `path`.
    #[derivative(Default(value = "\"melody.st\".into()"))]
    #[serde(alias = "model_name")]
    pub name: PathBuf,
    /// Whether the model writes melodies or accompaniment.
    pub kind: GenerateKind,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct OutputOption {
    /// File the generated sequence is written to.
    #[derivative(Default(value = "\"assets/output/generated.json\".into()"))]
    pub path: PathBuf,
    /// Log progress every this many tokens.
    #[derivative(Default(value = "10"))]
    pub report_every: usize,
}
