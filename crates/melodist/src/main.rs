use std::{
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser};
use flume::Receiver;
use melodist_core::{
    predictor::BigramPredictor, Checkpoint, Decoder, GenerateKind, Generation, TokenCounter,
};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
};

mod config;

pub fn build_path(path: impl AsRef<Path>, name: impl AsRef<Path>) -> Result<PathBuf> {
    let permitted = path.as_ref();
    let name = name.as_ref();
    if name.ancestors().any(|p| p.ends_with(Path::new(".."))) {
        bail!("cannot have \"..\" in names");
    }
    let path = match name.is_absolute() || name.starts_with(permitted) {
        true => name.into(),
        false => permitted.join(name),
    };
    match path.starts_with(permitted) {
        true => Ok(path),
        false => bail!("path not permitted"),
    }
}

async fn read_string(path: impl AsRef<Path>) -> Result<String> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    Ok(contents)
}

pub async fn load_config(path: impl AsRef<Path>) -> Result<config::Config> {
    let contents = read_string(path).await?;
    Ok(toml::from_str(&contents)?)
}

/// Token ids as written by the tokenizer: either a bare array or an object with an `ids` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeedFile {
    Ids(Vec<u32>),
    Encoded { ids: Vec<u32> },
}

impl From<SeedFile> for Vec<u32> {
    fn from(value: SeedFile) -> Self {
        match value {
            SeedFile::Ids(ids) | SeedFile::Encoded { ids } => ids,
        }
    }
}

pub async fn load_seed(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let contents = read_string(path).await?;
    let seed: SeedFile = serde_json::from_str(&contents)?;
    Ok(seed.into())
}

pub async fn load_predictor(path: impl AsRef<Path>) -> Result<BigramPredictor> {
    let file = File::open(path).await?;
    let data = unsafe { Mmap::map(&file)? };
    BigramPredictor::from_safetensors(&data)
}

#[derive(Debug, Clone, Serialize)]
pub struct Output {
    pub kind: GenerateKind,
    pub monophonic: bool,
    pub tokens: Vec<u32>,
    pub counter: TokenCounter,
}

impl Output {
    pub fn new(kind: GenerateKind, generation: Generation) -> Self {
        let (tokens, counter) = generation.into_parts();
        Self {
            kind,
            monophonic: kind.monophonic(),
            tokens,
            counter,
        }
    }
}

async fn report(receiver: Receiver<Checkpoint>, every: usize) {
    let every = every.max(1);
    while let Ok(Checkpoint { step, total, .. }) = receiver.recv_async().await {
        if step % every == 0 || step == total {
            log::info!("[progress] {step}/{total}");
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Token ids to continue, as a JSON array.
    #[arg(value_name = "SEED")]
    seed: PathBuf,
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(long, short, value_name = "FILE")]
    output: Option<PathBuf>,
    /// Number of tokens to generate.
    #[arg(long, short)]
    tokens: Option<usize>,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    temperature: Option<f32>,
    /// Seed of the random source.
    #[arg(long)]
    rng_seed: Option<u64>,
}

impl Args {
    fn apply(&self, mut config: config::Config) -> config::Config {
        let decoder = &mut config.decoder;
        decoder.tokens_to_generate = self.tokens.unwrap_or(decoder.tokens_to_generate);
        decoder.top_k = self.top_k.unwrap_or(decoder.top_k);
        decoder.temperature = self.temperature.unwrap_or(decoder.temperature);
        decoder.seed = self.rng_seed.or(decoder.seed);
        if let Some(output) = &self.output {
            config.output.path = output.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("melodist", log::LevelFilter::Info)
        .with_module_level("melodist_core", log::LevelFilter::Info)
        .init()?;

    let args = Args::parse();

    let cmd = Args::command();
    let version = cmd.get_version().unwrap_or("0.0.1");
    let bin_name = cmd.get_bin_name().unwrap_or("melodist");

    log::info!("{}\tversion: {}", bin_name, version);

    let config = {
        let path = args
            .config
            .clone()
            .unwrap_or("assets/configs/Config.toml".into());
        log::info!("reading config {}...", path.to_string_lossy());
        args.apply(load_config(path).await?)
    };

    let seed = load_seed(&args.seed).await?;
    log::info!("seed has {} tokens", seed.len());

    let model_path = build_path(&config.model.path, &config.model.name)?;
    log::info!("loading model {:?}", model_path);
    let predictor = load_predictor(&model_path).await?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupted, stopping after the current token");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let (sender, receiver) = flume::unbounded();
    let progress = tokio::spawn(report(receiver, config.output.report_every));

    let params = config.decoder.clone();
    let generation = tokio::task::spawn_blocking(move || -> melodist_core::Result<Generation> {
        Decoder::new(&seed, params, predictor)?.generate_with(|checkpoint| {
            let _ = sender.send(*checkpoint);
            match cancel.load(Ordering::Relaxed) {
                true => ControlFlow::Break(()),
                false => ControlFlow::Continue(()),
            }
        })
    })
    .await??;
    progress.await?;

    let output = Output::new(config.model.kind, generation);
    let path = &config.output.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_string_pretty(&output)?).await?;
    log::info!(
        "wrote {} tokens ({} generated) to {}",
        output.counter.total,
        output.counter.generated,
        path.to_string_lossy()
    );

    Ok(())
}
