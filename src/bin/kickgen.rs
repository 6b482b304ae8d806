//! kickgen CLI: preprocessing, the three trainers, vocoder export and
//! prompt-to-WAV generation.
//!
//! Every subcommand reads the model configuration from `--config` (JSON,
//! missing fields take their defaults). Trainer settings come from an
//! optional `--train-config` JSON file.
//!
//! ```text
//! kickgen preprocess --input data/raw --output data/spectrograms
//! kickgen train-codec
//! kickgen train-denoiser --train-config denoiser.json
//! kickgen train-vocoder
//! kickgen generate --prompt "deep punchy 808" --seed 7
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kickgen::{
    config::KickGenConfig,
    context::ExecutionContext,
    pipeline::{GenerationParams, KickPipeline, PipelinePaths, default_output_path, save_generated},
    train::{self, CodecTrainConfig, DenoiserTrainConfig, VocoderTrainConfig},
};

#[derive(Parser, Debug)]
#[command(name = "kickgen", about = "Keyword-conditioned kick drum generation")]
struct Args {
    /// Model configuration (JSON). Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run on the CPU even when a GPU is available.
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a directory of WAV files to log-mel spectrograms.
    Preprocess {
        #[arg(long, default_value = "data/raw")]
        input: PathBuf,
        #[arg(long, default_value = "data/spectrograms")]
        output: PathBuf,
    },
    /// Train the latent codec.
    TrainCodec {
        #[arg(long)]
        train_config: Option<PathBuf>,
    },
    /// Pre-encode latents and train the denoiser.
    TrainDenoiser {
        #[arg(long)]
        train_config: Option<PathBuf>,
    },
    /// Train (or resume) the vocoder.
    TrainVocoder {
        #[arg(long)]
        train_config: Option<PathBuf>,
    },
    /// Write a generator-only bundle from a vocoder training bundle.
    ExportVocoder {
        #[arg(long, default_value = "checkpoints/vocoder_latest")]
        checkpoint: PathBuf,
        #[arg(long, default_value = "checkpoints/vocoder_final")]
        output: PathBuf,
    },
    /// Generate one kick from a keyword prompt.
    Generate {
        /// Keywords, e.g. "deep punchy 808". Empty generates unconditionally.
        #[arg(long, short = 'p', default_value = "")]
        prompt: String,
        /// Classifier-free guidance scale (1 disables guidance).
        #[arg(long, default_value_t = 3.0)]
        cfg_scale: f64,
        /// DDIM sampling steps.
        #[arg(long, default_value_t = 50)]
        steps: usize,
        /// Random seed. Omit for a random seed each run.
        #[arg(long, short = 's')]
        seed: Option<u64>,
        /// Output WAV path (default: generations/kick_<keywords>_<tag>.wav).
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        #[arg(long, default_value = "checkpoints/vae_epoch_100")]
        codec: PathBuf,
        #[arg(long, default_value = "checkpoints/diffusion_step_100000")]
        denoiser: PathBuf,
        #[arg(long, default_value = "checkpoints/vocoder_final")]
        vocoder: PathBuf,
    },
}

fn load_json<T: serde::de::DeserializeOwned + Default>(path: Option<&Path>) -> anyhow::Result<T> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(T::default()),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let model_config = match &args.config {
        Some(path) => KickGenConfig::from_json_file(path)
            .with_context(|| format!("loading model config {}", path.display()))?,
        None => KickGenConfig::default(),
    };
    let ctx = if args.cpu {
        ExecutionContext::cpu()
    } else {
        ExecutionContext::best_available()?
    };
    tracing::debug!(device = ?ctx.device, "execution context");

    match args.command {
        Command::Preprocess { input, output } => {
            let summary = train::data::preprocess_directory(&input, &output, &model_config.audio)?;
            println!("Done: {} processed, {} failed", summary.processed, summary.failed);
        }
        Command::TrainCodec { train_config } => {
            let config: CodecTrainConfig = load_json(train_config.as_deref())?;
            train::train_codec(&config, &model_config, &ctx)?;
        }
        Command::TrainDenoiser { train_config } => {
            let config: DenoiserTrainConfig = load_json(train_config.as_deref())?;
            train::train_denoiser(&config, &model_config, &ctx)?;
        }
        Command::TrainVocoder { train_config } => {
            let config: VocoderTrainConfig = load_json(train_config.as_deref())?;
            train::train_vocoder(&config, &model_config, &ctx)?;
        }
        Command::ExportVocoder { checkpoint, output } => {
            train::export_vocoder(&checkpoint, &output, &model_config, &ctx)?;
            println!("{}", output.display());
        }
        Command::Generate {
            prompt,
            cfg_scale,
            steps,
            seed,
            output,
            codec,
            denoiser,
            vocoder,
        } => {
            let paths = PipelinePaths {
                codec,
                denoiser,
                vocoder,
            };
            let pipeline = KickPipeline::load(&paths, &model_config, &ctx)?;
            let audio = pipeline.generate(&GenerationParams {
                prompt,
                guidance_scale: cfg_scale,
                steps,
                seed,
            })?;
            let path = output.unwrap_or_else(|| {
                default_output_path(Path::new("generations"), &audio.keywords, &mut rand::rng())
            });
            save_generated(&audio, &path)?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
