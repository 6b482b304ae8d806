//! End-to-end inference pipeline.
//!
//! ```text
//! prompt ─→ vocabulary match ─→ keyword encoder ─→ cond ─┐
//!                               null vector ─→ uncond ──┴→ DDIM + CFG (EMA U-Net)
//!                                                             ↓ latent [1, 4, 8, 11]
//!                                                        codec decode
//!                                                             ↓ log-mel [1, 128, 173]
//!                                                        HiFi-GAN (folded)
//!                                                             ↓
//!                                          trim/pad → peak 0.95 → cubic fade → WAV
//! ```

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use rand::distr::Alphanumeric;
use rand::Rng;

use crate::audio::{PostProcessConfig, post_process, write_wav_mono};
use crate::config::KickGenConfig;
use crate::context::ExecutionContext;
use crate::model::codec::LatentCodec;
use crate::model::conditioning::{KeywordEncoder, Vocabulary};
use crate::model::denoiser::LatentUNet;
use crate::model::vocoder::HifiGanGenerator;
use crate::scheduler::NoiseSchedule;
use crate::scheduler::ddim::DdimSampler;
use crate::train::checkpoint::{load_codec, load_denoiser, load_vocoder};
use crate::Result;

/// Checkpoint bundles needed for inference.
#[derive(Debug, Clone)]
pub struct PipelinePaths {
    pub codec: PathBuf,
    pub denoiser: PathBuf,
    pub vocoder: PathBuf,
}

impl Default for PipelinePaths {
    fn default() -> Self {
        Self {
            codec: PathBuf::from("checkpoints/vae_epoch_100"),
            denoiser: PathBuf::from("checkpoints/diffusion_step_100000"),
            vocoder: PathBuf::from("checkpoints/vocoder_final"),
        }
    }
}

/// Parameters for one generation.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Free-text keywords, e.g. `"deep punchy 808"`.
    pub prompt: String,
    pub guidance_scale: f64,
    pub steps: usize,
    /// Drawn at random when `None`.
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            guidance_scale: 3.0,
            steps: 50,
            seed: None,
        }
    }
}

/// A post-processed hit.
#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    /// Mono samples, exactly the configured clip length.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Vocabulary words the prompt matched, in vocabulary order.
    pub keywords: Vec<String>,
    pub seed: u64,
}

/// Loaded models for prompt-to-waveform generation.
#[derive(Debug, Clone)]
pub struct KickPipeline {
    config: KickGenConfig,
    vocab: Vocabulary,
    text_encoder: KeywordEncoder,
    unet: LatentUNet,
    codec: LatentCodec,
    vocoder: HifiGanGenerator,
    schedule: NoiseSchedule,
    post: PostProcessConfig,
    device: Device,
    dtype: DType,
}

impl KickPipeline {
    /// Load all three bundles, checking each against `config` before any
    /// weights are used. The denoiser runs on its EMA weights.
    pub fn load(paths: &PipelinePaths, config: &KickGenConfig, ctx: &ExecutionContext) -> Result<Self> {
        config.validate()?;
        tracing::info!(device = ?ctx.device, "loading kick pipeline");
        let denoiser = load_denoiser(&paths.denoiser, config, ctx, true)?;
        let codec = load_codec(&paths.codec, config, ctx)?;
        let vocoder = load_vocoder(&paths.vocoder, config, ctx)?;
        tracing::info!(keywords = denoiser.vocab.len(), step = denoiser.step, "pipeline ready");
        Self::from_parts(
            config.clone(),
            denoiser.vocab,
            denoiser.text_encoder,
            denoiser.unet,
            codec,
            vocoder,
            ctx,
        )
    }

    pub fn from_parts(
        config: KickGenConfig,
        vocab: Vocabulary,
        text_encoder: KeywordEncoder,
        unet: LatentUNet,
        codec: LatentCodec,
        vocoder: HifiGanGenerator,
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        let schedule = NoiseSchedule::from_config(&config.diffusion)?;
        let post = PostProcessConfig::for_audio(&config.audio);
        Ok(Self {
            config,
            vocab,
            text_encoder,
            unet,
            codec,
            vocoder,
            schedule,
            post,
            device: ctx.device.clone(),
            dtype: ctx.dtype,
        })
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn config(&self) -> &KickGenConfig {
        &self.config
    }

    /// Generate one hit from a prompt.
    pub fn generate(&self, params: &GenerationParams) -> Result<GeneratedAudio> {
        let indices = self.vocab.parse_prompt(&params.prompt);
        let keywords: Vec<String> = self
            .vocab
            .words_for(&indices)
            .into_iter()
            .map(str::to_string)
            .collect();
        if keywords.is_empty() {
            tracing::info!(prompt = %params.prompt, "no known keywords, generating unconditionally");
        } else {
            tracing::info!(?keywords, "prompt keywords matched");
        }

        let seed = params.seed.unwrap_or_else(rand::random);
        let cond = self.text_encoder.encode_one(&indices)?.unsqueeze(0)?;
        let uncond = self.text_encoder.null_vector().unsqueeze(0)?;

        let sampler = DdimSampler::new(self.schedule.clone(), params.steps)?;
        let (c, h, w) = self.config.latent_shape();
        tracing::debug!(steps = params.steps, guidance = params.guidance_scale, seed, "sampling");
        let latent = sampler.sample(
            &self.unet,
            (1, c, h, w),
            &cond.to_dtype(self.dtype)?,
            Some(&uncond.to_dtype(self.dtype)?),
            params.guidance_scale,
            seed,
        )?;

        // [1, 1, n_mels, frames] → [1, n_mels, frames]
        let log_mel = self.codec.decode(&latent)?.squeeze(1)?;
        let waveform = self.vocoder.forward(&log_mel)?;
        let samples: Vec<f32> = waveform
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .to_vec1()?;
        tracing::debug!(device = ?self.device, raw_samples = samples.len(), "vocoded");

        Ok(GeneratedAudio {
            samples: post_process(samples, &self.post),
            sample_rate: self.config.audio.sample_rate,
            keywords,
            seed,
        })
    }
}

/// `<dir>/kick_<keywords…>_<4 random alphanumerics>.wav`.
pub fn default_output_path<R: Rng + ?Sized>(dir: &Path, keywords: &[String], rng: &mut R) -> PathBuf {
    let tag: String = (0..4).map(|_| char::from(rng.sample(Alphanumeric))).collect();
    let mut parts = vec!["kick".to_string()];
    parts.extend(keywords.iter().cloned());
    parts.push(tag);
    dir.join(format!("{}.wav", parts.join("_")))
}

/// Write a generated hit as 32-bit float WAV, creating parent directories.
pub fn save_generated(audio: &GeneratedAudio, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_wav_mono(path, &audio.samples, audio.sample_rate)?;
    tracing::info!(path = %path.display(), seed = audio.seed, "saved");
    Ok(())
}
