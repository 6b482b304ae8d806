//! Latent diffusion training: pre-encoding with the frozen codec, then an
//! iteration-based loop with classifier-free-guidance dropout, gradient
//! accumulation and an EMA copy of the U-Net.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use candle_nn::{ParamsAdamW, VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::checkpoint::{CheckpointBundle, CheckpointKind, bundle_path, load_codec, restore_varmaps};
use super::data::{
    BatchLoader, Dataset, LATENT_TENSOR, LatentBatch, LatentDataset, LoaderConfig, MEL_TENSOR, SPLIT_SEED,
    VAL_FRACTION, file_stem, list_files, load_tensor, save_tensor, split_indices,
};
use super::ema::Ema;
use super::optim::{AdamW, GradScaler, Gradients, ParamSet};
use super::progress_bar;
use crate::config::KickGenConfig;
use crate::context::ExecutionContext;
use crate::model::codec::LatentCodec;
use crate::model::conditioning::{DEFAULT_MIN_COUNT, KeywordEncoder, Vocabulary, keyword_index_by_stem};
use crate::model::denoiser::LatentUNet;
use crate::model::layers::{mse, scalar};
use crate::scheduler::{NoiseSchedule, gaussian_noise, timestep_tensor};
use crate::{Error, Result};

/// A latent directory holding more files than this is taken as already
/// encoded.
pub const PRE_ENCODED_THRESHOLD: usize = 100;

const STEP_PREFIX: &str = "diffusion_step_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiserTrainConfig {
    #[serde(default = "default_spectrogram_dir")]
    pub spectrogram_dir: PathBuf,
    #[serde(default = "default_latent_dir")]
    pub latent_dir: PathBuf,
    /// CSV with `filename` and `keywords` columns.
    #[serde(default = "default_metadata_csv")]
    pub metadata_csv: PathBuf,
    /// Trained `codec` bundle used to encode spectrograms.
    #[serde(default = "default_codec_checkpoint")]
    pub codec_checkpoint: PathBuf,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation: usize,
    #[serde(default = "default_ema_decay")]
    pub ema_decay: f64,
    /// Probability of replacing an example's keywords with the empty set.
    #[serde(default = "default_cfg_dropout")]
    pub cfg_dropout: f64,
    #[serde(default = "default_min_keyword_count")]
    pub min_keyword_count: usize,
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    #[serde(default = "default_validate_every")]
    pub validate_every: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default)]
    pub loss_scaling: bool,
    /// Continue from the newest `diffusion_step_{n}` bundle in
    /// `checkpoint_dir` when one exists.
    #[serde(default = "default_resume")]
    pub resume: bool,
    #[serde(default)]
    pub seed: u64,
}

impl Default for DenoiserTrainConfig {
    fn default() -> Self {
        Self {
            spectrogram_dir: default_spectrogram_dir(),
            latent_dir: default_latent_dir(),
            metadata_csv: default_metadata_csv(),
            codec_checkpoint: default_codec_checkpoint(),
            checkpoint_dir: default_checkpoint_dir(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            iterations: default_iterations(),
            num_workers: default_num_workers(),
            gradient_accumulation: default_accumulation(),
            ema_decay: default_ema_decay(),
            cfg_dropout: default_cfg_dropout(),
            min_keyword_count: default_min_keyword_count(),
            log_every: default_log_every(),
            validate_every: default_validate_every(),
            checkpoint_every: default_checkpoint_every(),
            loss_scaling: false,
            resume: default_resume(),
            seed: 0,
        }
    }
}

fn default_resume() -> bool {
    true
}

fn default_spectrogram_dir() -> PathBuf {
    PathBuf::from("data/spectrograms")
}

fn default_latent_dir() -> PathBuf {
    PathBuf::from("data/latents")
}

fn default_metadata_csv() -> PathBuf {
    PathBuf::from("data/metadata.csv")
}

fn default_codec_checkpoint() -> PathBuf {
    PathBuf::from("checkpoints/vae_epoch_100")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_batch_size() -> usize {
    16
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_iterations() -> usize {
    100_000
}

fn default_num_workers() -> usize {
    4
}

fn default_accumulation() -> usize {
    2
}

fn default_ema_decay() -> f64 {
    0.9999
}

fn default_cfg_dropout() -> f64 {
    0.15
}

fn default_min_keyword_count() -> usize {
    DEFAULT_MIN_COUNT
}

fn default_log_every() -> usize {
    500
}

fn default_validate_every() -> usize {
    1000
}

fn default_checkpoint_every() -> usize {
    5000
}

/// Encode every spectrogram in `spectrogram_dir` to its posterior mean and
/// store it as `<stem>.safetensors` in `latent_dir`.
///
/// Does nothing when `latent_dir` already holds more than
/// [`PRE_ENCODED_THRESHOLD`] latents; individual latents that already exist
/// are skipped. Returns the number of latents written.
pub fn pre_encode_latents(
    spectrogram_dir: &Path,
    latent_dir: &Path,
    codec: &LatentCodec,
    ctx: &ExecutionContext,
) -> Result<usize> {
    let existing = list_files(latent_dir, "safetensors")?.len();
    if existing > PRE_ENCODED_THRESHOLD {
        tracing::info!(existing, dir = %latent_dir.display(), "latents already encoded");
        return Ok(0);
    }
    let spectrograms = list_files(spectrogram_dir, "safetensors")?;
    if spectrograms.is_empty() {
        return Err(Error::EmptyDataset(spectrogram_dir.to_path_buf()));
    }
    std::fs::create_dir_all(latent_dir)?;

    let bar = progress_bar(spectrograms.len(), "encoding latents");
    let mut written = 0;
    for path in &spectrograms {
        bar.inc(1);
        let target = latent_dir.join(format!("{}.safetensors", file_stem(path)));
        if target.exists() {
            continue;
        }
        let mel = load_tensor(path, MEL_TENSOR)?
            .to_device(&ctx.device)?
            .to_dtype(ctx.dtype)?
            .unsqueeze(0)?;
        let latent = codec.encode(&mel)?.squeeze(0)?.to_device(&Device::Cpu)?;
        save_tensor(&target, LATENT_TENSOR, &latent)?;
        written += 1;
    }
    bar.finish_and_clear();
    tracing::info!(written, skipped = spectrograms.len() - written, "latents encoded");
    Ok(written)
}

/// Replace each keyword set with the empty set with probability `p`.
fn drop_keywords<R: Rng + ?Sized>(keywords: &[Vec<usize>], p: f64, rng: &mut R) -> Vec<Vec<usize>> {
    keywords
        .iter()
        .map(|kw| if rng.random::<f64>() < p { Vec::new() } else { kw.clone() })
        .collect()
}

/// Diffusion model, keyword encoder and the parameters they train.
struct Trainee {
    unet: LatentUNet,
    unet_vars: VarMap,
    text_encoder: KeywordEncoder,
    text_vars: VarMap,
}

impl Trainee {
    fn new(model_config: &KickGenConfig, vocab_size: usize, ctx: &ExecutionContext) -> Result<Self> {
        let unet_vars = VarMap::new();
        let unet = LatentUNet::new(
            model_config.codec.latent_channels,
            &model_config.denoiser,
            VarBuilder::from_varmap(&unet_vars, ctx.dtype, &ctx.device),
        )?;
        let text_vars = VarMap::new();
        let text_encoder = KeywordEncoder::new(
            vocab_size,
            model_config.denoiser.text_embed_dim,
            model_config.denoiser.cond_dim,
            VarBuilder::from_varmap(&text_vars, ctx.dtype, &ctx.device),
        )?;
        Ok(Self {
            unet,
            unet_vars,
            text_encoder,
            text_vars,
        })
    }

    /// Noise-prediction MSE for one batch at random timesteps.
    fn loss<R: Rng + ?Sized>(
        &self,
        schedule: &NoiseSchedule,
        latents: &Tensor,
        keywords: &[Vec<usize>],
        rng: &mut R,
    ) -> Result<Tensor> {
        let batch = latents.dim(0)?;
        let device = latents.device();
        let cond = self.text_encoder.encode_batch(keywords)?;
        let t: Vec<usize> = (0..batch)
            .map(|_| rng.random_range(0..schedule.num_timesteps()))
            .collect();
        let noise = gaussian_noise(latents.shape(), rng, device)?.to_dtype(latents.dtype())?;
        let noisy = schedule.add_noise(latents, &noise, &t)?;
        let pred = self.unet.forward(&noisy, &timestep_tensor(&t, device)?, &cond)?;
        mse(&pred, &noise)
    }
}

/// The trainee plus everything that updates it: AdamW over U-Net and
/// keyword encoder, the loss scaler, the U-Net EMA and the gradient
/// accumulator.
struct DenoiserState {
    trainee: Trainee,
    params: ParamSet,
    ema_params: ParamSet,
    optimizer: AdamW,
    scaler: GradScaler,
    ema: Ema,
    grads: Gradients,
    accumulation: usize,
}

impl DenoiserState {
    fn new(
        config: &DenoiserTrainConfig,
        model_config: &KickGenConfig,
        vocab_size: usize,
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        if config.gradient_accumulation == 0 {
            return Err(Error::Config("gradient_accumulation must be at least 1".into()));
        }
        let trainee = Trainee::new(model_config, vocab_size, ctx)?;
        let params = ParamSet::from_groups(&[
            ("model", &trainee.unet_vars),
            ("text_encoder", &trainee.text_vars),
        ]);
        let ema_params = ParamSet::from_varmap(&trainee.unet_vars);
        let optimizer = AdamW::new(
            &params,
            ParamsAdamW {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;
        let ema = Ema::new(&ema_params, config.ema_decay)?;
        let grads = Gradients::new(&params);
        Ok(Self {
            trainee,
            params,
            ema_params,
            optimizer,
            scaler: GradScaler::new(config.loss_scaling),
            ema,
            grads,
            accumulation: config.gradient_accumulation,
        })
    }

    /// One micro-batch: backward of `loss / accumulation` into the
    /// accumulator. On an accumulation boundary the optimizer steps through
    /// the scaler and, only if it actually stepped, the EMA follows.
    /// Returns the unscaled batch loss.
    fn train_step<R: Rng + ?Sized>(
        &mut self,
        schedule: &NoiseSchedule,
        latents: &Tensor,
        keywords: &[Vec<usize>],
        step: usize,
        rng: &mut R,
    ) -> Result<f64> {
        let loss = (self.trainee.loss(schedule, latents, keywords, rng)? / self.accumulation as f64)?;
        let store = self.scaler.scale_loss(&loss)?.backward()?;
        self.grads.accumulate(&self.params, &store)?;

        if (step + 1) % self.accumulation == 0 {
            if self.scaler.step(&mut self.optimizer, &self.params, &mut self.grads)? {
                self.ema.update(&self.ema_params)?;
            }
            self.grads.clear();
        }
        Ok(scalar(&loss)? * self.accumulation as f64)
    }

    fn bundle(&self, model_config: &KickGenConfig, vocab: &Vocabulary, steps_done: usize) -> CheckpointBundle {
        let mut bundle = CheckpointBundle::new(CheckpointKind::Denoiser, model_config.clone());
        bundle.manifest.step = Some(steps_done);
        bundle.manifest.vocab = Some(vocab.words().to_vec());
        bundle.manifest.optimizer_steps.insert("optimizer".into(), self.optimizer.step_count());
        if self.scaler.is_enabled() {
            bundle.manifest.scalers.insert("optimizer".into(), self.scaler.state());
        }
        bundle.insert_varmap("model", &self.trainee.unet_vars);
        bundle.insert_group("ema", self.ema.tensors(&self.ema_params));
        bundle.insert_varmap("text_encoder", &self.trainee.text_vars);
        bundle.insert_group("optimizer", self.optimizer.state_tensors(&self.params));
        bundle
    }

    /// Restore weights, EMA shadow, optimizer moments and the scaler from a
    /// denoiser bundle trained on `vocab`. Returns the completed step count.
    fn restore(&mut self, bundle: &CheckpointBundle, vocab: &Vocabulary) -> Result<usize> {
        let manifest = &bundle.manifest;
        let Some(steps_done) = manifest.step else {
            return Err(Error::Checkpoint("denoiser bundle has no step counter".into()));
        };
        if manifest.vocab.as_deref() != Some(vocab.words()) {
            return Err(Error::Checkpoint(
                "denoiser bundle was trained on a different keyword vocabulary".into(),
            ));
        }
        // Validate everything that can fail before any variable changes.
        self.ema.load(&self.ema_params, bundle.group("ema")?)?;
        self.optimizer
            .load_state(&self.params, bundle.group("optimizer")?, bundle.optimizer_step("optimizer"))?;
        restore_varmaps(&mut [
            ("model", &mut self.trainee.unet_vars, bundle.group("model")?),
            ("text_encoder", &mut self.trainee.text_vars, bundle.group("text_encoder")?),
        ])?;
        if let Some(state) = manifest.scalers.get("optimizer") {
            self.scaler.load_state(*state);
        }
        self.grads.clear();
        Ok(steps_done)
    }
}

/// The `diffusion_step_{n}` bundle with the largest `n` in `checkpoint_dir`.
fn latest_step_bundle(checkpoint_dir: &Path) -> Result<Option<(usize, PathBuf)>> {
    if !checkpoint_dir.is_dir() {
        return Ok(None);
    }
    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(checkpoint_dir)? {
        let path = entry?.path();
        let Some(step) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(STEP_PREFIX))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        if !path.join("manifest.json").is_file() {
            continue;
        }
        if latest.as_ref().is_none_or(|(best, _)| step > *best) {
            latest = Some((step, path));
        }
    }
    Ok(latest)
}

/// Train the denoiser and keyword encoder on codec latents.
///
/// With `resume` set, training continues from the newest
/// `diffusion_step_{n}` bundle in `checkpoint_dir`: weights, EMA shadow,
/// optimizer moments, loss scale and the step counter are all restored and
/// the loop picks up at step `n`.
pub fn train_denoiser(
    config: &DenoiserTrainConfig,
    model_config: &KickGenConfig,
    ctx: &ExecutionContext,
) -> Result<()> {
    model_config.validate()?;
    if config.gradient_accumulation == 0 {
        return Err(Error::Config("gradient_accumulation must be at least 1".into()));
    }

    let vocab = Vocabulary::from_metadata_csv(&config.metadata_csv, config.min_keyword_count)?;
    if vocab.is_empty() {
        tracing::warn!(min_count = config.min_keyword_count, "empty keyword vocabulary, training unconditionally");
    }
    tracing::info!(keywords = vocab.len(), "vocabulary built");

    let codec = load_codec(&config.codec_checkpoint, model_config, ctx)?;
    pre_encode_latents(&config.spectrogram_dir, &config.latent_dir, &codec, ctx)?;
    drop(codec);

    let keywords = keyword_index_by_stem(&config.metadata_csv, &vocab)?;
    let dataset = Arc::new(LatentDataset::open(&config.latent_dir, &keywords)?);
    let (train_idx, val_idx) = split_indices(dataset.len(), VAL_FRACTION, SPLIT_SEED);
    tracing::info!(train = train_idx.len(), val = val_idx.len(), "latent dataset split");
    let loader_config = LoaderConfig {
        batch_size: config.batch_size,
        shuffle: true,
        drop_last: false,
        num_workers: config.num_workers,
        seed: config.seed,
        ..Default::default()
    };
    let train_loader = BatchLoader::new(Arc::clone(&dataset), train_idx, loader_config.clone())?;
    let val_loader = BatchLoader::new(
        dataset,
        val_idx,
        LoaderConfig {
            shuffle: false,
            ..loader_config
        },
    )?;
    if train_loader.num_batches() == 0 {
        return Err(Error::EmptyDataset(config.latent_dir.clone()));
    }

    let mut state = DenoiserState::new(config, model_config, vocab.len(), ctx)?;
    let mut start_step = 0;
    if config.resume {
        if let Some((_, path)) = latest_step_bundle(&config.checkpoint_dir)? {
            let bundle = CheckpointBundle::load(&path, CheckpointKind::Denoiser, ctx)?;
            bundle.ensure_config(model_config)?;
            start_step = state.restore(&bundle, &vocab)?;
            tracing::info!(path = %path.display(), start_step, "resuming denoiser training");
        }
    }
    tracing::info!(parameters = state.params.num_elements(), "denoiser initialized");
    if start_step >= config.iterations {
        tracing::info!(start_step, iterations = config.iterations, "denoiser already trained");
        return Ok(());
    }

    let schedule = NoiseSchedule::from_config(&model_config.diffusion)?;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(start_step as u64));

    // Continue the epoch sequence where the completed steps left it.
    let num_batches = train_loader.num_batches();
    let mut epoch = start_step / num_batches;
    let mut batches = train_loader.epoch(epoch);
    for _ in 0..start_step % num_batches {
        batches.next().transpose()?;
    }

    let mut window_loss = 0.0;
    let mut window_len = 0usize;
    let bar = progress_bar(config.iterations, "denoiser");
    bar.inc(start_step as u64);

    for step in start_step..config.iterations {
        let batch: LatentBatch = match batches.next() {
            Some(batch) => batch?,
            None => {
                epoch += 1;
                batches = train_loader.epoch(epoch);
                match batches.next() {
                    Some(batch) => batch?,
                    None => return Err(Error::EmptyDataset(config.latent_dir.clone())),
                }
            }
        };
        let latents = batch.latents.to_device(&ctx.device)?.to_dtype(ctx.dtype)?;
        let keywords = drop_keywords(&batch.keywords, config.cfg_dropout, &mut rng);

        window_loss += state.train_step(&schedule, &latents, &keywords, step, &mut rng)?;
        window_len += 1;
        bar.inc(1);

        if config.log_every > 0 && (step + 1) % config.log_every == 0 {
            tracing::info!(step = step + 1, epoch, loss = window_loss / window_len as f64, "denoiser train");
            window_loss = 0.0;
            window_len = 0;
        }

        if config.validate_every > 0 && step > 0 && step % config.validate_every == 0 && val_loader.num_examples() > 0 {
            let mut val_rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(step as u64));
            let val_loss = validate(&state.trainee, &schedule, &val_loader, ctx, &mut val_rng)?;
            tracing::info!(step, loss = val_loss, "denoiser val");
        }

        let last = step + 1 == config.iterations;
        if (config.checkpoint_every > 0 && (step + 1) % config.checkpoint_every == 0) || last {
            state
                .bundle(model_config, &vocab, step + 1)
                .save(&bundle_path(&config.checkpoint_dir, &format!("{STEP_PREFIX}{}", step + 1)))?;
        }
    }
    bar.finish_and_clear();
    Ok(())
}

/// Mean noise-prediction loss over the validation split, keywords kept.
fn validate(
    trainee: &Trainee,
    schedule: &NoiseSchedule,
    loader: &BatchLoader<LatentDataset>,
    ctx: &ExecutionContext,
    rng: &mut ChaCha8Rng,
) -> Result<f64> {
    let mut total = 0.0;
    let mut count = 0usize;
    for batch in loader.epoch(0) {
        let batch = batch?;
        let latents = batch.latents.to_device(&ctx.device)?.to_dtype(ctx.dtype)?;
        total += scalar(&trainee.loss(schedule, &latents, &batch.keywords, rng)?)?;
        count += 1;
    }
    Ok(total / count.max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::checkpoint::load_denoiser;
    use crate::train::optim::GradScalerState;
    use std::io::Write;

    fn tiny_config() -> KickGenConfig {
        let mut cfg = KickGenConfig::default();
        cfg.audio.n_mels = 16;
        cfg.audio.duration_secs = 0.25;
        cfg.codec.channels = vec![8, 16];
        cfg.denoiser.base_channels = 16;
        cfg.denoiser.cond_dim = 32;
        cfg.denoiser.text_embed_dim = 8;
        cfg.diffusion.timesteps = 50;
        cfg
    }

    fn save_fresh_codec(cfg: &KickGenConfig, dir: &Path) -> LatentCodec {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &Device::Cpu);
        let codec = LatentCodec::new(&cfg.codec, cfg.audio.spectrogram_shape(), vb).unwrap();
        let mut bundle = CheckpointBundle::new(CheckpointKind::Codec, cfg.clone());
        bundle.insert_varmap("model", &varmap);
        bundle.insert_group("optimizer", Default::default());
        bundle.save(dir).unwrap();
        codec
    }

    fn write_spectrograms(cfg: &KickGenConfig, dir: &Path, n: usize) {
        std::fs::create_dir_all(dir).unwrap();
        let (h, w) = cfg.audio.spectrogram_shape();
        for i in 0..n {
            let mel = Tensor::randn(0f32, 1., (1, h, w), &Device::Cpu).unwrap();
            save_tensor(&dir.join(format!("kick{i}.safetensors")), MEL_TENSOR, &mel).unwrap();
        }
    }

    #[test]
    fn pre_encoding_writes_latents_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config();
        let codec = save_fresh_codec(&cfg, &dir.path().join("codec"));
        let specs = dir.path().join("specs");
        let latents = dir.path().join("latents");
        write_spectrograms(&cfg, &specs, 3);

        let ctx = ExecutionContext::cpu();
        assert_eq!(pre_encode_latents(&specs, &latents, &codec, &ctx).unwrap(), 3);
        let latent = load_tensor(&latents.join("kick0.safetensors"), LATENT_TENSOR).unwrap();
        let (c, h, w) = cfg.latent_shape();
        assert_eq!(latent.dims(), &[c, h, w]);

        write_spectrograms(&cfg, &specs, 4);
        assert_eq!(pre_encode_latents(&specs, &latents, &codec, &ctx).unwrap(), 1);
    }

    #[test]
    fn keyword_dropout_extremes() {
        let kw = vec![vec![1, 2], vec![3]];
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(drop_keywords(&kw, 0.0, &mut rng), kw);
        assert!(drop_keywords(&kw, 1.0, &mut rng).iter().all(Vec::is_empty));
    }

    #[test]
    fn short_run_checkpoints_with_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config();
        save_fresh_codec(&cfg, &dir.path().join("codec"));
        let specs = dir.path().join("specs");
        write_spectrograms(&cfg, &specs, 4);

        let csv_path = dir.path().join("metadata.csv");
        write_metadata(&csv_path, 4);

        let config = DenoiserTrainConfig {
            spectrogram_dir: specs,
            latent_dir: dir.path().join("latents"),
            metadata_csv: csv_path,
            codec_checkpoint: dir.path().join("codec"),
            checkpoint_dir: dir.path().join("ckpt"),
            batch_size: 2,
            iterations: 4,
            num_workers: 0,
            min_keyword_count: 1,
            checkpoint_every: 2,
            validate_every: 2,
            ..Default::default()
        };
        let ctx = ExecutionContext::cpu();
        train_denoiser(&config, &cfg, &ctx).unwrap();

        assert!(dir.path().join("ckpt/diffusion_step_2/manifest.json").is_file());
        let weights = load_denoiser(&dir.path().join("ckpt/diffusion_step_4"), &cfg, &ctx, true).unwrap();
        assert_eq!(weights.step, 4);
        assert_eq!(weights.vocab.words(), &["deep".to_string(), "punchy".to_string()]);
    }

    fn write_metadata(path: &Path, n: usize) {
        let mut f = std::fs::File::create(path).unwrap();
        writeln!(f, "filename,keywords").unwrap();
        for i in 0..n {
            writeln!(f, "kick{i}.wav,\"deep, punchy\"").unwrap();
        }
    }

    fn step_config(accumulation: usize, loss_scaling: bool) -> DenoiserTrainConfig {
        DenoiserTrainConfig {
            learning_rate: 1e-2,
            gradient_accumulation: accumulation,
            ema_decay: 0.5,
            loss_scaling,
            ..Default::default()
        }
    }

    fn random_latents(cfg: &KickGenConfig, batch: usize) -> Tensor {
        let (c, h, w) = cfg.latent_shape();
        Tensor::randn(0f32, 1., (batch, c, h, w), &Device::Cpu).unwrap()
    }

    fn snapshot(params: &ParamSet) -> Vec<Vec<f32>> {
        params
            .vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect()
    }

    fn ema_snapshot(state: &DenoiserState) -> Vec<Vec<f32>> {
        let shadow = state.ema.tensors(&state.ema_params);
        state
            .ema_params
            .names()
            .iter()
            .map(|n| shadow[n].flatten_all().unwrap().to_vec1().unwrap())
            .collect()
    }

    fn total_change(a: &[Vec<f32>], b: &[Vec<f32>]) -> f32 {
        a.iter()
            .zip(b)
            .flat_map(|(x, y)| x.iter().zip(y).map(|(p, q)| (p - q).abs()))
            .sum()
    }

    #[test]
    fn updates_only_on_accumulation_boundaries() {
        let cfg = tiny_config();
        let ctx = ExecutionContext::cpu();
        let mut state = DenoiserState::new(&step_config(2, false), &cfg, 3, &ctx).unwrap();
        let schedule = NoiseSchedule::from_config(&cfg.diffusion).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let latents = random_latents(&cfg, 2);
        let keywords = vec![vec![0, 2], vec![1]];

        let params_before = snapshot(&state.params);
        let ema_before = ema_snapshot(&state);

        let loss = state.train_step(&schedule, &latents, &keywords, 0, &mut rng).unwrap();
        assert!(loss.is_finite());
        assert_eq!(state.optimizer.step_count(), 0);
        assert_eq!(total_change(&params_before, &snapshot(&state.params)), 0.0);
        assert_eq!(total_change(&ema_before, &ema_snapshot(&state)), 0.0);
        assert!(!state.grads.is_empty());

        state.train_step(&schedule, &latents, &keywords, 1, &mut rng).unwrap();
        assert_eq!(state.optimizer.step_count(), 1);
        assert!(total_change(&params_before, &snapshot(&state.params)) > 0.0);
        assert!(total_change(&ema_before, &ema_snapshot(&state)) > 0.0);
        assert!(state.grads.is_empty());
    }

    #[test]
    fn overflowing_gradients_skip_optimizer_and_ema() {
        let cfg = tiny_config();
        let ctx = ExecutionContext::cpu();
        let mut state = DenoiserState::new(&step_config(1, true), &cfg, 3, &ctx).unwrap();
        state.scaler.load_state(GradScalerState {
            scale: f64::MAX,
            growth_tracker: 0,
        });
        let schedule = NoiseSchedule::from_config(&cfg.diffusion).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let latents = random_latents(&cfg, 2);
        let keywords = vec![vec![0], vec![]];

        let params_before = snapshot(&state.params);
        let ema_before = ema_snapshot(&state);
        state.train_step(&schedule, &latents, &keywords, 0, &mut rng).unwrap();

        assert_eq!(state.optimizer.step_count(), 0);
        assert_eq!(total_change(&params_before, &snapshot(&state.params)), 0.0);
        assert_eq!(total_change(&ema_before, &ema_snapshot(&state)), 0.0);
        assert_eq!(state.scaler.scale_value(), f64::MAX * 0.5);
        assert!(state.grads.is_empty());
    }

    #[test]
    fn restore_brings_back_weights_ema_and_optimizer() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config();
        let ctx = ExecutionContext::cpu();
        let vocab = Vocabulary::new(["808", "deep", "punchy"]);
        let config = step_config(1, true);
        let schedule = NoiseSchedule::from_config(&cfg.diffusion).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);

        let mut trained = DenoiserState::new(&config, &cfg, vocab.len(), &ctx).unwrap();
        for step in 0..2 {
            let latents = random_latents(&cfg, 2);
            trained
                .train_step(&schedule, &latents, &[vec![0], vec![1, 2]], step, &mut rng)
                .unwrap();
        }
        let path = dir.path().join("diffusion_step_2");
        trained.bundle(&cfg, &vocab, 2).save(&path).unwrap();
        let bundle = CheckpointBundle::load(&path, CheckpointKind::Denoiser, &ctx).unwrap();

        let mut fresh = DenoiserState::new(&config, &cfg, vocab.len(), &ctx).unwrap();
        assert_eq!(fresh.restore(&bundle, &vocab).unwrap(), 2);
        assert_eq!(snapshot(&fresh.params), snapshot(&trained.params));
        assert_eq!(ema_snapshot(&fresh), ema_snapshot(&trained));
        assert_eq!(fresh.optimizer.step_count(), trained.optimizer.step_count());
        assert_eq!(fresh.scaler.state(), trained.scaler.state());

        let other_vocab = Vocabulary::new(["808", "deep", "tight"]);
        let mut mismatched = DenoiserState::new(&config, &cfg, other_vocab.len(), &ctx).unwrap();
        assert!(matches!(
            mismatched.restore(&bundle, &other_vocab),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn latest_bundle_is_chosen_numerically() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_step_bundle(&dir.path().join("missing")).unwrap().is_none());
        for name in ["diffusion_step_9", "diffusion_step_10", "vocoder_latest"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
            std::fs::write(dir.path().join(name).join("manifest.json"), "{}").unwrap();
        }
        // Incomplete bundle without a manifest.
        std::fs::create_dir_all(dir.path().join("diffusion_step_20")).unwrap();

        let (step, path) = latest_step_bundle(dir.path()).unwrap().unwrap();
        assert_eq!(step, 10);
        assert_eq!(path, dir.path().join("diffusion_step_10"));
    }

    #[test]
    fn training_resumes_from_latest_step_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config();
        save_fresh_codec(&cfg, &dir.path().join("codec"));
        let specs = dir.path().join("specs");
        write_spectrograms(&cfg, &specs, 4);
        let csv_path = dir.path().join("metadata.csv");
        write_metadata(&csv_path, 4);

        let ckpt = dir.path().join("ckpt");
        let config = DenoiserTrainConfig {
            spectrogram_dir: specs,
            latent_dir: dir.path().join("latents"),
            metadata_csv: csv_path,
            codec_checkpoint: dir.path().join("codec"),
            checkpoint_dir: ckpt.clone(),
            batch_size: 2,
            iterations: 2,
            num_workers: 0,
            gradient_accumulation: 1,
            min_keyword_count: 1,
            checkpoint_every: 2,
            validate_every: 0,
            ..Default::default()
        };
        let ctx = ExecutionContext::cpu();
        train_denoiser(&config, &cfg, &ctx).unwrap();
        assert!(ckpt.join("diffusion_step_2").is_dir());

        // Steps 0 and 1 are not rerun, so no step-1 bundle appears.
        let resumed = DenoiserTrainConfig {
            iterations: 3,
            checkpoint_every: 1,
            ..config.clone()
        };
        train_denoiser(&resumed, &cfg, &ctx).unwrap();
        assert!(!ckpt.join("diffusion_step_1").exists());
        let bundle = CheckpointBundle::load(&ckpt.join("diffusion_step_3"), CheckpointKind::Denoiser, &ctx).unwrap();
        assert_eq!(bundle.manifest.step, Some(3));
        assert_eq!(bundle.optimizer_step("optimizer"), 3);

        // Nothing left to do once the target is reached.
        train_denoiser(&resumed, &cfg, &ctx).unwrap();
        assert!(!ckpt.join("diffusion_step_4").exists());

        // Without resume the run starts over.
        let restart = DenoiserTrainConfig {
            resume: false,
            iterations: 1,
            ..resumed
        };
        train_denoiser(&restart, &cfg, &ctx).unwrap();
        let bundle = CheckpointBundle::load(&ckpt.join("diffusion_step_1"), CheckpointKind::Denoiser, &ctx).unwrap();
        assert_eq!(bundle.optimizer_step("optimizer"), 1);
    }
}
