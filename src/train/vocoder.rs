//! Adversarial vocoder training against the multi-period and multi-scale
//! discriminators, with resume from the latest bundle.
//!
//! Per batch:
//!
//! ```text
//! fake = G(mel)                         (trimmed with real to the shorter length)
//! D:  Σ_{mpd,msd} lsgan(D(real), D(fake.detach()))
//! G:  adv(D(fake)) + fm_weight · fm(D(real), D(fake)) + mel_weight · L1(logmel(real), logmel(fake))
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_nn::{ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::checkpoint::{CheckpointBundle, CheckpointKind, bundle_path, restore_varmap, restore_varmaps};
use super::data::{BatchLoader, Dataset, LoaderConfig, VocoderBatch, VocoderDataset};
use super::losses::{discriminator_loss, feature_matching_loss, generator_adversarial_loss, mel_loss};
use super::optim::{AdamW, ExponentialLr, GradScaler, Gradients, ParamSet};
use super::progress_bar;
use crate::audio::{MelConfig, MelFrontend};
use crate::config::KickGenConfig;
use crate::context::ExecutionContext;
use crate::model::discriminator::{MultiPeriodDiscriminator, MultiScaleDiscriminator};
use crate::model::layers::scalar;
use crate::model::vocoder::HifiGanGenerator;
use crate::{Error, Result};

/// Bundle rewritten after every epoch and used for resume.
pub const LATEST_CHECKPOINT: &str = "vocoder_latest";

/// Generator-only bundle written when training finishes.
pub const FINAL_EXPORT: &str = "vocoder_final";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocoderTrainConfig {
    /// Directory of `<stem>.wav` source audio.
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,
    /// Directory of `<stem>.safetensors` spectrograms.
    #[serde(default = "default_spectrogram_dir")]
    pub spectrogram_dir: PathBuf,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Waveform samples per training segment (a whole number of hops).
    #[serde(default = "default_segment_samples")]
    pub segment_samples: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_beta1")]
    pub adam_beta1: f64,
    #[serde(default = "default_beta2")]
    pub adam_beta2: f64,
    /// Per-epoch decay of both learning rates.
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default = "default_fm_weight")]
    pub feature_matching_weight: f64,
    #[serde(default = "default_mel_weight")]
    pub mel_weight: f64,
    /// Continue from `vocoder_latest` when it exists.
    #[serde(default = "default_resume")]
    pub resume: bool,
    #[serde(default)]
    pub loss_scaling: bool,
    #[serde(default)]
    pub seed: u64,
}

impl Default for VocoderTrainConfig {
    fn default() -> Self {
        Self {
            raw_dir: default_raw_dir(),
            spectrogram_dir: default_spectrogram_dir(),
            checkpoint_dir: default_checkpoint_dir(),
            batch_size: default_batch_size(),
            segment_samples: default_segment_samples(),
            learning_rate: default_learning_rate(),
            adam_beta1: default_beta1(),
            adam_beta2: default_beta2(),
            lr_decay: default_lr_decay(),
            epochs: default_epochs(),
            num_workers: default_num_workers(),
            checkpoint_every: default_checkpoint_every(),
            feature_matching_weight: default_fm_weight(),
            mel_weight: default_mel_weight(),
            resume: default_resume(),
            loss_scaling: false,
            seed: 0,
        }
    }
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_spectrogram_dir() -> PathBuf {
    PathBuf::from("data/spectrograms")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_batch_size() -> usize {
    8
}

fn default_segment_samples() -> usize {
    8192
}

fn default_learning_rate() -> f64 {
    2e-4
}

fn default_beta1() -> f64 {
    0.8
}

fn default_beta2() -> f64 {
    0.99
}

fn default_lr_decay() -> f64 {
    0.999
}

fn default_epochs() -> usize {
    50
}

fn default_num_workers() -> usize {
    2
}

fn default_checkpoint_every() -> usize {
    10
}

fn default_fm_weight() -> f64 {
    2.0
}

fn default_mel_weight() -> f64 {
    45.0
}

fn default_resume() -> bool {
    true
}

/// Generator, both discriminator families and everything that steps them.
struct GanState {
    generator: HifiGanGenerator,
    mpd: MultiPeriodDiscriminator,
    msd: MultiScaleDiscriminator,
    gen_vars: VarMap,
    mpd_vars: VarMap,
    msd_vars: VarMap,
    params_g: ParamSet,
    params_d: ParamSet,
    optim_g: AdamW,
    optim_d: AdamW,
    sched_g: ExponentialLr,
    sched_d: ExponentialLr,
    scaler_g: GradScaler,
    scaler_d: GradScaler,
}

impl GanState {
    fn new(config: &VocoderTrainConfig, model_config: &KickGenConfig, ctx: &ExecutionContext) -> Result<Self> {
        let gen_vars = VarMap::new();
        let generator = HifiGanGenerator::new(
            model_config.audio.n_mels,
            &model_config.vocoder,
            VarBuilder::from_varmap(&gen_vars, ctx.dtype, &ctx.device),
        )?;
        let mpd_vars = VarMap::new();
        let mpd = MultiPeriodDiscriminator::new(
            &model_config.vocoder.periods,
            VarBuilder::from_varmap(&mpd_vars, ctx.dtype, &ctx.device),
        )?;
        let msd_vars = VarMap::new();
        let msd = MultiScaleDiscriminator::new(VarBuilder::from_varmap(&msd_vars, ctx.dtype, &ctx.device))?;

        let params_g = ParamSet::from_varmap(&gen_vars);
        let params_d = ParamSet::from_groups(&[("mpd", &mpd_vars), ("msd", &msd_vars)]);
        let adam = ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.adam_beta1,
            beta2: config.adam_beta2,
            ..Default::default()
        };
        let optim_g = AdamW::new(&params_g, adam.clone())?;
        let optim_d = AdamW::new(&params_d, adam)?;
        Ok(Self {
            generator,
            mpd,
            msd,
            gen_vars,
            mpd_vars,
            msd_vars,
            params_g,
            params_d,
            optim_g,
            optim_d,
            sched_g: ExponentialLr::new(config.learning_rate, config.lr_decay),
            sched_d: ExponentialLr::new(config.learning_rate, config.lr_decay),
            scaler_g: GradScaler::new(config.loss_scaling),
            scaler_d: GradScaler::new(config.loss_scaling),
        })
    }

    fn bundle(&self, model_config: &KickGenConfig, epochs_done: usize) -> CheckpointBundle {
        let mut bundle = CheckpointBundle::new(CheckpointKind::VocoderTrain, model_config.clone());
        bundle.manifest.epoch = Some(epochs_done);
        bundle.manifest.sched_g = Some(self.sched_g);
        bundle.manifest.sched_d = Some(self.sched_d);
        bundle.manifest.optimizer_steps.insert("optim_g".into(), self.optim_g.step_count());
        bundle.manifest.optimizer_steps.insert("optim_d".into(), self.optim_d.step_count());
        if self.scaler_g.is_enabled() {
            bundle.manifest.scalers.insert("optim_g".into(), self.scaler_g.state());
            bundle.manifest.scalers.insert("optim_d".into(), self.scaler_d.state());
        }
        bundle.insert_varmap("generator", &self.gen_vars);
        bundle.insert_varmap("mpd", &self.mpd_vars);
        bundle.insert_varmap("msd", &self.msd_vars);
        bundle.insert_group("optim_g", self.optim_g.state_tensors(&self.params_g));
        bundle.insert_group("optim_d", self.optim_d.state_tensors(&self.params_d));
        bundle
    }

    /// Restore every weight, moment, schedule and scaler from a training
    /// bundle. Returns the number of completed epochs.
    fn restore(&mut self, bundle: &CheckpointBundle) -> Result<usize> {
        let manifest = &bundle.manifest;
        let (Some(epochs_done), Some(sched_g), Some(sched_d)) = (manifest.epoch, manifest.sched_g, manifest.sched_d)
        else {
            return Err(Error::Checkpoint(
                "vocoder training bundle lacks epoch or schedules".into(),
            ));
        };
        restore_varmaps(&mut [
            ("generator", &mut self.gen_vars, bundle.group("generator")?),
            ("mpd", &mut self.mpd_vars, bundle.group("mpd")?),
            ("msd", &mut self.msd_vars, bundle.group("msd")?),
        ])?;
        self.optim_g.load_state(&self.params_g, bundle.group("optim_g")?, bundle.optimizer_step("optim_g"))?;
        self.optim_d.load_state(&self.params_d, bundle.group("optim_d")?, bundle.optimizer_step("optim_d"))?;
        self.sched_g = sched_g;
        self.sched_d = sched_d;
        self.optim_g.set_learning_rate(sched_g.current_lr());
        self.optim_d.set_learning_rate(sched_d.current_lr());
        if let Some(state) = manifest.scalers.get("optim_g") {
            self.scaler_g.load_state(*state);
        }
        if let Some(state) = manifest.scalers.get("optim_d") {
            self.scaler_d.load_state(*state);
        }
        Ok(epochs_done)
    }
}

/// Epoch means of the GAN losses.
#[derive(Debug, Clone, Copy, Default)]
struct GanMetrics {
    disc: f64,
    generator: f64,
    adv: f64,
    fm: f64,
    mel: f64,
    batches: usize,
}

/// Train (or continue training) the vocoder. Returns the generator with
/// training-form weights.
pub fn train_vocoder(
    config: &VocoderTrainConfig,
    model_config: &KickGenConfig,
    ctx: &ExecutionContext,
) -> Result<HifiGanGenerator> {
    model_config.validate()?;
    let hop = model_config.audio.hop_length;
    if config.segment_samples % hop != 0 {
        return Err(Error::Config(format!(
            "segment_samples {} is not a multiple of hop_length {hop}",
            config.segment_samples
        )));
    }

    let dataset = Arc::new(VocoderDataset::open(
        &config.raw_dir,
        &config.spectrogram_dir,
        &model_config.audio,
        config.segment_samples,
    )?);
    let loader = BatchLoader::new(
        Arc::clone(&dataset),
        (0..dataset.len()).collect(),
        LoaderConfig {
            batch_size: config.batch_size,
            shuffle: true,
            drop_last: true,
            num_workers: config.num_workers,
            seed: config.seed,
            ..Default::default()
        },
    )?;
    if loader.num_batches() == 0 {
        tracing::error!(
            clips = dataset.len(),
            batch_size = config.batch_size,
            "not enough paired clips for one full batch"
        );
        return Err(Error::EmptyDataset(config.raw_dir.clone()));
    }

    let mut state = GanState::new(config, model_config, ctx)?;
    let mut start_epoch = 0;
    let latest = bundle_path(&config.checkpoint_dir, LATEST_CHECKPOINT);
    if config.resume && latest.join("manifest.json").is_file() {
        let bundle = CheckpointBundle::load(&latest, CheckpointKind::VocoderTrain, ctx)?;
        bundle.ensure_config(model_config)?;
        start_epoch = state.restore(&bundle)?;
        tracing::info!(path = %latest.display(), start_epoch, "resuming vocoder training");
    }
    tracing::info!(
        generator = state.params_g.num_elements(),
        discriminators = state.params_d.num_elements(),
        "vocoder initialized"
    );

    let frontend = MelFrontend::new(MelConfig::from_audio(&model_config.audio, 1.0), &ctx.device)?;
    let mut grads_g = Gradients::new(&state.params_g);
    let mut grads_d = Gradients::new(&state.params_d);

    for epoch in start_epoch..config.epochs {
        let bar = progress_bar(loader.num_batches(), format!("epoch {}/{}", epoch + 1, config.epochs));
        let mut metrics = GanMetrics::default();
        for batch in loader.epoch(epoch) {
            train_step(
                &mut state,
                &batch?,
                config,
                &frontend,
                ctx,
                &mut grads_g,
                &mut grads_d,
                &mut metrics,
            )?;
            bar.inc(1);
        }
        bar.finish_and_clear();

        let n = metrics.batches.max(1) as f64;
        tracing::info!(
            epoch = epoch + 1,
            loss_d = metrics.disc / n,
            loss_g = metrics.generator / n,
            adv = metrics.adv / n,
            fm = metrics.fm / n,
            mel = metrics.mel / n,
            lr = state.optim_g.learning_rate(),
            "vocoder train"
        );

        state.sched_g.step(&mut state.optim_g);
        state.sched_d.step(&mut state.optim_d);

        let mut bundle = state.bundle(model_config, epoch + 1);
        let last = epoch + 1 == config.epochs;
        if (config.checkpoint_every > 0 && (epoch + 1) % config.checkpoint_every == 0) || last {
            bundle.save(&bundle_path(&config.checkpoint_dir, &format!("vocoder_epoch_{}", epoch + 1)))?;
        }
        bundle.save(&latest)?;
    }

    let mut export = CheckpointBundle::new(CheckpointKind::VocoderExport, model_config.clone());
    export.insert_varmap("generator", &state.gen_vars);
    export.save(&bundle_path(&config.checkpoint_dir, FINAL_EXPORT))?;
    Ok(state.generator)
}

#[allow(clippy::too_many_arguments)]
fn train_step(
    state: &mut GanState,
    batch: &VocoderBatch,
    config: &VocoderTrainConfig,
    frontend: &MelFrontend,
    ctx: &ExecutionContext,
    grads_g: &mut Gradients,
    grads_d: &mut Gradients,
    metrics: &mut GanMetrics,
) -> Result<()> {
    let mel = batch.mel.to_device(&ctx.device)?.to_dtype(ctx.dtype)?;
    let audio = batch.audio.to_device(&ctx.device)?.to_dtype(ctx.dtype)?;
    let fake = state.generator.forward(&mel)?;
    let len = fake.dim(2)?.min(audio.dim(2)?);
    let fake = fake.narrow(2, 0, len)?;
    let real = audio.narrow(2, 0, len)?;

    // Discriminators see a detached generator output.
    let fake_detached = fake.detach();
    let loss_d = (discriminator_loss(&state.mpd.forward(&real)?, &state.mpd.forward(&fake_detached)?)?
        + discriminator_loss(&state.msd.forward(&real)?, &state.msd.forward(&fake_detached)?)?)?;
    let store = state.scaler_d.scale_loss(&loss_d)?.backward()?;
    grads_d.clear();
    grads_d.accumulate(&state.params_d, &store)?;
    state.scaler_d.step(&mut state.optim_d, &state.params_d, grads_d)?;

    let mpd_real = state.mpd.forward(&real)?;
    let mpd_fake = state.mpd.forward(&fake)?;
    let msd_real = state.msd.forward(&real)?;
    let msd_fake = state.msd.forward(&fake)?;
    let adv = (generator_adversarial_loss(&mpd_fake)? + generator_adversarial_loss(&msd_fake)?)?;
    let fm = (feature_matching_loss(&mpd_real, &mpd_fake)? + feature_matching_loss(&msd_real, &msd_fake)?)?;
    let mel_l1 = mel_loss(frontend, &real, &fake)?;
    let loss_g = ((&adv + (&fm * config.feature_matching_weight)?)? + (&mel_l1 * config.mel_weight)?)?;
    let store = state.scaler_g.scale_loss(&loss_g)?.backward()?;
    grads_g.clear();
    grads_g.accumulate(&state.params_g, &store)?;
    state.scaler_g.step(&mut state.optim_g, &state.params_g, grads_g)?;

    metrics.disc += scalar(&loss_d)?;
    metrics.generator += scalar(&loss_g)?;
    metrics.adv += scalar(&adv)?;
    metrics.fm += scalar(&fm)?;
    metrics.mel += scalar(&mel_l1)?;
    metrics.batches += 1;
    Ok(())
}

/// Write a generator-only bundle from a training (or export) bundle.
pub fn export_vocoder(
    checkpoint: &Path,
    output: &Path,
    model_config: &KickGenConfig,
    ctx: &ExecutionContext,
) -> Result<()> {
    let bundle = CheckpointBundle::load(checkpoint, CheckpointKind::VocoderExport, ctx)?;
    bundle.ensure_config(model_config)?;

    // Round-trip through a generator so names and shapes are checked.
    let mut gen_vars = VarMap::new();
    HifiGanGenerator::new(
        model_config.audio.n_mels,
        &model_config.vocoder,
        VarBuilder::from_varmap(&gen_vars, ctx.dtype, &ctx.device),
    )?;
    restore_varmap("generator", &mut gen_vars, bundle.group("generator")?)?;

    let mut export = CheckpointBundle::new(CheckpointKind::VocoderExport, model_config.clone());
    export.insert_varmap("generator", &gen_vars);
    export.save(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VocoderConfig;
    use crate::train::checkpoint::load_vocoder;
    use crate::train::data::{MEL_TENSOR, save_tensor};
    use candle_core::{Device, Tensor};

    fn tiny_config() -> KickGenConfig {
        let mut cfg = KickGenConfig::default();
        cfg.audio.n_mels = 8;
        cfg.audio.n_fft = 64;
        cfg.audio.hop_length = 16;
        cfg.audio.duration_secs = 0.05;
        cfg.vocoder = VocoderConfig {
            upsample_initial_channel: 16,
            upsample_rates: vec![4, 4],
            upsample_kernel_sizes: vec![8, 8],
            resblock_kernel_sizes: vec![3],
            resblock_dilations: vec![vec![1, 3]],
            ..Default::default()
        };
        cfg
    }

    fn write_pairs(cfg: &KickGenConfig, root: &Path, n: usize) -> (PathBuf, PathBuf) {
        let raw = root.join("raw");
        let mels = root.join("mels");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::create_dir_all(&mels).unwrap();
        let (n_mels, frames) = cfg.audio.spectrogram_shape();
        for i in 0..n {
            let wav: Vec<f32> = (0..cfg.audio.target_samples())
                .map(|s| ((s + i) as f32 * 0.05).sin() * 0.5)
                .collect();
            crate::audio::write_wav_mono(raw.join(format!("k{i}.wav")), &wav, cfg.audio.sample_rate).unwrap();
            let mel = Tensor::randn(0f32, 1., (1, n_mels, frames), &Device::Cpu).unwrap();
            save_tensor(&mels.join(format!("k{i}.safetensors")), MEL_TENSOR, &mel).unwrap();
        }
        (raw, mels)
    }

    #[test]
    fn train_resume_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config();
        let (raw, mels) = write_pairs(&cfg, dir.path(), 2);
        let ckpt = dir.path().join("ckpt");
        let mut config = VocoderTrainConfig {
            raw_dir: raw,
            spectrogram_dir: mels,
            checkpoint_dir: ckpt.clone(),
            batch_size: 2,
            segment_samples: 64,
            epochs: 1,
            num_workers: 0,
            ..Default::default()
        };
        let ctx = ExecutionContext::cpu();
        train_vocoder(&config, &cfg, &ctx).unwrap();
        let first = CheckpointBundle::load(&ckpt.join(LATEST_CHECKPOINT), CheckpointKind::VocoderTrain, &ctx).unwrap();
        assert_eq!(first.manifest.epoch, Some(1));
        assert!(ckpt.join("vocoder_epoch_1/manifest.json").is_file());

        config.epochs = 2;
        train_vocoder(&config, &cfg, &ctx).unwrap();
        let second = CheckpointBundle::load(&ckpt.join(LATEST_CHECKPOINT), CheckpointKind::VocoderTrain, &ctx).unwrap();
        assert_eq!(second.manifest.epoch, Some(2));
        assert_eq!(second.optimizer_step("optim_g"), 2);
        let sched = second.manifest.sched_g.unwrap();
        assert_eq!(sched.last_epoch, 2);

        let out = dir.path().join("exported");
        export_vocoder(&ckpt.join(LATEST_CHECKPOINT), &out, &cfg, &ctx).unwrap();
        let exported = CheckpointBundle::load(&out, CheckpointKind::VocoderExport, &ctx).unwrap();
        assert_eq!(exported.kind(), CheckpointKind::VocoderExport);
        assert!(exported.group("mpd").is_err());

        let generator = load_vocoder(&ckpt.join(FINAL_EXPORT), &cfg, &ctx).unwrap();
        assert!(generator.is_folded());
        let (n_mels, _) = cfg.audio.spectrogram_shape();
        let mel = Tensor::zeros((1, n_mels, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert_eq!(generator.forward(&mel).unwrap().dims(), &[1, 1, 48]);
    }

    #[test]
    fn misaligned_segment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = VocoderTrainConfig {
            raw_dir: dir.path().into(),
            spectrogram_dir: dir.path().into(),
            segment_samples: 100,
            ..Default::default()
        };
        assert!(matches!(
            train_vocoder(&config, &tiny_config(), &ExecutionContext::cpu()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn too_few_clips_report_an_empty_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_config();
        let ctx = ExecutionContext::cpu();

        let (raw, mels) = write_pairs(&cfg, &dir.path().join("one"), 1);
        let config = VocoderTrainConfig {
            raw_dir: raw,
            spectrogram_dir: mels,
            checkpoint_dir: dir.path().join("ckpt"),
            batch_size: 2,
            segment_samples: 64,
            num_workers: 0,
            ..Default::default()
        };
        assert!(matches!(train_vocoder(&config, &cfg, &ctx), Err(Error::EmptyDataset(_))));

        let (raw, mels) = write_pairs(&cfg, &dir.path().join("none"), 0);
        let config = VocoderTrainConfig {
            raw_dir: raw,
            spectrogram_dir: mels,
            ..config
        };
        assert!(matches!(train_vocoder(&config, &cfg, &ctx), Err(Error::EmptyDataset(_))));
        assert!(!dir.path().join("ckpt").exists());
    }
}
