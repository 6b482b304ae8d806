//! Latent codec (VAE) training.

use std::path::PathBuf;
use std::sync::Arc;

use candle_nn::{ParamsAdamW, VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::checkpoint::{CheckpointBundle, CheckpointKind, bundle_path};
use super::data::{
    BatchLoader, Dataset, LoaderConfig, SPLIT_SEED, SpectrogramDataset, VAL_FRACTION, split_indices,
};
use super::losses::{CodecMetrics, codec_loss};
use super::optim::{AdamW, GradScaler, Gradients, ParamSet};
use super::progress_bar;
use crate::config::KickGenConfig;
use crate::context::ExecutionContext;
use crate::model::codec::{LatentCodec, kl_weight};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecTrainConfig {
    /// Directory of `<stem>.safetensors` spectrograms.
    #[serde(default = "default_spectrogram_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_kl_start")]
    pub kl_weight_start: f64,
    #[serde(default = "default_kl_end")]
    pub kl_weight_end: f64,
    #[serde(default = "default_kl_anneal_epochs")]
    pub kl_anneal_epochs: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    /// Dynamic loss scaling.
    #[serde(default)]
    pub loss_scaling: bool,
    #[serde(default)]
    pub seed: u64,
}

impl Default for CodecTrainConfig {
    fn default() -> Self {
        Self {
            data_dir: default_spectrogram_dir(),
            checkpoint_dir: default_checkpoint_dir(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            epochs: default_epochs(),
            num_workers: default_num_workers(),
            kl_weight_start: default_kl_start(),
            kl_weight_end: default_kl_end(),
            kl_anneal_epochs: default_kl_anneal_epochs(),
            checkpoint_every: default_checkpoint_every(),
            loss_scaling: false,
            seed: 0,
        }
    }
}

fn default_spectrogram_dir() -> PathBuf {
    PathBuf::from("data/spectrograms")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_epochs() -> usize {
    100
}

fn default_num_workers() -> usize {
    4
}

fn default_kl_start() -> f64 {
    1e-4
}

fn default_kl_end() -> f64 {
    1e-3
}

fn default_kl_anneal_epochs() -> usize {
    20
}

fn default_checkpoint_every() -> usize {
    10
}

/// Train the codec from scratch and return it.
///
/// A bundle `vae_epoch_{n}` is written every `checkpoint_every` epochs and
/// after the final epoch.
pub fn train_codec(
    config: &CodecTrainConfig,
    model_config: &KickGenConfig,
    ctx: &ExecutionContext,
) -> Result<LatentCodec> {
    model_config.validate()?;
    let dataset = Arc::new(SpectrogramDataset::open(&config.data_dir)?);
    let (train_idx, val_idx) = split_indices(dataset.len(), VAL_FRACTION, SPLIT_SEED);
    tracing::info!(train = train_idx.len(), val = val_idx.len(), "codec dataset split");

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

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, ctx.dtype, &ctx.device);
    let codec = LatentCodec::new(&model_config.codec, model_config.audio.spectrogram_shape(), vb)?;
    let params = ParamSet::from_varmap(&varmap);
    tracing::info!(parameters = params.num_elements(), "codec initialized");

    let mut optimizer = AdamW::new(
        &params,
        ParamsAdamW {
            lr: config.learning_rate,
            ..Default::default()
        },
    )?;
    let mut scaler = GradScaler::new(config.loss_scaling);
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut grads = Gradients::new(&params);

    for epoch in 0..config.epochs {
        let kl_w = kl_weight(
            epoch,
            config.kl_weight_start,
            config.kl_weight_end,
            config.kl_anneal_epochs,
        );
        let bar = progress_bar(train_loader.num_batches(), format!("epoch {}/{}", epoch + 1, config.epochs));
        let mut metrics = CodecMetrics::default();
        for batch in train_loader.epoch(epoch) {
            let x = batch?.to_device(&ctx.device)?.to_dtype(ctx.dtype)?;
            let output = codec.forward(&x, &mut rng)?;
            let loss = codec_loss(&output, &x, kl_w)?;
            let store = scaler.scale_loss(&loss.total)?.backward()?;
            grads.clear();
            grads.accumulate(&params, &store)?;
            scaler.step(&mut optimizer, &params, &mut grads)?;
            metrics.add(&loss)?;
            bar.inc(1);
        }
        bar.finish_and_clear();

        let m = metrics.mean();
        tracing::info!(
            epoch = epoch + 1,
            mse = m.mse,
            spectral = m.spectral,
            kl = m.kl,
            kl_weighted = m.kl_weighted,
            total = m.total,
            kl_weight = kl_w,
            "codec train"
        );
        if val_loader.num_examples() > 0 {
            let v = validate(&codec, &val_loader, epoch, kl_w, ctx, &mut rng)?;
            tracing::info!(epoch = epoch + 1, mse = v.mse, spectral = v.spectral, kl = v.kl, total = v.total, "codec val");
        }

        let last = epoch + 1 == config.epochs;
        if (config.checkpoint_every > 0 && (epoch + 1) % config.checkpoint_every == 0) || last {
            let mut bundle = CheckpointBundle::new(CheckpointKind::Codec, model_config.clone());
            bundle.manifest.epoch = Some(epoch + 1);
            bundle.manifest.optimizer_steps.insert("optimizer".into(), optimizer.step_count());
            if scaler.is_enabled() {
                bundle.manifest.scalers.insert("optimizer".into(), scaler.state());
            }
            bundle.insert_varmap("model", &varmap);
            bundle.insert_group("optimizer", optimizer.state_tensors(&params));
            bundle.save(&bundle_path(&config.checkpoint_dir, &format!("vae_epoch_{}", epoch + 1)))?;
        }
    }
    Ok(codec)
}

fn validate(
    codec: &LatentCodec,
    loader: &BatchLoader<SpectrogramDataset>,
    epoch: usize,
    kl_w: f64,
    ctx: &ExecutionContext,
    rng: &mut ChaCha8Rng,
) -> Result<CodecMetrics> {
    let mut metrics = CodecMetrics::default();
    for batch in loader.epoch(epoch) {
        let x = batch?.to_device(&ctx.device)?.to_dtype(ctx.dtype)?;
        let output = codec.forward(&x, rng)?;
        metrics.add(&codec_loss(&output, &x, kl_w)?)?;
    }
    Ok(metrics.mean())
}
