//! Versioned checkpoint bundles.
//!
//! A bundle is a directory:
//!
//! ```text
//! <name>/
//!   manifest.json         kind, format version, config, counters, vocab, schedules
//!   tensors.safetensors   every tensor, keyed `<group>.<name>`
//! ```
//!
//! | kind             | groups                                             |
//! |------------------|----------------------------------------------------|
//! | `codec`          | `model`, `optimizer`                               |
//! | `denoiser`       | `model`, `ema`, `text_encoder`, `optimizer`        |
//! | `vocoder_train`  | `generator`, `mpd`, `msd`, `optim_g`, `optim_d`    |
//! | `vocoder_export` | `generator`                                        |
//!
//! Loading validates the version, the kind, every required group and,
//! through [`restore_varmaps`], every tensor name and shape before any
//! variable is overwritten.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::optim::{ExponentialLr, GradScalerState};
use crate::config::KickGenConfig;
use crate::context::ExecutionContext;
use crate::model::codec::LatentCodec;
use crate::model::conditioning::{KeywordEncoder, Vocabulary};
use crate::model::denoiser::LatentUNet;
use crate::model::vocoder::HifiGanGenerator;
use crate::{Error, Result};

pub const FORMAT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const TENSORS_FILE: &str = "tensors.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Codec,
    Denoiser,
    VocoderTrain,
    VocoderExport,
}

impl CheckpointKind {
    pub fn required_groups(self) -> &'static [&'static str] {
        match self {
            Self::Codec => &["model", "optimizer"],
            Self::Denoiser => &["model", "ema", "text_encoder", "optimizer"],
            Self::VocoderTrain => &["generator", "mpd", "msd", "optim_g", "optim_d"],
            Self::VocoderExport => &["generator"],
        }
    }
}

impl std::fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Codec => "codec",
            Self::Denoiser => "denoiser",
            Self::VocoderTrain => "vocoder_train",
            Self::VocoderExport => "vocoder_export",
        };
        f.write_str(name)
    }
}

/// Everything in a bundle that is not a tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub kind: CheckpointKind,
    pub config: KickGenConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocab: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sched_g: Option<ExponentialLr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sched_d: Option<ExponentialLr>,
    /// AdamW step counters, keyed by optimizer group.
    #[serde(default)]
    pub optimizer_steps: BTreeMap<String, usize>,
    #[serde(default)]
    pub scalers: BTreeMap<String, GradScalerState>,
    pub tensor_groups: Vec<String>,
}

/// In-memory checkpoint: manifest plus grouped tensors.
#[derive(Debug, Clone)]
pub struct CheckpointBundle {
    pub manifest: Manifest,
    groups: BTreeMap<String, HashMap<String, Tensor>>,
}

impl CheckpointBundle {
    pub fn new(kind: CheckpointKind, config: KickGenConfig) -> Self {
        Self {
            manifest: Manifest {
                format_version: FORMAT_VERSION,
                kind,
                config,
                epoch: None,
                step: None,
                vocab: None,
                sched_g: None,
                sched_d: None,
                optimizer_steps: BTreeMap::new(),
                scalers: BTreeMap::new(),
                tensor_groups: Vec::new(),
            },
            groups: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> CheckpointKind {
        self.manifest.kind
    }

    pub fn insert_group(&mut self, group: &str, tensors: HashMap<String, Tensor>) {
        self.groups.insert(group.to_string(), tensors);
    }

    /// Snapshot the current values of every variable in `varmap`.
    pub fn insert_varmap(&mut self, group: &str, varmap: &VarMap) {
        let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let tensors = data
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        drop(data);
        self.insert_group(group, tensors);
    }

    pub fn group(&self, group: &str) -> Result<&HashMap<String, Tensor>> {
        self.groups.get(group).ok_or_else(|| {
            Error::Checkpoint(format!(
                "{} checkpoint has no `{group}` tensor group",
                self.manifest.kind
            ))
        })
    }

    pub fn save(&mut self, dir: &Path) -> Result<()> {
        for required in self.manifest.kind.required_groups() {
            if !self.groups.contains_key(*required) {
                return Err(Error::Checkpoint(format!(
                    "refusing to write {} checkpoint without `{required}`",
                    self.manifest.kind
                )));
            }
        }
        std::fs::create_dir_all(dir)?;

        let mut flat: HashMap<String, Tensor> = HashMap::new();
        for (group, tensors) in &self.groups {
            for (name, t) in tensors {
                flat.insert(format!("{group}.{name}"), t.clone());
            }
        }
        self.manifest.tensor_groups = self.groups.keys().cloned().collect();

        candle_core::safetensors::save(&flat, dir.join(TENSORS_FILE))?;
        // The manifest goes last: a bundle without one is incomplete.
        let file = std::fs::File::create(dir.join(MANIFEST_FILE))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &self.manifest)?;
        tracing::info!(path = %dir.display(), kind = %self.manifest.kind, tensors = flat.len(), "saved checkpoint");
        Ok(())
    }

    pub fn load(dir: &Path, expected: CheckpointKind, ctx: &ExecutionContext) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(Error::Checkpoint(format!(
                "{} is not a checkpoint bundle (no {MANIFEST_FILE})",
                dir.display()
            )));
        }
        let text = std::fs::read_to_string(&manifest_path)?;
        let manifest: Manifest = serde_json::from_str(&text)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(Error::Checkpoint(format!(
                "unsupported checkpoint format version {} (expected {FORMAT_VERSION})",
                manifest.format_version
            )));
        }
        let kind_ok = manifest.kind == expected
            || (expected == CheckpointKind::VocoderExport
                && manifest.kind == CheckpointKind::VocoderTrain);
        if !kind_ok {
            return Err(Error::Checkpoint(format!(
                "{} holds a {} checkpoint, expected {expected}",
                dir.display(),
                manifest.kind
            )));
        }

        let flat = candle_core::safetensors::load(dir.join(TENSORS_FILE), &ctx.device)?;
        // Groups can legitimately be empty (an optimizer that never stepped).
        let mut groups: BTreeMap<String, HashMap<String, Tensor>> = manifest
            .tensor_groups
            .iter()
            .map(|g| (g.clone(), HashMap::new()))
            .collect();
        for (key, t) in flat {
            let Some((group, name)) = key.split_once('.') else {
                return Err(Error::Checkpoint(format!("tensor `{key}` has no group prefix")));
            };
            groups
                .entry(group.to_string())
                .or_default()
                .insert(name.to_string(), t);
        }

        let bundle = Self { manifest, groups };
        for required in bundle.manifest.kind.required_groups() {
            bundle.group(required)?;
        }
        tracing::debug!(path = %dir.display(), kind = %bundle.manifest.kind, "loaded checkpoint");
        Ok(bundle)
    }

    /// The manifest config must match the caller's on every shape field.
    pub fn ensure_config(&self, expected: &KickGenConfig) -> Result<()> {
        self.manifest.config.ensure_compatible(expected)
    }

    pub fn optimizer_step(&self, group: &str) -> usize {
        self.manifest.optimizer_steps.get(group).copied().unwrap_or(0)
    }
}

/// Check that `tensors` holds exactly the variables of `varmap` with the same
/// shapes.
fn validate_varmap(group: &str, varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> Result<()> {
    let data = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
    for (name, var) in data.iter() {
        let t = tensors
            .get(name)
            .ok_or_else(|| Error::Checkpoint(format!("missing tensor `{group}.{name}`")))?;
        if t.dims() != var.dims() {
            return Err(Error::Checkpoint(format!(
                "tensor `{group}.{name}` has shape {:?}, model expects {:?}",
                t.dims(),
                var.dims()
            )));
        }
    }
    if let Some(extra) = tensors.keys().find(|k| !data.contains_key(*k)) {
        return Err(Error::Checkpoint(format!(
            "unexpected tensor `{group}.{extra}` for this model"
        )));
    }
    Ok(())
}

/// Overwrite several var maps from their tensor groups. Every group is
/// validated before the first variable changes.
pub fn restore_varmaps(targets: &mut [(&str, &mut VarMap, &HashMap<String, Tensor>)]) -> Result<()> {
    for (group, varmap, tensors) in targets.iter() {
        validate_varmap(group, varmap, tensors)?;
    }
    for (_, varmap, tensors) in targets.iter_mut() {
        for (name, t) in tensors.iter() {
            varmap.set_one(name, t)?;
        }
    }
    Ok(())
}

/// Single-group form of [`restore_varmaps`].
pub fn restore_varmap(group: &str, varmap: &mut VarMap, tensors: &HashMap<String, Tensor>) -> Result<()> {
    restore_varmaps(&mut [(group, varmap, tensors)])
}

/// Conventional bundle path inside a checkpoint directory.
pub fn bundle_path(checkpoint_dir: &Path, name: &str) -> PathBuf {
    checkpoint_dir.join(name)
}

// ---------------------------------------------------------------------------
// Typed loaders for inference
// ---------------------------------------------------------------------------

fn fresh_varmap(ctx: &ExecutionContext) -> (VarMap, VarBuilder<'static>) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, ctx.dtype, &ctx.device);
    (varmap, vb)
}

/// Codec weights from a `codec` bundle.
pub fn load_codec(dir: &Path, expected: &KickGenConfig, ctx: &ExecutionContext) -> Result<LatentCodec> {
    let bundle = CheckpointBundle::load(dir, CheckpointKind::Codec, ctx)?;
    bundle.ensure_config(expected)?;
    let (mut varmap, vb) = fresh_varmap(ctx);
    let codec = LatentCodec::new(&expected.codec, expected.audio.spectrogram_shape(), vb)?;
    restore_varmap("model", &mut varmap, bundle.group("model")?)?;
    Ok(codec)
}

/// Trained denoiser, keyword encoder and the vocabulary they were trained on.
#[derive(Debug, Clone)]
pub struct DenoiserWeights {
    pub unet: LatentUNet,
    pub text_encoder: KeywordEncoder,
    pub vocab: Vocabulary,
    pub step: usize,
}

/// Denoiser from a `denoiser` bundle, using the EMA weights when `use_ema`.
pub fn load_denoiser(
    dir: &Path,
    expected: &KickGenConfig,
    ctx: &ExecutionContext,
    use_ema: bool,
) -> Result<DenoiserWeights> {
    let bundle = CheckpointBundle::load(dir, CheckpointKind::Denoiser, ctx)?;
    bundle.ensure_config(expected)?;
    let words = bundle
        .manifest
        .vocab
        .clone()
        .ok_or_else(|| Error::Checkpoint("denoiser manifest has no vocabulary".into()))?;
    let vocab = Vocabulary::new(words);

    let (mut unet_vm, unet_vb) = fresh_varmap(ctx);
    let unet = LatentUNet::new(expected.codec.latent_channels, &expected.denoiser, unet_vb)?;
    let (mut text_vm, text_vb) = fresh_varmap(ctx);
    let text_encoder = KeywordEncoder::new(
        vocab.len(),
        expected.denoiser.text_embed_dim,
        expected.denoiser.cond_dim,
        text_vb,
    )?;

    let unet_group = if use_ema { "ema" } else { "model" };
    restore_varmaps(&mut [
        (unet_group, &mut unet_vm, bundle.group(unet_group)?),
        ("text_encoder", &mut text_vm, bundle.group("text_encoder")?),
    ])?;
    Ok(DenoiserWeights {
        unet,
        text_encoder,
        vocab,
        step: bundle.manifest.step.unwrap_or(0),
    })
}

/// Inference generator with weight norm folded. Accepts an export bundle or
/// a training bundle (whose `generator` group is used).
pub fn load_vocoder(
    dir: &Path,
    expected: &KickGenConfig,
    ctx: &ExecutionContext,
) -> Result<HifiGanGenerator> {
    let bundle = CheckpointBundle::load(dir, CheckpointKind::VocoderExport, ctx)?;
    bundle.ensure_config(expected)?;
    let (mut varmap, vb) = fresh_varmap(ctx);
    let generator = HifiGanGenerator::new(expected.audio.n_mels, &expected.vocoder, vb)?;
    restore_varmap("generator", &mut varmap, bundle.group("generator")?)?;
    generator.fold_weight_norm()
}
