//! Variational latent codec: log-mel spectrogram ⇄ compact latent.
//!
//! ## Architecture (default widths)
//!
//! ```text
//! [B, 1, 128, 173]
//!   ─→ Conv(1→32, k3 s2) + Res(32)        [B, 32, 64, 87]
//!   ─→ Conv(32→64, k3 s2) + Res(64)       [B, 64, 32, 44]
//!   ─→ Conv(64→128, k3 s2) + Res(128)     [B, 128, 16, 22]
//!   ─→ Conv(128→256, k3 s2) + Res(256)    [B, 256, 8, 11]
//!   ─→ 1×1 heads → μ, log σ²              [B, 4, 8, 11]
//!
//! z ─→ Conv1×1(4→256) + Res(256)
//!   ─→ ConvT(256→128, k4 s2 p1) + Res(128) [B, 128, 16, 22]
//!   ─→ ConvT(128→64) + Res(64)             [B, 64, 32, 44]
//!   ─→ ConvT(64→32) + Res(32)              [B, 32, 64, 88]
//!   ─→ ConvT(32→1)                         [B, 1, 128, 176]
//!   ─→ crop                                [B, 1, 128, 173]
//! ```

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;
use rand::Rng;

use super::layers::{NORM_GROUPS, UpConv2d, crop_spatial};
use crate::config::CodecConfig;
use crate::scheduler::gaussian_noise;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// ResBlock
// ---------------------------------------------------------------------------

/// `x + [GN → SiLU → Conv3×3 → GN → SiLU → Conv3×3](x)`.
#[derive(Debug, Clone)]
pub struct CodecResBlock {
    norm1: candle_nn::GroupNorm,
    conv1: candle_nn::Conv2d,
    norm2: candle_nn::GroupNorm,
    conv2: candle_nn::Conv2d,
}

impl CodecResBlock {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg3x3 = candle_nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            norm1: candle_nn::group_norm(NORM_GROUPS, channels, 1e-5, vb.pp("norm1"))?,
            conv1: candle_nn::conv2d(channels, channels, 3, cfg3x3, vb.pp("conv1"))?,
            norm2: candle_nn::group_norm(NORM_GROUPS, channels, 1e-5, vb.pp("norm2"))?,
            conv2: candle_nn::conv2d(channels, channels, 3, cfg3x3, vb.pp("conv2"))?,
        })
    }
}

impl Module for CodecResBlock {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = x.apply(&self.norm1)?.apply(&candle_nn::Activation::Silu)?;
        let h = h.apply(&self.conv1)?;
        let h = h.apply(&self.norm2)?.apply(&candle_nn::Activation::Silu)?;
        let h = h.apply(&self.conv2)?;
        x + h
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Result of a full training forward pass.
#[derive(Debug, Clone)]
pub struct CodecOutput {
    pub recon: Tensor,
    pub mean: Tensor,
    pub logvar: Tensor,
}

/// VAE over `[B, 1, n_mels, frames]` log-mel spectrograms.
#[derive(Debug, Clone)]
pub struct LatentCodec {
    down: Vec<(candle_nn::Conv2d, CodecResBlock)>,
    to_mean: candle_nn::Conv2d,
    to_logvar: candle_nn::Conv2d,
    from_latent: candle_nn::Conv2d,
    latent_res: CodecResBlock,
    up: Vec<(UpConv2d, CodecResBlock)>,
    to_spec: UpConv2d,
    spec_hw: (usize, usize),
}

impl LatentCodec {
    /// `spec_hw` is the `(n_mels, frames)` the decoder crops back to.
    pub fn new(config: &CodecConfig, spec_hw: (usize, usize), vb: VarBuilder) -> Result<Self> {
        let channels = &config.channels;
        let Some(&deepest) = channels.last() else {
            return Err(Error::Config("codec needs at least one stage".into()));
        };

        let down_cfg = candle_nn::Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let enc = vb.pp("encoder");
        let mut down = Vec::with_capacity(channels.len());
        let mut in_ch = 1;
        for (i, &ch) in channels.iter().enumerate() {
            let stage = enc.pp(format!("down.{i}"));
            let conv = candle_nn::conv2d(in_ch, ch, 3, down_cfg, stage.pp("conv"))?;
            let res = CodecResBlock::new(ch, stage.pp("res"))?;
            down.push((conv, res));
            in_ch = ch;
        }
        let latent = config.latent_channels;
        let to_mean = candle_nn::conv2d(deepest, latent, 1, Default::default(), enc.pp("mean"))?;
        let to_logvar =
            candle_nn::conv2d(deepest, latent, 1, Default::default(), enc.pp("logvar"))?;

        let dec = vb.pp("decoder");
        let from_latent = candle_nn::conv2d(latent, deepest, 1, Default::default(), dec.pp("input"))?;
        let latent_res = CodecResBlock::new(deepest, dec.pp("input_res"))?;
        let mut up = Vec::with_capacity(channels.len().saturating_sub(1));
        for (i, pair) in channels.windows(2).rev().enumerate() {
            let (out_ch, in_ch) = (pair[0], pair[1]);
            let stage = dec.pp(format!("up.{i}"));
            let conv = UpConv2d::new(in_ch, out_ch, 4, 2, 1, stage.pp("conv"))?;
            let res = CodecResBlock::new(out_ch, stage.pp("res"))?;
            up.push((conv, res));
        }
        let to_spec = UpConv2d::new(channels[0], 1, 4, 2, 1, dec.pp("output"))?;

        Ok(Self {
            down,
            to_mean,
            to_logvar,
            from_latent,
            latent_res,
            up,
            to_spec,
            spec_hw,
        })
    }

    fn trunk(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for (conv, res) in &self.down {
            h = h.apply(conv)?.apply(res)?;
        }
        Ok(h)
    }

    /// `(μ, log σ²)` of the approximate posterior.
    pub fn encode_distribution(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let h = self.trunk(x)?;
        Ok((h.apply(&self.to_mean)?, h.apply(&self.to_logvar)?))
    }

    /// Posterior mean, no sampling.
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.trunk(x)?.apply(&self.to_mean)?)
    }

    /// Latent → spectrogram, cropped to the configured resolution.
    pub fn decode(&self, z: &Tensor) -> Result<Tensor> {
        let mut h = z.apply(&self.from_latent)?.apply(&self.latent_res)?;
        for (conv, res) in &self.up {
            h = h.apply(conv)?.apply(res)?;
        }
        let out = h.apply(&self.to_spec)?;
        crop_spatial(&out, self.spec_hw.0, self.spec_hw.1)
    }

    /// Encode, reparameterize with `z = μ + exp(½ log σ²) · ε`, decode.
    pub fn forward<R: Rng + ?Sized>(&self, x: &Tensor, rng: &mut R) -> Result<CodecOutput> {
        let (mean, logvar) = self.encode_distribution(x)?;
        let std = (&logvar * 0.5)?.exp()?;
        let eps = gaussian_noise(std.shape(), rng, std.device())?.to_dtype(std.dtype())?;
        let z = (&mean + (eps * std)?)?;
        let recon = self.decode(&z)?;
        Ok(CodecOutput {
            recon,
            mean,
            logvar,
        })
    }
}

/// `-½ · mean(1 + log σ² − μ² − σ²)` over every element.
pub fn kl_divergence(mean: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    let inner = ((logvar + 1.0)? - mean.sqr()?)?;
    let inner = (inner - logvar.exp()?)?;
    Ok((inner.mean_all()? * -0.5)?)
}

/// KL weight warm-up: linear from `start` to `end` over `anneal_epochs`,
/// then constant at `end`.
pub fn kl_weight(epoch: usize, start: f64, end: f64, anneal_epochs: usize) -> f64 {
    if epoch >= anneal_epochs {
        return end;
    }
    start + (epoch as f64 / anneal_epochs as f64) * (end - start)
}
