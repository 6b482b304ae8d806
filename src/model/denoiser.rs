//! Conditional U-Net that predicts the noise in a latent.
//!
//! ## Architecture (base width 64)
//!
//! ```text
//! t ─→ sinusoidal(64) ─→ Linear(64→256) → SiLU → Linear(256→256) ─┐
//!                                                      cond [B,256] ─┴→ c
//!
//! x [B, 4, 8, 11]
//!   ─→ down_in 3×3 (4→64) ─→ down1 CondRes(64)                 h1 [B, 64, 8, 11]
//!   ─→ down_conv1 s2 (64→128) ─→ down2 CondRes(128)             h2 [B, 128, 4, 6]
//!   ─→ down_conv2 s2 (128→256) ─→ mid1 → mid_attn → mid2         [B, 256, 2, 3]
//!   ─→ up_conv2 ConvT (256→128) ─→ crop to h2 ─→ cat h2 ─→ up2 CondRes(256) ─→ 1×1 → 128
//!   ─→ up_conv1 ConvT (128→64)  ─→ crop to h1 ─→ cat h1 ─→ up1 CondRes(128) ─→ 1×1 → 64
//!   ─→ GroupNorm → SiLU → out_conv 3×3 (64→4)
//! ```
//!
//! Every residual block receives `c` through a per-block linear projection
//! added as a per-channel bias.

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::VarBuilder;

use super::layers::{NORM_GROUPS, UpConv2d, crop_spatial, silu};
use crate::config::DenoiserConfig;
use crate::scheduler::NoisePredictor;
use crate::Result;

// ---------------------------------------------------------------------------
// Timestep embedding
// ---------------------------------------------------------------------------

/// `[cos(t·f_i), sin(t·f_i)]` with `f_i = exp(-ln(10000) · i / half)`.
pub fn timestep_embedding(t: &Tensor, dim: usize, dev: &Device) -> Result<Tensor> {
    let half = dim / 2;
    let max_period: f64 = 10000.0;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(max_period.ln()) * i as f64 / half as f64).exp() as f32)
        .collect();
    let freqs = Tensor::new(freqs.as_slice(), dev)?;
    let args = t
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&freqs.unsqueeze(0)?)?;
    Ok(Tensor::cat(&[&args.cos()?, &args.sin()?], 1)?)
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// Residual block with an additive conditioning bias between the convs.
#[derive(Debug, Clone)]
struct CondResBlock {
    norm1: candle_nn::GroupNorm,
    conv1: candle_nn::Conv2d,
    cond_proj: candle_nn::Linear,
    norm2: candle_nn::GroupNorm,
    conv2: candle_nn::Conv2d,
}

impl CondResBlock {
    fn new(channels: usize, cond_dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg3x3 = candle_nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            norm1: candle_nn::group_norm(NORM_GROUPS, channels, 1e-5, vb.pp("norm1"))?,
            conv1: candle_nn::conv2d(channels, channels, 3, cfg3x3, vb.pp("conv1"))?,
            cond_proj: candle_nn::linear(cond_dim, channels, vb.pp("cond_proj"))?,
            norm2: candle_nn::group_norm(NORM_GROUPS, channels, 1e-5, vb.pp("norm2"))?,
            conv2: candle_nn::conv2d(channels, channels, 3, cfg3x3, vb.pp("conv2"))?,
        })
    }

    fn forward(&self, x: &Tensor, c: &Tensor) -> Result<Tensor> {
        let h = silu(&x.apply(&self.norm1)?)?.apply(&self.conv1)?;
        let bias = c.apply(&self.cond_proj)?.unsqueeze(2)?.unsqueeze(3)?;
        let h = h.broadcast_add(&bias)?;
        let h = silu(&h.apply(&self.norm2)?)?.apply(&self.conv2)?;
        Ok((x + h)?)
    }
}

/// Single-head spatial self-attention with a residual connection.
#[derive(Debug, Clone)]
struct SelfAttention2d {
    norm: candle_nn::GroupNorm,
    qkv: candle_nn::Conv2d,
    out: candle_nn::Conv2d,
    channels: usize,
}

impl SelfAttention2d {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: candle_nn::group_norm(NORM_GROUPS, channels, 1e-5, vb.pp("norm"))?,
            qkv: candle_nn::conv2d(channels, channels * 3, 1, Default::default(), vb.pp("qkv"))?,
            out: candle_nn::conv2d(channels, channels, 1, Default::default(), vb.pp("out"))?,
            channels,
        })
    }
}

impl Module for SelfAttention2d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let n = h * w;
        let qkv = x.apply(&self.norm)?.apply(&self.qkv)?.reshape((b, 3, c, n))?;
        let q = qkv.narrow(1, 0, 1)?.squeeze(1)?;
        let k = qkv.narrow(1, 1, 1)?.squeeze(1)?;
        let v = qkv.narrow(1, 2, 1)?.squeeze(1)?;

        // [B, N, C] × [B, C, N] → [B, N, N]
        let scale = 1.0 / (self.channels as f64).sqrt();
        let scores = (q.transpose(1, 2)?.contiguous()?.matmul(&k.contiguous()?)? * scale)?;
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;

        // [B, C, N] × [B, N, N]ᵀ → [B, C, N]
        let y = v
            .contiguous()?
            .matmul(&attn.transpose(1, 2)?.contiguous()?)?
            .reshape((b, c, h, w))?;
        x + y.apply(&self.out)?
    }
}

// ---------------------------------------------------------------------------
// U-Net
// ---------------------------------------------------------------------------

/// Noise-predicting U-Net over `[B, latent_channels, H, W]` latents.
#[derive(Debug, Clone)]
pub struct LatentUNet {
    time_dim: usize,
    time_mlp1: candle_nn::Linear,
    time_mlp2: candle_nn::Linear,

    down_in: candle_nn::Conv2d,
    down1: CondResBlock,
    down_conv1: candle_nn::Conv2d,
    down2: CondResBlock,
    down_conv2: candle_nn::Conv2d,

    mid1: CondResBlock,
    mid_attn: SelfAttention2d,
    mid2: CondResBlock,

    up_conv2: UpConv2d,
    up2: CondResBlock,
    up_reduce2: candle_nn::Conv2d,
    up_conv1: UpConv2d,
    up1: CondResBlock,
    up_reduce1: candle_nn::Conv2d,

    out_norm: candle_nn::GroupNorm,
    out_conv: candle_nn::Conv2d,
}

impl LatentUNet {
    pub fn new(latent_channels: usize, config: &DenoiserConfig, vb: VarBuilder) -> Result<Self> {
        let ch = config.base_channels;
        let cond = config.cond_dim;
        let cfg3x3 = candle_nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let down_cfg = candle_nn::Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv1x1 = candle_nn::Conv2dConfig::default();

        Ok(Self {
            time_dim: ch,
            time_mlp1: candle_nn::linear(ch, cond, vb.pp("time_mlp.0"))?,
            time_mlp2: candle_nn::linear(cond, cond, vb.pp("time_mlp.2"))?,

            down_in: candle_nn::conv2d(latent_channels, ch, 3, cfg3x3, vb.pp("down_in"))?,
            down1: CondResBlock::new(ch, cond, vb.pp("down1"))?,
            down_conv1: candle_nn::conv2d(ch, ch * 2, 3, down_cfg, vb.pp("down_conv1"))?,
            down2: CondResBlock::new(ch * 2, cond, vb.pp("down2"))?,
            down_conv2: candle_nn::conv2d(ch * 2, ch * 4, 3, down_cfg, vb.pp("down_conv2"))?,

            mid1: CondResBlock::new(ch * 4, cond, vb.pp("mid1"))?,
            mid_attn: SelfAttention2d::new(ch * 4, vb.pp("mid_attn"))?,
            mid2: CondResBlock::new(ch * 4, cond, vb.pp("mid2"))?,

            up_conv2: UpConv2d::new(ch * 4, ch * 2, 4, 2, 1, vb.pp("up_conv2"))?,
            up2: CondResBlock::new(ch * 4, cond, vb.pp("up2"))?,
            up_reduce2: candle_nn::conv2d(ch * 4, ch * 2, 1, conv1x1, vb.pp("up_reduce2"))?,
            up_conv1: UpConv2d::new(ch * 2, ch, 4, 2, 1, vb.pp("up_conv1"))?,
            up1: CondResBlock::new(ch * 2, cond, vb.pp("up1"))?,
            up_reduce1: candle_nn::conv2d(ch * 2, ch, 1, conv1x1, vb.pp("up_reduce1"))?,

            out_norm: candle_nn::group_norm(NORM_GROUPS, ch, 1e-5, vb.pp("out_norm"))?,
            out_conv: candle_nn::conv2d(ch, latent_channels, 3, cfg3x3, vb.pp("out_conv"))?,
        })
    }

    /// Predict noise for `x` at timesteps `t` (`[B]`) under `cond` (`[B, cond_dim]`).
    pub fn forward(&self, x: &Tensor, t: &Tensor, cond: &Tensor) -> Result<Tensor> {
        let temb = timestep_embedding(t, self.time_dim, x.device())?.to_dtype(x.dtype())?;
        let temb = silu(&temb.apply(&self.time_mlp1)?)?.apply(&self.time_mlp2)?;
        let c = (temb + cond)?;

        let h1 = self.down1.forward(&x.apply(&self.down_in)?, &c)?;
        let h2 = self.down2.forward(&h1.apply(&self.down_conv1)?, &c)?;
        let h = self.mid1.forward(&h2.apply(&self.down_conv2)?, &c)?;
        let h = h.apply(&self.mid_attn)?;
        let h = self.mid2.forward(&h, &c)?;

        let (_, _, h2_h, h2_w) = h2.dims4()?;
        let h = crop_spatial(&h.apply(&self.up_conv2)?, h2_h, h2_w)?;
        let h = self.up2.forward(&Tensor::cat(&[&h, &h2], 1)?, &c)?;
        let h = h.apply(&self.up_reduce2)?;

        let (_, _, h1_h, h1_w) = h1.dims4()?;
        let h = crop_spatial(&h.apply(&self.up_conv1)?, h1_h, h1_w)?;
        let h = self.up1.forward(&Tensor::cat(&[&h, &h1], 1)?, &c)?;
        let h = h.apply(&self.up_reduce1)?;

        let h = silu(&h.apply(&self.out_norm)?)?;
        Ok(h.apply(&self.out_conv)?)
    }
}

impl NoisePredictor for LatentUNet {
    fn predict_noise(&self, x: &Tensor, t: &Tensor, cond: &Tensor) -> Result<Tensor> {
        self.forward(x, t, cond)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{NoiseSchedule, ddim::DdimSampler, timestep_tensor};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn small_config() -> DenoiserConfig {
        DenoiserConfig {
            base_channels: 16,
            cond_dim: 32,
            text_embed_dim: 8,
        }
    }

    #[test]
    fn timestep_embedding_layout() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[0u32, 10], &dev).unwrap();
        let emb = timestep_embedding(&t, 8, &dev).unwrap();
        assert_eq!(emb.dims(), &[2, 8]);
        let rows: Vec<Vec<f32>> = emb.to_vec2().unwrap();
        // t = 0: cos terms are 1, sin terms are 0.
        assert_eq!(rows[0], vec![1., 1., 1., 1., 0., 0., 0., 0.]);
        assert!((rows[1][0] - 10f32.cos()).abs() < 1e-5);
        assert!((rows[1][4] - 10f32.sin()).abs() < 1e-5);
    }

    #[test]
    fn output_matches_latent_shape() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let cfg = small_config();
        let unet = LatentUNet::new(4, &cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1., (2, 4, 8, 11), &dev).unwrap();
        let t = timestep_tensor(&[3, 900], &dev).unwrap();
        let cond = Tensor::randn(0f32, 1., (2, 32), &dev).unwrap();
        let y = unet.forward(&x, &t, &cond).unwrap();
        assert_eq!(y.dims(), &[2, 4, 8, 11]);
    }

    #[test]
    fn default_width_runs() {
        let dev = Device::Cpu;
        let unet = LatentUNet::new(4, &DenoiserConfig::default(), VarBuilder::zeros(DType::F32, &dev)).unwrap();
        let x = Tensor::randn(0f32, 1., (1, 4, 8, 11), &dev).unwrap();
        let t = timestep_tensor(&[500], &dev).unwrap();
        let cond = Tensor::zeros((1, 256), DType::F32, &dev).unwrap();
        assert_eq!(unet.forward(&x, &t, &cond).unwrap().dims(), &[1, 4, 8, 11]);
    }

    #[test]
    fn sampling_is_deterministic_for_fixed_seed() {
        let dev = Device::Cpu;
        let unet = LatentUNet::new(4, &small_config(), VarBuilder::zeros(DType::F32, &dev)).unwrap();
        let schedule = NoiseSchedule::new(1000, 1e-4, 0.02).unwrap();
        let sampler = DdimSampler::new(schedule, 8).unwrap();
        let cond = Tensor::zeros((1, 32), DType::F32, &dev).unwrap();
        let uncond = Tensor::ones((1, 32), DType::F32, &dev).unwrap();

        let run = |seed| -> Vec<f32> {
            sampler
                .sample(&unet, (1, 4, 8, 11), &cond, Some(&uncond), 3.0, seed)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap()
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }
}
