//! Multi-period and multi-scale discriminators used to train the vocoder.
//!
//! ## Period discriminator
//! ```text
//! [B, 1, T] ─→ reflect pad to T' = ⌈T/p⌉·p ─→ fold [B, 1, T'/p, p]
//!   ─→ 4 × Conv(k=(5,1), s=(3,1)) 1→32→64→128→256 + LeakyReLU
//!   ─→ Conv(k=(5,1), s=1) 256→256 + LeakyReLU
//!   ─→ conv_post (3,1) → [B, 1, H, p] ─→ flatten
//! ```
//! A `(k, 1)` kernel never mixes columns, so each column of the fold is run
//! as an independent 1-D sequence (`[B·p, C, H]`) and reshaped back to the
//! 2-D grid for the recorded feature maps.
//!
//! ## Scale discriminator
//! ```text
//! [B, 1, T] ─→ grouped Conv1d stack 1→64→128→256→512→512→512 + LeakyReLU
//!   ─→ conv_post(512→1, k=3) ─→ flatten
//! ```
//! applied to the waveform and to two successive `AvgPool1d(4, 2, 2)` copies.
//! The full-resolution instance is spectrally normalized, the pooled ones
//! use weight norm.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::layers::{avg_pool1d, leaky_relu, reflect_pad_last};
use super::spectral_norm::SpectralNormConv1d;
use super::weight_norm::WeightNormConv1d;
use crate::Result;

/// Scores and intermediate activations of every sub-discriminator.
#[derive(Debug, Clone, Default)]
pub struct DiscriminatorOutput {
    /// One `[B, N]` score map per sub-discriminator.
    pub scores: Vec<Tensor>,
    /// Per sub-discriminator, every post-activation feature map plus the
    /// final conv output.
    pub feature_maps: Vec<Vec<Tensor>>,
}

impl DiscriminatorOutput {
    fn push(&mut self, score: Tensor, fmaps: Vec<Tensor>) {
        self.scores.push(score);
        self.feature_maps.push(fmaps);
    }
}

// ---------------------------------------------------------------------------
// Multi-period
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PeriodDiscriminator {
    period: usize,
    convs: Vec<WeightNormConv1d>,
    conv_post: WeightNormConv1d,
}

impl PeriodDiscriminator {
    pub fn new(period: usize, vb: VarBuilder) -> Result<Self> {
        let channels = [1, 32, 64, 128, 256, 256];
        let strides = [3, 3, 3, 3, 1];
        let mut convs = Vec::with_capacity(strides.len());
        for (i, &stride) in strides.iter().enumerate() {
            let cfg = candle_nn::Conv1dConfig {
                padding: 2,
                stride,
                ..Default::default()
            };
            convs.push(WeightNormConv1d::new(
                channels[i],
                channels[i + 1],
                5,
                cfg,
                vb.pp(format!("convs.{i}")),
            )?);
        }
        let post_cfg = candle_nn::Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_post = WeightNormConv1d::new(256, 1, 3, post_cfg, vb.pp("conv_post"))?;
        Ok(Self {
            period,
            convs,
            conv_post,
        })
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Returns `(score [B, N], feature maps [B, C, H, p])`.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let p = self.period;
        let (b, _, t) = x.dims3()?;
        let x = match t % p {
            0 => x.clone(),
            rem => reflect_pad_last(x, 0, p - rem)?,
        };
        let rows = x.dim(2)? / p;

        // [B, 1, H·p] → [B, 1, H, p] → [B, p, 1, H] → [B·p, 1, H]
        let mut h = x
            .reshape((b, 1, rows, p))?
            .permute((0, 3, 1, 2))?
            .reshape((b * p, 1, rows))?;

        let as_grid = |h: &Tensor| -> Result<Tensor> {
            let (_, c, rows) = h.dims3()?;
            Ok(h.reshape((b, p, c, rows))?.permute((0, 2, 3, 1))?)
        };

        let mut fmaps = Vec::with_capacity(self.convs.len() + 1);
        for conv in &self.convs {
            h = leaky_relu(&conv.forward(&h)?)?;
            fmaps.push(as_grid(&h)?);
        }
        let grid = as_grid(&self.conv_post.forward(&h)?)?;
        fmaps.push(grid.clone());
        Ok((grid.flatten_from(1)?, fmaps))
    }
}

/// One [`PeriodDiscriminator`] per configured period.
#[derive(Debug, Clone)]
pub struct MultiPeriodDiscriminator {
    discriminators: Vec<PeriodDiscriminator>,
}

impl MultiPeriodDiscriminator {
    pub fn new(periods: &[usize], vb: VarBuilder) -> Result<Self> {
        let discriminators = periods
            .iter()
            .enumerate()
            .map(|(i, &p)| PeriodDiscriminator::new(p, vb.pp(format!("discriminators.{i}"))))
            .collect::<Result<_>>()?;
        Ok(Self { discriminators })
    }

    pub fn forward(&self, audio: &Tensor) -> Result<DiscriminatorOutput> {
        let mut out = DiscriminatorOutput::default();
        for d in &self.discriminators {
            let (score, fmaps) = d.forward(audio)?;
            out.push(score, fmaps);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Multi-scale
// ---------------------------------------------------------------------------

/// Conv layer of a scale discriminator.
#[derive(Debug, Clone)]
enum NormConv1d {
    Weight(WeightNormConv1d),
    Spectral(SpectralNormConv1d),
}

impl NormConv1d {
    fn new(
        spectral: bool,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: candle_nn::Conv1dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if spectral {
            SpectralNormConv1d::new(in_channels, out_channels, kernel_size, config, vb).map(Self::Spectral)
        } else {
            WeightNormConv1d::new(in_channels, out_channels, kernel_size, config, vb).map(Self::Weight)
        }
    }
}

impl Module for NormConv1d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Weight(conv) => conv.forward(x),
            Self::Spectral(conv) => conv.forward(x),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScaleDiscriminator {
    convs: Vec<NormConv1d>,
    conv_post: NormConv1d,
}

impl ScaleDiscriminator {
    /// `spectral` selects spectral instead of weight normalization for
    /// every conv.
    pub fn new(spectral: bool, vb: VarBuilder) -> Result<Self> {
        // (in, out, kernel, stride, groups, padding)
        let layers: [(usize, usize, usize, usize, usize, usize); 6] = [
            (1, 64, 15, 1, 1, 7),
            (64, 128, 41, 2, 4, 20),
            (128, 256, 41, 2, 16, 20),
            (256, 512, 41, 4, 16, 20),
            (512, 512, 41, 4, 16, 20),
            (512, 512, 5, 1, 1, 2),
        ];
        let mut convs = Vec::with_capacity(layers.len());
        for (i, &(cin, cout, k, stride, groups, padding)) in layers.iter().enumerate() {
            let cfg = candle_nn::Conv1dConfig {
                padding,
                stride,
                groups,
                ..Default::default()
            };
            convs.push(NormConv1d::new(spectral, cin, cout, k, cfg, vb.pp(format!("convs.{i}")))?);
        }
        let post_cfg = candle_nn::Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_post = NormConv1d::new(spectral, 512, 1, 3, post_cfg, vb.pp("conv_post"))?;
        Ok(Self { convs, conv_post })
    }

    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let mut h = x.clone();
        let mut fmaps = Vec::with_capacity(self.convs.len() + 1);
        for conv in &self.convs {
            h = leaky_relu(&conv.forward(&h)?)?;
            fmaps.push(h.clone());
        }
        let h = self.conv_post.forward(&h)?;
        fmaps.push(h.clone());
        Ok((h.flatten_from(1)?, fmaps))
    }
}

/// Three [`ScaleDiscriminator`]s at 1×, ½× and ¼× resolution; the first is
/// spectrally normalized.
#[derive(Debug, Clone)]
pub struct MultiScaleDiscriminator {
    discriminators: Vec<ScaleDiscriminator>,
}

impl MultiScaleDiscriminator {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let discriminators = (0..3)
            .map(|i| ScaleDiscriminator::new(i == 0, vb.pp(format!("discriminators.{i}"))))
            .collect::<Result<_>>()?;
        Ok(Self { discriminators })
    }

    pub fn forward(&self, audio: &Tensor) -> Result<DiscriminatorOutput> {
        let mut out = DiscriminatorOutput::default();
        let mut x = audio.clone();
        for (i, d) in self.discriminators.iter().enumerate() {
            if i > 0 {
                x = avg_pool1d(&x, 4, 2, 2)?;
            }
            let (score, fmaps) = d.forward(&x)?;
            out.push(score, fmaps);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn period_feature_maps_are_grids() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let d = PeriodDiscriminator::new(3, vb).unwrap();
        // 1000 is not a multiple of 3: padded to 1002 → 334 rows.
        let x = Tensor::randn(0f32, 1., (2, 1, 1000), &dev).unwrap();
        let (score, fmaps) = d.forward(&x).unwrap();
        assert_eq!(fmaps.len(), 6);
        assert_eq!(fmaps[0].dims(), &[2, 32, 112, 3]);
        assert_eq!(fmaps[4].dims()[1], 256);
        let last = fmaps.last().unwrap();
        assert_eq!(last.dims()[1], 1);
        assert_eq!(last.dims()[3], 3);
        assert_eq!(score.dims(), &[2, last.dims()[2] * 3]);
    }

    #[test]
    fn multi_period_covers_all_periods() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let mpd = MultiPeriodDiscriminator::new(&[2, 3, 5, 7, 11], vb).unwrap();
        let x = Tensor::randn(0f32, 1., (1, 1, 2048), &dev).unwrap();
        let out = mpd.forward(&x).unwrap();
        assert_eq!(out.scores.len(), 5);
        assert!(out.feature_maps.iter().all(|f| f.len() == 6));
    }

    #[test]
    fn multi_scale_downsamples() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let msd = MultiScaleDiscriminator::new(vb).unwrap();
        let x = Tensor::randn(0f32, 1., (1, 1, 1024), &dev).unwrap();
        let out = msd.forward(&x).unwrap();
        assert_eq!(out.scores.len(), 3);
        assert_eq!(out.feature_maps[0].len(), 7);
        // 1024 → 513 → 257 samples, each /16 by the strided convs.
        let first = out.feature_maps[0][0].dim(2).unwrap();
        let second = out.feature_maps[1][0].dim(2).unwrap();
        let third = out.feature_maps[2][0].dim(2).unwrap();
        assert_eq!((first, second, third), (1024, 513, 257));
    }

    #[test]
    fn gradients_flow_to_input() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let msd = MultiScaleDiscriminator::new(vb.pp("msd")).unwrap();
        let mpd = MultiPeriodDiscriminator::new(&[2, 3], vb.pp("mpd")).unwrap();
        let x = candle_core::Var::randn(0f32, 1., (1, 1, 512), &dev).unwrap();
        let mut total = Tensor::zeros((), DType::F32, &dev).unwrap();
        for s in msd.forward(&x).unwrap().scores.iter().chain(&mpd.forward(&x).unwrap().scores) {
            total = (total + s.sqr().unwrap().mean_all().unwrap()).unwrap();
        }
        let grads = total.backward().unwrap();
        assert!(grads.get(x.as_tensor()).is_some());
    }

    #[test]
    fn first_scale_is_spectrally_normalized() {
        let dev = Device::Cpu;
        let (vm, vb) = make_vb(&dev);
        MultiScaleDiscriminator::new(vb).unwrap();
        let data = vm.data().lock().unwrap();
        assert!(data.contains_key("discriminators.0.convs.0.weight_orig"));
        assert!(data.contains_key("discriminators.0.convs.0.weight_u"));
        assert!(data.contains_key("discriminators.0.conv_post.weight_orig"));
        assert!(!data.contains_key("discriminators.0.convs.0.weight_v"));
        for i in 1..3 {
            assert!(data.contains_key(&format!("discriminators.{i}.convs.0.weight_v")));
            assert!(data.contains_key(&format!("discriminators.{i}.conv_post.weight_g")));
        }
    }
}
