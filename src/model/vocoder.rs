//! HiFi-GAN vocoder: log-mel spectrogram → audio waveform.
//!
//! ## Generator (defaults)
//! ```text
//! Input: [B, 128, F]
//! conv_pre(128, 256, k=7)
//! 5 upsample stages: rates=[8,8,2,2,2], product=512=hop_length
//! Each: LeakyReLU(0.1) + ConvTranspose1d(ch → ch/2) + mean of 3 ResBlock1 (k=3,7,11)
//! LeakyReLU(0.1) + conv_post(8, 1, k=7) + tanh
//! Output: [B, 1, F × 512]
//! ```
//!
//! Every convolution is weight-normalized while training. Call
//! [`HifiGanGenerator::fold_weight_norm`] once after loading for inference.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::layers::leaky_relu;
use super::weight_norm::{Conv1dLayer, ConvTranspose1dLayer};
use crate::config::VocoderConfig;
use crate::Result;

// ---------------------------------------------------------------------------
// ResBlock1
// ---------------------------------------------------------------------------

/// Dilated residual block: per dilation `x += conv2(lrelu(conv1_d(lrelu(x))))`.
#[derive(Debug, Clone)]
struct ResBlock1 {
    convs1: Vec<Conv1dLayer>,
    convs2: Vec<Conv1dLayer>,
}

impl ResBlock1 {
    fn new(channels: usize, kernel_size: usize, dilations: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut convs1 = Vec::with_capacity(dilations.len());
        let mut convs2 = Vec::with_capacity(dilations.len());
        for (i, &d) in dilations.iter().enumerate() {
            let dilated = candle_nn::Conv1dConfig {
                padding: (kernel_size * d - d) / 2,
                dilation: d,
                ..Default::default()
            };
            let plain = candle_nn::Conv1dConfig {
                padding: (kernel_size - 1) / 2,
                ..Default::default()
            };
            convs1.push(Conv1dLayer::new(
                channels,
                channels,
                kernel_size,
                dilated,
                vb.pp(format!("convs1.{i}")),
            )?);
            convs2.push(Conv1dLayer::new(
                channels,
                channels,
                kernel_size,
                plain,
                vb.pp(format!("convs2.{i}")),
            )?);
        }
        Ok(Self { convs1, convs2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for (c1, c2) in self.convs1.iter().zip(&self.convs2) {
            let xt = c1.forward(&leaky_relu(&x)?)?;
            let xt = c2.forward(&leaky_relu(&xt)?)?;
            x = (xt + x)?;
        }
        Ok(x)
    }

    fn fold(self) -> Result<Self> {
        Ok(Self {
            convs1: self.convs1.into_iter().map(Conv1dLayer::fold).collect::<Result<_>>()?,
            convs2: self.convs2.into_iter().map(Conv1dLayer::fold).collect::<Result<_>>()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Mel-to-waveform generator.
#[derive(Debug, Clone)]
pub struct HifiGanGenerator {
    conv_pre: Conv1dLayer,
    ups: Vec<ConvTranspose1dLayer>,
    resblocks: Vec<ResBlock1>,
    conv_post: Conv1dLayer,
    num_kernels: usize,
    hop_length: usize,
}

impl HifiGanGenerator {
    /// Build a trainable (weight-normalized) generator for `n_mels` inputs.
    pub fn new(n_mels: usize, config: &VocoderConfig, vb: VarBuilder) -> Result<Self> {
        let hop_length = config.upsample_factor();
        config.validate(hop_length)?;

        let k7 = candle_nn::Conv1dConfig {
            padding: 3,
            ..Default::default()
        };
        let mut ch = config.upsample_initial_channel;
        let conv_pre = Conv1dLayer::new(n_mels, ch, 7, k7, vb.pp("conv_pre"))?;

        let mut ups = Vec::with_capacity(config.upsample_rates.len());
        let mut resblocks = Vec::new();
        for (i, (&u, &k)) in config
            .upsample_rates
            .iter()
            .zip(&config.upsample_kernel_sizes)
            .enumerate()
        {
            ups.push(ConvTranspose1dLayer::new(
                ch,
                ch / 2,
                k,
                u,
                (k - u) / 2,
                vb.pp(format!("ups.{i}")),
            )?);
            ch /= 2;
            for (kernel, dilations) in config
                .resblock_kernel_sizes
                .iter()
                .zip(&config.resblock_dilations)
            {
                let j = resblocks.len();
                resblocks.push(ResBlock1::new(
                    ch,
                    *kernel,
                    dilations,
                    vb.pp(format!("resblocks.{j}")),
                )?);
            }
        }
        let conv_post = Conv1dLayer::new(ch, 1, 7, k7, vb.pp("conv_post"))?;

        Ok(Self {
            conv_pre,
            ups,
            resblocks,
            conv_post,
            num_kernels: config.resblock_kernel_sizes.len(),
            hop_length,
        })
    }

    /// Samples produced per input frame.
    pub fn hop_length(&self) -> usize {
        self.hop_length
    }

    /// `[B, n_mels, F]` → `[B, 1, F · hop_length]`, values in `(-1, 1)`.
    pub fn forward(&self, mel: &Tensor) -> Result<Tensor> {
        let mut x = self.conv_pre.forward(mel)?;
        for (i, up) in self.ups.iter().enumerate() {
            x = up.forward(&leaky_relu(&x)?)?;
            let blocks = &self.resblocks[i * self.num_kernels..(i + 1) * self.num_kernels];
            let mut acc = blocks[0].forward(&x)?;
            for block in &blocks[1..] {
                acc = (acc + block.forward(&x)?)?;
            }
            x = (acc / self.num_kernels as f64)?;
        }
        let x = self.conv_post.forward(&leaky_relu(&x)?)?;
        Ok(x.tanh()?)
    }

    /// Replace every weight-normalized conv with its folded plain weight.
    /// The result is inference-only.
    pub fn fold_weight_norm(self) -> Result<Self> {
        Ok(Self {
            conv_pre: self.conv_pre.fold()?,
            ups: self
                .ups
                .into_iter()
                .map(ConvTranspose1dLayer::fold)
                .collect::<Result<_>>()?,
            resblocks: self
                .resblocks
                .into_iter()
                .map(ResBlock1::fold)
                .collect::<Result<_>>()?,
            conv_post: self.conv_post.fold()?,
            num_kernels: self.num_kernels,
            hop_length: self.hop_length,
        })
    }

    pub fn is_folded(&self) -> bool {
        self.conv_pre.is_folded() && self.conv_post.is_folded()
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

    fn tiny_config() -> VocoderConfig {
        VocoderConfig {
            upsample_initial_channel: 16,
            upsample_rates: vec![4, 2],
            upsample_kernel_sizes: vec![8, 4],
            resblock_kernel_sizes: vec![3, 5],
            resblock_dilations: vec![vec![1, 3], vec![1, 3]],
            ..Default::default()
        }
    }

    #[test]
    fn output_length_is_frames_times_hop() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let generator = HifiGanGenerator::new(128, &VocoderConfig::default(), vb).unwrap();
        let mel = Tensor::randn(0f32, 1., (1, 128, 4), &dev).unwrap();
        let audio = generator.forward(&mel).unwrap();
        assert_eq!(audio.dims(), &[1, 1, 4 * 512]);
    }

    #[test]
    fn output_is_bounded() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let generator = HifiGanGenerator::new(8, &tiny_config(), vb).unwrap();
        let mel = (Tensor::randn(0f32, 1., (2, 8, 5), &dev).unwrap() * 50.).unwrap();
        let audio = generator.forward(&mel).unwrap();
        assert_eq!(audio.dims(), &[2, 1, 40]);
        let peak: f32 = audio.abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(peak <= 1.0);
    }

    #[test]
    fn folding_preserves_output() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let generator = HifiGanGenerator::new(8, &tiny_config(), vb).unwrap();
        let mel = Tensor::randn(0f32, 1., (1, 8, 6), &dev).unwrap();
        let before = generator.forward(&mel).unwrap();
        let folded = generator.fold_weight_norm().unwrap();
        assert!(folded.is_folded());
        let after = folded.forward(&mel).unwrap();
        let diff: f32 = (before - after)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "folded output drifted by {diff}");
    }

    #[test]
    fn parameter_names_follow_layout() {
        let dev = Device::Cpu;
        let (varmap, vb) = make_vb(&dev);
        HifiGanGenerator::new(8, &tiny_config(), vb).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "conv_pre.weight_g",
            "conv_pre.weight_v",
            "ups.0.weight_v",
            "ups.1.bias",
            "resblocks.3.convs1.1.weight_g",
            "conv_post.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }
}
