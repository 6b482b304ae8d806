//! Weight-normalized 1-D convolutions.
//!
//! ```text
//! w = g · v / ‖v‖        (norm over every dim except dim 0)
//! ```
//!
//! Checkpoints store `weight_g` and `weight_v`; the trainable layers
//! recompute `w` on every forward so both factors receive gradients. For
//! inference, [`Conv1dLayer::fold`] and [`ConvTranspose1dLayer::fold`]
//! collapse them once into a plain weight. Folding is one-way.

use candle_core::{D, Module, Tensor};
use candle_nn::{Init, VarBuilder};

use super::layers::conv_transpose1d_stuffed;
use crate::Result;

/// `g · v / ‖v‖`, where the norm runs over every dim except the first.
fn weight_norm(g: &Tensor, v: &Tensor) -> Result<Tensor> {
    let norm = v.sqr()?.flatten_from(1)?.sum_keepdim(D::Minus1)?.sqrt()?;
    let mut norm_shape = vec![1usize; v.rank()];
    norm_shape[0] = v.dim(0)?;
    let scale = (g.reshape(norm_shape.as_slice())? / norm.reshape(norm_shape.as_slice())?)?;
    Ok(v.broadcast_mul(&scale)?)
}

fn add_channel_bias(y: Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    match bias {
        Some(b) => Ok(y.broadcast_add(&b.reshape((1, (), 1))?)?),
        None => Ok(y),
    }
}

// ---------------------------------------------------------------------------
// Conv1d
// ---------------------------------------------------------------------------

/// Trainable weight-normalized `Conv1d`.
#[derive(Debug, Clone)]
pub struct WeightNormConv1d {
    weight_g: Tensor,
    weight_v: Tensor,
    bias: Option<Tensor>,
    config: candle_nn::Conv1dConfig,
}

impl WeightNormConv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: candle_nn::Conv1dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight_v = vb.get_with_hints(
            (out_channels, in_channels / config.groups, kernel_size),
            "weight_v",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let weight_g = vb.get_with_hints((out_channels, 1, 1), "weight_g", Init::Const(1.0))?;
        let fan_in = (in_channels / config.groups * kernel_size) as f64;
        let bound = 1.0 / fan_in.sqrt();
        let bias = vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Ok(Self {
            weight_g,
            weight_v,
            bias: Some(bias),
            config,
        })
    }

    pub fn weight(&self) -> Result<Tensor> {
        weight_norm(&self.weight_g, &self.weight_v)
    }

    /// Collapse `g` and `v` into a plain convolution.
    pub fn fold(&self) -> Result<candle_nn::Conv1d> {
        Ok(candle_nn::Conv1d::new(
            self.weight()?.detach(),
            self.bias.as_ref().map(|b| b.detach()),
            self.config,
        ))
    }
}

impl Module for WeightNormConv1d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let w = self.weight().map_err(candle_core::Error::wrap)?;
        let c = &self.config;
        let y = x.conv1d(&w, c.padding, c.stride, c.dilation, c.groups)?;
        add_channel_bias(y, self.bias.as_ref()).map_err(candle_core::Error::wrap)
    }
}

/// A `Conv1d` that is either still weight-normalized or already folded.
#[derive(Debug, Clone)]
pub enum Conv1dLayer {
    Normalized(WeightNormConv1d),
    Plain(candle_nn::Conv1d),
}

impl Conv1dLayer {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: candle_nn::Conv1dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        WeightNormConv1d::new(in_channels, out_channels, kernel_size, config, vb).map(Self::Normalized)
    }

    pub fn fold(self) -> Result<Self> {
        match self {
            Self::Normalized(conv) => Ok(Self::Plain(conv.fold()?)),
            plain => Ok(plain),
        }
    }

    pub fn is_folded(&self) -> bool {
        matches!(self, Self::Plain(_))
    }
}

impl Module for Conv1dLayer {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Normalized(conv) => conv.forward(x),
            Self::Plain(conv) => conv.forward(x),
        }
    }
}

// ---------------------------------------------------------------------------
// ConvTranspose1d
// ---------------------------------------------------------------------------

/// Trainable weight-normalized `ConvTranspose1d` (groups = 1, dilation = 1).
///
/// The weight layout is `[C_in, C_out, K]`, so `g` has one entry per input
/// channel.
#[derive(Debug, Clone)]
pub struct WeightNormConvTranspose1d {
    weight_g: Tensor,
    weight_v: Tensor,
    bias: Tensor,
    stride: usize,
    padding: usize,
}

impl WeightNormConvTranspose1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight_v = vb.get_with_hints(
            (in_channels, out_channels, kernel_size),
            "weight_v",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let weight_g = vb.get_with_hints((in_channels, 1, 1), "weight_g", Init::Const(1.0))?;
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight_g,
            weight_v,
            bias,
            stride,
            padding,
        })
    }

    pub fn weight(&self) -> Result<Tensor> {
        weight_norm(&self.weight_g, &self.weight_v)
    }

    pub fn fold(&self) -> Result<candle_nn::ConvTranspose1d> {
        let config = candle_nn::ConvTranspose1dConfig {
            padding: self.padding,
            stride: self.stride,
            ..Default::default()
        };
        Ok(candle_nn::ConvTranspose1d::new(
            self.weight()?.detach(),
            Some(self.bias.detach()),
            config,
        ))
    }
}

impl Module for WeightNormConvTranspose1d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let w = self.weight().map_err(candle_core::Error::wrap)?;
        let y = conv_transpose1d_stuffed(x, &w, self.stride, self.padding)
            .map_err(candle_core::Error::wrap)?;
        add_channel_bias(y, Some(&self.bias)).map_err(candle_core::Error::wrap)
    }
}

/// A `ConvTranspose1d` that is either still weight-normalized or folded.
#[derive(Debug, Clone)]
pub enum ConvTranspose1dLayer {
    Normalized(WeightNormConvTranspose1d),
    Plain(candle_nn::ConvTranspose1d),
}

impl ConvTranspose1dLayer {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        WeightNormConvTranspose1d::new(in_channels, out_channels, kernel_size, stride, padding, vb)
            .map(Self::Normalized)
    }

    pub fn fold(self) -> Result<Self> {
        match self {
            Self::Normalized(conv) => Ok(Self::Plain(conv.fold()?)),
            plain => Ok(plain),
        }
    }
}

impl Module for ConvTranspose1dLayer {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Normalized(conv) => conv.forward(x),
            Self::Plain(conv) => conv.forward(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn unit_gain_gives_unit_norm_rows() {
        let (_vm, vb) = make_vb();
        let conv = WeightNormConv1d::new(4, 3, 5, Default::default(), vb).unwrap();
        let w = conv.weight().unwrap();
        let norms: Vec<f32> = w
            .sqr()
            .unwrap()
            .flatten_from(1)
            .unwrap()
            .sum(1)
            .unwrap()
            .sqrt()
            .unwrap()
            .to_vec1()
            .unwrap();
        for n in norms {
            assert!((n - 1.0).abs() < 1e-5, "row norm {n}");
        }
    }

    #[test]
    fn folded_conv_matches_normalized() {
        let (_vm, vb) = make_vb();
        let cfg = candle_nn::Conv1dConfig {
            padding: 3,
            dilation: 1,
            ..Default::default()
        };
        let layer = Conv1dLayer::new(2, 4, 7, cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1., (1, 2, 32), &Device::Cpu).unwrap();
        let before = layer.forward(&x).unwrap();
        let folded = layer.fold().unwrap();
        assert!(folded.is_folded());
        let after = folded.forward(&x).unwrap();
        let diff: f32 = (before - after)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn folded_transpose_matches_normalized() {
        let (_vm, vb) = make_vb();
        let layer = ConvTranspose1dLayer::new(4, 2, 4, 2, 1, vb).unwrap();
        let x = Tensor::randn(0f32, 1., (1, 4, 10), &Device::Cpu).unwrap();
        let before = layer.forward(&x).unwrap();
        assert_eq!(before.dims(), &[1, 2, 20]);
        let after = layer.fold().unwrap().forward(&x).unwrap();
        let diff: f32 = (before - after)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn gradients_reach_both_factors() {
        let (varmap, vb) = make_vb();
        let conv = WeightNormConvTranspose1d::new(3, 2, 4, 2, 1, vb).unwrap();
        let x = Tensor::randn(0f32, 1., (1, 3, 6), &Device::Cpu).unwrap();
        let loss = conv.forward(&x).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        for var in varmap.all_vars() {
            assert!(grads.get(&var).is_some(), "missing gradient");
        }
    }
}
