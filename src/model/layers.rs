//! Small tensor helpers shared by the networks.

use candle_core::{D, DType, Tensor};

use crate::{Error, Result};

/// LeakyReLU slope used throughout the vocoder and discriminators.
pub const LRELU_SLOPE: f64 = 0.1;

/// GroupNorm group count used by the codec and denoiser.
pub const NORM_GROUPS: usize = 8;

pub fn leaky_relu(x: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::leaky_relu(x, LRELU_SLOPE)?)
}

pub fn silu(x: &Tensor) -> Result<Tensor> {
    Ok(x.apply(&candle_nn::Activation::Silu)?)
}

/// Keep the leading `height × width` window of a `[B, C, H, W]` tensor.
///
/// Transposed convolutions overshoot odd spatial sizes; the overshoot is
/// always cropped from the end, never interpolated.
pub fn crop_spatial(x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if h < height || w < width {
        return Err(Error::Shape(format!(
            "cannot crop {h}x{w} to {height}x{width}: upsampled tensor is smaller than its target"
        )));
    }
    if h == height && w == width {
        return Ok(x.clone());
    }
    Ok(x.narrow(2, 0, height)?.narrow(3, 0, width)?)
}

/// Reflect-pad the last dimension, mirroring around the edge samples.
pub fn reflect_pad_last(x: &Tensor, left: usize, right: usize) -> Result<Tensor> {
    if left == 0 && right == 0 {
        return Ok(x.clone());
    }
    let len = x.dim(D::Minus1)?;
    if left >= len || right >= len {
        return Err(Error::Shape(format!(
            "reflect padding ({left}, {right}) needs more than {len} samples"
        )));
    }
    let mut idx: Vec<u32> = (1..=left).rev().map(|i| i as u32).collect();
    idx.extend((0..len).map(|i| i as u32));
    idx.extend((0..right).map(|i| (len - 2 - i) as u32));
    let idx = Tensor::new(idx.as_slice(), x.device())?;
    Ok(x.index_select(&idx, x.rank() - 1)?)
}

/// Transposed 1-D convolution written as zero-stuffing followed by a
/// regular convolution with the flipped, transposed kernel. Equivalent to
/// `conv_transpose1d(x, weight, stride, padding)` for `groups = 1`, and
/// differentiable with respect to both `x` and `weight`.
///
/// `weight` has the transposed-conv layout `[C_in, C_out, K]`. Output length
/// is `(T - 1) · stride + K - 2 · padding`.
pub fn conv_transpose1d_stuffed(
    x: &Tensor,
    weight: &Tensor,
    stride: usize,
    padding: usize,
) -> Result<Tensor> {
    let (_, _, k) = weight.dims3()?;
    if padding + 1 > k {
        return Err(Error::Shape(format!(
            "transposed conv padding {padding} must be smaller than kernel {k}"
        )));
    }

    let stuffed = zero_stuff(x, 2, stride)?;
    let flip: Vec<u32> = (0..k as u32).rev().collect();
    let flip = Tensor::new(flip.as_slice(), weight.device())?;
    let kernel = weight.index_select(&flip, 2)?.transpose(0, 1)?.contiguous()?;
    Ok(stuffed.conv1d(&kernel, k - 1 - padding, 1, 1, 1)?)
}

/// Insert `stride - 1` zeros between consecutive entries of `dim`.
fn zero_stuff(x: &Tensor, dim: usize, stride: usize) -> Result<Tensor> {
    if stride == 1 {
        return Ok(x.clone());
    }
    let len = x.dim(dim)?;
    let expanded = x.unsqueeze(dim + 1)?;
    let mut zeros_shape = expanded.dims().to_vec();
    zeros_shape[dim + 1] = stride - 1;
    let zeros = Tensor::zeros(zeros_shape, x.dtype(), x.device())?;
    let mut merged_shape = x.dims().to_vec();
    merged_shape[dim] = len * stride;
    let interleaved = Tensor::cat(&[&expanded, &zeros], dim + 1)?.reshape(merged_shape)?;
    Ok(interleaved.narrow(dim, 0, (len - 1) * stride + 1)?)
}

/// 2-D counterpart of [`conv_transpose1d_stuffed`] for square kernels.
/// `weight` is `[C_in, C_out, K, K]`.
pub fn conv_transpose2d_stuffed(
    x: &Tensor,
    weight: &Tensor,
    stride: usize,
    padding: usize,
) -> Result<Tensor> {
    let (_, _, k, _) = weight.dims4()?;
    if padding + 1 > k {
        return Err(Error::Shape(format!(
            "transposed conv padding {padding} must be smaller than kernel {k}"
        )));
    }
    let stuffed = zero_stuff(&zero_stuff(x, 2, stride)?, 3, stride)?;
    let flip: Vec<u32> = (0..k as u32).rev().collect();
    let flip = Tensor::new(flip.as_slice(), weight.device())?;
    let kernel = weight
        .index_select(&flip, 2)?
        .index_select(&flip, 3)?
        .transpose(0, 1)?
        .contiguous()?;
    Ok(stuffed.conv2d(&kernel, k - 1 - padding, 1, 1, 1)?)
}

/// `ConvTranspose2d` whose forward goes through [`conv_transpose2d_stuffed`].
/// Parameter names and layout match `candle_nn::ConvTranspose2d`.
#[derive(Debug, Clone)]
pub struct UpConv2d {
    inner: candle_nn::ConvTranspose2d,
}

impl UpConv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        vb: candle_nn::VarBuilder,
    ) -> Result<Self> {
        let config = candle_nn::ConvTranspose2dConfig {
            padding,
            stride,
            ..Default::default()
        };
        let inner = candle_nn::conv_transpose2d(in_channels, out_channels, kernel_size, config, vb)?;
        Ok(Self { inner })
    }
}

impl candle_core::Module for UpConv2d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let cfg = self.inner.config();
        let y = conv_transpose2d_stuffed(x, self.inner.weight(), cfg.stride, cfg.padding)
            .map_err(candle_core::Error::wrap)?;
        match self.inner.bias() {
            Some(b) => y.broadcast_add(&b.reshape((1, (), 1, 1))?),
            None => Ok(y),
        }
    }
}

/// `AvgPool1d(kernel, stride, padding)` with zero padding counted in the
/// average, expressed as a convolution so gradients flow through it.
pub fn avg_pool1d(x: &Tensor, kernel: usize, stride: usize, padding: usize) -> Result<Tensor> {
    let (b, c, t) = x.dims3()?;
    let padded = x.pad_with_zeros(2, padding, padding)?;
    let window = Tensor::full(1.0 / kernel as f64, (1, 1, kernel), x.device())?.to_dtype(x.dtype())?;
    let pooled = padded
        .reshape((b * c, 1, t + 2 * padding))?
        .conv1d(&window, 0, stride, 1, 1)?;
    let out_len = pooled.dim(2)?;
    Ok(pooled.reshape((b, c, out_len))?)
}

/// Mean of the squared difference, as a scalar tensor.
pub fn mse(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok((a - b)?.sqr()?.mean_all()?)
}

/// Mean absolute difference, as a scalar tensor.
pub fn l1(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Ok((a - b)?.abs()?.mean_all()?)
}

/// Read a scalar tensor as `f64` regardless of dtype.
pub fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
