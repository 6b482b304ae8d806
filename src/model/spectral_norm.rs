//! Spectrally normalized 1-D convolution.
//!
//! ```text
//! W = weight_orig.reshape(out, -1)
//! v = normalize(Wᵀ u)      u ← normalize(W v)      σ = uᵀ W v
//! w = weight_orig / σ
//! ```
//!
//! One power iteration runs per forward. `u` is a non-trainable estimate of
//! the leading left singular vector; it lives in the var map as
//! `weight_u` (so checkpoints carry it) and is updated in place without
//! gradient. Only `σ` is differentiated, through `weight_orig`.

use candle_core::{Module, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::Result;

const EPS: f64 = 1e-12;

fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_all()?.sqrt()?.maximum(EPS)?;
    Ok(x.broadcast_div(&norm)?)
}

#[derive(Debug, Clone)]
pub struct SpectralNormConv1d {
    weight_orig: Tensor,
    weight_u: Tensor,
    bias: Tensor,
    config: candle_nn::Conv1dConfig,
}

impl SpectralNormConv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        config: candle_nn::Conv1dConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight_orig = vb.get_with_hints(
            (out_channels, in_channels / config.groups, kernel_size),
            "weight_orig",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let weight_u = vb.get_with_hints(out_channels, "weight_u", Init::Randn { mean: 0.0, stdev: 1.0 })?;
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
            weight_orig,
            weight_u,
            bias,
            config,
        })
    }

    /// Run one power iteration, store the new `u` and return `w / σ`.
    pub fn weight(&self) -> Result<Tensor> {
        let w = self.weight_orig.flatten_from(1)?;
        let w_const = w.detach();
        let u = self.weight_u.detach().unsqueeze(1)?;
        let v = l2_normalize(&w_const.t()?.matmul(&u)?)?;
        let u = l2_normalize(&w_const.matmul(&v)?)?;
        self.weight_u.slice_set(&u.squeeze(1)?.contiguous()?, 0, 0)?;

        let sigma = (&u * w.matmul(&v)?)?.sum_all()?;
        Ok(self.weight_orig.broadcast_div(&sigma)?)
    }
}

impl Module for SpectralNormConv1d {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let w = self.weight().map_err(candle_core::Error::wrap)?;
        let c = &self.config;
        let y = x.conv1d(&w, c.padding, c.stride, c.dilation, c.groups)?;
        y.broadcast_add(&self.bias.reshape((1, (), 1))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn conv(varmap: &VarMap) -> SpectralNormConv1d {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let cfg = candle_nn::Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        SpectralNormConv1d::new(4, 6, 3, cfg, vb).unwrap()
    }

    fn largest_singular_value(w: &Tensor) -> f32 {
        // Power iteration to convergence on WᵀW.
        let w = w.flatten_from(1).unwrap();
        let wtw = w.t().unwrap().matmul(&w).unwrap();
        let mut v = Tensor::ones((w.dim(1).unwrap(), 1), DType::F32, &Device::Cpu).unwrap();
        for _ in 0..500 {
            v = l2_normalize(&wtw.matmul(&v).unwrap()).unwrap();
        }
        let wv = w.matmul(&v).unwrap();
        wv.sqr().unwrap().sum_all().unwrap().sqrt().unwrap().to_scalar().unwrap()
    }

    #[test]
    fn normalized_weight_has_unit_spectral_norm() {
        let varmap = VarMap::new();
        let layer = conv(&varmap);
        for _ in 0..200 {
            layer.weight().unwrap();
        }
        let w = layer.weight().unwrap();
        let sigma = largest_singular_value(&w);
        assert!((sigma - 1.0).abs() < 1e-2, "sigma {sigma}");
    }

    #[test]
    fn power_iteration_state_is_persisted_in_the_var_map() {
        let varmap = VarMap::new();
        let layer = conv(&varmap);
        let before: Vec<f32> = varmap.data().lock().unwrap()["weight_u"].as_tensor().to_vec1().unwrap();
        layer.weight().unwrap();
        let after: Vec<f32> = varmap.data().lock().unwrap()["weight_u"].as_tensor().to_vec1().unwrap();
        assert_ne!(before, after);
        let norm: f32 = after.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn only_weight_and_bias_receive_gradients() {
        let varmap = VarMap::new();
        let layer = conv(&varmap);
        let x = Tensor::randn(0f32, 1., (2, 4, 10), &Device::Cpu).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 6, 10]);
        let grads = y.sqr().unwrap().mean_all().unwrap().backward().unwrap();
        let data = varmap.data().lock().unwrap();
        assert!(grads.get(data["weight_orig"].as_tensor()).is_some());
        assert!(grads.get(data["bias"].as_tensor()).is_some());
        assert!(grads.get(data["weight_u"].as_tensor()).is_none());
    }
}
