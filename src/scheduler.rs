//! Discrete-time diffusion: noise schedule and reverse samplers.
//!
//! ## Forward process
//!
//! ```text
//! β_t  = linspace(β_start, β_end, T)[t]
//! α_t  = 1 - β_t
//! ᾱ_t  = Π_{s ≤ t} α_s
//! x_t  = √ᾱ_t · x_0 + √(1 - ᾱ_t) · ε
//! ```
//!
//! The network is trained to predict `ε` from `(x_t, t, cond)`; the
//! [`ddim`] sampler inverts the process deterministically.

pub mod ddim;

use candle_core::{Device, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::DiffusionConfig;
use crate::{Error, Result};

/// Common interface for noise-predicting networks.
pub trait NoisePredictor {
    /// Predict the noise in `x` (`[B, C, H, W]`) at integer timesteps `t`
    /// (`[B]`, u32) under conditioning `cond` (`[B, cond_dim]`).
    fn predict_noise(&self, x: &Tensor, t: &Tensor, cond: &Tensor) -> Result<Tensor>;
}

/// Precomputed β/α/ᾱ tables. Immutable after construction.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alpha_bars: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(timesteps: usize, beta_start: f64, beta_end: f64) -> Result<Self> {
        if timesteps == 0 {
            return Err(Error::Config("noise schedule needs at least one timestep".into()));
        }
        if !(beta_start > 0.0 && beta_end < 1.0 && beta_start < beta_end) {
            return Err(Error::Config(format!(
                "beta range must satisfy 0 < start < end < 1, got {beta_start}..{beta_end}"
            )));
        }

        let denom = (timesteps - 1).max(1) as f64;
        let betas: Vec<f64> = (0..timesteps)
            .map(|i| beta_start + (beta_end - beta_start) * i as f64 / denom)
            .collect();
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alpha_bars: Vec<f64> = alphas
            .iter()
            .scan(1.0, |acc, a| {
                *acc *= a;
                Some(*acc)
            })
            .collect();

        Ok(Self {
            betas,
            alphas,
            alpha_bars,
        })
    }

    pub fn from_config(config: &DiffusionConfig) -> Result<Self> {
        Self::new(config.timesteps, config.beta_start, config.beta_end)
    }

    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alpha_bars(&self) -> &[f64] {
        &self.alpha_bars
    }

    pub fn alpha_bar(&self, t: usize) -> Result<f64> {
        self.alpha_bars.get(t).copied().ok_or_else(|| {
            Error::Config(format!(
                "timestep {t} out of range for a {}-step schedule",
                self.num_timesteps()
            ))
        })
    }

    /// Forward-noise `x0` at per-example timesteps `t` (one per batch row).
    pub fn add_noise(&self, x0: &Tensor, noise: &Tensor, t: &[usize]) -> Result<Tensor> {
        let batch = x0.dim(0)?;
        if t.len() != batch {
            return Err(Error::Shape(format!(
                "{} timesteps for a batch of {batch}",
                t.len()
            )));
        }
        let mut signal = Vec::with_capacity(batch);
        let mut noise_scale = Vec::with_capacity(batch);
        for &step in t {
            let ab = self.alpha_bar(step)?;
            signal.push(ab.sqrt() as f32);
            noise_scale.push((1.0 - ab).sqrt() as f32);
        }

        // [B] → [B, 1, 1, ...] so the coefficients broadcast over the rest.
        let mut coef_shape = vec![1usize; x0.rank()];
        coef_shape[0] = batch;
        let signal = Tensor::from_vec(signal, coef_shape.clone(), x0.device())?.to_dtype(x0.dtype())?;
        let noise_scale = Tensor::from_vec(noise_scale, coef_shape, x0.device())?.to_dtype(x0.dtype())?;

        Ok((x0.broadcast_mul(&signal)? + noise.broadcast_mul(&noise_scale)?)?)
    }
}

/// Standard-normal f32 tensor drawn from `rng` on the host, then moved to
/// `device`. Keeps sampling reproducible across backends.
pub fn gaussian_noise<S: Into<Shape>, R: Rng + ?Sized>(
    shape: S,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)?)
}

/// Integer timestep tensor `[B]` on `device`.
pub fn timestep_tensor(t: &[usize], device: &Device) -> Result<Tensor> {
    let t: Vec<u32> = t.iter().map(|&s| s as u32).collect();
    Ok(Tensor::new(t.as_slice(), device)?)
}
