//! Deterministic DDIM sampler (η = 0) with classifier-free guidance.
//!
//! ```text
//! ε̂      = ε_u + s · (ε_c - ε_u)          (guided, s > 1)
//! x̂_0    = (x_t - √(1 - ᾱ_t) · ε̂) / √ᾱ_t
//! x_prev = √ᾱ_prev · x̂_0 + √(1 - ᾱ_prev) · ε̂
//! ```
//!
//! `ᾱ_prev` is the next (smaller) timestep's ᾱ, or `1.0` after the last
//! step. Guided steps run the conditioned and unconditioned branches as a
//! single forward over the concatenated batch.

use candle_core::{Shape, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::{NoisePredictor, NoiseSchedule, gaussian_noise, timestep_tensor};
use crate::{Error, Result};

/// DDIM sampler over an evenly strided subsequence of the training steps.
#[derive(Debug, Clone)]
pub struct DdimSampler {
    schedule: NoiseSchedule,
    timesteps: Vec<usize>,
}

impl DdimSampler {
    pub fn new(schedule: NoiseSchedule, steps: usize) -> Result<Self> {
        let total = schedule.num_timesteps();
        if steps == 0 || steps > total {
            return Err(Error::Config(format!(
                "sampling steps must be in 1..={total}, got {steps}"
            )));
        }
        let stride = total / steps;
        let timesteps = (0..steps).map(|i| total - 1 - i * stride).collect();
        Ok(Self { schedule, timesteps })
    }

    /// Strictly descending timestep subsequence.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Draw seeded initial noise of `shape` and denoise it.
    pub fn sample<M: NoisePredictor + ?Sized, S: Into<Shape>>(
        &self,
        model: &M,
        shape: S,
        cond: &Tensor,
        uncond: Option<&Tensor>,
        guidance_scale: f64,
        seed: u64,
    ) -> Result<Tensor> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let x = gaussian_noise(shape, &mut rng, cond.device())?.to_dtype(cond.dtype())?;
        self.sample_from_noise(model, x, cond, uncond, guidance_scale)
    }

    /// Run the reverse loop from an explicit initial tensor.
    pub fn sample_from_noise<M: NoisePredictor + ?Sized>(
        &self,
        model: &M,
        mut x: Tensor,
        cond: &Tensor,
        uncond: Option<&Tensor>,
        guidance_scale: f64,
    ) -> Result<Tensor> {
        let batch = x.dim(0)?;
        if cond.dim(0)? != batch {
            return Err(Error::Shape(format!(
                "conditioning batch {} does not match latent batch {batch}",
                cond.dim(0)?
            )));
        }
        let guided = match uncond {
            Some(u) if guidance_scale > 1.0 => {
                if u.dims() != cond.dims() {
                    return Err(Error::Shape(format!(
                        "unconditional embedding {:?} does not match conditional {:?}",
                        u.dims(),
                        cond.dims()
                    )));
                }
                Some(Tensor::cat(&[cond, u], 0)?)
            }
            _ => None,
        };

        for (i, &t) in self.timesteps.iter().enumerate() {
            let eps = match &guided {
                Some(both) => {
                    let x_in = Tensor::cat(&[&x, &x], 0)?;
                    let t_in = timestep_tensor(&vec![t; 2 * batch], x.device())?;
                    let pred = model.predict_noise(&x_in, &t_in, both)?;
                    let eps_cond = pred.narrow(0, 0, batch)?;
                    let eps_uncond = pred.narrow(0, batch, batch)?;
                    (&eps_uncond + ((eps_cond - &eps_uncond)? * guidance_scale)?)?
                }
                None => {
                    let t_in = timestep_tensor(&vec![t; batch], x.device())?;
                    model.predict_noise(&x, &t_in, cond)?
                }
            };

            let ab_t = self.schedule.alpha_bar(t)?;
            let ab_prev = match self.timesteps.get(i + 1) {
                Some(&t_prev) => self.schedule.alpha_bar(t_prev)?,
                None => 1.0,
            };

            let x0_pred = ((&x - (&eps * (1.0 - ab_t).sqrt())?)? / ab_t.sqrt())?;
            let dir_xt = (&eps * (1.0 - ab_prev).sqrt())?;
            x = ((x0_pred * ab_prev.sqrt())? + dir_xt)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    /// Predicts `x * k + cond_mean`, enough to tell branches apart.
    struct Affine(f64);

    impl NoisePredictor for Affine {
        fn predict_noise(&self, x: &Tensor, _t: &Tensor, cond: &Tensor) -> Result<Tensor> {
            let shift = cond.mean_keepdim(1)?.unsqueeze(2)?.unsqueeze(3)?;
            Ok((x * self.0)?.broadcast_add(&shift)?)
        }
    }

    fn schedule() -> NoiseSchedule {
        NoiseSchedule::new(1000, 1e-4, 0.02).unwrap()
    }

    #[test]
    fn timesteps_strictly_descending() {
        let sampler = DdimSampler::new(schedule(), 50).unwrap();
        let ts = sampler.timesteps();
        assert_eq!(ts.len(), 50);
        assert_eq!(ts[0], 999);
        assert_eq!(ts[1], 979);
        assert_eq!(*ts.last().unwrap(), 19);
        assert!(ts.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn invalid_step_counts() {
        assert!(DdimSampler::new(schedule(), 0).is_err());
        assert!(DdimSampler::new(schedule(), 1001).is_err());
        assert_eq!(DdimSampler::new(schedule(), 1000).unwrap().timesteps().len(), 1000);
    }

    #[test]
    fn scale_one_matches_unguided() {
        let dev = Device::Cpu;
        let sampler = DdimSampler::new(schedule(), 10).unwrap();
        let cond = Tensor::full(0.3f32, (2, 8), &dev).unwrap();
        let uncond = Tensor::full(-0.7f32, (2, 8), &dev).unwrap();
        let model = Affine(0.1);

        let a = sampler
            .sample(&model, (2, 4, 8, 11), &cond, Some(&uncond), 1.0, 11)
            .unwrap();
        let b = sampler.sample(&model, (2, 4, 8, 11), &cond, None, 3.0, 11).unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn guidance_changes_result() {
        let dev = Device::Cpu;
        let sampler = DdimSampler::new(schedule(), 10).unwrap();
        let cond = Tensor::full(0.3f32, (1, 8), &dev).unwrap();
        let uncond = Tensor::full(-0.7f32, (1, 8), &dev).unwrap();
        let model = Affine(0.1);
        let plain = sampler.sample(&model, (1, 4, 8, 11), &cond, None, 3.0, 5).unwrap();
        let guided = sampler
            .sample(&model, (1, 4, 8, 11), &cond, Some(&uncond), 3.0, 5)
            .unwrap();
        let diff: f32 = (plain - guided)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff > 1e-3);
    }

    #[test]
    fn zero_prediction_rescales_noise() {
        // With ε̂ = 0 the loop reduces to x · √(1/ᾱ_first).
        struct Zero;
        impl NoisePredictor for Zero {
            fn predict_noise(&self, x: &Tensor, _t: &Tensor, _c: &Tensor) -> Result<Tensor> {
                Ok(x.zeros_like()?)
            }
        }
        let dev = Device::Cpu;
        let sampler = DdimSampler::new(schedule(), 4).unwrap();
        let x = Tensor::ones((1, 1, 2, 2), DType::F32, &dev).unwrap();
        let cond = Tensor::zeros((1, 4), DType::F32, &dev).unwrap();
        let out = sampler.sample_from_noise(&Zero, x, &cond, None, 1.0).unwrap();
        let expected = (1.0 / sampler.schedule().alpha_bar(999).unwrap()).sqrt() as f32;
        let got: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        for v in got {
            assert!((v - expected).abs() / expected < 1e-4, "{v} vs {expected}");
        }
    }
}
