//! Training objectives for the codec and the adversarial vocoder.

use candle_core::Tensor;

use crate::audio::MelFrontend;
use crate::model::codec::{CodecOutput, kl_divergence};
use crate::model::discriminator::DiscriminatorOutput;
use crate::model::layers::{l1, mse, scalar};
use crate::Result;

/// LSGAN generator term: `Σ_k mean((1 − D_k(fake))²)`.
pub fn generator_adversarial_loss(fake: &DiscriminatorOutput) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for score in &fake.scores {
        let term = score.affine(-1.0, 1.0)?.sqr()?.mean_all()?;
        total = Some(match total {
            Some(t) => (t + term)?,
            None => term,
        });
    }
    sum_or_zero(total, &fake.scores)
}

/// LSGAN discriminator term: `Σ_k mean((1 − D_k(real))²) + mean(D_k(fake)²)`.
pub fn discriminator_loss(real: &DiscriminatorOutput, fake: &DiscriminatorOutput) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for (r, g) in real.scores.iter().zip(&fake.scores) {
        let r_loss = r.affine(-1.0, 1.0)?.sqr()?.mean_all()?;
        let g_loss = g.sqr()?.mean_all()?;
        let term = (r_loss + g_loss)?;
        total = Some(match total {
            Some(t) => (t + term)?,
            None => term,
        });
    }
    sum_or_zero(total, &real.scores)
}

/// `Σ L1(fake_fmap, real_fmap)` over every layer of every discriminator.
/// Real feature maps are treated as constants.
pub fn feature_matching_loss(real: &DiscriminatorOutput, fake: &DiscriminatorOutput) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for (real_maps, fake_maps) in real.feature_maps.iter().zip(&fake.feature_maps) {
        for (r, g) in real_maps.iter().zip(fake_maps) {
            let term = l1(g, &r.detach())?;
            total = Some(match total {
                Some(t) => (t + term)?,
                None => term,
            });
        }
    }
    sum_or_zero(total, &real.scores)
}

fn sum_or_zero(total: Option<Tensor>, like: &[Tensor]) -> Result<Tensor> {
    match (total, like.first()) {
        (Some(t), _) => Ok(t),
        (None, Some(s)) => Ok(s.zeros_like()?.sum_all()?),
        (None, None) => Err(crate::Error::Shape("discriminator produced no scores".into())),
    }
}

/// L1 between log-mels of real and generated audio.
pub fn mel_loss(frontend: &MelFrontend, real: &Tensor, fake: &Tensor) -> Result<Tensor> {
    let real_mel = frontend.log_mel(&real.detach())?;
    let fake_mel = frontend.log_mel(fake)?;
    l1(&fake_mel, &real_mel)
}

/// Codec loss terms for one batch.
#[derive(Debug, Clone)]
pub struct CodecLoss {
    pub total: Tensor,
    pub mse: f64,
    pub spectral: f64,
    pub kl: f64,
    pub kl_weighted: f64,
}

/// `mse(recon, x) + l1(recon, x) + kl_weight · KL`.
pub fn codec_loss(output: &CodecOutput, target: &Tensor, kl_weight: f64) -> Result<CodecLoss> {
    let mse_t = mse(&output.recon, target)?;
    let spectral_t = l1(&output.recon, target)?;
    let kl_t = kl_divergence(&output.mean, &output.logvar)?;
    let weighted = (&kl_t * kl_weight)?;
    let total = ((&mse_t + &spectral_t)? + &weighted)?;
    Ok(CodecLoss {
        mse: scalar(&mse_t)?,
        spectral: scalar(&spectral_t)?,
        kl: scalar(&kl_t)?,
        kl_weighted: scalar(&weighted)?,
        total,
    })
}

/// Running means of the codec metrics over an epoch.
#[derive(Debug, Clone, Default)]
pub struct CodecMetrics {
    pub mse: f64,
    pub spectral: f64,
    pub kl: f64,
    pub kl_weighted: f64,
    pub total: f64,
    batches: usize,
}

impl CodecMetrics {
    pub fn add(&mut self, loss: &CodecLoss) -> Result<()> {
        self.mse += loss.mse;
        self.spectral += loss.spectral;
        self.kl += loss.kl;
        self.kl_weighted += loss.kl_weighted;
        self.total += scalar(&loss.total)?;
        self.batches += 1;
        Ok(())
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn mean(&self) -> Self {
        let n = self.batches.max(1) as f64;
        Self {
            mse: self.mse / n,
            spectral: self.spectral / n,
            kl: self.kl / n,
            kl_weighted: self.kl_weighted / n,
            total: self.total / n,
            batches: self.batches,
        }
    }
}
