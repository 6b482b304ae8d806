//! Model configuration for the kick generator.
//!
//! Every shape-relevant hyperparameter lives in [`KickGenConfig`], which is
//! serialized into each checkpoint manifest. Loading a checkpoint compares
//! the stored config against the one the caller expects with
//! [`KickGenConfig::ensure_compatible`] before any tensor is touched.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Audio framing and spectrogram resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Fixed clip duration in seconds.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: f64,
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    #[serde(default = "default_n_mels")]
    pub n_mels: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            duration_secs: default_duration_secs(),
            n_fft: default_n_fft(),
            hop_length: default_hop_length(),
            n_mels: default_n_mels(),
        }
    }
}

impl AudioConfig {
    /// Number of waveform samples in one clip.
    pub fn target_samples(&self) -> usize {
        (self.sample_rate as f64 * self.duration_secs).round() as usize
    }

    /// Number of STFT frames for one clip (centered framing).
    pub fn num_frames(&self) -> usize {
        self.target_samples() / self.hop_length + 1
    }

    /// `(mel bins, frames)` of the log-mel spectrogram.
    pub fn spectrogram_shape(&self) -> (usize, usize) {
        (self.n_mels, self.num_frames())
    }
}

/// Latent codec (VAE) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
    /// Channel widths of the four stride-2 encoder stages.
    #[serde(default = "default_codec_channels")]
    pub channels: Vec<usize>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            latent_channels: default_latent_channels(),
            channels: default_codec_channels(),
        }
    }
}

impl CodecConfig {
    /// Latent `(height, width)` for a spectrogram of `(height, width)`.
    ///
    /// Each stage is a k=3, s=2, p=1 convolution: `out = (in - 1) / 2 + 1`.
    pub fn latent_hw(&self, spec_hw: (usize, usize)) -> (usize, usize) {
        let stage = |n: usize| (n.saturating_sub(1)) / 2 + 1;
        let (mut h, mut w) = spec_hw;
        for _ in &self.channels {
            h = stage(h);
            w = stage(w);
        }
        (h, w)
    }
}

/// Linear-beta noise schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    #[serde(default = "default_timesteps")]
    pub timesteps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            timesteps: default_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
        }
    }
}

/// Conditional U-Net and keyword encoder dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenoiserConfig {
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    #[serde(default = "default_cond_dim")]
    pub cond_dim: usize,
    #[serde(default = "default_text_embed_dim")]
    pub text_embed_dim: usize,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            base_channels: default_base_channels(),
            cond_dim: default_cond_dim(),
            text_embed_dim: default_text_embed_dim(),
        }
    }
}

/// HiFi-GAN generator and discriminator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocoderConfig {
    #[serde(default = "default_upsample_initial_channel")]
    pub upsample_initial_channel: usize,
    /// Per-stage upsample factors (product must equal the hop length).
    #[serde(default = "default_upsample_rates")]
    pub upsample_rates: Vec<usize>,
    #[serde(default = "default_upsample_kernel_sizes")]
    pub upsample_kernel_sizes: Vec<usize>,
    #[serde(default = "default_resblock_kernel_sizes")]
    pub resblock_kernel_sizes: Vec<usize>,
    #[serde(default = "default_resblock_dilations")]
    pub resblock_dilations: Vec<Vec<usize>>,
    /// Periods of the multi-period discriminator.
    #[serde(default = "default_periods")]
    pub periods: Vec<usize>,
}

impl Default for VocoderConfig {
    fn default() -> Self {
        Self {
            upsample_initial_channel: default_upsample_initial_channel(),
            upsample_rates: default_upsample_rates(),
            upsample_kernel_sizes: default_upsample_kernel_sizes(),
            resblock_kernel_sizes: default_resblock_kernel_sizes(),
            resblock_dilations: default_resblock_dilations(),
            periods: default_periods(),
        }
    }
}

impl VocoderConfig {
    /// Total upsampling factor of the generator.
    pub fn upsample_factor(&self) -> usize {
        self.upsample_rates.iter().product()
    }

    /// Verify that the generator maps one mel frame to `hop_length` samples.
    pub fn validate(&self, hop_length: usize) -> Result<()> {
        let product = self.upsample_factor();
        if product != hop_length {
            return Err(Error::Config(format!(
                "upsample_rates product is {product}, expected {hop_length} (hop_length)"
            )));
        }
        if self.upsample_rates.len() != self.upsample_kernel_sizes.len() {
            return Err(Error::Config(format!(
                "{} upsample rates but {} upsample kernels",
                self.upsample_rates.len(),
                self.upsample_kernel_sizes.len()
            )));
        }
        for (&u, &k) in self.upsample_rates.iter().zip(&self.upsample_kernel_sizes) {
            if k < u || (k - u) % 2 != 0 {
                return Err(Error::Config(format!(
                    "upsample kernel {k} incompatible with rate {u}: (k - u) must be even and >= 0"
                )));
            }
        }
        if self.resblock_kernel_sizes.len() != self.resblock_dilations.len() {
            return Err(Error::Config(
                "resblock_kernel_sizes and resblock_dilations differ in length".into(),
            ));
        }
        if self.upsample_initial_channel >> self.upsample_rates.len() == 0 {
            return Err(Error::Config(format!(
                "upsample_initial_channel {} too small for {} stages",
                self.upsample_initial_channel,
                self.upsample_rates.len()
            )));
        }
        if self.periods.iter().any(|&p| p < 2) {
            return Err(Error::Config("discriminator periods must be >= 2".into()));
        }
        Ok(())
    }
}

/// Complete model configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KickGenConfig {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    #[serde(default)]
    pub denoiser: DenoiserConfig,
    #[serde(default)]
    pub vocoder: VocoderConfig,
}

impl KickGenConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Latent shape `[C, H, W]` produced by the codec for one clip.
    pub fn latent_shape(&self) -> (usize, usize, usize) {
        let (h, w) = self.codec.latent_hw(self.audio.spectrogram_shape());
        (self.codec.latent_channels, h, w)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.hop_length == 0 || self.audio.n_fft < self.audio.hop_length {
            return Err(Error::Config(format!(
                "invalid STFT framing: n_fft={} hop={}",
                self.audio.n_fft, self.audio.hop_length
            )));
        }
        if self.codec.channels.is_empty() {
            return Err(Error::Config("codec needs at least one stage".into()));
        }
        for &ch in self
            .codec
            .channels
            .iter()
            .chain(std::iter::once(&self.denoiser.base_channels))
        {
            if ch % 8 != 0 {
                return Err(Error::Config(format!(
                    "channel count {ch} is not divisible by 8 (GroupNorm groups)"
                )));
            }
        }
        self.vocoder.validate(self.audio.hop_length)
    }

    /// Compare the shape-relevant fields of a checkpoint's config (`self`)
    /// against the config the caller is about to instantiate.
    pub fn ensure_compatible(&self, expected: &KickGenConfig) -> Result<()> {
        fn check<T: PartialEq + std::fmt::Debug>(
            field: &'static str,
            checkpoint: &T,
            expected: &T,
        ) -> Result<()> {
            if checkpoint != expected {
                return Err(Error::ConfigMismatch {
                    field,
                    checkpoint: format!("{checkpoint:?}"),
                    expected: format!("{expected:?}"),
                });
            }
            Ok(())
        }

        check(
            "audio.spectrogram_shape",
            &self.audio.spectrogram_shape(),
            &expected.audio.spectrogram_shape(),
        )?;
        check(
            "audio.hop_length",
            &self.audio.hop_length,
            &expected.audio.hop_length,
        )?;
        check(
            "codec.latent_channels",
            &self.codec.latent_channels,
            &expected.codec.latent_channels,
        )?;
        check("codec.channels", &self.codec.channels, &expected.codec.channels)?;
        check(
            "denoiser.base_channels",
            &self.denoiser.base_channels,
            &expected.denoiser.base_channels,
        )?;
        check(
            "denoiser.cond_dim",
            &self.denoiser.cond_dim,
            &expected.denoiser.cond_dim,
        )?;
        check(
            "denoiser.text_embed_dim",
            &self.denoiser.text_embed_dim,
            &expected.denoiser.text_embed_dim,
        )?;
        check(
            "diffusion.timesteps",
            &self.diffusion.timesteps,
            &expected.diffusion.timesteps,
        )?;
        check(
            "diffusion.beta_range",
            &(self.diffusion.beta_start, self.diffusion.beta_end),
            &(expected.diffusion.beta_start, expected.diffusion.beta_end),
        )?;
        check(
            "vocoder.upsample_rates",
            &self.vocoder.upsample_rates,
            &expected.vocoder.upsample_rates,
        )?;
        check(
            "vocoder.upsample_initial_channel",
            &self.vocoder.upsample_initial_channel,
            &expected.vocoder.upsample_initial_channel,
        )?;
        check(
            "vocoder.periods",
            &self.vocoder.periods,
            &expected.vocoder.periods,
        )?;
        Ok(())
    }
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_duration_secs() -> f64 {
    2.0
}

fn default_n_fft() -> usize {
    2048
}

fn default_hop_length() -> usize {
    512
}

fn default_n_mels() -> usize {
    128
}

fn default_latent_channels() -> usize {
    4
}

fn default_codec_channels() -> Vec<usize> {
    vec![32, 64, 128, 256]
}

fn default_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    1e-4
}

fn default_beta_end() -> f64 {
    0.02
}

fn default_base_channels() -> usize {
    64
}

fn default_cond_dim() -> usize {
    256
}

fn default_text_embed_dim() -> usize {
    64
}

fn default_upsample_initial_channel() -> usize {
    256
}

fn default_upsample_rates() -> Vec<usize> {
    vec![8, 8, 2, 2, 2]
}

fn default_upsample_kernel_sizes() -> Vec<usize> {
    vec![16, 16, 4, 4, 4]
}

fn default_resblock_kernel_sizes() -> Vec<usize> {
    vec![3, 7, 11]
}

fn default_resblock_dilations() -> Vec<Vec<usize>> {
    vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]]
}

fn default_periods() -> Vec<usize> {
    vec![2, 3, 5, 7, 11]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shapes() {
        let cfg = KickGenConfig::default();
        assert_eq!(cfg.audio.target_samples(), 88200);
        assert_eq!(cfg.audio.spectrogram_shape(), (128, 173));
        assert_eq!(cfg.latent_shape(), (4, 8, 11));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_vocoder_product_matches_hop() {
        let cfg = VocoderConfig::default();
        assert_eq!(cfg.upsample_factor(), 512);
        cfg.validate(512).unwrap();
        let bad = VocoderConfig {
            upsample_rates: vec![8, 8, 2, 2],
            upsample_kernel_sizes: vec![16, 16, 4, 4],
            ..Default::default()
        };
        assert!(bad.validate(512).is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: KickGenConfig =
            serde_json::from_str(r#"{"denoiser": {"base_channels": 32}}"#).unwrap();
        assert_eq!(cfg.denoiser.base_channels, 32);
        assert_eq!(cfg.denoiser.cond_dim, 256);
        assert_eq!(cfg.diffusion.timesteps, 1000);
    }

    #[test]
    fn test_mismatch_reports_field() {
        let expected = KickGenConfig::default();
        let mut stored = expected.clone();
        stored.codec.latent_channels = 8;
        match stored.ensure_compatible(&expected) {
            Err(Error::ConfigMismatch { field, .. }) => {
                assert_eq!(field, "codec.latent_channels")
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        expected.ensure_compatible(&expected).unwrap();
    }
}
