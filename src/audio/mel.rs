//! Log-mel spectrogram computation via STFT + mel filterbank.
//!
//! Two front-ends share the same framing and filterbank:
//!
//! - [`FeatureExtractor`] runs on the CPU with `rustfft` and produces the
//!   training spectrograms (power 2).
//! - [`MelFrontend`] expresses the STFT as a strided convolution with
//!   windowed DFT kernels so it stays differentiable inside a candle graph.
//!   The vocoder's mel loss uses it with power 1 (magnitude).
//!
//! Framing:
//! - Sample rate: 44100 Hz
//! - FFT size: 2048 (1025 frequency bins), periodic Hann window of 2048
//! - Hop length: 512, centered frames with reflect padding of `n_fft / 2`
//! - Mel bins: 128 over 0 Hz to Nyquist, HTK scale, no area normalization
//! - Log compression: `ln(clamp(mel, min=1e-5))`

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

use super::wav::{db_to_amplitude, fit_length, peak_normalize, read_wav_mono, resample};
use crate::config::AudioConfig;
use crate::model::layers::reflect_pad_last;
use crate::{Error, Result};

/// Floor applied before the logarithm.
pub const LOG_FLOOR: f64 = 1e-5;

/// Peak level of preprocessed training audio.
const PREPROCESS_PEAK_DB: f32 = -1.0;

/// Linear fade applied to the end of every preprocessed clip.
const PREPROCESS_FADE_SECS: f64 = 0.2;

/// Spectrogram resolution and magnitude exponent.
#[derive(Debug, Clone)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f64,
    pub f_max: f64,
    /// 2.0 for a power spectrogram, 1.0 for magnitude.
    pub power: f64,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self::from_audio(&AudioConfig::default(), 2.0)
    }
}

impl MelConfig {
    pub fn from_audio(audio: &AudioConfig, power: f64) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            n_fft: audio.n_fft,
            hop_length: audio.hop_length,
            n_mels: audio.n_mels,
            f_min: 0.0,
            f_max: audio.sample_rate as f64 / 2.0,
            power,
        }
    }

    fn num_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }
}

// ---------------------------------------------------------------------------
// CPU feature extractor
// ---------------------------------------------------------------------------

/// CPU log-mel extractor and training-clip preprocessor.
///
/// Pre-computes the Hann window, FFT plan, and mel filterbank on construction.
pub struct FeatureExtractor {
    audio: AudioConfig,
    config: MelConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: std::sync::Arc<dyn rustfft::Fft<f64>>,
}

impl std::fmt::Debug for FeatureExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureExtractor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FeatureExtractor {
    pub fn new(audio: &AudioConfig) -> Self {
        let config = MelConfig::from_audio(audio, 2.0);
        let window = hann_window(config.n_fft);
        let filterbank = mel_filterbank(&config);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);
        Self {
            audio: audio.clone(),
            config,
            window,
            filterbank,
            fft,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Log-mel spectrogram of mono audio, row-major `[n_mels, frames]`.
    pub fn log_mel(&self, samples: &[f32]) -> Result<Vec<Vec<f32>>> {
        let half = self.config.n_fft / 2;
        if samples.len() <= half {
            return Err(Error::Audio(format!(
                "{} samples is too short for centered framing with n_fft={}",
                samples.len(),
                self.config.n_fft
            )));
        }
        let signal: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        let padded = reflect_pad(&signal, half, half);
        let spectra = self.stft(&padded);

        let frames = spectra.len();
        let mut mel = vec![vec![0f32; frames]; self.config.n_mels];
        for (frame_idx, spectrum) in spectra.iter().enumerate() {
            for (mel_idx, filter) in self.filterbank.iter().enumerate() {
                let sum: f64 = filter
                    .iter()
                    .zip(spectrum)
                    .filter(|(w, _)| **w > 0.0)
                    .map(|(w, s)| w * s)
                    .sum();
                mel[mel_idx][frame_idx] = sum.max(LOG_FLOOR).ln() as f32;
            }
        }
        Ok(mel)
    }

    /// Framed spectra `|X|^power`, one `n_fft/2 + 1` vector per frame.
    fn stft(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = self.config.num_bins();
        let num_frames = (padded.len() - n_fft) / hop + 1;

        let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];
        (0..num_frames)
            .map(|frame_idx| {
                let start = frame_idx * hop;
                for (i, slot) in buffer.iter_mut().enumerate() {
                    *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
                }
                self.fft.process(&mut buffer);
                buffer[..num_bins]
                    .iter()
                    .map(|c| c.norm_sqr().powf(self.config.power / 2.0))
                    .collect()
            })
            .collect()
    }

    /// Bring decoded audio to the training clip format: resample, fit to the
    /// target length, normalize to -1 dBFS peak, then a linear fade over the
    /// last 0.2 s.
    pub fn prepare_clip(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        let mut clip = resample(samples, sample_rate, self.audio.sample_rate)?;
        fit_length(&mut clip, self.audio.target_samples());
        peak_normalize(&mut clip, db_to_amplitude(PREPROCESS_PEAK_DB));

        let fade = ((self.audio.sample_rate as f64 * PREPROCESS_FADE_SECS) as usize).min(clip.len());
        let start = clip.len() - fade;
        for (i, s) in clip[start..].iter_mut().enumerate() {
            *s *= linspace_at(1.0, 0.0, fade, i) as f32;
        }
        Ok(clip)
    }

    /// Read a WAV file and return its `[1, n_mels, frames]` log-mel tensor.
    pub fn spectrogram_from_file(&self, path: &Path, device: &Device) -> Result<Tensor> {
        let (samples, sr) = read_wav_mono(path)?;
        if samples.is_empty() {
            return Err(Error::Audio(format!("{} has no samples", path.display())));
        }
        let clip = self.prepare_clip(&samples, sr)?;
        self.to_tensor(&self.log_mel(&clip)?, device)
    }

    /// Pack `[n_mels][frames]` into a `[1, n_mels, frames]` f32 tensor.
    pub fn to_tensor(&self, mel: &[Vec<f32>], device: &Device) -> Result<Tensor> {
        let frames = mel.first().map_or(0, Vec::len);
        let flat: Vec<f32> = mel.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (1, mel.len(), frames), device)?)
    }
}

// ---------------------------------------------------------------------------
// Differentiable front-end
// ---------------------------------------------------------------------------

/// STFT + mel projection built from candle ops, so gradients reach the
/// waveform.
#[derive(Debug, Clone)]
pub struct MelFrontend {
    config: MelConfig,
    /// `[2·bins, 1, n_fft]`: windowed cosine kernels, then windowed sine kernels.
    dft_kernels: Tensor,
    /// `[n_mels, bins]`
    filterbank: Tensor,
}

impl MelFrontend {
    pub fn new(config: MelConfig, device: &Device) -> Result<Self> {
        let n_fft = config.n_fft;
        let bins = config.num_bins();
        let window = hann_window(n_fft);

        let mut kernels = vec![0f32; 2 * bins * n_fft];
        for k in 0..bins {
            for n in 0..n_fft {
                let phase = 2.0 * std::f64::consts::PI * (k * n) as f64 / n_fft as f64;
                kernels[k * n_fft + n] = (window[n] * phase.cos()) as f32;
                kernels[(bins + k) * n_fft + n] = (-window[n] * phase.sin()) as f32;
            }
        }
        let dft_kernels = Tensor::from_vec(kernels, (2 * bins, 1, n_fft), device)?;

        let fb: Vec<f32> = mel_filterbank(&config)
            .into_iter()
            .flatten()
            .map(|w| w as f32)
            .collect();
        let filterbank = Tensor::from_vec(fb, (config.n_mels, bins), device)?;

        Ok(Self {
            config,
            dft_kernels,
            filterbank,
        })
    }

    /// `[B, 1, T]` or `[B, T]` waveform → `[B, n_mels, T / hop + 1]` log-mel.
    pub fn log_mel(&self, audio: &Tensor) -> Result<Tensor> {
        let audio = match audio.rank() {
            2 => audio.unsqueeze(1)?,
            3 => audio.clone(),
            r => {
                return Err(Error::Shape(format!(
                    "mel front-end expects [B, T] or [B, 1, T], got rank {r}"
                )));
            }
        };
        let dtype = audio.dtype();
        let audio = audio.to_dtype(DType::F32)?;
        let half = self.config.n_fft / 2;
        let padded = reflect_pad_last(&audio, half, half)?;

        let spec = padded.conv1d(&self.dft_kernels, 0, self.config.hop_length, 1, 1)?;
        let bins = self.config.num_bins();
        let re = spec.narrow(1, 0, bins)?;
        let im = spec.narrow(1, bins, bins)?;
        let power = (re.sqr()? + im.sqr()?)?;
        let magnitude = if self.config.power == 2.0 {
            power
        } else {
            // The epsilon keeps the sqrt gradient finite at silent bins.
            (power + 1e-9)?.powf(self.config.power / 2.0)?
        };

        let mel = self.filterbank.broadcast_matmul(&magnitude)?;
        Ok(mel.maximum(LOG_FLOOR)?.log()?.to_dtype(dtype)?)
    }
}

// ---------------------------------------------------------------------------
// Shared DSP helpers
// ---------------------------------------------------------------------------

/// `linspace(start, end, n)[i]` with inclusive endpoints.
pub(crate) fn linspace_at(start: f64, end: f64, n: usize, i: usize) -> f64 {
    if n <= 1 {
        return start;
    }
    start + (end - start) * i as f64 / (n - 1) as f64
}

/// Periodic Hann window.
fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Reflect-pad a signal on both sides (edge sample not repeated).
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(pad_left + len + pad_right);
    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(len - 1)]);
    }
    padded.extend_from_slice(signal);
    for i in 0..pad_right {
        padded.push(signal[len.saturating_sub(2 + i)]);
    }
    padded
}

/// Triangular HTK-scale filterbank without area normalization.
///
/// Returns `n_mels` filters, each with `n_fft/2 + 1` weights.
fn mel_filterbank(config: &MelConfig) -> Vec<Vec<f64>> {
    let num_bins = config.num_bins();
    let nyquist = config.sample_rate as f64 / 2.0;
    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| linspace_at(0.0, nyquist, num_bins, i))
        .collect();

    let mel_min = hz_to_mel_htk(config.f_min);
    let mel_max = hz_to_mel_htk(config.f_max);
    let edges: Vec<f64> = (0..config.n_mels + 2)
        .map(|i| mel_to_hz_htk(linspace_at(mel_min, mel_max, config.n_mels + 2, i)))
        .collect();

    (0..config.n_mels)
        .map(|m| {
            let (left, center, right) = (edges[m], edges[m + 1], edges[m + 2]);
            bin_freqs
                .iter()
                .map(|&f| {
                    let down = (f - left) / (center - left);
                    let up = (right - f) / (right - center);
                    down.min(up).max(0.0)
                })
                .collect()
        })
        .collect()
}

fn hz_to_mel_htk(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz_htk(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}
