//! Output post-processing for generated hits.

use super::mel::linspace_at;
use super::wav::{fit_length, peak_normalize};

/// Final shaping applied to every generated waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessConfig {
    pub sample_rate: u32,
    pub target_samples: usize,
    pub peak: f32,
    pub fade_start_secs: f64,
    /// Samples from here on are zeroed.
    pub fade_end_secs: f64,
    /// Exponent applied to the linear fade curve.
    pub fade_power: i32,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self::for_audio(&crate::config::AudioConfig::default())
    }
}

impl PostProcessConfig {
    pub fn for_audio(audio: &crate::config::AudioConfig) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            target_samples: audio.target_samples(),
            peak: 0.95,
            fade_start_secs: 1.0,
            fade_end_secs: 1.75,
            fade_power: 3,
        }
    }
}

/// Fit to length, normalize the peak, fade out and silence the tail.
pub fn post_process(mut samples: Vec<f32>, config: &PostProcessConfig) -> Vec<f32> {
    fit_length(&mut samples, config.target_samples);
    peak_normalize(&mut samples, config.peak);

    let sr = config.sample_rate as f64;
    let fade_start = (config.fade_start_secs * sr) as usize;
    let fade_end = ((config.fade_end_secs * sr) as usize).max(fade_start);
    if fade_start >= samples.len() {
        return samples;
    }
    let fade_len = fade_end - fade_start;
    let stop = fade_end.min(samples.len());
    for (i, s) in samples[fade_start..stop].iter_mut().enumerate() {
        *s *= linspace_at(1.0, 0.0, fade_len, i).powi(config.fade_power) as f32;
    }
    for s in samples[stop..].iter_mut() {
        *s = 0.0;
    }
    samples
}
