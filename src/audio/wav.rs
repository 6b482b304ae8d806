//! Mono WAV I/O and sample-level helpers.

use crate::{Error, Result};
use rubato::Resampler;
use std::path::Path;

/// Read a WAV file as mono f32 in [-1, 1], returning `(samples, sample_rate)`.
///
/// Multichannel files are mixed down by averaging the channels of each frame.
pub fn read_wav_mono(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(Error::Audio("WAV header declares zero channels".into()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok((mix_to_mono(&interleaved, channels), spec.sample_rate))
}

/// Write mono f32 samples as a 32-bit float WAV file.
pub fn write_wav_mono(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

fn mix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

const SINC_LEN: usize = 256;

/// Band-limited sinc resampling. Content above the lower of the two Nyquist
/// frequencies is filtered out. The filter delay is removed, so the output
/// is time-aligned with the input and `round(len · to / from)` long.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        return Err(Error::Audio(format!("cannot resample {from_rate} Hz -> {to_rate} Hz")));
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let expected = (samples.len() as f64 * ratio).round() as usize;

    let sinc = rubato::SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: 0.95,
        interpolation: rubato::SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: rubato::WindowFunction::BlackmanHarris2,
    };
    // Trailing zeros flush the filter so the delayed tail is not lost.
    let mut padded = samples.to_vec();
    padded.resize(samples.len() + SINC_LEN, 0.0);
    let mut resampler = rubato::SincFixedIn::<f32>::new(ratio, 1.0, sinc, padded.len(), 1)?;
    let delay = resampler.output_delay();
    let mut out = resampler
        .process(&[padded], None)?
        .into_iter()
        .next()
        .unwrap_or_default();

    let start = delay.min(out.len());
    out.drain(..start);
    out.resize(expected, 0.0);
    Ok(out)
}

/// Trim or zero-pad at the end to exactly `len` samples.
pub fn fit_length(samples: &mut Vec<f32>, len: usize) {
    samples.resize(len, 0.0);
}

/// Scale so the absolute peak equals `target`. Silent input is left alone.
pub fn peak_normalize(samples: &mut [f32], target: f32) {
    let max_abs = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if max_abs > 0.0 {
        let scale = target / max_abs;
        for s in samples.iter_mut() {
            *s *= scale;
        }
    }
}

/// Amplitude for a level in dBFS.
pub fn db_to_amplitude(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_normalize() {
        let mut samples = vec![0.5, -0.25, 0.1];
        peak_normalize(&mut samples, 1.0);
        assert!((samples[0] - 1.0).abs() < 1e-6);
        assert!((samples[1] - (-0.5)).abs() < 1e-6);

        let mut silent = vec![0.0f32; 8];
        peak_normalize(&mut silent, 0.95);
        assert!(silent.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_roundtrip_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wav");
        let original = vec![0.0f32, 0.5, -0.5, 1.0, -1.0, 0.25];
        write_wav_mono(&path, &original, 44100).unwrap();
        let (loaded, sr) = read_wav_mono(&path).unwrap();
        assert_eq!(sr, 44100);
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_stereo_mixdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(&path, spec).unwrap();
        for s in [16384i16, 0, -16384, -16384] {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();

        let (mono, sr) = read_wav_mono(&path).unwrap();
        assert_eq!(sr, 22050);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.25).abs() < 1e-4);
        assert!((mono[1] + 0.5).abs() < 1e-4);
    }

    fn sine(freq: f32, rate: u32, secs: f32) -> Vec<f32> {
        let n = (rate as f32 * secs) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_resample_suppresses_content_above_nyquist() {
        // 30 kHz is above the 22.05 kHz Nyquist of the target rate.
        let input = sine(30_000.0, 96_000, 1.0);
        let out = resample(&input, 96_000, 44_100).unwrap();
        assert_eq!(out.len(), 44_100);
        let interior = &out[1000..out.len() - 1000];
        assert!(rms(interior) < 0.05, "aliased rms {}", rms(interior));
    }

    #[test]
    fn test_resample_keeps_passband_and_alignment() {
        let input = sine(1_000.0, 48_000, 0.5);
        let out = resample(&input, 48_000, 44_100).unwrap();
        assert_eq!(out.len(), 22_050);
        let interior = &out[1000..out.len() - 1000];
        assert!((rms(interior) - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.02);

        // Delay compensation: the output tracks the reference sine in phase.
        let reference = sine(1_000.0, 44_100, 0.5);
        let err = interior
            .iter()
            .zip(&reference[1000..reference.len() - 1000])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(err < 0.05, "max deviation {err}");

        let same = resample(&input, 48_000, 48_000).unwrap();
        assert_eq!(same, input);
    }

    #[test]
    fn test_fit_length() {
        let mut v = vec![1.0f32; 5];
        fit_length(&mut v, 8);
        assert_eq!(v, vec![1., 1., 1., 1., 1., 0., 0., 0.]);
        fit_length(&mut v, 3);
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn test_db_to_amplitude() {
        assert!((db_to_amplitude(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_amplitude(-1.0) - 0.891_250_9).abs() < 1e-5);
    }
}
