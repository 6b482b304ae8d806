//! Training datasets, the train/validation split and the prefetching
//! batch loader.
//!
//! ```text
//!  epoch order (seeded shuffle) ─→ batches b0 b1 b2 b3 ...
//!  worker 0: b0, b2, ...  ─→ bounded channel 0 ─┐
//!  worker 1: b1, b3, ...  ─→ bounded channel 1 ─┴→ round-robin recv ─→ training loop
//! ```
//!
//! Batches are assembled on the host and arrive in epoch order regardless
//! of the worker count; the trainer moves them to its device.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;

use crate::audio::{FeatureExtractor, fit_length, read_wav_mono, resample};
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Seed of the train/validation split.
pub const SPLIT_SEED: u64 = 42;

/// Fraction of examples held out for validation.
pub const VAL_FRACTION: f64 = 0.1;

/// Tensor name inside spectrogram files.
pub const MEL_TENSOR: &str = "mel";

/// Tensor name inside latent files.
pub const LATENT_TENSOR: &str = "latent";

/// Files in `dir` with extension `ext`, sorted, skipping AppleDouble `._*`
/// entries.
pub fn list_files(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches_ext = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case(ext));
        let hidden = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with("._"));
        if path.is_file() && matches_ext && !hidden {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Load one named tensor from a safetensors file onto the host.
pub fn load_tensor(path: &Path, name: &str) -> Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    tensors.remove(name).ok_or_else(|| {
        Error::Shape(format!("{} has no `{name}` tensor", path.display()))
    })
}

/// Save one named tensor to a safetensors file.
pub fn save_tensor(path: &Path, name: &str, tensor: &Tensor) -> Result<()> {
    let map = HashMap::from([(name.to_string(), tensor.clone())]);
    Ok(candle_core::safetensors::save(&map, path)?)
}

/// Shuffle `0..n` with a fixed seed and hold out `floor(n · val_fraction)`
/// indices. Returns `(train, val)`.
pub fn split_indices(n: usize, val_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    let val_len = ((n as f64) * val_fraction).floor() as usize;
    let val = order.split_off(n - val_len);
    (order, val)
}

/// Outcome of [`preprocess_directory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreprocessSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Convert every WAV in `input` into a `<stem>.safetensors` spectrogram
/// (tensor `mel`) in `output`. Unreadable files are logged and counted, not
/// fatal.
pub fn preprocess_directory(input: &Path, output: &Path, audio: &AudioConfig) -> Result<PreprocessSummary> {
    let files = list_files(input, "wav")?;
    if files.is_empty() {
        return Err(Error::EmptyDataset(input.to_path_buf()));
    }
    std::fs::create_dir_all(output)?;
    let extractor = FeatureExtractor::new(audio);
    let bar = super::progress_bar(files.len(), "preprocessing");
    let mut summary = PreprocessSummary::default();
    for path in &files {
        bar.inc(1);
        let mel = match extractor.spectrogram_from_file(path, &Device::Cpu) {
            Ok(mel) => mel,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "failed to load");
                summary.failed += 1;
                continue;
            }
        };
        save_tensor(&output.join(format!("{}.safetensors", file_stem(path))), MEL_TENSOR, &mel)?;
        summary.processed += 1;
    }
    bar.finish_and_clear();
    tracing::info!(processed = summary.processed, failed = summary.failed, "preprocessing done");
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

/// Indexable source of training examples, collated into batches on worker
/// threads.
pub trait Dataset: Send + Sync + 'static {
    type Item: Send + 'static;
    type Batch: Send + 'static;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Example `index`; `rng` is seeded per example and epoch.
    fn get(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<Self::Item>;

    fn collate(items: Vec<Self::Item>) -> Result<Self::Batch>;
}

/// Preprocessed log-mel spectrograms (`<stem>.safetensors`, tensor `mel`).
#[derive(Debug, Clone)]
pub struct SpectrogramDataset {
    files: Vec<PathBuf>,
}

impl SpectrogramDataset {
    pub fn open(dir: &Path) -> Result<Self> {
        let files = list_files(dir, "safetensors")?;
        if files.is_empty() {
            return Err(Error::EmptyDataset(dir.to_path_buf()));
        }
        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl Dataset for SpectrogramDataset {
    type Item = Tensor;
    type Batch = Tensor;

    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize, _rng: &mut ChaCha8Rng) -> Result<Tensor> {
        load_tensor(&self.files[index], MEL_TENSOR)
    }

    fn collate(items: Vec<Tensor>) -> Result<Tensor> {
        Ok(Tensor::stack(&items, 0)?)
    }
}

/// Pre-encoded latents paired with their keyword indices.
#[derive(Debug, Clone)]
pub struct LatentDataset {
    files: Vec<PathBuf>,
    keywords: Vec<Vec<usize>>,
}

/// A batch of latents `[B, C, H, W]` and per-example keyword sets.
#[derive(Debug, Clone)]
pub struct LatentBatch {
    pub latents: Tensor,
    pub keywords: Vec<Vec<usize>>,
}

impl LatentDataset {
    /// Files without a metadata row get an empty keyword set.
    pub fn open(dir: &Path, keywords_by_stem: &HashMap<String, Vec<usize>>) -> Result<Self> {
        let files = list_files(dir, "safetensors")?;
        if files.is_empty() {
            return Err(Error::EmptyDataset(dir.to_path_buf()));
        }
        let keywords = files
            .iter()
            .map(|f| keywords_by_stem.get(&file_stem(f)).cloned().unwrap_or_default())
            .collect();
        Ok(Self { files, keywords })
    }
}

impl Dataset for LatentDataset {
    type Item = (Tensor, Vec<usize>);
    type Batch = LatentBatch;

    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize, _rng: &mut ChaCha8Rng) -> Result<Self::Item> {
        let latent = load_tensor(&self.files[index], LATENT_TENSOR)?;
        Ok((latent, self.keywords[index].clone()))
    }

    fn collate(items: Vec<Self::Item>) -> Result<LatentBatch> {
        let (latents, keywords): (Vec<Tensor>, Vec<Vec<usize>>) = items.into_iter().unzip();
        Ok(LatentBatch {
            latents: Tensor::stack(&latents, 0)?,
            keywords,
        })
    }
}

/// Random aligned segments of raw audio and their spectrogram frames.
#[derive(Debug, Clone)]
pub struct VocoderDataset {
    pairs: Vec<(PathBuf, PathBuf)>,
    audio: AudioConfig,
    segment_frames: usize,
}

/// `mel [B, n_mels, frames]` with the matching `audio [B, 1, frames · hop]`.
#[derive(Debug, Clone)]
pub struct VocoderBatch {
    pub mel: Tensor,
    pub audio: Tensor,
}

impl VocoderDataset {
    /// Pair every `<stem>.wav` in `raw_dir` with `<stem>.safetensors` in
    /// `mel_dir`. Unpaired files are ignored.
    pub fn open(raw_dir: &Path, mel_dir: &Path, audio: &AudioConfig, segment_samples: usize) -> Result<Self> {
        if segment_samples < audio.hop_length {
            return Err(Error::Config(format!(
                "segment of {segment_samples} samples is shorter than one hop ({})",
                audio.hop_length
            )));
        }
        let mel_stems: HashSet<String> = list_files(mel_dir, "safetensors")?
            .iter()
            .map(|p| file_stem(p))
            .collect();
        let pairs: Vec<(PathBuf, PathBuf)> = list_files(raw_dir, "wav")?
            .into_iter()
            .filter(|raw| mel_stems.contains(&file_stem(raw)))
            .map(|raw| {
                let mel = mel_dir.join(format!("{}.safetensors", file_stem(&raw)));
                (raw, mel)
            })
            .collect();
        if pairs.is_empty() {
            return Err(Error::EmptyDataset(raw_dir.to_path_buf()));
        }
        tracing::info!(pairs = pairs.len(), "vocoder dataset paired");
        Ok(Self {
            pairs,
            audio: audio.clone(),
            segment_frames: segment_samples / audio.hop_length,
        })
    }

    pub fn segment_samples(&self) -> usize {
        self.segment_frames * self.audio.hop_length
    }
}

impl Dataset for VocoderDataset {
    type Item = (Tensor, Tensor);
    type Batch = VocoderBatch;

    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<Self::Item> {
        let (raw_path, mel_path) = &self.pairs[index];
        let (samples, sr) = read_wav_mono(raw_path)?;
        let mut audio = resample(&samples, sr, self.audio.sample_rate)?;
        fit_length(&mut audio, self.audio.target_samples());

        // [1, n_mels, F] → [n_mels, F]
        let mel = load_tensor(mel_path, MEL_TENSOR)?.squeeze(0)?;
        let (n_mels, frames) = mel.dims2()?;
        let span = self.segment_frames;
        let mel_start = if frames > span {
            rng.random_range(0..frames - span)
        } else {
            0
        };

        let take = span.min(frames - mel_start);
        let mut mel_seg = mel.narrow(1, mel_start, take)?;
        if take < span {
            mel_seg = mel_seg.pad_with_zeros(1, 0, span - take)?;
        }

        let seg_len = self.segment_samples();
        let audio_start = (mel_start * self.audio.hop_length).min(audio.len());
        let audio_end = (audio_start + seg_len).min(audio.len());
        let mut segment = audio[audio_start..audio_end].to_vec();
        fit_length(&mut segment, seg_len);

        debug_assert_eq!(mel_seg.dims(), &[n_mels, span]);
        let audio_seg = Tensor::from_vec(segment, (1, seg_len), &Device::Cpu)?;
        Ok((mel_seg, audio_seg))
    }

    fn collate(items: Vec<Self::Item>) -> Result<VocoderBatch> {
        let (mels, audio): (Vec<Tensor>, Vec<Tensor>) = items.into_iter().unzip();
        Ok(VocoderBatch {
            mel: Tensor::stack(&mels, 0)?,
            audio: Tensor::stack(&audio, 0)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    /// 0 loads batches on the calling thread.
    pub num_workers: usize,
    /// Batches buffered per worker.
    pub prefetch: usize,
    pub seed: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            drop_last: false,
            num_workers: 4,
            prefetch: 2,
            seed: 0,
        }
    }
}

/// Batches a subset of a [`Dataset`], reshuffled every epoch.
pub struct BatchLoader<D: Dataset> {
    dataset: Arc<D>,
    indices: Vec<usize>,
    config: LoaderConfig,
}

impl<D: Dataset> BatchLoader<D> {
    pub fn new(dataset: Arc<D>, indices: Vec<usize>, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        Ok(Self {
            dataset,
            indices,
            config,
        })
    }

    pub fn num_examples(&self) -> usize {
        self.indices.len()
    }

    pub fn num_batches(&self) -> usize {
        let n = self.indices.len();
        let bs = self.config.batch_size;
        if self.config.drop_last { n / bs } else { n.div_ceil(bs) }
    }

    fn epoch_seed(&self, epoch: usize) -> u64 {
        self.config
            .seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(epoch as u64)
    }

    /// Index groups for `epoch`, in the order they will be yielded.
    pub fn plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order = self.indices.clone();
        if self.config.shuffle {
            order.shuffle(&mut ChaCha8Rng::seed_from_u64(self.epoch_seed(epoch)));
        }
        let mut batches: Vec<Vec<usize>> = order
            .chunks(self.config.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        if self.config.drop_last && batches.last().is_some_and(|b| b.len() < self.config.batch_size) {
            batches.pop();
        }
        batches
    }

    /// Iterate the batches of one epoch.
    pub fn epoch(&self, epoch: usize) -> Batches<D::Batch> {
        let plan = self.plan(epoch);
        let seed = self.epoch_seed(epoch);
        if self.config.num_workers == 0 || plan.len() <= 1 {
            let dataset = Arc::clone(&self.dataset);
            let inline = plan
                .into_iter()
                .enumerate()
                .map(move |(b, indices)| load_batch(dataset.as_ref(), &indices, seed, b));
            return Batches {
                source: Source::Inline(Box::new(inline)),
            };
        }

        let workers = self.config.num_workers.min(plan.len());
        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for w in 0..workers {
            let (tx, rx) = mpsc::channel::<Result<D::Batch>>(self.config.prefetch.max(1));
            let dataset = Arc::clone(&self.dataset);
            let assigned: Vec<(usize, Vec<usize>)> = plan
                .iter()
                .enumerate()
                .skip(w)
                .step_by(workers)
                .map(|(b, idx)| (b, idx.clone()))
                .collect();
            handles.push(std::thread::spawn(move || {
                for (b, indices) in assigned {
                    let batch = load_batch(dataset.as_ref(), &indices, seed, b);
                    // The consumer hung up: stop early.
                    if tx.blocking_send(batch).is_err() {
                        break;
                    }
                }
            }));
            receivers.push(rx);
        }
        Batches {
            source: Source::Workers {
                receivers,
                handles,
                next: 0,
                remaining: plan.len(),
            },
        }
    }
}

fn load_batch<D: Dataset>(dataset: &D, indices: &[usize], seed: u64, batch: usize) -> Result<D::Batch> {
    let items = indices
        .iter()
        .enumerate()
        .map(|(i, &index)| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed ^ ((batch as u64) << 20 | i as u64));
            dataset.get(index, &mut rng)
        })
        .collect::<Result<Vec<_>>>()?;
    D::collate(items)
}

enum Source<B> {
    Inline(Box<dyn Iterator<Item = Result<B>>>),
    Workers {
        receivers: Vec<mpsc::Receiver<Result<B>>>,
        handles: Vec<JoinHandle<()>>,
        next: usize,
        remaining: usize,
    },
}

/// Iterator over one epoch's batches.
pub struct Batches<B> {
    source: Source<B>,
}

impl<B> Iterator for Batches<B> {
    type Item = Result<B>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            Source::Inline(iter) => iter.next(),
            Source::Workers {
                receivers,
                next,
                remaining,
                ..
            } => {
                if *remaining == 0 {
                    return None;
                }
                let worker = *next % receivers.len();
                *next += 1;
                *remaining -= 1;
                match receivers[worker].blocking_recv() {
                    Some(batch) => Some(batch),
                    None => {
                        *remaining = 0;
                        Some(Err(Error::Io(std::io::Error::other(
                            "batch loader worker exited early",
                        ))))
                    }
                }
            }
        }
    }
}

impl<B> Drop for Batches<B> {
    fn drop(&mut self) {
        if let Source::Workers {
            receivers, handles, ..
        } = &mut self.source
        {
            receivers.clear();
            for handle in handles.drain(..) {
                if handle.join().is_err() {
                    tracing::warn!("batch loader worker panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting(usize);

    impl Dataset for Counting {
        type Item = usize;
        type Batch = Vec<usize>;

        fn len(&self) -> usize {
            self.0
        }

        fn get(&self, index: usize, _rng: &mut ChaCha8Rng) -> Result<usize> {
            Ok(index)
        }

        fn collate(items: Vec<usize>) -> Result<Vec<usize>> {
            Ok(items)
        }
    }

    fn loader(workers: usize, drop_last: bool) -> BatchLoader<Counting> {
        BatchLoader::new(
            Arc::new(Counting(10)),
            (0..10).collect(),
            LoaderConfig {
                batch_size: 3,
                num_workers: workers,
                drop_last,
                seed: 5,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let (train, val) = split_indices(50, VAL_FRACTION, SPLIT_SEED);
        assert_eq!((train.len(), val.len()), (45, 5));
        let mut all: Vec<usize> = train.iter().chain(&val).copied().collect();
        all.sort();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
        assert_eq!(split_indices(50, VAL_FRACTION, SPLIT_SEED), (train, val));
        assert_eq!(split_indices(5, VAL_FRACTION, SPLIT_SEED).1.len(), 0);
    }

    #[test]
    fn drop_last_discards_partial_batch() {
        assert_eq!(loader(0, true).num_batches(), 3);
        assert_eq!(loader(0, false).num_batches(), 4);
        let plan = loader(0, true).plan(0);
        assert!(plan.iter().all(|b| b.len() == 3));
    }

    #[test]
    fn workers_preserve_epoch_order() {
        let inline: Vec<Vec<usize>> = loader(0, false).epoch(3).map(|b| b.unwrap()).collect();
        let threaded: Vec<Vec<usize>> = loader(3, false).epoch(3).map(|b| b.unwrap()).collect();
        assert_eq!(inline, threaded);
        assert_eq!(inline, loader(0, false).plan(3));
        assert_ne!(loader(0, false).plan(3), loader(0, false).plan(4));
    }

    #[test]
    fn dropping_mid_epoch_stops_workers() {
        let mut batches = loader(2, false).epoch(0);
        assert!(batches.next().unwrap().is_ok());
        drop(batches);
    }

    #[test]
    fn empty_directories_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SpectrogramDataset::open(dir.path()),
            Err(Error::EmptyDataset(_))
        ));
    }

    #[test]
    fn preprocessing_counts_failures() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        let tone: Vec<f32> = (0..22050).map(|i| (i as f32 * 0.01).sin()).collect();
        crate::audio::write_wav_mono(raw.join("a.wav"), &tone, 22050).unwrap();
        std::fs::write(raw.join("broken.wav"), b"not a wav").unwrap();
        std::fs::write(raw.join("._a.wav"), b"resource fork").unwrap();

        let out = dir.path().join("mels");
        let summary = preprocess_directory(&raw, &out, &AudioConfig::default()).unwrap();
        assert_eq!(summary, PreprocessSummary { processed: 1, failed: 1 });
        let mel = load_tensor(&out.join("a.safetensors"), MEL_TENSOR).unwrap();
        assert_eq!(mel.dims(), &[1, 128, 173]);
    }

    #[test]
    fn vocoder_segments_align_with_frames() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        let mels = dir.path().join("mels");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::create_dir_all(&mels).unwrap();

        let audio = AudioConfig::default();
        let ramp: Vec<f32> = (0..audio.target_samples()).map(|i| i as f32 / 1e5).collect();
        crate::audio::write_wav_mono(raw.join("k1.wav"), &ramp, 44100).unwrap();
        crate::audio::write_wav_mono(raw.join("orphan.wav"), &ramp, 44100).unwrap();
        let frame_ids = Tensor::arange(0f32, 173., &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 173))
            .unwrap()
            .broadcast_as((1, 128, 173))
            .unwrap()
            .contiguous()
            .unwrap();
        save_tensor(&mels.join("k1.safetensors"), MEL_TENSOR, &frame_ids).unwrap();

        let ds = VocoderDataset::open(&raw, &mels, &audio, 8192).unwrap();
        assert_eq!(ds.len(), 1);
        let (mel, wav) = ds.get(0, &mut ChaCha8Rng::seed_from_u64(1)).unwrap();
        assert_eq!(mel.dims(), &[128, 16]);
        assert_eq!(wav.dims(), &[1, 8192]);
        let first_frame = mel.get(0).unwrap().get(0).unwrap().to_scalar::<f32>().unwrap() as usize;
        assert!(first_frame < 173 - 16);
        let first_sample = wav.get(0).unwrap().get(0).unwrap().to_scalar::<f32>().unwrap();
        assert!((first_sample - (first_frame * 512) as f32 / 1e5).abs() < 1e-4);

        let batch = VocoderDataset::collate(vec![(mel.clone(), wav.clone()), (mel, wav)]).unwrap();
        assert_eq!(batch.mel.dims(), &[2, 128, 16]);
        assert_eq!(batch.audio.dims(), &[2, 1, 8192]);
    }
}
