//! Audio I/O, feature extraction and output post-processing.
//!
//! Everything runs at 44.1 kHz mono.

pub mod mel;
pub mod post;
mod wav;

pub use mel::{FeatureExtractor, MelConfig, MelFrontend};
pub use post::{PostProcessConfig, post_process};
pub use wav::{
    db_to_amplitude, fit_length, peak_normalize, read_wav_mono, resample, write_wav_mono,
};
