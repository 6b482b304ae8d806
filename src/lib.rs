//! Keyword-conditioned kick drum synthesis in pure Rust.
//!
//! A candle-based three-stage generator: a VAE compresses log-mel
//! spectrograms into a small latent, a conditional U-Net denoises latents
//! under keyword conditioning, and a HiFi-GAN vocoder turns the decoded
//! spectrogram into a waveform.
//!
//! ## Architecture
//!
//! ```text
//! "deep punchy" → vocabulary → keyword encoder ──┐
//!                              null vector ──────┼→ DDIM + classifier-free guidance
//!                                                ↓
//!                                      latent [1, 4, 8, 11]
//!                                                ↓
//!                                codec decoder (latent → log-mel)
//!                                                ↓
//!                               HiFi-GAN generator (log-mel → audio)
//!                                                ↓
//!                             2 s mono 44.1 kHz, faded, peak 0.95
//! ```
//!
//! ## Modules
//!
//! - [`audio`]: WAV I/O, log-mel features, output post-processing
//! - [`model`]: codec, keyword encoder, U-Net, vocoder, discriminators
//! - [`scheduler`]: noise schedule and the DDIM sampler
//! - [`train`]: trainers, optimizer state, data loading, checkpoints
//! - [`pipeline`]: end-to-end inference

pub mod audio;
pub mod config;
pub mod context;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod train;

mod error;

pub use error::{Error, Result};
