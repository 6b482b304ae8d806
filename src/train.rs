//! Training for the three models.
//!
//! - [`codec`]: VAE on spectrograms, epoch based, KL warm-up
//! - [`denoiser`]: latent diffusion, iteration based, CFG dropout, EMA
//! - [`vocoder`]: HiFi-GAN against MPD + MSD, epoch based, resumable
//!
//! Shared pieces live in [`optim`], [`ema`], [`data`], [`losses`] and
//! [`checkpoint`].

pub mod checkpoint;
pub mod codec;
pub mod data;
pub mod denoiser;
pub mod ema;
pub mod losses;
pub mod optim;
pub mod vocoder;

use indicatif::{ProgressBar, ProgressStyle};

pub use codec::{CodecTrainConfig, train_codec};
pub use denoiser::{DenoiserTrainConfig, pre_encode_latents, train_denoiser};
pub use vocoder::{VocoderTrainConfig, export_vocoder, train_vocoder};

/// Progress bar for `len` units of work.
pub(crate) fn progress_bar(len: usize, message: impl Into<String>) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar.set_message(message.into());
    bar
}
