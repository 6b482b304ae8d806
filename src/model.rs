//! Networks.
//!
//! ## Components
//!
//! - [`codec`]: convolutional VAE between spectrograms and latents
//! - [`conditioning`]: keyword vocabulary and keyword encoder
//! - [`denoiser`]: conditional U-Net noise predictor
//! - [`vocoder`]: HiFi-GAN generator (log-mel → waveform)
//! - [`discriminator`]: multi-period and multi-scale discriminators

pub mod codec;
pub mod conditioning;
pub mod denoiser;
pub mod discriminator;
pub mod layers;
pub mod spectral_norm;
pub mod vocoder;
pub mod weight_norm;
