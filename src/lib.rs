//! FLAV audio+video generation in pure Rust.
//!
//! A candle-based sampler for FLAV, a rolling rectified-flow model that
//! generates paired video and audio. Loads the released safetensors/pickle
//! checkpoints directly; the denoising network itself is plugged in through
//! the [`model::Denoiser`] trait.
//!
//! ## Architecture
//!
//! ```text
//! seeded noise ──→ rolling window [W frames, staggered t]
//!                        ↓
//!          Denoiser (+ CFG, + audio reconstruction guidance)
//!                        ↓
//!          Euler steps, emit one clean frame per stage
//!                  ↓                         ↓
//!        SD VAE (latent → RGB)     HiFi-GAN (mel → waveform)
//!                  ↓                         ↓
//!           video/sample_N/            audio/sample_N.wav
//! ```
//!
//! ## Modules
//!
//! - [`flow`] — rectified-flow schedule, guidance, and sampling loops
//! - [`model`] — denoiser seam, weight loading, HiFi-GAN vocoder
//! - [`vae`] — SD VAE decoding of video latents
//! - [`audio`] — mel spectrogram and WAV I/O
//! - [`conditions`] — class labels and conditioning audio per batch
//! - [`pipeline`] — end-to-end batch generation
//! - [`output`] — sample files on disk
//! - [`hub`] — checkpoint resolution (local or HuggingFace)
//! - [`cli`] — sampling drivers

pub mod audio;
pub mod cli;
pub mod conditions;
pub mod config;
pub mod flow;
pub mod hub;
pub mod model;
pub mod noise;
pub mod output;
pub mod pipeline;
pub mod vae;

mod error;

pub use error::{Error, Result};
