//! Audio I/O and feature extraction.
//!
//! WAV read/write for the vocoder's mono output and log-mel features for
//! audio-conditioned sampling.

pub mod mel;
mod wav;

pub use mel::{MelConfig, MelSpectrogram};
pub use wav::{downmix, read_wav, write_wav};
