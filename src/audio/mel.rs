//! Mel spectrogram computation via STFT + mel filterbank.
//!
//! Matches the features the HiFi-GAN vocoder was trained on:
//! - Window: Hann of `win_length`, centred inside `n_fft` when shorter
//! - Padding: reflect, `(n_fft - hop) / 2` on both sides, no STFT centring
//! - Magnitude: `sqrt(re² + im² + 1e-9)`
//! - Mel scale/norm: Slaney
//! - Log compression: `ln(clamp(mel, min=1e-5))`
//!
//! Defaults are the 16 kHz, 256-bin, hop-160 features of the FLAV vocoder.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::model::vocoder::VocoderConfig;

/// Configuration for the mel spectrogram.
#[derive(Debug, Clone)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f64,
    pub f_max: f64,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self::from(&VocoderConfig::default())
    }
}

impl From<&VocoderConfig> for MelConfig {
    fn from(cfg: &VocoderConfig) -> Self {
        Self {
            sample_rate: cfg.sampling_rate,
            n_fft: cfg.n_fft,
            win_length: cfg.win_size.min(cfg.n_fft),
            hop_length: cfg.hop_size,
            n_mels: cfg.num_mels,
            f_min: cfg.fmin,
            f_max: cfg.fmax.unwrap_or(cfg.sampling_rate as f64 / 2.0),
        }
    }
}

/// Mel spectrogram processor.
///
/// Pre-computes the Hann window, FFT plan, and mel filterbank on construction.
/// Then call [`MelSpectrogram::process`] to convert audio samples to a log-mel
/// spectrogram.
pub struct MelSpectrogram {
    config: MelConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: std::sync::Arc<dyn rustfft::Fft<f64>>,
}

impl MelSpectrogram {
    /// Create a new mel spectrogram processor with the given config.
    pub fn new(config: MelConfig) -> Self {
        let window = padded_hann_window(config.win_length, config.n_fft);
        let filterbank = mel_filterbank(
            config.n_fft,
            config.n_mels,
            config.sample_rate,
            config.f_min,
            config.f_max,
        );
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);

        Self {
            config,
            window,
            filterbank,
            fft,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Compute a log-mel spectrogram from raw audio samples.
    ///
    /// Input: mono audio at the configured sample rate.
    /// Output: `[n_mels, num_frames]` log-mel spectrogram, roughly
    /// `samples.len() / hop_length` frames.
    pub fn process(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let samples_f64: Vec<f64> = samples.iter().map(|&s| s as f64).collect();

        let pad = self.config.n_fft.saturating_sub(self.config.hop_length) / 2;
        let padded = reflect_pad(&samples_f64, pad, pad);

        let magnitudes = self.stft(&padded);

        let num_frames = magnitudes.len();
        let mut mel_spec = vec![vec![0.0f32; num_frames]; self.config.n_mels];

        for (frame_idx, frame_magnitudes) in magnitudes.iter().enumerate() {
            for (mel_idx, filter) in self.filterbank.iter().enumerate() {
                let sum: f64 = filter
                    .iter()
                    .zip(frame_magnitudes.iter())
                    .filter(|(w, _)| **w > 0.0)
                    .map(|(w, m)| w * m)
                    .sum();
                mel_spec[mel_idx][frame_idx] = sum.max(1e-5).ln() as f32;
            }
        }

        mel_spec
    }

    /// Short-time Fourier transform. Returns magnitude spectra per frame.
    ///
    /// Each inner vec has `n_fft/2 + 1` elements (one-sided).
    fn stft(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;

        if padded.len() < n_fft {
            return Vec::new();
        }
        let num_frames = (padded.len() - n_fft) / hop + 1;
        let mut frames = Vec::with_capacity(num_frames);

        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;

            let mut buffer: Vec<Complex<f64>> = (0..n_fft)
                .map(|i| Complex::new(padded[start + i] * self.window[i], 0.0))
                .collect();

            self.fft.process(&mut buffer);

            let magnitudes: Vec<f64> = buffer[..num_bins]
                .iter()
                .map(|c| (c.re * c.re + c.im * c.im + 1e-9).sqrt())
                .collect();

            frames.push(magnitudes);
        }

        frames
    }
}

/// Periodic Hann window of `win_length`, zero-padded and centred in `n_fft`.
fn padded_hann_window(win_length: usize, n_fft: usize) -> Vec<f64> {
    let offset = (n_fft - win_length) / 2;
    let mut window = vec![0.0; n_fft];
    for i in 0..win_length {
        let phase = 2.0 * std::f64::consts::PI * i as f64 / win_length as f64;
        window[offset + i] = 0.5 * (1.0 - phase.cos());
    }
    window
}

/// Reflect-pad a signal on both sides.
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    if len == 0 {
        return vec![0.0; pad_left + pad_right];
    }
    let total = pad_left + len + pad_right;
    let mut padded = Vec::with_capacity(total);

    // Left reflection: signal[pad_left], signal[pad_left-1], ..., signal[1]
    for i in (1..=pad_left).rev() {
        padded.push(signal[i.min(len - 1)]);
    }

    padded.extend_from_slice(signal);

    // Right reflection: signal[len-2], signal[len-3], ...
    for i in 0..pad_right {
        let idx = len.saturating_sub(2 + i);
        padded.push(signal[idx]);
    }

    padded
}

/// Build a Slaney-normalized mel filterbank.
///
/// Returns `n_mels` filters, each with `n_fft/2 + 1` weights.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;

    let mel_min = hz_to_mel_slaney(f_min);
    let mel_max = hz_to_mel_slaney(f_max);

    let hz_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64)
        .map(mel_to_hz_slaney)
        .collect();

    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| sr * i as f64 / n_fft as f64)
        .collect();

    (0..n_mels)
        .map(|i| {
            let f_left = hz_points[i];
            let f_center = hz_points[i + 1];
            let f_right = hz_points[i + 2];
            let norm = 2.0 / (f_right - f_left);

            bin_freqs
                .iter()
                .map(|&f| {
                    if f < f_left || f > f_right {
                        0.0
                    } else if f <= f_center {
                        norm * (f - f_left) / (f_center - f_left)
                    } else {
                        norm * (f_right - f) / (f_right - f_center)
                    }
                })
                .collect()
        })
        .collect()
}

/// Convert frequency in Hz to Slaney mel scale.
///
/// Below 1000 Hz: linear mapping (mel = 3 * f / 200).
/// Above 1000 Hz: logarithmic (mel = 15 + 27 * ln(f / 1000) / ln(6.4)).
fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / (6.4_f64).ln()
    }
}

/// Convert Slaney mel scale to frequency in Hz.
fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * (6.4_f64).ln() / 27.0).exp()
    }
}
