//! Conditioning inputs for sampling batches.
//!
//! A [`ConditionSource`] hands the driver one batch of class labels and/or
//! ground-truth audio latents at a time. Dataset loading is outside the
//! crate's scope; these sources cover the sampling drivers' own needs:
//!
//! - [`Unconditional`] — no labels, no audio
//! - [`ClassCycle`] — fixed or random class labels
//! - [`WavDirectory`] — audio latents computed from a folder of WAV files

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::audio::{self, MelSpectrogram};
use crate::noise::NoiseGenerator;
use crate::{Error, Result};

/// One batch of conditioning.
#[derive(Debug, Clone, Default)]
pub struct ConditionBatch {
    /// `[B]` u32 class labels.
    pub labels: Option<Tensor>,
    /// `[B, T, 1, N_mel, F]` audio latents, already multiplied by the audio scale.
    pub audio: Option<Tensor>,
}

/// Source of per-batch conditioning.
pub trait ConditionSource {
    fn next_batch(&mut self, batch_size: usize) -> Result<ConditionBatch>;
}

/// Unconditional sampling.
#[derive(Debug, Default)]
pub struct Unconditional;

impl ConditionSource for Unconditional {
    fn next_batch(&mut self, _batch_size: usize) -> Result<ConditionBatch> {
        Ok(ConditionBatch::default())
    }
}

/// Class labels drawn from a fixed list (cycled) or uniformly at random.
pub struct ClassCycle {
    classes: Vec<u32>,
    num_classes: usize,
    position: usize,
    rng: NoiseGenerator,
    device: Device,
}

impl ClassCycle {
    /// `classes` empty means uniform over `0..num_classes`.
    pub fn new(classes: Vec<u32>, num_classes: usize, seed: u64, device: &Device) -> Result<Self> {
        if num_classes == 0 {
            return Err(Error::Config(
                "class labels requested for an unconditional model".into(),
            ));
        }
        if let Some(bad) = classes.iter().find(|&&c| c as usize >= num_classes) {
            return Err(Error::Config(format!(
                "class {bad} out of range for a model with {num_classes} classes"
            )));
        }
        Ok(Self {
            classes,
            num_classes,
            position: 0,
            rng: NoiseGenerator::new(seed),
            device: device.clone(),
        })
    }

    fn next_labels(&mut self, batch_size: usize) -> Vec<u32> {
        (0..batch_size)
            .map(|_| {
                if self.classes.is_empty() {
                    self.rng.next_index(self.num_classes) as u32
                } else {
                    let label = self.classes[self.position % self.classes.len()];
                    self.position += 1;
                    label
                }
            })
            .collect()
    }

    fn next_label_tensor(&mut self, batch_size: usize) -> Result<Tensor> {
        let labels = self.next_labels(batch_size);
        Ok(Tensor::new(labels.as_slice(), &self.device)?)
    }
}

impl ConditionSource for ClassCycle {
    fn next_batch(&mut self, batch_size: usize) -> Result<ConditionBatch> {
        Ok(ConditionBatch {
            labels: Some(self.next_label_tensor(batch_size)?),
            audio: None,
        })
    }
}

/// Audio latents from a directory of WAV clips.
///
/// Each clip is downmixed to mono, turned into log-mel features with the
/// vocoder's STFT settings, cut to `video_length × frame_len` columns and
/// rearranged `N (T F) → T 1 N F`. Clips are taken in file-name order and
/// the directory wraps around when exhausted.
pub struct WavDirectory {
    files: Vec<PathBuf>,
    position: usize,
    mel: MelSpectrogram,
    video_length: usize,
    frame_len: usize,
    audio_scale: f64,
    labels: Option<ClassCycle>,
    device: Device,
    dtype: DType,
}

impl WavDirectory {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        dir: impl AsRef<Path>,
        mel: MelSpectrogram,
        video_length: usize,
        frame_len: usize,
        audio_scale: f64,
        labels: Option<ClassCycle>,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
            })
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(Error::Config(format!(
                "no .wav files found in {}",
                dir.display()
            )));
        }
        tracing::info!(clips = files.len(), dir = %dir.display(), "conditioning audio");

        Ok(Self {
            files,
            position: 0,
            mel,
            video_length,
            frame_len,
            audio_scale,
            labels,
            device: device.clone(),
            dtype,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Audio latents `[T, 1, N_mel, F]` for one clip.
    pub fn load_clip(&self, path: &Path) -> Result<Tensor> {
        let (samples, sample_rate, channels) = audio::read_wav(path)?;
        let expected = self.mel.config().sample_rate;
        if sample_rate != expected {
            return Err(Error::Audio(format!(
                "{} is {sample_rate} Hz, expected {expected} Hz",
                path.display()
            )));
        }
        let mono = audio::downmix(&samples, channels);
        let mel = self.mel.process(&mono);

        let n_mels = mel.len();
        let columns = self.video_length * self.frame_len;
        let available = mel.first().map_or(0, |row| row.len());
        if available < columns {
            return Err(Error::Audio(format!(
                "{} has {available} mel frames, need {columns} for {} video frames",
                path.display(),
                self.video_length
            )));
        }

        let data: Vec<f32> = mel
            .iter()
            .flat_map(|row| row[..columns].iter().copied())
            .collect();
        // N (T F) -> T 1 N F
        let clip = Tensor::from_vec(data, (n_mels, self.video_length, self.frame_len), &Device::Cpu)?
            .permute((1, 0, 2))?
            .unsqueeze(1)?
            .contiguous()?;
        let clip = (clip * self.audio_scale)?
            .to_dtype(self.dtype)?
            .to_device(&self.device)?;
        Ok(clip)
    }

    fn next_path(&mut self) -> PathBuf {
        if self.position > 0 && self.position % self.files.len() == 0 {
            tracing::warn!("conditioning audio exhausted, wrapping around");
        }
        let path = self.files[self.position % self.files.len()].clone();
        self.position += 1;
        path
    }
}

impl ConditionSource for WavDirectory {
    fn next_batch(&mut self, batch_size: usize) -> Result<ConditionBatch> {
        let mut clips = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let path = self.next_path();
            tracing::debug!(clip = %path.display(), "loading conditioning audio");
            clips.push(self.load_clip(&path)?);
        }
        let labels = match self.labels.as_mut() {
            Some(labels) => Some(labels.next_label_tensor(batch_size)?),
            None => None,
        };
        Ok(ConditionBatch {
            labels,
            audio: Some(Tensor::stack(&clips, 0)?),
        })
    }
}
