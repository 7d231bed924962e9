//! Configuration for the FLAV audio+video model.
//!
//! Mirrors the `config.json` shipped next to the pretrained checkpoint.
//! Missing keys fall back to the released 256px, 10 fps model.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Mel columns per video frame: 1600 samples per frame / hop 160 at 16 kHz.
pub const AUDIO_T_PER_FRAME: usize = 1600 / 160;

/// Shape of the latents a video autoencoder works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentGeometry {
    /// Pixels per latent cell along each spatial axis.
    pub downsample: usize,
    /// Latent channels.
    pub channels: usize,
}

impl LatentGeometry {
    /// `stabilityai/sd-vae-ft-*`: 8x downsampling, 4 channels.
    pub const SD_VAE: Self = Self {
        downsample: 8,
        channels: 4,
    };

    /// Latent resolution for a pixel resolution.
    pub fn latent_size_for(&self, image_size: usize) -> Result<usize> {
        if self.downsample == 0 || image_size == 0 || image_size % self.downsample != 0 {
            return Err(Error::Config(format!(
                "image size must be divisible by {} (for the VAE encoder), got {image_size}",
                self.downsample
            )));
        }
        Ok(image_size / self.downsample)
    }
}

/// Default audio latent scale used during training.
pub const DEFAULT_AUDIO_SCALE: f64 = 3.5009668382765917;

/// Model hyperparameters that the sampler needs to know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlavConfig {
    /// Frames jointly denoised in one window.
    pub predict_frames: usize,
    /// Number of classes; 0 means unconditional.
    pub num_classes: usize,
    /// Video latent channels; must match the autoencoder.
    pub in_channels: usize,
    /// Video latent height and width.
    pub latent_size: usize,
    /// Mel bins per audio latent frame.
    pub audio_mel_bins: usize,
    /// Mel columns per audio latent frame.
    pub audio_frame_len: usize,
}

impl Default for FlavConfig {
    fn default() -> Self {
        Self {
            predict_frames: 10,
            num_classes: 0,
            in_channels: LatentGeometry::SD_VAE.channels,
            latent_size: 256 / LatentGeometry::SD_VAE.downsample,
            audio_mel_bins: 256,
            audio_frame_len: AUDIO_T_PER_FRAME,
        }
    }
}

impl FlavConfig {
    /// Read a checkpoint `config.json`.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.verify()?;
        Ok(config)
    }

    /// Check the internal consistency of the config.
    pub fn verify(&self) -> Result<()> {
        if self.predict_frames == 0 {
            return Err(Error::Config("predict_frames must be at least 1".into()));
        }
        if self.in_channels == 0 || self.latent_size == 0 {
            return Err(Error::Config(format!(
                "invalid video latent geometry: {} channels, size {}",
                self.in_channels, self.latent_size
            )));
        }
        if self.audio_mel_bins == 0 || self.audio_frame_len == 0 {
            return Err(Error::Config(format!(
                "invalid audio latent geometry: {} mel bins, {} columns per frame",
                self.audio_mel_bins, self.audio_frame_len
            )));
        }
        Ok(())
    }

    /// Set the latent size from a pixel resolution for the autoencoder
    /// described by `geometry`.
    ///
    /// The image size must be divisible by its downsampling factor and the
    /// model's channels must match its latents.
    pub fn with_image_size(mut self, image_size: usize, geometry: LatentGeometry) -> Result<Self> {
        self.check_geometry(geometry)?;
        self.latent_size = geometry.latent_size_for(image_size)?;
        Ok(self)
    }

    /// Whether the model's video latents fit `geometry`.
    pub fn check_geometry(&self, geometry: LatentGeometry) -> Result<()> {
        if self.in_channels != geometry.channels {
            return Err(Error::Config(format!(
                "model expects {} latent channels, autoencoder produces {}",
                self.in_channels, geometry.channels
            )));
        }
        Ok(())
    }

    /// Whether the model was trained with class conditioning.
    pub fn is_class_conditional(&self) -> bool {
        self.num_classes > 0
    }

    /// Label used for the unconditional branch of classifier-free guidance.
    pub fn null_label(&self) -> u32 {
        self.num_classes as u32
    }

    /// Video latent shape for one window: `(B, W, C, h, w)`.
    pub fn video_latent_shape(&self, batch_size: usize) -> (usize, usize, usize, usize, usize) {
        (
            batch_size,
            self.predict_frames,
            self.in_channels,
            self.latent_size,
            self.latent_size,
        )
    }

    /// Audio latent shape for one window: `(B, W, 1, N_mel, F)`.
    pub fn audio_latent_shape(&self, batch_size: usize) -> (usize, usize, usize, usize, usize) {
        (
            batch_size,
            self.predict_frames,
            1,
            self.audio_mel_bins,
            self.audio_frame_len,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = FlavConfig::default();
        assert_eq!(cfg.predict_frames, 10);
        assert_eq!(cfg.latent_size, 32);
        assert_eq!(cfg.audio_frame_len, 10);
        assert!(!cfg.is_class_conditional());
        cfg.verify().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: FlavConfig =
            serde_json::from_str(r#"{"predict_frames": 5, "num_classes": 400}"#).unwrap();
        assert_eq!(cfg.predict_frames, 5);
        assert_eq!(cfg.null_label(), 400);
        assert_eq!(cfg.in_channels, 4);
        assert_eq!(cfg.video_latent_shape(2), (2, 5, 4, 32, 32));
        assert_eq!(cfg.audio_latent_shape(2), (2, 5, 1, 256, 10));
    }

    #[test]
    fn test_image_size_must_divide() {
        let sd = LatentGeometry::SD_VAE;
        assert_eq!(sd.latent_size_for(256).unwrap(), 32);
        assert!(sd.latent_size_for(250).is_err());
        assert!(sd.latent_size_for(0).is_err());
        let cfg = FlavConfig::default().with_image_size(128, sd).unwrap();
        assert_eq!(cfg.latent_size, 16);
    }

    #[test]
    fn test_geometry_per_autoencoder() {
        let deep = LatentGeometry {
            downsample: 32,
            channels: 32,
        };
        assert_eq!(deep.latent_size_for(256).unwrap(), 8);
        assert!(deep.latent_size_for(200).is_err());

        let cfg = FlavConfig {
            in_channels: 32,
            ..Default::default()
        }
        .with_image_size(512, deep)
        .unwrap();
        assert_eq!(cfg.video_latent_shape(1), (1, 10, 32, 16, 16));

        // SD VAE latents have 4 channels.
        let result = FlavConfig::default().with_image_size(256, deep);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_window_rejected() {
        let cfg = FlavConfig {
            predict_frames: 0,
            ..Default::default()
        };
        assert!(cfg.verify().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"predict_frames": 3}"#).unwrap();
        let cfg = FlavConfig::from_file(&path).unwrap();
        assert_eq!(cfg.predict_frames, 3);
    }
}
