//! Model components for FLAV sampling.
//!
//! ## Components
//!
//! - [`Denoiser`] — the joint audio+video velocity network. Its architecture
//!   lives outside this crate; callers hand in a factory that builds it from
//!   the checkpoint's [`VarBuilder`].
//! - [`vocoder`] — HiFi-GAN (mel spectrogram → audio waveform)
//!
//! The video autoencoder lives in [`crate::vae`].

pub mod vocoder;

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::FlavConfig;
use crate::{Error, Result};

/// Velocity predicted for both modalities.
#[derive(Debug, Clone)]
pub struct Velocity {
    /// `[B, W, C, h, w]`
    pub video: Tensor,
    /// `[B, W, 1, N_mel, F]`
    pub audio: Tensor,
}

/// A rectified-flow network predicting `v = x1 - ε` for a window of frames.
///
/// - `video`: `[B, W, C, h, w]` noisy video latents
/// - `audio`: `[B, W, 1, N_mel, F]` noisy audio latents
/// - `t`: `[B, W]` per-frame time in `[0, 1]` (0 = noise, 1 = data)
/// - `labels`: optional `[B]` u32 class ids; `num_classes` is the null class
pub trait Denoiser {
    fn forward(
        &self,
        video: &Tensor,
        audio: &Tensor,
        t: &Tensor,
        labels: Option<&Tensor>,
    ) -> candle_core::Result<Velocity>;
}

impl<D: Denoiser + ?Sized> Denoiser for Box<D> {
    fn forward(
        &self,
        video: &Tensor,
        audio: &Tensor,
        t: &Tensor,
        labels: Option<&Tensor>,
    ) -> candle_core::Result<Velocity> {
        (**self).forward(video, audio, t, labels)
    }
}

/// Open a checkpoint as a [`VarBuilder`].
///
/// `.safetensors` files are memory-mapped. PyTorch pickles (`.pt`, `.pth`,
/// `.bin`) are read through candle's pickle loader; `key` selects a nested
/// state dict such as `"generator"`. Pickles without any named tensor are
/// rejected.
pub fn load_weights(
    path: &Path,
    key: Option<&str>,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "safetensors" => {
            // SAFETY: the file is not modified while mapped.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? };
            Ok(vb)
        }
        "pt" | "pth" | "bin" | "ckpt" => {
            let infos = candle_core::pickle::read_pth_tensor_info(path, false, key)
                .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))?;
            if infos.is_empty() {
                // EMA checkpoints store `shadow_params` as a positional list.
                return Err(Error::WeightLoad(format!(
                    "{} holds no named tensors{}; convert EMA shadow params to a state dict",
                    path.display(),
                    key.map(|k| format!(" under '{k}'")).unwrap_or_default()
                )));
            }
            let tensors = candle_core::pickle::PthTensors::new(path, key).map_err(|e| {
                Error::WeightLoad(format!("{}: {e}", path.display()))
            })?;
            Ok(VarBuilder::from_backend(
                Box::new(tensors),
                dtype,
                device.clone(),
            ))
        }
        other => Err(Error::WeightLoad(format!(
            "unsupported checkpoint format '{other}' for {}",
            path.display()
        ))),
    }
}

/// Build the denoiser through a caller-supplied factory.
pub fn build_denoiser<F>(
    config: &FlavConfig,
    vb: VarBuilder<'static>,
    factory: F,
) -> Result<Box<dyn Denoiser>>
where
    F: FnOnce(&FlavConfig, VarBuilder<'static>) -> candle_core::Result<Box<dyn Denoiser>>,
{
    let denoiser = factory(config, vb)?;
    tracing::info!(
        predict_frames = config.predict_frames,
        num_classes = config.num_classes,
        "denoiser ready"
    );
    Ok(denoiser)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Zero;

    impl Denoiser for Zero {
        fn forward(
            &self,
            video: &Tensor,
            audio: &Tensor,
            _t: &Tensor,
            _labels: Option<&Tensor>,
        ) -> candle_core::Result<Velocity> {
            Ok(Velocity {
                video: video.zeros_like()?,
                audio: audio.zeros_like()?,
            })
        }
    }

    #[test]
    fn boxed_denoiser_forwards() {
        let dev = Device::Cpu;
        let boxed: Box<dyn Denoiser> = Box::new(Zero);
        let video = Tensor::ones((1, 2, 4, 2, 2), DType::F32, &dev).unwrap();
        let audio = Tensor::ones((1, 2, 1, 8, 10), DType::F32, &dev).unwrap();
        let t = Tensor::zeros((1, 2), DType::F32, &dev).unwrap();
        let v = boxed.forward(&video, &audio, &t, None).unwrap();
        assert_eq!(v.video.dims(), video.dims());
        assert_eq!(v.audio.dims(), audio.dims());
    }

    #[test]
    fn unknown_checkpoint_extension_rejected() {
        let result = load_weights(Path::new("weights.onnx"), None, DType::F32, &Device::Cpu);
        assert!(matches!(result, Err(Error::WeightLoad(_))));
    }

    #[test]
    fn pickle_without_named_tensors_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // End-of-central-directory record of an empty zip archive.
        let mut empty_zip = b"PK\x05\x06".to_vec();
        empty_zip.extend_from_slice(&[0u8; 18]);
        let path = dir.path().join("ema.pth");
        std::fs::write(&path, &empty_zip).unwrap();
        for key in [None, Some("shadow_params")] {
            let result = load_weights(&path, key, DType::F32, &Device::Cpu);
            assert!(matches!(result, Err(Error::WeightLoad(_))));
        }
    }

    #[test]
    fn corrupt_pickle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocoder.pt");
        std::fs::write(&path, b"not a zip archive").unwrap();
        let result = load_weights(&path, None, DType::F32, &Device::Cpu);
        assert!(matches!(result, Err(Error::WeightLoad(_))));
    }

    #[test]
    fn factory_receives_config() {
        let cfg = FlavConfig {
            predict_frames: 3,
            ..Default::default()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mut seen = 0;
        build_denoiser(&cfg, vb, |c, _vb| {
            seen = c.predict_frames;
            Ok(Box::new(Zero) as Box<dyn Denoiser>)
        })
        .unwrap();
        assert_eq!(seen, 3);
    }
}
