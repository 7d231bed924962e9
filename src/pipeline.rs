//! End-to-end sampling pipeline.
//!
//! Orchestrates one batch of audio+video generation:
//! 1. Draw the initial window noise from the seeded generator
//! 2. Run the rolling rectified-flow sampler (with CFG when class-conditional)
//! 3. Decode video latents with the SD VAE, in frame chunks
//! 4. Undo the audio scale and synthesize waveforms with HiFi-GAN

use candle_core::{DType, Device, Tensor};

use crate::conditions::ConditionBatch;
use crate::config::{FlavConfig, DEFAULT_AUDIO_SCALE};
use crate::flow::guidance::Guidance;
use crate::flow::sampler::{GeneratedLatents, SampleRequest, Sampler};
use crate::flow::RectifiedFlow;
use crate::hub::{self, FlavAssets, VaeVariant};
use crate::model::vocoder::{get_wavs, HifiGan, Vocoder, VocoderConfig};
use crate::model::{build_denoiser, load_weights, Denoiser};
use crate::noise::NoiseGenerator;
use crate::vae::{decode_video, LatentDecoder, SdVae};
use crate::{Error, Result};

/// Frames decoded per VAE call by default.
pub const DEFAULT_DECODE_CHUNK: usize = 16;

/// Settings for [`FlavPipeline::load`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Output resolution in pixels; must be divisible by the VAE downsampling.
    pub image_size: usize,
    /// Overrides `num_classes` from `config.json` when set.
    pub num_classes: Option<usize>,
    /// Euler steps per rolling stage.
    pub num_timesteps: usize,
    pub vae: VaeVariant,
    /// Local VAE weights (file or directory) instead of the hub download.
    pub vae_path: Option<std::path::PathBuf>,
    /// State-dict key of the denoiser weights in pickled checkpoints.
    pub weights_key: Option<String>,
    pub audio_scale: f64,
    pub decode_chunk: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            image_size: 256,
            num_classes: None,
            num_timesteps: 2,
            vae: VaeVariant::Ema,
            vae_path: None,
            weights_key: None,
            audio_scale: DEFAULT_AUDIO_SCALE,
            decode_chunk: DEFAULT_DECODE_CHUNK,
        }
    }
}

/// One batch to generate.
#[derive(Debug, Clone, Copy)]
pub struct BatchRequest {
    pub batch_size: usize,
    pub video_length: usize,
    /// Classifier-free guidance scale; only used with class labels.
    pub cfg_scale: f64,
}

/// Decoded output of one batch.
#[derive(Debug, Clone)]
pub struct GeneratedBatch {
    /// `[B, T, 3, H, W]` in `[0, 1]`, F32.
    pub videos: Tensor,
    /// One mono waveform per sample.
    pub wavs: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl GeneratedBatch {
    pub fn len(&self) -> usize {
        self.wavs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavs.is_empty()
    }

    /// `[T, 3, H, W]` frames of sample `i`.
    pub fn video(&self, i: usize) -> Result<Tensor> {
        Ok(self.videos.get(i)?)
    }
}

/// The loaded FLAV sampling pipeline.
pub struct FlavPipeline {
    denoiser: Box<dyn Denoiser>,
    vae: Box<dyn LatentDecoder>,
    vocoder: Box<dyn Vocoder>,
    flow: RectifiedFlow,
    config: FlavConfig,
    device: Device,
    dtype: DType,
    audio_scale: f64,
    decode_chunk: usize,
}

impl FlavPipeline {
    /// Assemble a pipeline from already-built components.
    ///
    /// The warmup lasts `predict_frames` stages.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        denoiser: Box<dyn Denoiser>,
        vae: Box<dyn LatentDecoder>,
        vocoder: Box<dyn Vocoder>,
        config: FlavConfig,
        num_timesteps: usize,
        audio_scale: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.verify()?;
        config.check_geometry(vae.geometry())?;
        let flow = RectifiedFlow::new(num_timesteps, config.predict_frames, config.predict_frames)?;
        Ok(Self {
            denoiser,
            vae,
            vocoder,
            flow,
            config,
            device: device.clone(),
            dtype,
            audio_scale,
            decode_chunk: DEFAULT_DECODE_CHUNK,
        })
    }

    pub fn with_decode_chunk(mut self, decode_chunk: usize) -> Self {
        self.decode_chunk = decode_chunk.max(1);
        self
    }

    /// Load everything for `model_ckpt` (hub repo id or local directory).
    ///
    /// The denoiser network is built by `factory` from the checkpoint config
    /// and a [`candle_nn::VarBuilder`] over its EMA weights.
    pub fn load<F>(
        model_ckpt: &str,
        options: &LoadOptions,
        device: &Device,
        dtype: DType,
        factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(&FlavConfig, candle_nn::VarBuilder<'static>) -> candle_core::Result<Box<dyn Denoiser>>,
    {
        let assets = FlavAssets::fetch(model_ckpt)?;
        Self::from_assets(&assets, options, device, dtype, factory)
    }

    /// Like [`Self::load`], for assets that were already resolved.
    pub fn from_assets<F>(
        assets: &FlavAssets,
        options: &LoadOptions,
        device: &Device,
        dtype: DType,
        factory: F,
    ) -> Result<Self>
    where
        F: FnOnce(&FlavConfig, candle_nn::VarBuilder<'static>) -> candle_core::Result<Box<dyn Denoiser>>,
    {
        tracing::info!(variant = ?options.vae, "loading SD VAE");
        let vae_weights = hub::vae_weights(options.vae, options.vae_path.as_deref())?;
        let vae = SdVae::new(load_weights(&vae_weights, None, dtype, device)?)?;

        let mut config = FlavConfig::from_file(&assets.config)?
            .with_image_size(options.image_size, vae.geometry())?;
        if let Some(num_classes) = options.num_classes {
            config.num_classes = num_classes;
        }

        tracing::info!("loading denoiser");
        let vb = load_weights(&assets.weights, options.weights_key.as_deref(), dtype, device)?;
        let denoiser = build_denoiser(&config, vb, factory)?;

        tracing::info!("loading HiFi-GAN vocoder");
        let vocoder_config = VocoderConfig::from_file(&assets.vocoder_config)?;
        let vocoder = load_vocoder(&vocoder_config, &assets.vocoder_weights, device)?;

        let pipeline = Self::new(
            denoiser,
            Box::new(vae),
            Box::new(vocoder),
            config,
            options.num_timesteps,
            options.audio_scale,
            device,
            dtype,
        )?
        .with_decode_chunk(options.decode_chunk);
        tracing::info!(
            predict_frames = pipeline.config.predict_frames,
            latent_size = pipeline.config.latent_size,
            num_classes = pipeline.config.num_classes,
            "pipeline ready"
        );
        Ok(pipeline)
    }

    pub fn config(&self) -> &FlavConfig {
        &self.config
    }

    pub fn flow(&self) -> &RectifiedFlow {
        &self.flow
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn sample_rate(&self) -> u32 {
        self.vocoder.sample_rate()
    }

    /// Video frame rate implied by the vocoder hop and mel columns per frame.
    pub fn frames_per_second(&self) -> f64 {
        let samples_per_frame = self.vocoder.hop_size() * self.config.audio_frame_len;
        self.vocoder.sample_rate() as f64 / samples_per_frame.max(1) as f64
    }

    /// Joint audio+video generation.
    pub fn sample_batch(
        &self,
        conditions: &ConditionBatch,
        request: &BatchRequest,
        noise: &mut NoiseGenerator,
    ) -> Result<GeneratedBatch> {
        let labels = self.labels(conditions)?;
        let sample_request = self.sample_request(request, labels.as_ref());
        let latents = self.sampler().generate_sample(&sample_request, noise)?;
        self.decode(latents)
    }

    /// Video generation for the conditioning audio in `conditions`.
    ///
    /// `scale` weights the audio reconstruction guidance; 0 disables it.
    pub fn sample_batch_a2v(
        &self,
        conditions: &ConditionBatch,
        request: &BatchRequest,
        scale: f64,
        noise: &mut NoiseGenerator,
    ) -> Result<GeneratedBatch> {
        let audio = conditions
            .audio
            .as_ref()
            .ok_or_else(|| Error::Config("audio-to-video sampling needs conditioning audio".into()))?;
        let labels = self.labels(conditions)?;
        let sample_request = self.sample_request(request, labels.as_ref());
        let latents = self
            .sampler()
            .generate_sample_a2v(&sample_request, audio, scale, noise)?;
        self.decode(latents)
    }

    fn sampler(&self) -> Sampler<'_> {
        Sampler::new(
            self.denoiser.as_ref(),
            &self.flow,
            &self.config,
            &self.device,
            self.dtype,
        )
    }

    /// Labels on the pipeline device; dropped for unconditional models.
    fn labels(&self, conditions: &ConditionBatch) -> Result<Option<Tensor>> {
        match &conditions.labels {
            Some(labels) if self.config.is_class_conditional() => {
                Ok(Some(labels.to_device(&self.device)?))
            }
            Some(_) => {
                tracing::warn!("ignoring class labels for an unconditional model");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn sample_request<'a>(
        &self,
        request: &BatchRequest,
        labels: Option<&'a Tensor>,
    ) -> SampleRequest<'a> {
        let guidance = labels.map(|_| Guidance::new(request.cfg_scale, self.config.null_label()));
        SampleRequest {
            batch_size: request.batch_size,
            video_length: request.video_length,
            labels,
            guidance,
        }
    }

    fn decode(&self, latents: GeneratedLatents) -> Result<GeneratedBatch> {
        let videos = decode_video(self.vae.as_ref(), &latents.video, self.decode_chunk)?;
        let wavs = get_wavs(self.vocoder.as_ref(), &latents.audio, self.audio_scale)?;
        Ok(GeneratedBatch {
            videos,
            wavs,
            sample_rate: self.vocoder.sample_rate(),
        })
    }
}

/// HiFi-GAN from a `vocoder.pt` checkpoint.
///
/// Training checkpoints nest the weights under `"generator"`; exported ones
/// are a flat state dict. The vocoder always runs in F32.
fn load_vocoder(
    config: &VocoderConfig,
    weights: &std::path::Path,
    device: &Device,
) -> Result<HifiGan> {
    let nested = load_weights(weights, Some("generator"), DType::F32, device).ok();
    let vb = match nested {
        Some(vb) if has_vocoder_weights(&vb) => vb,
        _ => load_weights(weights, None, DType::F32, device)?,
    };
    HifiGan::new(config, vb)
}

fn has_vocoder_weights(vb: &candle_nn::VarBuilder) -> bool {
    vb.contains_tensor("conv_pre.weight") || vb.contains_tensor("conv_pre.weight_g")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LatentGeometry;
    use crate::model::Velocity;

    /// Velocity pointing at a constant target of 0.5 for both modalities.
    struct Toward;

    impl Denoiser for Toward {
        fn forward(
            &self,
            video: &Tensor,
            audio: &Tensor,
            t: &Tensor,
            _labels: Option<&Tensor>,
        ) -> candle_core::Result<Velocity> {
            // z = t·x1 + (1 - t)·ε with x1 = 0.5 → v = (x1 - z) / (1 - t)
            let toward = |z: &Tensor| -> candle_core::Result<Tensor> {
                let mut shape = vec![t.dim(0)?, t.dim(1)?];
                shape.extend(std::iter::repeat_n(1, z.rank() - 2));
                let one_minus_t = (1.0 - t.reshape(shape)?)?.clamp(1e-3, 1.0)?;
                (0.5 - z)?.broadcast_div(&one_minus_t)
            };
            Ok(Velocity {
                video: toward(video)?,
                audio: toward(audio)?,
            })
        }
    }

    /// Doubles spatial size, passes the first 3 channels through.
    struct Upsample;

    impl LatentDecoder for Upsample {
        fn decode(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
            let (n, _c, h, w) = latents.dims4()?;
            latents
                .narrow(1, 0, 3)?
                .contiguous()?
                .upsample_nearest2d(h * 2, w * 2)?
                .reshape((n, 3, h * 2, w * 2))
        }

        fn geometry(&self) -> LatentGeometry {
            LatentGeometry {
                downsample: 2,
                channels: 4,
            }
        }
    }

    /// One sample per mel column.
    struct ColumnVocoder;

    impl Vocoder for ColumnVocoder {
        fn synthesize(&self, mel: &Tensor) -> candle_core::Result<Tensor> {
            mel.mean(1)
        }

        fn sample_rate(&self) -> u32 {
            16000
        }

        fn hop_size(&self) -> usize {
            160
        }
    }

    fn tiny_config(num_classes: usize) -> FlavConfig {
        FlavConfig {
            predict_frames: 3,
            num_classes,
            in_channels: 4,
            latent_size: 2,
            audio_mel_bins: 4,
            audio_frame_len: 10,
        }
    }

    fn pipeline(num_classes: usize) -> FlavPipeline {
        FlavPipeline::new(
            Box::new(Toward),
            Box::new(Upsample),
            Box::new(ColumnVocoder),
            tiny_config(num_classes),
            2,
            2.0,
            &Device::Cpu,
            DType::F32,
        )
        .unwrap()
        .with_decode_chunk(2)
    }

    fn request(batch_size: usize, video_length: usize) -> BatchRequest {
        BatchRequest {
            batch_size,
            video_length,
            cfg_scale: 1.0,
        }
    }

    #[test]
    fn channel_mismatch_with_decoder_rejected() {
        let config = FlavConfig {
            in_channels: 32,
            ..tiny_config(0)
        };
        let result = FlavPipeline::new(
            Box::new(Toward),
            Box::new(Upsample),
            Box::new(ColumnVocoder),
            config,
            2,
            2.0,
            &Device::Cpu,
            DType::F32,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn joint_batch_shapes() {
        let pipe = pipeline(0);
        let mut noise = NoiseGenerator::new(42);
        let out = pipe
            .sample_batch(&ConditionBatch::default(), &request(2, 4), &mut noise)
            .unwrap();
        assert_eq!(out.videos.dims(), &[2, 4, 3, 4, 4]);
        assert_eq!(out.len(), 2);
        assert_eq!(out.wavs[0].len(), 4 * 10);
        assert_eq!(out.sample_rate, 16000);
        assert_eq!(out.video(1).unwrap().dims(), &[4, 3, 4, 4]);
        assert_eq!(pipe.frames_per_second(), 10.0);
    }

    #[test]
    fn decoded_values_follow_latents() {
        let pipe = pipeline(0);
        let mut noise = NoiseGenerator::new(0);
        let out = pipe
            .sample_batch(&ConditionBatch::default(), &request(1, 2), &mut noise)
            .unwrap();
        // Latents converge to 0.5: video (0.5 / 2 + 0.5), audio 0.5 / audio_scale.
        let pixels: Vec<f32> = out.videos.flatten_all().unwrap().to_vec1().unwrap();
        assert!(pixels.iter().all(|p| (p - 0.75).abs() < 1e-3), "{pixels:?}");
        assert!(out.wavs[0].iter().all(|s| (s - 0.25).abs() < 1e-3));
    }

    #[test]
    fn a2v_requires_audio() {
        let pipe = pipeline(0);
        let mut noise = NoiseGenerator::new(0);
        let result =
            pipe.sample_batch_a2v(&ConditionBatch::default(), &request(1, 1), 0.0, &mut noise);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn a2v_keeps_conditioning_audio() {
        let pipe = pipeline(0);
        let mut noise = NoiseGenerator::new(0);
        let audio = Tensor::full(1.0f32, (1, 2, 1, 4, 10), &Device::Cpu).unwrap();
        let conditions = ConditionBatch {
            labels: None,
            audio: Some(audio),
        };
        let out = pipe
            .sample_batch_a2v(&conditions, &request(1, 2), 0.0, &mut noise)
            .unwrap();
        // Ground-truth audio divided by the audio scale.
        assert!(out.wavs[0].iter().all(|s| (s - 0.5).abs() < 1e-5));
        assert_eq!(out.videos.dims(), &[1, 2, 3, 4, 4]);
    }

    #[test]
    fn labels_ignored_without_classes() {
        let pipe = pipeline(0);
        let conditions = ConditionBatch {
            labels: Some(Tensor::new(&[1u32], &Device::Cpu).unwrap()),
            audio: None,
        };
        assert!(pipe.labels(&conditions).unwrap().is_none());
    }

    #[test]
    fn class_conditional_request_uses_null_label() {
        let pipe = pipeline(5);
        let labels = Tensor::new(&[1u32, 2], &Device::Cpu).unwrap();
        let req = BatchRequest {
            batch_size: 2,
            video_length: 1,
            cfg_scale: 4.0,
        };
        let sample_request = pipe.sample_request(&req, Some(&labels));
        assert_eq!(sample_request.guidance, Some(Guidance::new(4.0, 5)));

        let mut noise = NoiseGenerator::new(1);
        let conditions = ConditionBatch {
            labels: Some(labels),
            audio: None,
        };
        let out = pipe.sample_batch(&conditions, &req, &mut noise).unwrap();
        assert_eq!(out.len(), 2);
    }
}
