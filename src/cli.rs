//! Sampling drivers.
//!
//! Two command-line front ends share most flags:
//!
//! - [`SampleArgs`] / [`run_sample`] — joint audio+video generation into
//!   `<results>/samples/`
//! - [`A2vArgs`] / [`run_sample_a2v`] — video generation for a directory of
//!   WAV clips into `<results>/samples-a2v/`
//!
//! The denoiser architecture is supplied by the caller as a factory, so a
//! binary is a few lines:
//!
//! ```no_run
//! use clap::Parser;
//! use flav_rs::cli::{init_tracing, run_sample, SampleArgs};
//! # fn build(cfg: &flav_rs::config::FlavConfig, vb: candle_nn::VarBuilder<'static>)
//! #     -> candle_core::Result<Box<dyn flav_rs::model::Denoiser>> { unimplemented!() }
//!
//! fn main() -> anyhow::Result<()> {
//!     init_tracing();
//!     run_sample(&SampleArgs::parse(), build)
//! }
//! ```

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use clap::{Args, Parser};

use crate::audio::{MelConfig, MelSpectrogram};
use crate::conditions::{ClassCycle, ConditionSource, Unconditional, WavDirectory};
use crate::config::{FlavConfig, LatentGeometry, DEFAULT_AUDIO_SCALE};
use crate::hub::{FlavAssets, VaeVariant};
use crate::model::vocoder::VocoderConfig;
use crate::model::Denoiser;
use crate::noise::NoiseGenerator;
use crate::output::{sample_name, OutputLayout, SampleKind, VideoFormat};
use crate::pipeline::{BatchRequest, FlavPipeline, LoadOptions, DEFAULT_DECODE_CHUNK};

/// Flags shared by both drivers.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// HuggingFace repo id or local directory of the FLAV checkpoint.
    #[arg(long)]
    pub model_ckpt: String,

    /// SD VAE fine-tune used to decode video latents.
    #[arg(long, value_enum, default_value_t = VaeVariant::Ema)]
    pub vae: VaeVariant,

    /// Local VAE weights (file or directory) instead of the hub download.
    #[arg(long)]
    pub vae_path: Option<PathBuf>,

    /// State-dict key of the denoiser weights in a pickled checkpoint.
    #[arg(long)]
    pub weights_key: Option<String>,

    /// Output resolution in pixels. Must be divisible by 8.
    #[arg(long, default_value_t = 256)]
    pub image_size: usize,

    /// Number of classes (0 = unconditional). Read from `config.json` when omitted.
    #[arg(long)]
    pub num_classes: Option<usize>,

    /// Class labels to cycle through. Random classes when omitted.
    #[arg(long, num_args = 1..)]
    pub classes: Vec<u32>,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 1.0)]
    pub cfg_scale: f64,

    /// Euler steps per generated frame.
    #[arg(long, default_value_t = 2)]
    pub num_timesteps: usize,

    #[arg(long, default_value_t = 4)]
    pub batch_size: usize,

    /// Frames per generated video.
    #[arg(long, default_value_t = 1)]
    pub video_length: usize,

    /// Total number of videos; rounded down to whole batches.
    #[arg(long, default_value_t = 2048)]
    pub num_videos: usize,

    /// Scale applied to audio latents during training.
    #[arg(long, default_value_t = DEFAULT_AUDIO_SCALE)]
    pub audio_scale: f64,

    #[arg(long, default_value = "results")]
    pub results_dir: PathBuf,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Frames decoded per VAE call.
    #[arg(long, default_value_t = DEFAULT_DECODE_CHUNK)]
    pub decode_chunk: usize,

    #[arg(long, value_enum, default_value_t = VideoFormat::Png)]
    pub video_format: VideoFormat,

    /// Run on the CPU instead of requiring a GPU.
    #[arg(long)]
    pub cpu: bool,
}

/// Joint audio+video sampling.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "flav-sample",
    about = "Sample paired video and audio from a FLAV checkpoint"
)]
pub struct SampleArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Audio-to-video sampling.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "flav-sample-a2v",
    about = "Generate video for audio clips with a FLAV checkpoint"
)]
pub struct A2vArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Directory of conditioning WAV clips at the vocoder sample rate.
    #[arg(long, default_value = "./datasets")]
    pub data_path: PathBuf,

    /// Weight of the audio reconstruction guidance (0 disables it).
    #[arg(long, default_value_t = 100.0)]
    pub scale: f64,
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

impl CommonArgs {
    /// Check flag combinations before anything is loaded.
    pub fn validate(&self) -> anyhow::Result<()> {
        LatentGeometry::SD_VAE.latent_size_for(self.image_size)?;
        if self.batch_size == 0 {
            anyhow::bail!("batch size must be at least 1");
        }
        if self.num_videos < self.batch_size {
            anyhow::bail!(
                "num-videos ({}) must be at least the batch size ({})",
                self.num_videos,
                self.batch_size
            );
        }
        if self.video_length == 0 {
            anyhow::bail!("video length must be at least 1");
        }
        if self.num_timesteps == 0 {
            anyhow::bail!("num-timesteps must be at least 1");
        }
        if self.audio_scale <= 0.0 {
            anyhow::bail!("audio scale must be positive, got {}", self.audio_scale);
        }
        if let Some(num_classes) = self.num_classes
            && let Some(bad) = self.classes.iter().find(|&&c| c as usize >= num_classes)
        {
            anyhow::bail!("class {bad} is out of range for {num_classes} classes");
        }
        Ok(())
    }

    pub fn num_batches(&self) -> usize {
        self.num_videos / self.batch_size
    }

    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            image_size: self.image_size,
            num_classes: self.num_classes,
            num_timesteps: self.num_timesteps,
            vae: self.vae,
            vae_path: self.vae_path.clone(),
            weights_key: self.weights_key.clone(),
            audio_scale: self.audio_scale,
            decode_chunk: self.decode_chunk,
        }
    }

    fn batch_request(&self) -> BatchRequest {
        BatchRequest {
            batch_size: self.batch_size,
            video_length: self.video_length,
            cfg_scale: self.cfg_scale,
        }
    }

    fn class_source(&self, config: &FlavConfig, device: &Device) -> anyhow::Result<Option<ClassCycle>> {
        if !config.is_class_conditional() {
            return Ok(None);
        }
        let source = ClassCycle::new(self.classes.clone(), config.num_classes, self.seed, device)?;
        Ok(Some(source))
    }
}

/// A GPU unless `cpu` is set.
pub fn select_device(cpu: bool) -> anyhow::Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    anyhow::bail!("sampling requires a GPU; pass --cpu to sample on the CPU")
}

/// Joint audio+video sampling driver.
pub fn run_sample<F>(args: &SampleArgs, factory: F) -> anyhow::Result<()>
where
    F: FnOnce(&FlavConfig, VarBuilder<'static>) -> candle_core::Result<Box<dyn Denoiser>>,
{
    let common = &args.common;
    common.validate()?;
    let device = select_device(common.cpu)?;
    tracing::info!(?device, "using device");

    let pipeline = FlavPipeline::load(
        &common.model_ckpt,
        &common.load_options(),
        &device,
        DType::F32,
        factory,
    )
    .context("failed to load FLAV pipeline")?;

    let mut conditions: Box<dyn ConditionSource> = match common.class_source(pipeline.config(), &device)? {
        Some(classes) => Box::new(classes),
        None => Box::new(Unconditional),
    };
    let layout = OutputLayout::create(
        &common.results_dir,
        SampleKind::Joint,
        common.video_format,
        pipeline.frames_per_second(),
    )?;

    generate_all(
        &pipeline,
        conditions.as_mut(),
        &layout,
        common,
        |pipeline, batch, request, noise| pipeline.sample_batch(batch, request, noise),
    )
}

/// Audio-to-video sampling driver.
pub fn run_sample_a2v<F>(args: &A2vArgs, factory: F) -> anyhow::Result<()>
where
    F: FnOnce(&FlavConfig, VarBuilder<'static>) -> candle_core::Result<Box<dyn Denoiser>>,
{
    let common = &args.common;
    common.validate()?;
    if args.scale < 0.0 {
        anyhow::bail!("reconstruction scale must be non-negative, got {}", args.scale);
    }
    let device = select_device(common.cpu)?;
    tracing::info!(?device, "using device");

    let assets = FlavAssets::fetch(&common.model_ckpt)?;
    let pipeline =
        FlavPipeline::from_assets(&assets, &common.load_options(), &device, DType::F32, factory)
            .context("failed to load FLAV pipeline")?;

    let vocoder_config = VocoderConfig::from_file(&assets.vocoder_config)?;
    let mel = MelSpectrogram::new(MelConfig::from(&vocoder_config));
    let mut conditions = WavDirectory::open(
        &args.data_path,
        mel,
        common.video_length,
        pipeline.config().audio_frame_len,
        common.audio_scale,
        common.class_source(pipeline.config(), &device)?,
        &device,
        DType::F32,
    )
    .with_context(|| format!("failed to open {}", args.data_path.display()))?;
    let layout = OutputLayout::create(
        &common.results_dir,
        SampleKind::AudioToVideo,
        common.video_format,
        pipeline.frames_per_second(),
    )?;

    let scale = args.scale;
    generate_all(
        &pipeline,
        &mut conditions,
        &layout,
        common,
        |pipeline, batch, request, noise| pipeline.sample_batch_a2v(batch, request, scale, noise),
    )
}

/// Generate and save `num_videos / batch_size` batches.
fn generate_all<S>(
    pipeline: &FlavPipeline,
    conditions: &mut dyn ConditionSource,
    layout: &OutputLayout,
    common: &CommonArgs,
    sample: S,
) -> anyhow::Result<()>
where
    S: Fn(
        &FlavPipeline,
        &crate::conditions::ConditionBatch,
        &BatchRequest,
        &mut NoiseGenerator,
    ) -> crate::Result<crate::pipeline::GeneratedBatch>,
{
    let mut noise = NoiseGenerator::new(common.seed);
    let request = common.batch_request();
    let num_batches = common.num_batches();

    for i in 0..num_batches {
        let batch = conditions.next_batch(common.batch_size)?;
        let start = std::time::Instant::now();
        let generated = sample(pipeline, &batch, &request, &mut noise)
            .with_context(|| format!("sampling batch {i} failed"))?;

        for j in 0..generated.len() {
            let name = sample_name(i, common.batch_size, j);
            layout
                .save_multimodal(&generated.video(j)?, &generated.wavs[j], generated.sample_rate, &name)
                .with_context(|| format!("failed to save {name}"))?;
        }
        tracing::info!(
            batch = i + 1,
            of = num_batches,
            elapsed_s = start.elapsed().as_secs_f64(),
            "batch saved"
        );
    }
    tracing::info!(dir = %layout.root().display(), videos = num_batches * common.batch_size, "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::ConditionBatch;
    use crate::model::vocoder::Vocoder;
    use crate::model::Velocity;
    use crate::vae::LatentDecoder;
    use candle_core::Tensor;

    #[test]
    fn sample_defaults() {
        let args = SampleArgs::try_parse_from(["flav-sample", "--model-ckpt", "org/flav-checkpoint"])
            .unwrap();
        let c = &args.common;
        assert_eq!(c.vae, VaeVariant::Ema);
        assert_eq!(c.image_size, 256);
        assert_eq!(c.num_classes, None);
        assert!(c.classes.is_empty());
        assert_eq!(c.cfg_scale, 1.0);
        assert_eq!(c.num_timesteps, 2);
        assert_eq!(c.batch_size, 4);
        assert_eq!(c.video_length, 1);
        assert_eq!(c.num_videos, 2048);
        assert_eq!(c.audio_scale, DEFAULT_AUDIO_SCALE);
        assert_eq!(c.results_dir, PathBuf::from("results"));
        assert_eq!(c.seed, 42);
        assert_eq!(c.video_format, VideoFormat::Png);
        assert!(!c.cpu);
        assert_eq!(c.num_batches(), 512);
    }

    #[test]
    fn a2v_flags() {
        let args = A2vArgs::try_parse_from([
            "flav-sample-a2v",
            "--model-ckpt",
            "ckpt",
            "--data-path",
            "/data/clips",
            "--scale",
            "0",
            "--vae",
            "mse",
            "--num-classes",
            "10",
            "--classes",
            "1",
            "2",
            "--video-format",
            "gif",
        ])
        .unwrap();
        assert_eq!(args.data_path, PathBuf::from("/data/clips"));
        assert_eq!(args.scale, 0.0);
        assert_eq!(args.common.vae, VaeVariant::Mse);
        assert_eq!(args.common.classes, vec![1, 2]);
        assert_eq!(args.common.video_format, VideoFormat::Gif);
        args.common.validate().unwrap();

        let defaults = A2vArgs::try_parse_from(["a2v", "--model-ckpt", "ckpt"]).unwrap();
        assert_eq!(defaults.scale, 100.0);
        assert_eq!(defaults.data_path, PathBuf::from("./datasets"));
    }

    #[test]
    fn model_ckpt_is_required() {
        assert!(SampleArgs::try_parse_from(["flav-sample"]).is_err());
    }

    fn parse(extra: &[&str]) -> CommonArgs {
        let mut argv = vec!["flav-sample", "--model-ckpt", "ckpt"];
        argv.extend_from_slice(extra);
        SampleArgs::try_parse_from(argv).unwrap().common
    }

    #[test]
    fn validation() {
        assert!(parse(&[]).validate().is_ok());
        assert!(parse(&["--image-size", "250"]).validate().is_err());
        assert!(parse(&["--num-videos", "2", "--batch-size", "4"]).validate().is_err());
        assert!(parse(&["--video-length", "0"]).validate().is_err());
        assert!(parse(&["--classes", "3"]).validate().is_ok());
        assert!(parse(&["--num-classes", "3", "--classes", "3"]).validate().is_err());
    }

    #[test]
    fn cpu_flag_selects_cpu() {
        assert!(matches!(select_device(true).unwrap(), Device::Cpu));
    }

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

    struct FirstChannels;

    impl LatentDecoder for FirstChannels {
        fn decode(&self, latents: &Tensor) -> candle_core::Result<Tensor> {
            latents.narrow(1, 0, 3)?.contiguous()
        }

        fn geometry(&self) -> LatentGeometry {
            LatentGeometry {
                downsample: 1,
                channels: 4,
            }
        }
    }

    struct MeanVocoder;

    impl Vocoder for MeanVocoder {
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

    #[test]
    fn generate_all_writes_every_sample() {
        let config = FlavConfig {
            predict_frames: 2,
            num_classes: 0,
            in_channels: 4,
            latent_size: 2,
            audio_mel_bins: 4,
            audio_frame_len: 10,
        };
        let pipeline = FlavPipeline::new(
            Box::new(Zero),
            Box::new(FirstChannels),
            Box::new(MeanVocoder),
            config,
            1,
            1.0,
            &Device::Cpu,
            DType::F32,
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let common = parse(&[
            "--batch-size",
            "2",
            "--num-videos",
            "5",
            "--video-length",
            "2",
            "--results-dir",
            dir.path().to_str().unwrap(),
        ]);
        let layout =
            OutputLayout::create(dir.path(), SampleKind::Joint, VideoFormat::Png, 10.0).unwrap();

        let calls = std::cell::Cell::new(0usize);
        generate_all(
            &pipeline,
            &mut Unconditional,
            &layout,
            &common,
            |pipeline, batch: &ConditionBatch, request, noise| {
                calls.set(calls.get() + 1);
                pipeline.sample_batch(batch, request, noise)
            },
        )
        .unwrap();

        // 5 videos in batches of 2: two batches, four samples.
        assert_eq!(calls.get(), 2);
        for n in 0..4 {
            assert!(dir.path().join(format!("samples/audio/sample_{n}.wav")).is_file());
            assert!(dir
                .path()
                .join(format!("samples/video/sample_{n}/frame_0001.png"))
                .is_file());
        }
        assert!(!dir.path().join("samples/audio/sample_4.wav").exists());
    }
}
