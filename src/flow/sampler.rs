//! Joint audio+video and audio-to-video sampling loops.
//!
//! Both loops share the rolling schedule of [`RectifiedFlow`]:
//!
//! 1. Fill the window with noise for both modalities
//! 2. Warmup: bring the window to the staggered time profile
//! 3. Repeat `video_length` times: run one stage, emit the oldest frame,
//!    shift the window and append a fresh noise frame
//!
//! Audio-to-video keeps the audio track pinned to the conditioning audio:
//! before each network call the audio latent of every frame with known
//! audio is replaced by the forward-noised ground truth at that frame's time.
//! With a positive reconstruction scale the video velocity is additionally
//! corrected by the gradient of the audio reconstruction error.

use candle_core::{DType, Device, Tensor, Var};

use super::guidance::{guided_forward, Guidance};
use super::{frame_scalars, time_tensor, RectifiedFlow, StepPlan};
use crate::config::FlavConfig;
use crate::model::{Denoiser, Velocity};
use crate::noise::NoiseGenerator;
use crate::{Error, Result};

/// What to generate in one batch.
#[derive(Debug, Clone)]
pub struct SampleRequest<'a> {
    pub batch_size: usize,
    /// Frames to emit per sample.
    pub video_length: usize,
    /// `[B]` class labels for class-conditional models.
    pub labels: Option<&'a Tensor>,
    pub guidance: Option<Guidance>,
}

/// Clean latents produced by the sampler.
#[derive(Debug, Clone)]
pub struct GeneratedLatents {
    /// `[B, T, C, h, w]`
    pub video: Tensor,
    /// `[B, T, 1, N_mel, F]`
    pub audio: Tensor,
}

/// Ground-truth audio for audio-to-video sampling.
struct AudioCondition<'a> {
    /// `[B, T_audio, 1, N_mel, F]`
    audio: &'a Tensor,
    /// Reconstruction guidance weight; 0 disables it.
    scale: f64,
}

/// The rolling window of noisy latents.
struct Window {
    video: Tensor,
    audio: Tensor,
    /// Noise each audio frame entered the window with.
    audio_noise: Tensor,
    /// Global frame index of slot 0.
    first_frame: usize,
}

/// Known audio aligned to the current window.
struct WindowTarget {
    audio: Tensor,
    /// 1.0 where the slot's audio is known.
    mask: Vec<f64>,
}

impl WindowTarget {
    fn any_known(&self) -> bool {
        self.mask.iter().any(|&m| m > 0.0)
    }
}

/// Drives a [`Denoiser`] through the rolling rectified-flow schedule.
pub struct Sampler<'a> {
    denoiser: &'a dyn Denoiser,
    flow: &'a RectifiedFlow,
    config: &'a FlavConfig,
    device: Device,
    dtype: DType,
}

impl<'a> Sampler<'a> {
    pub fn new(
        denoiser: &'a dyn Denoiser,
        flow: &'a RectifiedFlow,
        config: &'a FlavConfig,
        device: &Device,
        dtype: DType,
    ) -> Self {
        Self {
            denoiser,
            flow,
            config,
            device: device.clone(),
            dtype,
        }
    }

    /// Generate paired video and audio latents.
    pub fn generate_sample(
        &self,
        request: &SampleRequest,
        noise: &mut NoiseGenerator,
    ) -> Result<GeneratedLatents> {
        self.run(request, None, noise)
    }

    /// Generate video latents for the given audio latents `[B, T, 1, N_mel, F]`.
    ///
    /// The returned audio is the conditioning audio for the emitted frames.
    pub fn generate_sample_a2v(
        &self,
        request: &SampleRequest,
        audio: &Tensor,
        scale: f64,
        noise: &mut NoiseGenerator,
    ) -> Result<GeneratedLatents> {
        let (b, t, c, n, f) = audio.dims5()?;
        let (_, _, ec, en, ef) = self.config.audio_latent_shape(request.batch_size);
        if b != request.batch_size || (c, n, f) != (ec, en, ef) {
            return Err(Error::Config(format!(
                "conditioning audio has shape {:?}, expected [{}, T, {ec}, {en}, {ef}]",
                audio.dims(),
                request.batch_size
            )));
        }
        if t < request.video_length {
            return Err(Error::Config(format!(
                "conditioning audio covers {t} frames but {} were requested",
                request.video_length
            )));
        }
        let audio = audio.to_dtype(self.dtype)?.to_device(&self.device)?;
        let condition = AudioCondition {
            audio: &audio,
            scale,
        };
        self.run(request, Some(&condition), noise)
    }

    fn run(
        &self,
        request: &SampleRequest,
        condition: Option<&AudioCondition>,
        noise: &mut NoiseGenerator,
    ) -> Result<GeneratedLatents> {
        self.validate(request)?;
        let b = request.batch_size;

        let video = noise.randn(self.config.video_latent_shape(b), self.dtype, &self.device)?;
        let audio = noise.randn(self.config.audio_latent_shape(b), self.dtype, &self.device)?;
        let mut window = Window {
            video,
            audio_noise: audio.clone(),
            audio,
            first_frame: 0,
        };

        tracing::debug!(
            steps = self.flow.total_steps(request.video_length),
            window = self.flow.window_size(),
            "sampling"
        );

        let warmup = self.flow.warmup_schedule();
        if !warmup.is_empty() {
            let target = condition.map(|c| self.window_target(c, &window)).transpose()?;
            for plan in &warmup {
                self.step(&mut window, plan, request, condition, target.as_ref())?;
            }
        }

        let stage = self.flow.stage_schedule();
        let mut video_frames = Vec::with_capacity(request.video_length);
        let mut audio_frames = Vec::with_capacity(request.video_length);
        for frame in 0..request.video_length {
            let target = condition.map(|c| self.window_target(c, &window)).transpose()?;
            for plan in &stage {
                self.step(&mut window, plan, request, condition, target.as_ref())?;
            }

            video_frames.push(window.video.narrow(1, 0, 1)?);
            let audio_frame = match &target {
                Some(target) if target.mask[0] > 0.0 => target.audio.narrow(1, 0, 1)?,
                _ => window.audio.narrow(1, 0, 1)?,
            };
            audio_frames.push(audio_frame);
            tracing::debug!(frame, "frame emitted");

            if frame + 1 < request.video_length {
                self.shift(&mut window, b, noise)?;
            }
        }

        Ok(GeneratedLatents {
            video: Tensor::cat(&video_frames, 1)?,
            audio: Tensor::cat(&audio_frames, 1)?,
        })
    }

    fn validate(&self, request: &SampleRequest) -> Result<()> {
        if request.video_length == 0 {
            return Err(Error::Config("video_length must be at least 1".into()));
        }
        if request.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.flow.window_size() != self.config.predict_frames {
            return Err(Error::Config(format!(
                "flow window of {} frames does not match the model's predict_frames = {}",
                self.flow.window_size(),
                self.config.predict_frames
            )));
        }
        if let Some(labels) = request.labels {
            if labels.dims() != [request.batch_size] {
                return Err(Error::Config(format!(
                    "labels must have shape [{}], got {:?}",
                    request.batch_size,
                    labels.dims()
                )));
            }
        }
        Ok(())
    }

    /// One Euler step of the whole window.
    fn step(
        &self,
        window: &mut Window,
        plan: &StepPlan,
        request: &SampleRequest,
        condition: Option<&AudioCondition>,
        target: Option<&WindowTarget>,
    ) -> Result<()> {
        if let Some(target) = target {
            window.audio = self.impose_known_audio(window, target, &plan.times)?;
        }

        let t = time_tensor(&plan.times, request.batch_size, self.dtype, &self.device)?;
        let guidance = request.guidance.as_ref();
        let velocity = match (condition, target) {
            (Some(condition), Some(target)) if condition.scale > 0.0 && target.any_known() => self
                .reconstruction_guided(
                    window,
                    &t,
                    &plan.times,
                    request.labels,
                    guidance,
                    target,
                    condition.scale,
                )?,
            _ => guided_forward(
                self.denoiser,
                &window.video,
                &window.audio,
                &t,
                request.labels,
                guidance,
            )?,
        };

        window.video = self.flow.euler_step(&window.video, &velocity.video, &plan.deltas)?;
        window.audio = self.flow.euler_step(&window.audio, &velocity.audio, &plan.deltas)?;
        Ok(())
    }

    /// Denoiser call whose video velocity is nudged towards reproducing the
    /// known audio: `v_video -= scale * ∇_video mean((â - a)²)`.
    #[allow(clippy::too_many_arguments)]
    fn reconstruction_guided(
        &self,
        window: &Window,
        t: &Tensor,
        times: &[f64],
        labels: Option<&Tensor>,
        guidance: Option<&Guidance>,
        target: &WindowTarget,
        scale: f64,
    ) -> Result<Velocity> {
        let video = Var::from_tensor(&window.video)?;
        let velocity = guided_forward(
            self.denoiser,
            video.as_tensor(),
            &window.audio,
            t,
            labels,
            guidance,
        )?;

        let clean = self.flow.predict_clean(&window.audio, &velocity.audio, times)?;
        let mask = frame_scalars(&target.mask, &window.audio)?;
        let err = (clean - &target.audio)?.broadcast_mul(&mask)?;
        let known_frames = target.mask.iter().filter(|&&m| m > 0.0).count();
        let per_frame = window.audio.elem_count() / target.mask.len();
        let loss = (err.sqr()?.sum_all()? / (known_frames * per_frame) as f64)?;
        let grads = loss.backward()?;

        let video_velocity = velocity.video.detach();
        let video_velocity = match grads.get(video.as_tensor()) {
            Some(grad) => (video_velocity - (grad * scale)?)?,
            None => video_velocity,
        };
        Ok(Velocity {
            video: video_velocity,
            audio: velocity.audio.detach(),
        })
    }

    /// Conditioning audio for the frames currently in the window.
    fn window_target(&self, condition: &AudioCondition, window: &Window) -> Result<WindowTarget> {
        let w = self.flow.window_size();
        let available = condition.audio.dim(1)?;
        let mut frames = Vec::with_capacity(w);
        let mut mask = Vec::with_capacity(w);
        for slot in 0..w {
            let index = window.first_frame + slot;
            if index < available {
                frames.push(condition.audio.narrow(1, index, 1)?);
                mask.push(1.0);
            } else {
                frames.push(window.audio.narrow(1, slot, 1)?.zeros_like()?);
                mask.push(0.0);
            }
        }
        Ok(WindowTarget {
            audio: Tensor::cat(&frames, 1)?,
            mask,
        })
    }

    fn impose_known_audio(
        &self,
        window: &Window,
        target: &WindowTarget,
        times: &[f64],
    ) -> Result<Tensor> {
        let noised = self.flow.add_noise(&target.audio, &window.audio_noise, times)?;
        let keep: Vec<f64> = target.mask.iter().map(|m| 1.0 - m).collect();
        let mask = frame_scalars(&target.mask, &window.audio)?;
        let keep = frame_scalars(&keep, &window.audio)?;
        Ok((noised.broadcast_mul(&mask)? + window.audio.broadcast_mul(&keep)?)?)
    }

    /// Drop the oldest frame and append fresh noise at `t = 0`.
    fn shift(&self, window: &mut Window, b: usize, noise: &mut NoiseGenerator) -> Result<()> {
        let (_, _, c, h, w) = self.config.video_latent_shape(b);
        let (_, _, ac, n, f) = self.config.audio_latent_shape(b);
        let fresh_video = noise.randn((b, 1, c, h, w), self.dtype, &self.device)?;
        let fresh_audio = noise.randn((b, 1, ac, n, f), self.dtype, &self.device)?;

        window.video = roll(&window.video, &fresh_video)?;
        window.audio = roll(&window.audio, &fresh_audio)?;
        window.audio_noise = roll(&window.audio_noise, &fresh_audio)?;
        window.first_frame += 1;
        Ok(())
    }
}

/// `cat([xs[:, 1:], fresh], dim=1)`
fn roll(xs: &Tensor, fresh: &Tensor) -> Result<Tensor> {
    let w = xs.dim(1)?;
    if w <= 1 {
        return Ok(fresh.clone());
    }
    Ok(Tensor::cat(&[&xs.narrow(1, 1, w - 1)?, fresh], 1)?)
}
