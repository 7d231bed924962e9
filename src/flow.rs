//! Rolling rectified flow.
//!
//! The forward process is a straight line between noise and data:
//! `z_t = t * x1 + (1 - t) * ε`, with `t = 0` pure noise and `t = 1` data.
//! The network predicts the constant velocity `v = x1 - ε` and sampling
//! integrates it with Euler steps `z ← z + v * Δt`.
//!
//! Frames in the prediction window sit at staggered times. At the start of
//! every rolling stage, frame `k` of a window of `W` frames is at
//! `t_k = (W - 1 - k) / W`:
//!
//! ```text
//! frame:  0        1        …   W-1
//! t:      (W-1)/W  (W-2)/W  …   0
//! ```
//!
//! A stage is `S` steps of `Δt = 1 / (W * S)` applied to every frame. After
//! a stage the oldest frame is clean and leaves the window; a fresh noise
//! frame enters at `t = 0`. Before the first stage a warmup brings the
//! all-noise window up to the staggered profile.
//!
//! - [`guidance`] — classifier-free guidance around the network call
//! - [`sampler`] — the joint and audio-to-video sampling loops

pub mod guidance;
pub mod sampler;

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Per-frame times before a step and the per-frame increment it applies.
#[derive(Debug, Clone, PartialEq)]
pub struct StepPlan {
    pub times: Vec<f64>,
    pub deltas: Vec<f64>,
}

impl StepPlan {
    /// Per-frame times after the step.
    pub fn next_times(&self) -> Vec<f64> {
        self.times
            .iter()
            .zip(self.deltas.iter())
            .map(|(t, dt)| (t + dt).min(1.0))
            .collect()
    }
}

/// Rolling rectified-flow schedule.
#[derive(Debug, Clone)]
pub struct RectifiedFlow {
    num_timesteps: usize,
    warmup_timesteps: usize,
    window_size: usize,
}

impl RectifiedFlow {
    /// - `num_timesteps`: Euler steps per rolling stage
    /// - `warmup_timesteps`: warmup length, in stages
    /// - `window_size`: frames jointly denoised
    pub fn new(num_timesteps: usize, warmup_timesteps: usize, window_size: usize) -> Result<Self> {
        if num_timesteps == 0 {
            return Err(Error::Config("num_timesteps must be at least 1".into()));
        }
        if window_size == 0 {
            return Err(Error::Config("window_size must be at least 1".into()));
        }
        Ok(Self {
            num_timesteps,
            warmup_timesteps,
            window_size,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Euler step size of a rolling stage.
    pub fn step_size(&self) -> f64 {
        1.0 / (self.window_size * self.num_timesteps) as f64
    }

    /// Times at the start of every rolling stage, oldest frame first.
    pub fn stage_profile(&self) -> Vec<f64> {
        let w = self.window_size;
        (0..w).map(|k| (w - 1 - k) as f64 / w as f64).collect()
    }

    /// Number of warmup steps. A single-frame window needs none.
    pub fn warmup_steps(&self) -> usize {
        if self.window_size <= 1 {
            0
        } else {
            self.warmup_timesteps * self.num_timesteps
        }
    }

    /// Steps that take an all-noise window to [`Self::stage_profile`].
    ///
    /// Frame `k` moves linearly: at warmup step `i` it sits at
    /// `t_k * i / warmup_steps`.
    pub fn warmup_schedule(&self) -> Vec<StepPlan> {
        let n = self.warmup_steps();
        if n == 0 {
            return Vec::new();
        }
        let profile = self.stage_profile();
        let deltas: Vec<f64> = profile.iter().map(|t| t / n as f64).collect();
        (0..n)
            .map(|i| StepPlan {
                times: profile.iter().map(|t| t * i as f64 / n as f64).collect(),
                deltas: deltas.clone(),
            })
            .collect()
    }

    /// Steps of one rolling stage; afterwards the oldest frame is at `t = 1`.
    pub fn stage_schedule(&self) -> Vec<StepPlan> {
        let dt = self.step_size();
        let profile = self.stage_profile();
        (0..self.num_timesteps)
            .map(|s| StepPlan {
                times: profile.iter().map(|t| t + s as f64 * dt).collect(),
                deltas: vec![dt; self.window_size],
            })
            .collect()
    }

    /// Network evaluations needed to emit `video_length` frames.
    pub fn total_steps(&self, video_length: usize) -> usize {
        self.warmup_steps() + video_length * self.num_timesteps
    }

    /// `z + v * Δt` with one `Δt` per window frame.
    pub fn euler_step(&self, z: &Tensor, v: &Tensor, deltas: &[f64]) -> Result<Tensor> {
        let dt = frame_scalars(deltas, z)?;
        Ok((z + v.broadcast_mul(&dt)?)?)
    }

    /// Forward path: `t * x1 + (1 - t) * ε`.
    pub fn add_noise(&self, x1: &Tensor, noise: &Tensor, times: &[f64]) -> Result<Tensor> {
        let t = frame_scalars(times, x1)?;
        let one_minus_t = frame_scalars(&times.iter().map(|t| 1.0 - t).collect::<Vec<_>>(), x1)?;
        Ok((x1.broadcast_mul(&t)? + noise.broadcast_mul(&one_minus_t)?)?)
    }

    /// Clean-sample estimate from a velocity: `z + (1 - t) * v`.
    pub fn predict_clean(&self, z: &Tensor, v: &Tensor, times: &[f64]) -> Result<Tensor> {
        let one_minus_t = frame_scalars(&times.iter().map(|t| 1.0 - t).collect::<Vec<_>>(), z)?;
        Ok((z + v.broadcast_mul(&one_minus_t)?)?)
    }
}

/// Broadcastable `[B, W, 1, …]` tensor holding one value per window frame.
///
/// `like` supplies batch size, rank, dtype, and device.
pub fn frame_scalars(values: &[f64], like: &Tensor) -> Result<Tensor> {
    let dims = like.dims();
    if dims.len() < 2 || dims[1] != values.len() {
        return Err(Error::Config(format!(
            "expected {} window frames in dimension 1, got shape {:?}",
            values.len(),
            dims
        )));
    }
    let mut shape = vec![1usize; dims.len()];
    shape[1] = values.len();
    let data: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    let t = Tensor::from_vec(data, shape, &Device::Cpu)?
        .to_dtype(like.dtype())?
        .to_device(like.device())?;
    Ok(t)
}

/// `[B, W]` time tensor handed to the network.
pub fn time_tensor(times: &[f64], batch_size: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = times.iter().map(|&t| t as f32).collect();
    let t = Tensor::from_vec(data, (1, times.len()), &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)?
        .broadcast_as((batch_size, times.len()))?
        .contiguous()?;
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(RectifiedFlow::new(0, 1, 4).is_err());
        assert!(RectifiedFlow::new(2, 1, 0).is_err());
    }

    #[test]
    fn stage_profile_is_staggered() {
        let flow = RectifiedFlow::new(2, 4, 4).unwrap();
        let profile = flow.stage_profile();
        assert_eq!(profile.len(), 4);
        assert_close(profile[0], 0.75);
        assert_close(profile[3], 0.0);
        for pair in profile.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn warmup_reaches_profile() {
        let flow = RectifiedFlow::new(3, 2, 5).unwrap();
        let plans = flow.warmup_schedule();
        assert_eq!(plans.len(), 6);
        // Starts from pure noise.
        assert!(plans[0].times.iter().all(|&t| t == 0.0));
        // Ends exactly on the stage profile.
        let last = plans.last().unwrap().next_times();
        for (a, b) in last.iter().zip(flow.stage_profile()) {
            assert_close(*a, b);
        }
    }

    #[test]
    fn single_frame_window_skips_warmup() {
        let flow = RectifiedFlow::new(4, 1, 1).unwrap();
        assert_eq!(flow.warmup_steps(), 0);
        assert!(flow.warmup_schedule().is_empty());
        assert_eq!(flow.total_steps(3), 12);
    }

    #[test]
    fn stage_finishes_oldest_frame() {
        let flow = RectifiedFlow::new(2, 4, 4).unwrap();
        let plans = flow.stage_schedule();
        assert_eq!(plans.len(), 2);
        let end = plans.last().unwrap().next_times();
        assert_close(end[0], 1.0);
        // Every other frame ends where its left neighbour started.
        let profile = flow.stage_profile();
        for k in 1..4 {
            assert_close(end[k], profile[k - 1]);
        }
    }

    #[test]
    fn times_stay_in_unit_interval() {
        let flow = RectifiedFlow::new(5, 3, 6).unwrap();
        for plan in flow.warmup_schedule().iter().chain(flow.stage_schedule().iter()) {
            for &t in plan.times.iter().chain(plan.next_times().iter()) {
                assert!((0.0..=1.0).contains(&t), "t = {t}");
            }
            for pair in plan.times.windows(2) {
                assert!(pair[0] >= pair[1], "window times must be non-increasing");
            }
        }
    }

    #[test]
    fn each_frame_integrates_to_one() {
        // A frame entering as the newest slot needs W stages; one present at
        // warmup in slot k needs its warmup share plus k + 1 stages.
        let w = 4;
        let flow = RectifiedFlow::new(3, 4, w).unwrap();
        let stage: f64 = flow.stage_schedule().iter().map(|p| p.deltas[0]).sum();
        assert_close(stage * w as f64, 1.0);
        for k in 0..w {
            let warm: f64 = flow.warmup_schedule().iter().map(|p| p.deltas[k]).sum();
            assert_close(warm + stage * (k + 1) as f64, 1.0);
        }
    }

    #[test]
    fn add_noise_and_predict_clean_invert() {
        let dev = Device::Cpu;
        let flow = RectifiedFlow::new(1, 1, 2).unwrap();
        let x1 = Tensor::ones((1, 2, 3), DType::F32, &dev).unwrap();
        let noise = Tensor::zeros((1, 2, 3), DType::F32, &dev).unwrap();
        let times = [0.25, 0.5];
        let z = flow.add_noise(&x1, &noise, &times).unwrap();
        let z_vals: Vec<Vec<f32>> = z.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(z_vals[0], vec![0.25; 3]);
        assert_eq!(z_vals[1], vec![0.5; 3]);
        // v = x1 - ε = 1
        let v = x1.ones_like().unwrap();
        let clean = flow.predict_clean(&z, &v, &times).unwrap();
        let diff: f32 = (clean - &x1).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn frame_scalars_checks_window() {
        let dev = Device::Cpu;
        let z = Tensor::zeros((2, 3, 4, 5, 5), DType::F32, &dev).unwrap();
        let s = frame_scalars(&[0.1, 0.2, 0.3], &z).unwrap();
        assert_eq!(s.dims(), &[1, 3, 1, 1, 1]);
        assert!(frame_scalars(&[0.1, 0.2], &z).is_err());
    }

    #[test]
    fn time_tensor_is_batched() {
        let t = time_tensor(&[0.5, 0.0], 3, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        let rows: Vec<Vec<f32>> = t.to_vec2().unwrap();
        assert_eq!(rows[2], vec![0.5, 0.0]);
    }
}
