//! Reproducible Gaussian noise for latent initialisation.
//!
//! Candle's `Tensor::randn` on CUDA is not seedable per call, so noise is
//! drawn on the host from a `ChaCha8Rng` and moved to the device.
//! The same seed produces the same latents on every backend.

use candle_core::{DType, Device, Shape, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::Result;

/// Seeded standard-normal sampler.
pub struct NoiseGenerator {
    rng: ChaCha8Rng,
}

impl NoiseGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Draw one standard-normal sample.
    pub fn next_gaussian(&mut self) -> f32 {
        StandardNormal.sample(&mut self.rng)
    }

    /// Uniform integer in `0..upper`.
    pub fn next_index(&mut self, upper: usize) -> usize {
        self.rng.random_range(0..upper)
    }

    /// A tensor of standard-normal noise with the given shape.
    pub fn randn(&mut self, shape: impl Into<Shape>, dtype: DType, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.next_gaussian())
            .collect();
        let noise = Tensor::from_vec(data, shape, &Device::Cpu)?
            .to_dtype(dtype)?
            .to_device(device)?;
        Ok(noise)
    }
}
