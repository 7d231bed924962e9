//! Stable-diffusion VAE decoder for video latents.
//!
//! Converts latents [N, 4, h, w] to RGB frames [N, 3, 8h, 8w] using the
//! `sd-vae-ft-{ema,mse}` autoencoder via
//! `candle_transformers::models::stable_diffusion::vae`.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};

use crate::config::LatentGeometry;

/// Latent scaling factor the diffusion model was trained with.
pub const SD_VAE_SCALING: f64 = 0.18215;

/// Anything that turns image latents back into pixels.
pub trait LatentDecoder {
    /// `[N, C, h, w]` latents → `[N, 3, H, W]` images in `[-1, 1]`.
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    /// Latent channels and downsampling factor the decoder expects.
    fn geometry(&self) -> LatentGeometry;
}

/// `AutoencoderKL` from `stabilityai/sd-vae-ft-*`.
pub struct SdVae {
    inner: AutoEncoderKL,
    scaling_factor: f64,
}

impl SdVae {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let inner = AutoEncoderKL::new(vb, 3, 3, sd_vae_config())?;
        Ok(Self {
            inner,
            scaling_factor: SD_VAE_SCALING,
        })
    }
}

impl LatentDecoder for SdVae {
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents / self.scaling_factor)?;
        self.inner.decode(&latents)
    }

    fn geometry(&self) -> LatentGeometry {
        LatentGeometry::SD_VAE
    }
}

/// Architecture of the SD 1.x VAE (shared by the `ema` and `mse` fine-tunes).
pub fn sd_vae_config() -> AutoEncoderKLConfig {
    AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: LatentGeometry::SD_VAE.channels,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}

/// Decode a batch of latent videos.
///
/// Input: `[B, T, C, h, w]`. Frames are flattened into the batch and decoded
/// `chunk` at a time to bound device memory.
/// Output: `[B, T, 3, H, W]` in `[0, 1]`, F32.
pub fn decode_video(decoder: &dyn LatentDecoder, latents: &Tensor, chunk: usize) -> Result<Tensor> {
    let (b, t, c, h, w) = latents.dims5()?;
    let expected = decoder.geometry().channels;
    if c != expected {
        candle_core::bail!("video latents have {c} channels, decoder expects {expected}");
    }
    let flat = latents.reshape((b * t, c, h, w))?;
    let chunk = chunk.max(1);

    let mut frames = Vec::with_capacity((b * t).div_ceil(chunk));
    let mut start = 0;
    while start < b * t {
        let len = chunk.min(b * t - start);
        let images = decoder.decode(&flat.narrow(0, start, len)?.contiguous()?)?;
        frames.push(images);
        start += len;
    }
    let images = Tensor::cat(&frames, 0)?;
    let (_, ch, height, width) = images.dims4()?;

    // [-1, 1] → [0, 1]
    ((images.to_dtype(DType::F32)? / 2.0)? + 0.5)?
        .clamp(0f32, 1f32)?
        .reshape((b, t, ch, height, width))
}
