//! HiFi-GAN vocoder: mel spectrogram → audio waveform.
//!
//! ```text
//! Input: [B, num_mels, T_mel]
//! conv_pre(num_mels, C, k=7)
//! per upsample stage i (C_i = C / 2^(i+1)):
//!     LeakyReLU(0.1) + ConvTranspose1d(stride = rate_i)
//!     mean over resblock kernels of ResBlock(C_i, k_j, dilations_j)
//! LeakyReLU(0.01) + conv_post(C_last, 1, k=7) + tanh
//! Output: [B, T_mel × hop_size]
//! ```
//!
//! Checkpoints saved before `remove_weight_norm` carry `weight_g`/`weight_v`
//! pairs; both layouts load.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, VarBuilder};
use candle_transformers::models::encodec;
use serde::{Deserialize, Serialize};

const LRELU_SLOPE: f64 = 0.1;

/// Vocoder configuration, read from `vocoder/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VocoderConfig {
    /// Residual block flavour: `"1"` (two convs per dilation) or `"2"`.
    pub resblock: String,
    /// Upsample rates; their product must equal `hop_size`.
    pub upsample_rates: Vec<usize>,
    pub upsample_kernel_sizes: Vec<usize>,
    pub upsample_initial_channel: usize,
    pub resblock_kernel_sizes: Vec<usize>,
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    pub num_mels: usize,
    pub n_fft: usize,
    pub hop_size: usize,
    pub win_size: usize,
    pub sampling_rate: u32,
    pub fmin: f64,
    pub fmax: Option<f64>,
}

impl Default for VocoderConfig {
    fn default() -> Self {
        Self {
            resblock: "1".to_string(),
            upsample_rates: vec![5, 4, 4, 2],
            upsample_kernel_sizes: vec![11, 8, 8, 4],
            upsample_initial_channel: 512,
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]],
            num_mels: 256,
            n_fft: 1024,
            hop_size: 160,
            win_size: 1024,
            sampling_rate: 16000,
            fmin: 0.0,
            fmax: Some(8000.0),
        }
    }
}

impl VocoderConfig {
    /// Read `vocoder/config.json`.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.verify()?;
        Ok(config)
    }

    /// Verify that upsample rates multiply to the hop length, that every
    /// upsample kernel covers its rate, that the STFT hop fits in `n_fft`,
    /// and that the per-stage and per-kernel lists line up.
    pub fn verify(&self) -> crate::Result<()> {
        let product: usize = self.upsample_rates.iter().product();
        if product != self.hop_size {
            return Err(crate::Error::Config(format!(
                "upsample_rates product is {product}, expected {} (hop_size)",
                self.hop_size
            )));
        }
        if self.upsample_rates.len() != self.upsample_kernel_sizes.len() {
            return Err(crate::Error::Config(format!(
                "{} upsample rates but {} upsample kernel sizes",
                self.upsample_rates.len(),
                self.upsample_kernel_sizes.len()
            )));
        }
        for (&rate, &kernel) in self.upsample_rates.iter().zip(&self.upsample_kernel_sizes) {
            if rate == 0 || kernel < rate {
                return Err(crate::Error::Config(format!(
                    "upsample kernel {kernel} cannot upsample by rate {rate}"
                )));
            }
        }
        if self.hop_size == 0 || self.hop_size > self.n_fft || self.win_size == 0 {
            return Err(crate::Error::Config(format!(
                "STFT needs 0 < hop_size <= n_fft and a non-empty window, got hop {}, n_fft {}, win {}",
                self.hop_size, self.n_fft, self.win_size
            )));
        }
        if self.resblock_kernel_sizes.len() != self.resblock_dilation_sizes.len() {
            return Err(crate::Error::Config(format!(
                "{} resblock kernel sizes but {} dilation lists",
                self.resblock_kernel_sizes.len(),
                self.resblock_dilation_sizes.len()
            )));
        }
        if self.resblock != "1" && self.resblock != "2" {
            return Err(crate::Error::Config(format!(
                "unknown resblock type '{}'",
                self.resblock
            )));
        }
        if self.upsample_initial_channel >> self.upsample_rates.len() == 0 {
            return Err(crate::Error::Config(format!(
                "upsample_initial_channel {} too small for {} stages",
                self.upsample_initial_channel,
                self.upsample_rates.len()
            )));
        }
        Ok(())
    }

    /// Mel columns per second of audio.
    pub fn frames_per_second(&self) -> f64 {
        self.sampling_rate as f64 / self.hop_size as f64
    }
}

fn get_padding(kernel_size: usize, dilation: usize) -> usize {
    (kernel_size * dilation - dilation) / 2
}

fn conv1d(
    in_c: usize,
    out_c: usize,
    kernel_size: usize,
    cfg: Conv1dConfig,
    weight_norm: bool,
    vb: VarBuilder,
) -> Result<Conv1d> {
    if weight_norm {
        encodec::conv1d_weight_norm(in_c, out_c, kernel_size, cfg, vb)
    } else {
        candle_nn::conv1d(in_c, out_c, kernel_size, cfg, vb)
    }
}

fn conv_transpose1d(
    in_c: usize,
    out_c: usize,
    kernel_size: usize,
    cfg: ConvTranspose1dConfig,
    weight_norm: bool,
    vb: VarBuilder,
) -> Result<ConvTranspose1d> {
    if weight_norm {
        encodec::conv_transpose1d_weight_norm(in_c, out_c, kernel_size, true, cfg, vb)
    } else {
        candle_nn::conv_transpose1d(in_c, out_c, kernel_size, cfg, vb)
    }
}

// ---------------------------------------------------------------------------
// Residual blocks
// ---------------------------------------------------------------------------

/// Residual block with dilated convolutions.
///
/// Type "1" pairs each dilated conv with an undilated one; type "2" uses a
/// single dilated conv per residual.
#[derive(Debug, Clone)]
pub struct ResBlock {
    convs1: Vec<Conv1d>,
    convs2: Vec<Conv1d>,
}

impl ResBlock {
    pub fn new(
        channels: usize,
        kernel_size: usize,
        dilations: &[usize],
        paired: bool,
        weight_norm: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut convs1 = Vec::with_capacity(dilations.len());
        let mut convs2 = Vec::new();
        let vb1 = if paired { vb.pp("convs1") } else { vb.pp("convs") };
        for (i, &dilation) in dilations.iter().enumerate() {
            let cfg = Conv1dConfig {
                dilation,
                padding: get_padding(kernel_size, dilation),
                ..Default::default()
            };
            convs1.push(conv1d(channels, channels, kernel_size, cfg, weight_norm, vb1.pp(i))?);
            if paired {
                let cfg = Conv1dConfig {
                    padding: get_padding(kernel_size, 1),
                    ..Default::default()
                };
                convs2.push(conv1d(
                    channels,
                    channels,
                    kernel_size,
                    cfg,
                    weight_norm,
                    vb.pp("convs2").pp(i),
                )?);
            }
        }
        Ok(Self { convs1, convs2 })
    }
}

impl Module for ResBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (i, c1) in self.convs1.iter().enumerate() {
            let mut ys = candle_nn::ops::leaky_relu(&xs, LRELU_SLOPE)?.apply(c1)?;
            if let Some(c2) = self.convs2.get(i) {
                ys = candle_nn::ops::leaky_relu(&ys, LRELU_SLOPE)?.apply(c2)?;
            }
            xs = (ys + xs)?;
        }
        Ok(xs)
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// HiFi-GAN generator.
#[derive(Debug, Clone)]
pub struct HifiGan {
    conv_pre: Conv1d,
    ups: Vec<ConvTranspose1d>,
    /// `resblocks[stage][kernel]`
    resblocks: Vec<Vec<ResBlock>>,
    conv_post: Conv1d,
    sampling_rate: u32,
    hop_size: usize,
}

impl HifiGan {
    pub fn new(cfg: &VocoderConfig, vb: VarBuilder) -> crate::Result<Self> {
        cfg.verify()?;
        let weight_norm = vb.contains_tensor("conv_pre.weight_g");
        let paired = cfg.resblock == "1";
        let pad3 = Conv1dConfig {
            padding: 3,
            ..Default::default()
        };

        let conv_pre = conv1d(
            cfg.num_mels,
            cfg.upsample_initial_channel,
            7,
            pad3,
            weight_norm,
            vb.pp("conv_pre"),
        )?;

        let num_kernels = cfg.resblock_kernel_sizes.len();
        let mut ups = Vec::with_capacity(cfg.upsample_rates.len());
        let mut resblocks = Vec::with_capacity(cfg.upsample_rates.len());
        let mut channels = cfg.upsample_initial_channel;
        for (i, (&rate, &kernel)) in cfg
            .upsample_rates
            .iter()
            .zip(cfg.upsample_kernel_sizes.iter())
            .enumerate()
        {
            let out_c = channels / 2;
            let up_cfg = ConvTranspose1dConfig {
                stride: rate,
                padding: (kernel - rate) / 2,
                ..Default::default()
            };
            ups.push(conv_transpose1d(
                channels,
                out_c,
                kernel,
                up_cfg,
                weight_norm,
                vb.pp("ups").pp(i),
            )?);

            let mut stage = Vec::with_capacity(num_kernels);
            for (j, (&k, dilations)) in cfg
                .resblock_kernel_sizes
                .iter()
                .zip(cfg.resblock_dilation_sizes.iter())
                .enumerate()
            {
                stage.push(ResBlock::new(
                    out_c,
                    k,
                    dilations,
                    paired,
                    weight_norm,
                    vb.pp("resblocks").pp(i * num_kernels + j),
                )?);
            }
            resblocks.push(stage);
            channels = out_c;
        }

        let conv_post = conv1d(channels, 1, 7, pad3, weight_norm, vb.pp("conv_post"))?;

        Ok(Self {
            conv_pre,
            ups,
            resblocks,
            conv_post,
            sampling_rate: cfg.sampling_rate,
            hop_size: cfg.hop_size,
        })
    }

    /// Synthesize a waveform.
    ///
    /// Input: `[B, num_mels, T]`. Output: `[B, T × hop_size]` in `[-1, 1]`.
    pub fn decode(&self, mel: &Tensor) -> Result<Tensor> {
        let mut xs = mel.apply(&self.conv_pre)?;
        for (up, stage) in self.ups.iter().zip(self.resblocks.iter()) {
            xs = candle_nn::ops::leaky_relu(&xs, LRELU_SLOPE)?.apply(up)?;
            let mut acc: Option<Tensor> = None;
            for block in stage {
                let ys = xs.apply(block)?;
                acc = Some(match acc {
                    Some(a) => (a + ys)?,
                    None => ys,
                });
            }
            if let Some(acc) = acc {
                xs = (acc / stage.len() as f64)?;
            }
        }
        // PyTorch's default leaky_relu slope before conv_post.
        let xs = candle_nn::ops::leaky_relu(&xs, 0.01)?.apply(&self.conv_post)?;
        xs.tanh()?.squeeze(1)
    }
}

/// Anything that turns mel spectrograms into waveforms.
pub trait Vocoder {
    /// `[B, num_mels, T]` → `[B, samples]`.
    fn synthesize(&self, mel: &Tensor) -> Result<Tensor>;

    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Waveform samples per mel column.
    fn hop_size(&self) -> usize;
}

impl Vocoder for HifiGan {
    fn synthesize(&self, mel: &Tensor) -> Result<Tensor> {
        self.decode(mel)
    }

    fn sample_rate(&self) -> u32 {
        self.sampling_rate
    }

    fn hop_size(&self) -> usize {
        self.hop_size
    }
}

/// Convert generated audio latents to waveforms.
///
/// `[B, T, 1, N_mel, F]` is rearranged to a `[B, N_mel, T·F]` mel spectrogram,
/// divided by `audio_scale`, and synthesized. Returns one sample vector per
/// batch element.
pub fn get_wavs(
    vocoder: &dyn Vocoder,
    audio: &Tensor,
    audio_scale: f64,
) -> crate::Result<Vec<Vec<f32>>> {
    let (b, t, c, n, f) = audio.dims5()?;
    if c != 1 {
        return Err(crate::Error::Config(format!(
            "audio latents must have a single channel, got {c}"
        )));
    }
    // B T 1 N F -> B N T F -> B N (T F)
    let mel = audio
        .squeeze(2)?
        .permute((0, 2, 1, 3))?
        .contiguous()?
        .reshape((b, n, t * f))?;
    let mel = (mel / audio_scale)?;
    let wavs = vocoder.synthesize(&mel)?.to_dtype(candle_core::DType::F32)?;
    let mut out = Vec::with_capacity(b);
    for i in 0..b {
        out.push(wavs.get(i)?.to_vec1::<f32>()?);
    }
    Ok(out)
}
