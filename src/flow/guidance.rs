//! Classifier-free guidance around the denoiser call.
//!
//! ```text
//! v = v_uncond + s * (v_cond - v_uncond)
//! ```
//!
//! Conditional and unconditional branches run as one batched forward pass:
//! the window is duplicated and the second half is labelled with the null
//! class. Guidance is applied to both modalities.

use candle_core::{DType, Tensor};

use crate::model::{Denoiser, Velocity};
use crate::Result;

/// Guidance settings for a class-conditional model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Guidance {
    /// Guidance scale `s`; `1.0` is plain conditional sampling.
    pub scale: f64,
    /// Label of the unconditional class (`num_classes`).
    pub null_label: u32,
}

impl Guidance {
    pub fn new(scale: f64, null_label: u32) -> Self {
        Self { scale, null_label }
    }

    /// Whether an unconditional pass is needed at all.
    pub fn is_active(&self) -> bool {
        (self.scale - 1.0).abs() > f64::EPSILON
    }
}

/// Run the denoiser with optional classifier-free guidance.
///
/// - no labels: unconditional forward
/// - labels without guidance, or scale 1: conditional forward
/// - otherwise: batched `[cond; uncond]` forward blended by the scale
pub fn guided_forward(
    denoiser: &dyn Denoiser,
    video: &Tensor,
    audio: &Tensor,
    t: &Tensor,
    labels: Option<&Tensor>,
    guidance: Option<&Guidance>,
) -> Result<Velocity> {
    let (labels, guidance) = match (labels, guidance) {
        (Some(labels), Some(guidance)) if guidance.is_active() => (labels, guidance),
        (labels, _) => return Ok(denoiser.forward(video, audio, t, labels)?),
    };

    let b = video.dim(0)?;
    let null = Tensor::full(guidance.null_label, (b,), labels.device())?;
    let labels = Tensor::cat(&[&labels.to_dtype(DType::U32)?, &null], 0)?;
    let video2 = Tensor::cat(&[video, video], 0)?;
    let audio2 = Tensor::cat(&[audio, audio], 0)?;
    let t2 = Tensor::cat(&[t, t], 0)?;

    let out = denoiser.forward(&video2, &audio2, &t2, Some(&labels))?;
    Ok(Velocity {
        video: blend(&out.video, b, guidance.scale)?,
        audio: blend(&out.audio, b, guidance.scale)?,
    })
}

/// Split `[cond; uncond]` along the batch and apply the guidance formula.
fn blend(both: &Tensor, b: usize, scale: f64) -> Result<Tensor> {
    let cond = both.narrow(0, 0, b)?;
    let uncond = both.narrow(0, b, b)?;
    let guided = (&uncond + ((&cond - &uncond)? * scale)?)?;
    Ok(guided)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::cell::RefCell;

    /// Predicts `label` everywhere (or -1 without labels) and records batch sizes.
    struct LabelEcho {
        batches: RefCell<Vec<usize>>,
    }

    impl LabelEcho {
        fn new() -> Self {
            Self {
                batches: RefCell::new(Vec::new()),
            }
        }

        fn fill(like: &Tensor, labels: Option<&Tensor>) -> candle_core::Result<Tensor> {
            let b = like.dim(0)?;
            let per_item = match labels {
                Some(l) => l.to_dtype(DType::F32)?,
                None => Tensor::full(-1f32, (b,), like.device())?,
            };
            let mut shape = vec![b];
            shape.extend(std::iter::repeat_n(1, like.rank() - 1));
            per_item.reshape(shape)?.broadcast_as(like.shape())?.contiguous()
        }
    }

    impl Denoiser for LabelEcho {
        fn forward(
            &self,
            video: &Tensor,
            audio: &Tensor,
            _t: &Tensor,
            labels: Option<&Tensor>,
        ) -> candle_core::Result<Velocity> {
            self.batches.borrow_mut().push(video.dim(0)?);
            Ok(Velocity {
                video: Self::fill(video, labels)?,
                audio: Self::fill(audio, labels)?,
            })
        }
    }

    fn inputs() -> (Tensor, Tensor, Tensor) {
        let dev = Device::Cpu;
        (
            Tensor::zeros((2, 3, 4, 2, 2), DType::F32, &dev).unwrap(),
            Tensor::zeros((2, 3, 1, 4, 10), DType::F32, &dev).unwrap(),
            Tensor::zeros((2, 3), DType::F32, &dev).unwrap(),
        )
    }

    fn first(t: &Tensor) -> f32 {
        t.flatten_all().unwrap().get(0).unwrap().to_scalar().unwrap()
    }

    #[test]
    fn unconditional_passes_no_labels() {
        let (v, a, t) = inputs();
        let model = LabelEcho::new();
        let out = guided_forward(&model, &v, &a, &t, None, Some(&Guidance::new(4.0, 10))).unwrap();
        assert_eq!(first(&out.video), -1.0);
        assert_eq!(*model.batches.borrow(), vec![2]);
    }

    #[test]
    fn scale_one_is_conditional_only() {
        let (v, a, t) = inputs();
        let labels = Tensor::new(&[3u32, 3], &Device::Cpu).unwrap();
        let model = LabelEcho::new();
        let out =
            guided_forward(&model, &v, &a, &t, Some(&labels), Some(&Guidance::new(1.0, 10))).unwrap();
        assert_eq!(first(&out.audio), 3.0);
        assert_eq!(*model.batches.borrow(), vec![2]);
    }

    #[test]
    fn guidance_blends_branches() {
        let (v, a, t) = inputs();
        let labels = Tensor::new(&[3u32, 3], &Device::Cpu).unwrap();
        let model = LabelEcho::new();
        let out =
            guided_forward(&model, &v, &a, &t, Some(&labels), Some(&Guidance::new(2.0, 10))).unwrap();
        // uncond = 10, cond = 3: 10 + 2 * (3 - 10) = -4
        assert_eq!(first(&out.video), -4.0);
        assert_eq!(first(&out.audio), -4.0);
        assert_eq!(out.video.dims(), v.dims());
        // One batched call over the doubled window.
        assert_eq!(*model.batches.borrow(), vec![4]);
    }
}
