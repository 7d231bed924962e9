//! Writing generated samples to disk.
//!
//! ```text
//! <results>/samples/
//!     audio/sample_0.wav
//!     video/sample_0/frame_0000.png   (png frames)
//!     video/sample_0.gif              (gif)
//! ```
//!
//! Audio-to-video runs write to `samples-a2v/` instead.

use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};

use crate::audio::write_wav;
use crate::Result;

/// Container for generated video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum VideoFormat {
    /// One PNG per frame in a directory named after the sample.
    #[default]
    Png,
    /// A single looping animated GIF.
    Gif,
}

/// Which driver produced the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Joint,
    AudioToVideo,
}

impl SampleKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            SampleKind::Joint => "samples",
            SampleKind::AudioToVideo => "samples-a2v",
        }
    }
}

/// Output directory tree for one sampling run.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    format: VideoFormat,
    fps: f64,
}

impl OutputLayout {
    /// Create `<results_dir>/<kind>/{audio,video}`.
    pub fn create(
        results_dir: impl AsRef<Path>,
        kind: SampleKind,
        format: VideoFormat,
        fps: f64,
    ) -> Result<Self> {
        let root = results_dir.as_ref().join(kind.dir_name());
        std::fs::create_dir_all(root.join("audio"))?;
        std::fs::create_dir_all(root.join("video"))?;
        tracing::info!(dir = %root.display(), ?format, "writing samples");
        Ok(Self { root, format, fps })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audio_path(&self, name: &str) -> PathBuf {
        self.root.join("audio").join(format!("{name}.wav"))
    }

    pub fn video_path(&self, name: &str) -> PathBuf {
        match self.format {
            VideoFormat::Png => self.root.join("video").join(name),
            VideoFormat::Gif => self.root.join("video").join(format!("{name}.gif")),
        }
    }

    /// Write one sample: `video` is `[T, 3, H, W]` in `[0, 1]`.
    pub fn save_multimodal(
        &self,
        video: &Tensor,
        wav: &[f32],
        sample_rate: u32,
        name: &str,
    ) -> Result<()> {
        let (frames, width, height) = video_to_rgb(video)?;
        let video_path = self.video_path(name);
        match self.format {
            VideoFormat::Png => write_png_frames(&video_path, &frames, width, height)?,
            VideoFormat::Gif => write_gif(&video_path, &frames, width, height, self.fps)?,
        }
        write_wav(self.audio_path(name), wav, sample_rate, 1)?;
        tracing::debug!(name, frames = frames.len(), "sample saved");
        Ok(())
    }
}

/// Name of sample `j` of batch `i`.
pub fn sample_name(batch: usize, batch_size: usize, index: usize) -> String {
    format!("sample_{}", batch * batch_size + index)
}

/// `[T, 3, H, W]` floats in `[0, 1]` to interleaved RGB8 frames.
fn video_to_rgb(video: &Tensor) -> Result<(Vec<Vec<u8>>, u32, u32)> {
    let (t, _c, h, w) = video.dims4()?;
    let bytes = (video.to_dtype(DType::F32)? * 255.0)?
        .round()?
        .clamp(0f32, 255f32)?
        .permute((0, 2, 3, 1))?
        .to_dtype(DType::U8)?;
    let mut frames = Vec::with_capacity(t);
    for i in 0..t {
        frames.push(bytes.get(i)?.flatten_all()?.to_vec1::<u8>()?);
    }
    Ok((frames, w as u32, h as u32))
}

fn write_png_frames(dir: &Path, frames: &[Vec<u8>], width: u32, height: u32) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    for (i, data) in frames.iter().enumerate() {
        let path = dir.join(format!("frame_{i:04}.png"));
        image::save_buffer(&path, data, width, height, image::ColorType::Rgb8)?;
    }
    Ok(())
}

fn write_gif(path: &Path, frames: &[Vec<u8>], width: u32, height: u32, fps: f64) -> Result<()> {
    use gif::{Encoder, Frame, Repeat};

    let mut file = File::create(path)?;
    let mut encoder = Encoder::new(&mut file, width as u16, height as u16, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;
    // GIF delays are in hundredths of a second.
    let delay = (100.0 / fps.max(1.0)).round() as u16;
    for data in frames {
        let mut frame = Frame::from_rgb_speed(width as u16, height as u16, data, 10);
        frame.delay = delay;
        encoder.write_frame(&frame)?;
    }
    Ok(())
}
