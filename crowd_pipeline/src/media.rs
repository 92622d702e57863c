//! Decoder/encoder seams the pipeline drives.
//!
//! The pipeline owns whatever these hand out for exactly one job and drops
//! them before returning, so implementations release their handles in `Drop`
//! as well as in [`VideoWriter::close`].

use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::Serialize;

use crate::codec::CodecCandidate;

/// Stream properties known once a source is open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Frame count as reported by the container, may be an estimate.
    pub total_frames: u64,
}

/// Largest time base denominator the mpeg4 family of encoders accepts.
pub const MAX_TIME_BASE_DEN: i64 = 65535;

/// Frame rate as a `(num, den)` pair suitable for encoders and `ffmpeg -r`.
///
/// Integer and NTSC (`n * 1000 / 1001`) rates come out exact; anything else is
/// rounded to millihertz. Rates whose numerator would overflow the mpeg4
/// time base fall back to whole frames per second. `None` for non-positive
/// or non-finite input.
pub fn frame_rate_ratio(fps: f64) -> Option<(i32, i32)> {
    if !fps.is_finite() || fps <= 0.0 {
        return None;
    }
    let whole = (fps.round() as i64).max(1);
    if (fps - fps.round()).abs() < 1e-3 {
        return Some((whole.min(MAX_TIME_BASE_DEN) as i32, 1));
    }

    let ntsc = (fps * 1.001).round();
    if ntsc >= 1.0
        && (ntsc / 1.001 - fps).abs() < 1e-3
        && (ntsc as i64) * 1000 <= MAX_TIME_BASE_DEN
    {
        return Some((ntsc as i32 * 1000, 1001));
    }

    let millis = (fps * 1000.0).round() as i64;
    let divisor = gcd(millis, 1000);
    let (num, den) = (millis / divisor, 1000 / divisor);
    if num > MAX_TIME_BASE_DEN {
        return Some((whole.min(MAX_TIME_BASE_DEN) as i32, 1));
    }
    Some((num as i32, den as i32))
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

/// Sequential frame reader.
pub trait FrameSource {
    fn info(&self) -> SourceInfo;

    /// Next frame in decode order, `None` once the stream is exhausted.
    fn read(&mut self) -> anyhow::Result<Option<RgbImage>>;
}

/// Target of an encoder open attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub path: PathBuf,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// An opened encoder.
pub trait VideoWriter {
    /// Whether the underlying encoder accepted its configuration.
    fn is_open(&self) -> bool {
        true
    }

    /// Appends a frame, frames are encoded in call order.
    fn write(&mut self, frame: &RgbImage) -> anyhow::Result<()>;

    /// Flushes and releases the encoder. Calling it again is a no-op.
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Factory for the decoder and encoders of one media stack.
pub trait MediaBackend {
    fn open_source(&mut self, path: &Path) -> anyhow::Result<Box<dyn FrameSource>>;

    fn open_writer(
        &mut self,
        candidate: &CodecCandidate,
        settings: &EncoderSettings,
    ) -> anyhow::Result<Box<dyn VideoWriter>>;
}

impl<B: MediaBackend + ?Sized> MediaBackend for &mut B {
    fn open_source(&mut self, path: &Path) -> anyhow::Result<Box<dyn FrameSource>> {
        (**self).open_source(path)
    }

    fn open_writer(
        &mut self,
        candidate: &CodecCandidate,
        settings: &EncoderSettings,
    ) -> anyhow::Result<Box<dyn VideoWriter>> {
        (**self).open_writer(candidate, settings)
    }
}
