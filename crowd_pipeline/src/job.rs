use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// One video to analyse. Validated on construction, read-only afterwards.
#[derive(Debug, Clone)]
pub struct VideoJob {
    source: PathBuf,
    output: PathBuf,
    frame_interval: NonZeroU32,
    confidence_threshold: f32,
}

impl VideoJob {
    pub fn new(
        source: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        frame_interval: u32,
        confidence_threshold: f32,
    ) -> Result<Self, PipelineError> {
        let frame_interval = NonZeroU32::new(frame_interval)
            .ok_or_else(|| PipelineError::InvalidJob("frame_interval must be >= 1".into()))?;
        let confidence_threshold = check_confidence(confidence_threshold)?;
        Ok(Self {
            source: source.into(),
            output: output.into(),
            frame_interval,
            confidence_threshold,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Requested output path; the encoder that opens may change its extension.
    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn frame_interval(&self) -> NonZeroU32 {
        self.frame_interval
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }
}

/// Accepts thresholds in `[0, 1]`.
pub fn check_confidence(confidence_threshold: f32) -> Result<f32, PipelineError> {
    if !(0.0..=1.0).contains(&confidence_threshold) {
        return Err(PipelineError::InvalidJob(format!(
            "confidence_threshold {confidence_threshold} is outside [0, 1]"
        )));
    }
    Ok(confidence_threshold)
}
