use std::path::PathBuf;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Failure kinds of a pipeline run.
///
/// `InvalidJob`, `SourceUnreadable` without a frame index and
/// `NoUsableEncoder` mean nothing was produced. The rest are reported
/// alongside a (possibly partial) result.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("source {path:?} unreadable{}: {reason}", at_frame(.frame_index))]
    SourceUnreadable {
        path: PathBuf,
        /// Set when decoding broke after the source was opened.
        frame_index: Option<u64>,
        reason: String,
    },

    #[error("no usable encoder for {path:?}, tried: {}", .attempts.join("; "))]
    NoUsableEncoder { path: PathBuf, attempts: Vec<String> },

    #[error("writing output failed{}: {reason}", at_frame(.frame_index))]
    WriteFailed {
        frame_index: Option<u64>,
        reason: String,
    },

    #[error("detector failed at frame {frame_index}: {reason}")]
    DetectorFailure { frame_index: u64, reason: String },

    #[error("transcode failed: {reason}")]
    TranscodeFailure { reason: String },
}

fn at_frame(frame_index: &Option<u64>) -> String {
    frame_index
        .map(|i| format!(" at frame {i}"))
        .unwrap_or_default()
}

impl PipelineError {
    pub fn source_unreadable(
        path: impl Into<PathBuf>,
        frame_index: Option<u64>,
        reason: &anyhow::Error,
    ) -> Self {
        Self::SourceUnreadable {
            path: path.into(),
            frame_index,
            reason: format!("{reason:#}"),
        }
    }

    pub fn write_failed(frame_index: Option<u64>, reason: &anyhow::Error) -> Self {
        Self::WriteFailed {
            frame_index,
            reason: format!("{reason:#}"),
        }
    }

    pub fn detector_failure(frame_index: u64, reason: &anyhow::Error) -> Self {
        Self::DetectorFailure {
            frame_index,
            reason: format!("{reason:#}"),
        }
    }

    pub fn transcode_failure(reason: impl Into<String>) -> Self {
        Self::TranscodeFailure {
            reason: reason.into(),
        }
    }

    /// Pipeline stage the error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidJob(_) => "job",
            Self::SourceUnreadable { .. } => "decode",
            Self::NoUsableEncoder { .. } => "codec",
            Self::WriteFailed { .. } => "encode",
            Self::DetectorFailure { .. } => "detect",
            Self::TranscodeFailure { .. } => "transcode",
        }
    }

    /// Frame the error is tied to, if any.
    pub fn frame_index(&self) -> Option<u64> {
        match self {
            Self::SourceUnreadable { frame_index, .. } | Self::WriteFailed { frame_index, .. } => {
                *frame_index
            }
            Self::DetectorFailure { frame_index, .. } => Some(*frame_index),
            _ => None,
        }
    }
}

impl Serialize for PipelineError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
