//! Sampled person detection over a video file.
//!
//! A [`Pipeline`] decodes a source frame by frame, runs the detector on every
//! `frame_interval`-th frame, carries the latest detections over the frames in
//! between, writes annotated frames through the first encoder that opens, and
//! finally tries to re-encode the result into a widely playable mp4.

pub mod aggregate;
pub mod codec;
pub mod error;
pub mod job;
pub mod media;
pub mod pipeline;
pub mod scheduler;
pub mod transcode;

pub use codec::{CodecCandidate, ExtensionRule, PixelLayout};
pub use error::PipelineError;
pub use job::VideoJob;
pub use media::{
    frame_rate_ratio, EncoderSettings, FrameSource, MediaBackend, SourceInfo, VideoWriter,
};
pub use pipeline::{JobReport, Pipeline, PipelineOptions};
pub use transcode::{TranscodeOutcome, Transcoder};
