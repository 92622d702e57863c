//! Output codec negotiation.
//!
//! Which encoders exist depends on how the media libraries were built, so
//! the writer is opened by walking an ordered candidate list and keeping the
//! first one that opens.

use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::media::{EncoderSettings, MediaBackend, VideoWriter};

/// Pixel layout an encoder expects its input converted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Yuv420p,
    /// Full range yuv, required by mjpeg.
    Yuvj420p,
}

/// How a candidate constrains the output file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionRule {
    Keep,
    /// The container this encoder is paired with needs this extension.
    Require(&'static str),
}

impl ExtensionRule {
    pub fn apply(&self, path: &Path) -> PathBuf {
        match self {
            Self::Keep => path.to_path_buf(),
            Self::Require(ext) => {
                let matches = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(ext));
                if matches {
                    path.to_path_buf()
                } else {
                    path.with_extension(ext)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecCandidate {
    /// Short tag used in logs and reports, e.g. `mp4v`.
    pub fourcc: &'static str,
    /// Encoder name as the media library knows it, e.g. `mpeg4`.
    pub encoder: &'static str,
    pub pixel_layout: PixelLayout,
    pub extension: ExtensionRule,
}

impl CodecCandidate {
    pub const fn new(
        fourcc: &'static str,
        encoder: &'static str,
        pixel_layout: PixelLayout,
        extension: ExtensionRule,
    ) -> Self {
        Self {
            fourcc,
            encoder,
            pixel_layout,
            extension,
        }
    }
}

/// Most compatible first: the built-in mpeg4 and mjpeg encoders need no
/// external libraries, h264 ones usually do.
pub const DEFAULT_CANDIDATES: &[CodecCandidate] = &[
    CodecCandidate::new("mp4v", "mpeg4", PixelLayout::Yuv420p, ExtensionRule::Keep),
    CodecCandidate::new("XVID", "libxvid", PixelLayout::Yuv420p, ExtensionRule::Keep),
    CodecCandidate::new("MJPG", "mjpeg", PixelLayout::Yuvj420p, ExtensionRule::Require("avi")),
    CodecCandidate::new("avc1", "libx264", PixelLayout::Yuv420p, ExtensionRule::Keep),
    CodecCandidate::new("H264", "h264", PixelLayout::Yuv420p, ExtensionRule::Keep),
];

/// Looks a default candidate up by fourcc, case-insensitively.
pub fn candidate_by_fourcc(fourcc: &str) -> Option<CodecCandidate> {
    DEFAULT_CANDIDATES
        .iter()
        .find(|c| c.fourcc.eq_ignore_ascii_case(fourcc))
        .copied()
}

/// The default candidates with `fourcc` moved to the front.
pub fn preferring(fourcc: &str) -> Option<Vec<CodecCandidate>> {
    let first = candidate_by_fourcc(fourcc)?;
    let mut candidates = vec![first];
    candidates.extend(DEFAULT_CANDIDATES.iter().filter(|c| c.fourcc != first.fourcc));
    Some(candidates)
}

/// The writer that won the negotiation.
pub struct NegotiatedWriter {
    pub writer: Box<dyn VideoWriter>,
    pub candidate: CodecCandidate,
    /// `path` after the winning candidate's extension rule.
    pub output_path: PathBuf,
}

impl std::fmt::Debug for NegotiatedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedWriter")
            .field("candidate", &self.candidate)
            .field("output_path", &self.output_path)
            .finish_non_exhaustive()
    }
}

/// Opens the first candidate that reports itself open.
///
/// Candidates after the winner are never tried. A file created by a failed
/// attempt is removed again, files that existed beforehand are left alone.
pub fn negotiate(
    backend: &mut dyn MediaBackend,
    candidates: &[CodecCandidate],
    path: &Path,
    fps: f64,
    width: u32,
    height: u32,
) -> Result<NegotiatedWriter, PipelineError> {
    let mut attempts = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let settings = EncoderSettings {
            path: candidate.extension.apply(path),
            fps,
            width,
            height,
        };
        let existed_before = settings.path.exists();
        log::debug!(
            "Trying codec {} ({}) for {:?}",
            candidate.fourcc,
            candidate.encoder,
            settings.path
        );

        let failure = match backend.open_writer(candidate, &settings) {
            Ok(writer) if writer.is_open() => {
                log::info!(
                    "Video writer initialized with codec {} -> {:?}",
                    candidate.fourcc,
                    settings.path
                );
                return Ok(NegotiatedWriter {
                    writer,
                    candidate: *candidate,
                    output_path: settings.path,
                });
            }
            Ok(mut writer) => {
                if let Err(e) = writer.close() {
                    log::debug!("Closing unopened {} writer: {e:#}", candidate.fourcc);
                }
                "encoder did not open".to_string()
            }
            Err(e) => format!("{e:#}"),
        };

        log::warn!("Codec {} unavailable: {failure}", candidate.fourcc);
        attempts.push(format!("{}: {failure}", candidate.fourcc));
        if !existed_before {
            remove_leftover(&settings.path);
        }
    }

    Err(PipelineError::NoUsableEncoder {
        path: path.to_path_buf(),
        attempts,
    })
}

fn remove_leftover(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("Removed leftover {path:?}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove leftover {path:?}: {e}"),
    }
}
