//! Best-effort re-encode of the finished output into browser friendly h264.
//!
//! The external transcoder writes next to the original; only a successful,
//! non-empty result replaces it. Every other exit leaves the original file
//! alone and removes whatever the transcoder left behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

use crate::error::PipelineError;
use crate::media::frame_rate_ratio;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const STDERR_EXCERPT: usize = 500;

/// Result of the transcode step, which never fails a job.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TranscodeOutcome {
    /// No transcoder configured.
    Disabled,
    Skipped { reason: String },
    /// The output file now holds the re-encoded video.
    Replaced,
    /// The original output is kept.
    Failed { error: PipelineError },
}

/// Invocation of an external ffmpeg-compatible transcoder.
#[derive(Debug, Clone)]
pub struct Transcoder {
    program: PathBuf,
    timeout: Duration,
    preset: String,
    crf: u8,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl Transcoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TIMEOUT,
            preset: "medium".to_string(),
            crf: 23,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    pub fn with_crf(mut self, crf: u8) -> Self {
        self.crf = crf;
        self
    }

    /// Only mp4 outputs are re-encoded.
    pub fn applies_to(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp4"))
    }

    /// `dir/name.mp4` -> `dir/name_h264.mp4`
    pub fn temp_path_for(path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{stem}_h264.mp4"))
    }

    pub fn build_args(
        &self,
        input: &Path,
        output: &Path,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.preset.clone(),
            "-crf".to_string(),
            self.crf.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ];
        if let Some((num, den)) = frame_rate_ratio(fps) {
            args.push("-r".to_string());
            args.push(if den == 1 {
                num.to_string()
            } else {
                format!("{num}/{den}")
            });
        }
        // yuv420p needs even dimensions
        let (even_w, even_h) = (width & !1, height & !1);
        if even_w > 0 && even_h > 0 {
            args.push("-s".to_string());
            args.push(format!("{even_w}x{even_h}"));
        }
        args.push(output.to_string_lossy().to_string());
        args
    }

    /// Re-encodes `path` in place, blocking the calling thread for at most
    /// the configured timeout (plus process startup).
    ///
    /// Safe to call from inside a tokio runtime: the subprocess is then
    /// driven from a scoped helper thread.
    pub fn transcode(
        &self,
        path: &Path,
        fps: f64,
        width: u32,
        height: u32,
    ) -> Result<(), PipelineError> {
        let block_on = || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| PipelineError::transcode_failure(format!("runtime: {e}")))?;
            runtime.block_on(self.run(path, fps, width, height))
        };

        if tokio::runtime::Handle::try_current().is_err() {
            return block_on();
        }
        // a thread that is already driving a runtime cannot block on another
        std::thread::scope(|scope| {
            scope
                .spawn(block_on)
                .join()
                .map_err(|_| PipelineError::transcode_failure("transcode thread panicked"))?
        })
    }

    async fn run(&self, path: &Path, fps: f64, width: u32, height: u32) -> Result<(), PipelineError> {
        let program = which::which(&self.program).map_err(|_| {
            PipelineError::transcode_failure(format!("transcoder {:?} not found", self.program))
        })?;

        let temp = PartialOutput::new(Self::temp_path_for(path));
        let args = self.build_args(path, temp.path(), fps, width, height);
        log::info!("Re-encoding {path:?} to h264");
        log::debug!("Running {program:?} {}", args.join(" "));

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::transcode_failure(format!("spawn {program:?}: {e}")))?;

        // on timeout the child future is dropped, which kills the process
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| PipelineError::transcode_failure(format!("wait: {e}")))?
            }
            Err(_) => {
                return Err(PipelineError::transcode_failure(format!(
                    "timed out after {} seconds",
                    self.timeout.as_secs_f64()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(PipelineError::transcode_failure(format!(
                "{} ({excerpt})",
                output.status
            )));
        }

        let size = tokio::fs::metadata(temp.path())
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if size == 0 {
            return Err(PipelineError::transcode_failure("transcoder produced no output"));
        }

        tokio::fs::rename(temp.path(), path)
            .await
            .map_err(|e| PipelineError::transcode_failure(format!("replace {path:?}: {e}")))?;
        temp.persist();
        log::info!("Video re-encoded to h264: {path:?} ({size} bytes)");
        Ok(())
    }
}

/// Temporary transcoder output, deleted on drop unless persisted.
struct PartialOutput {
    path: PathBuf,
    keep: bool,
}

impl PartialOutput {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persist(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed partial transcode output {:?}", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove {:?}: {e}", self.path),
        }
    }
}
