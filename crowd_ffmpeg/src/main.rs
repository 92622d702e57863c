extern crate ffmpeg_next as ffmpeg;

mod backend;
mod process_image;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crowd_pipeline::codec::{self, DEFAULT_CANDIDATES};
use crowd_pipeline::job::check_confidence;
use crowd_pipeline::{CodecCandidate, JobReport, Pipeline, PipelineOptions, Transcoder, VideoJob};
use inference_common::annotate::Annotator;
use ort::execution_providers::CPUExecutionProvider;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::builder::SessionBuilder;
use ort_common::{YoloParams, YoloV8};
use tracing_subscriber::prelude::*;

use crate::backend::FfmpegBackend;

#[derive(Debug, Parser)]
pub struct Args {
    /// Path to input video, or an image (.jpg/.jpeg/.png) for a single detection.
    #[arg(env = "CROWD_INPUT")]
    input: PathBuf,
    /// Annotated output video. Defaults to `<input stem>.out.mp4` next to the input.
    #[arg(long, short, env = "CROWD_OUTPUT")]
    output: Option<PathBuf>,
    /// Yolov8 onnx model file to use.
    #[arg(long, short, env = "CROWD_MODEL", default_value = "_models/yolov8n.onnx")]
    model: PathBuf,
    /// Whether to attempt to use `cuda` hw acceleration.
    /// This may silently fail and fallback to cpu acceleration presently.
    #[arg(long, action, env = "CROWD_CUDA", default_value = "false")]
    cuda: bool,
    /// Run the detector on every n-th frame, the frames in between reuse its results.
    #[arg(long, env = "CROWD_FRAME_INTERVAL", default_value_t = 5)]
    frame_interval: u32,
    /// Minimum detection confidence, in [0, 1].
    #[arg(long, env = "CROWD_CONFIDENCE", default_value_t = 0.25)]
    confidence: f32,
    /// Deadline for the h264 re-encode.
    #[arg(long, env = "CROWD_TRANSCODE_TIMEOUT_SECS", default_value_t = 300)]
    transcode_timeout_secs: u64,
    /// Try this encoder first (mp4v, XVID, MJPG, avc1 or H264), then the usual fallbacks.
    #[arg(long, env = "CROWD_CODEC")]
    codec: Option<String>,
    /// x264 preset of the h264 re-encode.
    #[arg(long, env = "CROWD_TRANSCODE_PRESET", default_value = "medium")]
    transcode_preset: String,
    /// x264 constant rate factor of the h264 re-encode.
    #[arg(
        long,
        env = "CROWD_TRANSCODE_CRF",
        default_value_t = 23,
        value_parser = clap::value_parser!(u8).range(0..=51)
    )]
    transcode_crf: u8,
    /// Keep the first-pass output as is, without the h264 re-encode.
    #[arg(long, action, env = "CROWD_NO_TRANSCODE", default_value = "false")]
    no_transcode: bool,
    /// Program used for the h264 re-encode.
    #[arg(long, env = "CROWD_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,
    /// TrueType font for the box labels. Common system fonts are tried otherwise.
    #[arg(long, env = "CROWD_FONT")]
    font: Option<PathBuf>,
    /// Where to write the json report. Defaults to `<output>.json`.
    #[arg(long, env = "CROWD_REPORT")]
    report: Option<PathBuf>,
}

impl Args {
    fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let stem = self
                .input
                .file_stem()
                .map(|s| s.to_string_lossy())
                .unwrap_or_else(|| "output".into());
            self.input.with_file_name(format!("{stem}.out.mp4"))
        })
    }

    fn transcoder(&self) -> Option<Transcoder> {
        (!self.no_transcode).then(|| {
            Transcoder::new(&self.ffmpeg)
                .with_timeout(Duration::from_secs(self.transcode_timeout_secs))
                .with_preset(&self.transcode_preset)
                .with_crf(self.transcode_crf)
        })
    }

    fn candidates(&self) -> anyhow::Result<Vec<CodecCandidate>> {
        match &self.codec {
            Some(fourcc) => codec::preferring(fourcc)
                .with_context(|| format!("Unknown codec {fourcc:?}")),
            None => Ok(DEFAULT_CANDIDATES.to_vec()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,crowd_ffmpeg=info,crowd_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    // image mode bypasses VideoJob, so validate up front for both paths
    let confidence = check_confidence(args.confidence)?;
    let candidates = args.candidates()?;

    // Load model into ort.
    let (ep, ep_name) = if args.cuda {
        (CUDAExecutionProvider::default().build(), "cuda")
    } else {
        (CPUExecutionProvider::default().build(), "cpu")
    };

    ort::init().with_execution_providers([ep]).commit()?;

    let session = SessionBuilder::new()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(&args.model)
        .with_context(|| format!("Failed to load model {:?}", args.model))?;
    log::debug!("{session:?}");

    log::info!(
        "Prepared ort {ep_name} session with model: {:?}",
        args.model
    );
    let mut detector = YoloV8::new(session, YoloParams::default());

    let annotator = match &args.font {
        Some(font) => Annotator::from_font_file(font)?,
        None => Annotator::with_system_font(),
    };

    match args.input.extension().and_then(|os_str| os_str.to_str()) {
        Some("jpeg" | "jpg" | "png") => {
            let report = process_image::process_image(
                &args.input,
                &mut detector,
                &annotator,
                confidence,
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => process_video(&args, candidates, detector, annotator)?,
    }

    Ok(())
}

fn process_video(
    args: &Args,
    candidates: Vec<CodecCandidate>,
    detector: YoloV8,
    annotator: Annotator,
) -> anyhow::Result<()> {
    ffmpeg::init().context("Initialize ffmpeg")?;

    let job = VideoJob::new(
        &args.input,
        args.output_path(),
        args.frame_interval,
        args.confidence,
    )?;
    let _span = tracing::info_span!("job", input = ?job.source()).entered();

    let options = PipelineOptions {
        candidates,
        transcoder: args.transcoder(),
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(FfmpegBackend, detector, annotator, options);
    let report = pipeline.run(&job)?;

    let report_path = args.report.clone().unwrap_or_else(|| {
        let mut name = report.result.output_path.clone().into_os_string();
        name.push(".json");
        PathBuf::from(name)
    });
    write_report(&report_path, &report)?;

    if let Some(err) = &report.aborted {
        log::warn!("Job stopped early ({} stage): {err}", err.stage());
    }
    for failure in &report.detector_failures {
        log::warn!("{failure}");
    }
    println!(
        "{:?}: {} frames, {} analysed, avg {:.2} people, avg density {:.2}%, report {:?}",
        report.result.output_path,
        report.frames_written,
        report.result.processed_frames,
        report.result.average_person_count,
        report.result.average_density,
        report_path
    );

    if report.is_partial() {
        anyhow::bail!("Output {:?} is incomplete", report.result.output_path);
    }
    Ok(())
}

fn write_report(path: &Path, report: &JobReport) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create report {path:?}"))?;
    serde_json::to_writer_pretty(file, report)?;
    log::info!("Saved report to {path:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let argv = ["crowd_ffmpeg", "clips/walk.mp4"].iter().chain(extra).copied();
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_paths() {
        let args = args(&[]);
        assert_eq!(args.output_path(), Path::new("clips/walk.out.mp4"));
        assert_eq!(args.frame_interval, 5);
        assert!(args.transcoder().is_some());
        assert_eq!(args.candidates().unwrap(), DEFAULT_CANDIDATES);
    }

    #[test]
    fn test_confidence_outside_unit_range_is_rejected() {
        assert!(check_confidence(args(&["--confidence", "1.5"]).confidence).is_err());
        assert!(check_confidence(args(&["--confidence=-0.1"]).confidence).is_err());
        assert!(check_confidence(args(&["--confidence", "0.4"]).confidence).is_ok());
    }

    #[test]
    fn test_codec_flag_reorders_candidates() {
        let candidates = args(&["--codec", "avc1"]).candidates().unwrap();
        assert_eq!(candidates[0].encoder, "libx264");
        assert_eq!(candidates.len(), DEFAULT_CANDIDATES.len());
        assert!(args(&["--codec", "vp9"]).candidates().is_err());
    }

    #[test]
    fn test_transcode_flags() {
        assert!(args(&["--no-transcode"]).transcoder().is_none());
        assert!(Args::try_parse_from(["crowd_ffmpeg", "a.mp4", "--transcode-crf", "60"]).is_err());
        let transcoder = args(&["--transcode-preset", "fast", "--transcode-crf", "28"])
            .transcoder()
            .unwrap();
        let flags = transcoder
            .build_args(Path::new("a.mp4"), Path::new("a_h264.mp4"), 25.0, 64, 48)
            .join(" ");
        assert!(flags.contains("-preset fast -crf 28"));
    }
}
