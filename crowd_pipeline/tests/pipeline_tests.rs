use std::cell::RefCell;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crowd_pipeline::codec::DEFAULT_CANDIDATES;
use crowd_pipeline::{
    CodecCandidate, EncoderSettings, FrameSource, MediaBackend, Pipeline, PipelineError,
    PipelineOptions, SourceInfo, TranscodeOutcome, Transcoder, VideoJob, VideoWriter,
};
use image::{Rgb, RgbImage};
use inference_common::annotate::{Annotator, BOX_COLOR};
use inference_common::bbox::{Bbox, Detection};
use inference_common::detector::PersonDetector;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

/// What the synthetic backend observed, shared with the test body.
#[derive(Default)]
struct Recorded {
    written: Vec<RgbImage>,
    writers_opened: usize,
    writer_closes: usize,
    source_dropped: bool,
    tried: Vec<&'static str>,
}

#[derive(Default)]
struct Plan {
    frames: u64,
    fps: f64,
    open_fails: bool,
    decode_error_at: Option<u64>,
    broken_codecs: Vec<&'static str>,
    write_error_at: Option<usize>,
}

struct SyntheticBackend {
    plan: Plan,
    recorded: Rc<RefCell<Recorded>>,
}

impl SyntheticBackend {
    fn new(plan: Plan) -> Self {
        Self {
            plan,
            recorded: Rc::default(),
        }
    }

    fn recorded(&self) -> std::cell::Ref<'_, Recorded> {
        self.recorded.borrow()
    }
}

struct SyntheticSource {
    info: SourceInfo,
    produced: u64,
    decode_error_at: Option<u64>,
    recorded: Rc<RefCell<Recorded>>,
}

impl FrameSource for SyntheticSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read(&mut self) -> anyhow::Result<Option<RgbImage>> {
        if self.decode_error_at == Some(self.produced + 1) {
            anyhow::bail!("corrupt packet");
        }
        if self.produced == self.info.total_frames {
            return Ok(None);
        }
        self.produced += 1;
        Ok(Some(RgbImage::new(WIDTH, HEIGHT)))
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.recorded.borrow_mut().source_dropped = true;
    }
}

struct FileWriter {
    file: Option<std::fs::File>,
    write_error_at: Option<usize>,
    recorded: Rc<RefCell<Recorded>>,
}

impl VideoWriter for FileWriter {
    fn write(&mut self, frame: &RgbImage) -> anyhow::Result<()> {
        let mut recorded = self.recorded.borrow_mut();
        if self.write_error_at == Some(recorded.written.len() + 1) {
            anyhow::bail!("No space left on device");
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("writer closed"))?;
        file.write_all(&frame.as_raw()[..16])?;
        recorded.written.push(frame.clone());
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            self.recorded.borrow_mut().writer_closes += 1;
        }
        Ok(())
    }
}

impl MediaBackend for SyntheticBackend {
    fn open_source(&mut self, path: &Path) -> anyhow::Result<Box<dyn FrameSource>> {
        if self.plan.open_fails {
            anyhow::bail!("could not open {path:?}");
        }
        Ok(Box::new(SyntheticSource {
            info: SourceInfo {
                fps: self.plan.fps,
                width: WIDTH,
                height: HEIGHT,
                total_frames: self.plan.frames,
            },
            produced: 0,
            decode_error_at: self.plan.decode_error_at,
            recorded: Rc::clone(&self.recorded),
        }))
    }

    fn open_writer(
        &mut self,
        candidate: &CodecCandidate,
        settings: &EncoderSettings,
    ) -> anyhow::Result<Box<dyn VideoWriter>> {
        self.recorded.borrow_mut().tried.push(candidate.fourcc);
        if self.plan.broken_codecs.contains(&candidate.fourcc) {
            anyhow::bail!("encoder {} not available", candidate.encoder);
        }
        let file = std::fs::File::create(&settings.path)?;
        self.recorded.borrow_mut().writers_opened += 1;
        Ok(Box::new(FileWriter {
            file: Some(file),
            write_error_at: self.plan.write_error_at,
            recorded: Rc::clone(&self.recorded),
        }))
    }
}

/// One person at a fixed spot on every call.
#[derive(Default)]
struct OneBox {
    calls: usize,
}

impl PersonDetector for OneBox {
    fn detect(
        &mut self,
        _frame: &RgbImage,
        confidence_threshold: f32,
        _classes: &[usize],
    ) -> anyhow::Result<Vec<Detection>> {
        self.calls += 1;
        let hit = Detection::person(Bbox::new(10.0, 10.0, 30.0, 30.0), 0.9);
        Ok([hit]
            .into_iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .collect())
    }
}

/// Call `c` (1-based) puts a narrow box with its left edge at `x = 4c`.
#[derive(Default)]
struct Marching {
    calls: usize,
    fail_on_call: Option<usize>,
}

fn marching_x(call: usize) -> u32 {
    4 * call as u32
}

impl PersonDetector for Marching {
    fn detect(
        &mut self,
        _frame: &RgbImage,
        _confidence_threshold: f32,
        _classes: &[usize],
    ) -> anyhow::Result<Vec<Detection>> {
        self.calls += 1;
        if self.fail_on_call == Some(self.calls) {
            anyhow::bail!("model crashed");
        }
        let x = marching_x(self.calls) as f32;
        Ok(vec![Detection::person(Bbox::new(x, 5.0, x + 2.0, 20.0), 0.8)])
    }
}

fn no_transcode() -> PipelineOptions {
    PipelineOptions {
        transcoder: None,
        ..Default::default()
    }
}

fn job_in(dir: &Path, interval: u32) -> VideoJob {
    VideoJob::new(dir.join("in.mp4"), dir.join("out.mp4"), interval, 0.25).unwrap()
}

fn has_box_at(frame: &RgbImage, x: u32, y: u32) -> bool {
    *frame.get_pixel(x, y) == BOX_COLOR
}

fn has_any_box(frame: &RgbImage) -> bool {
    frame.pixels().any(|p| *p == BOX_COLOR)
}

#[test]
fn test_hundred_frames_every_fifth_sampled() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 100,
        fps: 10.0,
        ..Default::default()
    });
    let mut detector = OneBox::default();
    let mut pipeline = Pipeline::new(&mut backend, &mut detector, Annotator::new(None), no_transcode());

    let report = pipeline.run(&job_in(dir.path(), 5)).unwrap();
    drop(pipeline);

    assert_eq!(report.result.total_frames, 100);
    assert_eq!(report.result.processed_frames, 20);
    assert_eq!(report.result.average_person_count, 1.0);
    assert_eq!(report.result.output_path, dir.path().join("out.mp4"));
    assert!(report.result.output_exists);
    assert_eq!(report.frames_read, 100);
    assert_eq!(report.frames_written, 100);
    assert_eq!(report.codec, "mp4v");
    assert!(!report.is_partial());
    assert!(matches!(report.transcode, TranscodeOutcome::Disabled));
    assert_eq!(detector.calls, 20);

    let anchors: Vec<u64> = report.frame_results.iter().map(|r| r.frame_index).collect();
    assert_eq!(anchors, (1..=20).map(|k| k * 5).collect::<Vec<_>>());
    assert!((report.frame_results[0].timestamp - 0.5).abs() < 1e-9);

    let recorded = backend.recorded();
    assert_eq!(recorded.written.len(), 100);
    for (i, frame) in recorded.written.iter().enumerate() {
        let index = i + 1;
        // nothing has been detected before the first anchor
        assert_eq!(has_box_at(frame, 10, 10), index >= 5, "frame {index}");
    }
    assert_eq!(recorded.writer_closes, 1);
    assert!(recorded.source_dropped);
}

#[test]
fn test_empty_source() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 0,
        fps: 25.0,
        ..Default::default()
    });
    let options = PipelineOptions {
        transcoder: Some(Transcoder::new(dir.path().join("ffmpeg-missing"))),
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(&mut backend, OneBox::default(), Annotator::new(None), options);

    let report = pipeline.run(&job_in(dir.path(), 5)).unwrap();

    assert_eq!(report.result.total_frames, 0);
    assert_eq!(report.result.processed_frames, 0);
    assert_eq!(report.result.average_person_count, 0.0);
    assert_eq!(report.result.average_density, 0.0);
    assert!(report.aborted.is_none());
    assert!(report.detector_failures.is_empty());
    assert!(matches!(report.transcode, TranscodeOutcome::Skipped { .. }));
}

#[test]
fn test_result_count_is_floor_of_frames_over_interval() {
    for interval in [1u32, 2, 3, 7, 10] {
        for frames in [1u64, 9, 10, 23] {
            let dir = tempfile::tempdir().unwrap();
            let mut backend = SyntheticBackend::new(Plan {
                frames,
                fps: 30.0,
                ..Default::default()
            });
            let mut pipeline =
                Pipeline::new(&mut backend, OneBox::default(), Annotator::new(None), no_transcode());
            let report = pipeline.run(&job_in(dir.path(), interval)).unwrap();
            assert_eq!(
                report.result.processed_frames as u64,
                frames / u64::from(interval),
                "interval {interval}, frames {frames}"
            );
        }
    }
}

#[test]
fn test_frames_drawn_with_latest_earlier_anchor() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 20,
        fps: 30.0,
        ..Default::default()
    });
    let mut pipeline =
        Pipeline::new(&mut backend, Marching::default(), Annotator::new(None), no_transcode());
    pipeline.run(&job_in(dir.path(), 3)).unwrap();
    drop(pipeline);

    let recorded = backend.recorded();
    for (i, frame) in recorded.written.iter().enumerate() {
        let index = i + 1;
        let latest_call = index / 3;
        for call in 1..=6 {
            assert_eq!(
                has_box_at(frame, marching_x(call), 10),
                call == latest_call,
                "frame {index}, call {call}"
            );
        }
    }
}

#[test]
fn test_detector_failure_continues_with_empty_set() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 20,
        fps: 10.0,
        ..Default::default()
    });
    let detector = Marching {
        fail_on_call: Some(2),
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(&mut backend, detector, Annotator::new(None), no_transcode());
    let report = pipeline.run(&job_in(dir.path(), 5)).unwrap();
    drop(pipeline);

    assert!(report.aborted.is_none());
    assert_eq!(report.result.processed_frames, 4);
    assert_eq!(report.detector_failures.len(), 1);
    assert!(matches!(
        report.detector_failures[0],
        PipelineError::DetectorFailure { frame_index: 10, .. }
    ));
    assert_eq!(report.frame_results[1].frame_index, 10);
    assert_eq!(report.frame_results[1].person_count, 0);
    assert_eq!(report.result.average_person_count, 0.75);

    let recorded = backend.recorded();
    assert_eq!(recorded.written.len(), 20);
    assert!(has_any_box(&recorded.written[8]));
    for frame in &recorded.written[9..14] {
        assert!(!has_any_box(frame));
    }
    assert!(has_box_at(&recorded.written[14], marching_x(3), 10));
}

#[test]
fn test_unreadable_source_opens_no_writer() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        open_fails: true,
        ..Default::default()
    });
    let mut pipeline =
        Pipeline::new(&mut backend, OneBox::default(), Annotator::new(None), no_transcode());

    let err = pipeline.run(&job_in(dir.path(), 5)).unwrap_err();
    drop(pipeline);

    assert!(matches!(
        err,
        PipelineError::SourceUnreadable {
            frame_index: None,
            ..
        }
    ));
    assert_eq!(err.stage(), "decode");
    assert_eq!(backend.recorded().writers_opened, 0);
    assert!(!dir.path().join("out.mp4").exists());
}

#[test]
fn test_no_usable_encoder_releases_source() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 10,
        fps: 10.0,
        broken_codecs: DEFAULT_CANDIDATES.iter().map(|c| c.fourcc).collect(),
        ..Default::default()
    });
    let mut detector = OneBox::default();
    let mut pipeline =
        Pipeline::new(&mut backend, &mut detector, Annotator::new(None), no_transcode());

    let err = pipeline.run(&job_in(dir.path(), 5)).unwrap_err();
    drop(pipeline);

    assert!(matches!(err, PipelineError::NoUsableEncoder { ref attempts, .. } if attempts.len() == 5));
    assert_eq!(detector.calls, 0);
    let recorded = backend.recorded();
    assert!(recorded.source_dropped);
    assert_eq!(recorded.tried, ["mp4v", "XVID", "MJPG", "avc1", "H264"]);
}

#[test]
fn test_write_failure_keeps_collected_results() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 100,
        fps: 10.0,
        write_error_at: Some(37),
        ..Default::default()
    });
    let options = PipelineOptions {
        transcoder: Some(Transcoder::new(dir.path().join("ffmpeg-missing"))),
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(&mut backend, OneBox::default(), Annotator::new(None), options);

    let report = pipeline.run(&job_in(dir.path(), 5)).unwrap();
    drop(pipeline);

    assert!(report.is_partial());
    match &report.aborted {
        Some(PipelineError::WriteFailed { frame_index, reason }) => {
            assert_eq!(*frame_index, Some(37));
            assert!(reason.contains("No space left"));
        }
        other => panic!("unexpected abort {other:?}"),
    }
    // anchors 5..=35 were done before frame 37 failed
    assert_eq!(report.result.processed_frames, 7);
    assert_eq!(report.result.average_person_count, 1.0);
    assert_eq!(report.frames_read, 37);
    assert_eq!(report.frames_written, 36);
    assert!(matches!(report.transcode, TranscodeOutcome::Skipped { .. }));

    let recorded = backend.recorded();
    assert_eq!(recorded.writer_closes, 1);
    assert!(recorded.source_dropped);
}

#[test]
fn test_decode_error_after_open_is_partial() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 50,
        fps: 10.0,
        decode_error_at: Some(12),
        ..Default::default()
    });
    let mut pipeline =
        Pipeline::new(&mut backend, OneBox::default(), Annotator::new(None), no_transcode());

    let report = pipeline.run(&job_in(dir.path(), 5)).unwrap();

    assert!(matches!(
        report.aborted,
        Some(PipelineError::SourceUnreadable {
            frame_index: Some(12),
            ..
        })
    ));
    assert_eq!(report.result.processed_frames, 2);
    assert_eq!(report.frames_written, 11);
    assert!(report.result.output_exists);
}

#[test]
fn test_mjpeg_fallback_rewrites_extension_and_skips_transcode() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 10,
        fps: 10.0,
        broken_codecs: vec!["mp4v", "XVID"],
        ..Default::default()
    });
    let options = PipelineOptions {
        transcoder: Some(Transcoder::new(dir.path().join("ffmpeg-missing"))),
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(&mut backend, OneBox::default(), Annotator::new(None), options);

    let report = pipeline.run(&job_in(dir.path(), 5)).unwrap();
    drop(pipeline);

    assert_eq!(report.codec, "MJPG");
    assert_eq!(report.result.output_path, dir.path().join("out.avi"));
    assert!(report.result.output_exists);
    assert!(!dir.path().join("out.mp4").exists());
    assert!(matches!(report.transcode, TranscodeOutcome::Skipped { .. }));
    assert_eq!(backend.recorded().tried, ["mp4v", "XVID", "MJPG"]);
}

#[test]
fn test_missing_transcoder_keeps_written_output() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 10,
        fps: 10.0,
        ..Default::default()
    });
    let options = PipelineOptions {
        transcoder: Some(Transcoder::new(dir.path().join("ffmpeg-missing"))),
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(&mut backend, OneBox::default(), Annotator::new(None), options);

    let report = pipeline.run(&job_in(dir.path(), 5)).unwrap();

    let output: PathBuf = dir.path().join("out.mp4");
    assert_eq!(report.result.output_path, output);
    assert!(report.result.output_exists);
    assert!(report.aborted.is_none());
    match &report.transcode {
        TranscodeOutcome::Failed { error } => {
            assert!(matches!(error, PipelineError::TranscodeFailure { .. }))
        }
        other => panic!("unexpected transcode outcome {other:?}"),
    }
    // 10 frames x 16 bytes from the synthetic writer, untouched
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 160);
}

#[test]
fn test_run_from_async_context_reports_transcode_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 10,
        fps: 10.0,
        ..Default::default()
    });
    let options = PipelineOptions {
        transcoder: Some(Transcoder::new(dir.path().join("ffmpeg-missing"))),
        ..Default::default()
    };
    let job = job_in(dir.path(), 5);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let report = runtime.block_on(async {
        let mut pipeline =
            Pipeline::new(&mut backend, OneBox::default(), Annotator::new(None), options);
        pipeline.run(&job)
    });

    let report = report.unwrap();
    assert!(report.result.output_exists);
    assert_eq!(report.result.output_path, dir.path().join("out.mp4"));
    assert!(matches!(report.transcode, TranscodeOutcome::Failed { .. }));
}

#[test]
fn test_confidence_threshold_reaches_detector() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 10,
        fps: 10.0,
        ..Default::default()
    });
    let job = VideoJob::new(dir.path().join("in.mp4"), dir.path().join("out.mp4"), 2, 0.95).unwrap();
    let mut pipeline =
        Pipeline::new(&mut backend, OneBox::default(), Annotator::new(None), no_transcode());

    let report = pipeline.run(&job).unwrap();
    drop(pipeline);

    assert_eq!(report.result.processed_frames, 5);
    assert_eq!(report.result.average_person_count, 0.0);
    assert!(backend.recorded().written.iter().all(|f| !has_any_box(f)));
}

#[test]
fn test_report_json_truncates_frame_detections() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = SyntheticBackend::new(Plan {
        frames: 150,
        fps: 30.0,
        ..Default::default()
    });
    let mut pipeline =
        Pipeline::new(&mut backend, OneBox::default(), Annotator::new(None), no_transcode());

    let report = pipeline.run(&job_in(dir.path(), 1)).unwrap();
    assert_eq!(report.frame_results.len(), 150);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["processed_frames"], 150);
    assert_eq!(json["average_person_count"], 1.0);
    assert_eq!(json["output_exists"], true);
    assert_eq!(json["codec"], "mp4v");
    assert_eq!(json["frame_detections"].as_array().map(Vec::len), Some(100));
    assert_eq!(json["transcode"]["status"], "disabled");
    assert!(json["aborted"].is_null());
}

#[test]
fn test_frame_pixels_are_not_modified_in_place() {
    let frame = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([7, 7, 7]));
    let annotated = Annotator::new(None).annotate(
        &frame,
        &[Detection::person(Bbox::new(1.0, 1.0, 8.0, 8.0), 0.5)],
    );
    assert!(frame.pixels().all(|p| *p == Rgb([7, 7, 7])));
    assert!(has_any_box(&annotated));
}
