use std::path::Path;
use std::time::Instant;

use inference_common::annotate::Annotator;
use inference_common::bbox::DetectionSet;
use inference_common::detector::{PersonDetector, PERSON_CLASS};
use inference_common::frame_meta::FrameResult;
use inference_common::frame_times::{AggregatedTimes, FrameTimes};
use inference_common::video_meta::JobResult;
use serde::{Serialize, Serializer};

use crate::aggregate::Aggregator;
use crate::codec::{self, CodecCandidate, NegotiatedWriter, DEFAULT_CANDIDATES};
use crate::error::PipelineError;
use crate::job::VideoJob;
use crate::media::{FrameSource, MediaBackend, SourceInfo, VideoWriter};
use crate::scheduler::{DetectionScheduler, FrameRole};
use crate::transcode::{TranscodeOutcome, Transcoder};

/// Anchor frame results included in a serialized report.
pub const REPORTED_FRAME_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Output encoders, tried in order.
    pub candidates: Vec<CodecCandidate>,
    /// `None` disables the h264 re-encode.
    pub transcoder: Option<Transcoder>,
    /// Detector classes to keep.
    pub classes: Vec<usize>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            candidates: DEFAULT_CANDIDATES.to_vec(),
            transcoder: Some(Transcoder::default()),
            classes: vec![PERSON_CLASS],
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Serialize)]
pub struct JobReport {
    #[serde(flatten)]
    pub result: JobResult,
    /// Fourcc of the encoder the output was written with.
    pub codec: &'static str,
    pub source: SourceInfo,
    pub frames_read: u64,
    pub frames_written: u64,
    #[serde(rename = "frame_detections", serialize_with = "first_frames")]
    pub frame_results: Vec<FrameResult>,
    pub detector_failures: Vec<PipelineError>,
    /// Fatal error that cut the frame loop short.
    pub aborted: Option<PipelineError>,
    pub transcode: TranscodeOutcome,
}

impl JobReport {
    /// Whether the run stopped before the end of the source.
    pub fn is_partial(&self) -> bool {
        self.aborted.is_some()
    }
}

fn first_frames<S: Serializer>(frames: &[FrameResult], serializer: S) -> Result<S::Ok, S::Error> {
    frames[..frames.len().min(REPORTED_FRAME_LIMIT)].serialize(serializer)
}

/// State owned by a single run.
struct JobContext {
    scheduler: DetectionScheduler,
    aggregator: Aggregator,
    times: AggregatedTimes,
    frames_read: u64,
    frames_written: u64,
    detector_failures: Vec<PipelineError>,
}

impl JobContext {
    fn new(job: &VideoJob) -> Self {
        Self {
            scheduler: DetectionScheduler::new(job.frame_interval()),
            aggregator: Aggregator::default(),
            times: AggregatedTimes::default(),
            frames_read: 0,
            frames_written: 0,
            detector_failures: Vec::new(),
        }
    }
}

/// Runs video jobs one at a time on the calling thread.
pub struct Pipeline<B, D> {
    backend: B,
    detector: D,
    annotator: Annotator,
    options: PipelineOptions,
}

impl<B: MediaBackend, D: PersonDetector> Pipeline<B, D> {
    pub fn new(backend: B, detector: D, annotator: Annotator, options: PipelineOptions) -> Self {
        Self {
            backend,
            detector,
            annotator,
            options,
        }
    }

    /// Processes `job` to completion.
    ///
    /// Returns `Err` only when no output was produced at all. Failures after
    /// the writer opened end up in the report instead.
    pub fn run(&mut self, job: &VideoJob) -> Result<JobReport, PipelineError> {
        log::info!("Processing video {:?} -> {:?}", job.source(), job.output());
        let mut source = self
            .backend
            .open_source(job.source())
            .map_err(|e| PipelineError::source_unreadable(job.source(), None, &e))?;
        let info = source.info();
        log::info!("{:?}: {info:?}", job.source());

        let NegotiatedWriter {
            mut writer,
            candidate,
            output_path,
        } = codec::negotiate(
            &mut self.backend,
            &self.options.candidates,
            job.output(),
            info.fps,
            info.width,
            info.height,
        )?;

        let mut ctx = JobContext::new(job);
        let aborted = self.run_frames(job, &info, &mut ctx, source.as_mut(), writer.as_mut());
        drop(source);

        let close_result = writer.close();
        drop(writer);
        let aborted = match (aborted, close_result) {
            (Some(err), Err(close_err)) => {
                log::warn!("Closing writer after failure: {close_err:#}");
                Some(err)
            }
            (Some(err), Ok(())) => Some(err),
            (None, Err(close_err)) => {
                let err = PipelineError::write_failed(None, &close_err);
                log::error!("{err}");
                Some(err)
            }
            (None, Ok(())) => None,
        };

        let transcode = self.transcode(&output_path, &info, &ctx, aborted.is_some());
        let output_exists = output_path.exists();
        if !output_exists {
            log::warn!("Output video not found at {output_path:?}");
        }

        log_times(&ctx.times);
        let (result, frame_results) =
            ctx.aggregator.finish(info.total_frames, output_path, output_exists);
        log::info!(
            "Done: {} frames read, {} anchor frames, avg {:.2} people, avg density {:.2}%",
            ctx.frames_read,
            result.processed_frames,
            result.average_person_count,
            result.average_density
        );

        Ok(JobReport {
            result,
            codec: candidate.fourcc,
            source: info,
            frames_read: ctx.frames_read,
            frames_written: ctx.frames_written,
            frame_results,
            detector_failures: ctx.detector_failures,
            aborted,
            transcode,
        })
    }

    /// Decode, detect, annotate, encode until the source ends or a fatal
    /// error, which is returned.
    fn run_frames(
        &mut self,
        job: &VideoJob,
        info: &SourceInfo,
        ctx: &mut JobContext,
        source: &mut dyn FrameSource,
        writer: &mut dyn VideoWriter,
    ) -> Option<PipelineError> {
        let mut frame_index = 0u64;
        loop {
            let mut times = FrameTimes::default();

            let start = Instant::now();
            let frame = match source.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => return None,
                Err(e) => {
                    let err =
                        PipelineError::source_unreadable(job.source(), Some(frame_index + 1), &e);
                    log::error!("{err}");
                    return Some(err);
                }
            };
            times.decode = start.elapsed();
            frame_index += 1;
            ctx.frames_read += 1;

            if ctx.scheduler.role(frame_index) == FrameRole::Anchor {
                let start = Instant::now();
                let detected = self.detector.detect(
                    &frame,
                    job.confidence_threshold(),
                    &self.options.classes,
                );
                times.detect = start.elapsed();

                let set = match detected {
                    Ok(detections) => DetectionSet::new(frame_index, detections),
                    Err(e) => {
                        let err = PipelineError::detector_failure(frame_index, &e);
                        log::warn!("{err}, continuing without detections");
                        ctx.detector_failures.push(err);
                        DetectionSet::empty(frame_index)
                    }
                };
                let result = FrameResult::new(set.clone(), info.fps, frame.width(), frame.height());
                log::debug!(
                    "Frame {frame_index}: {} people, density {:.2}%",
                    result.person_count,
                    result.density_percentage
                );
                ctx.aggregator.push(result);
                ctx.scheduler.store(set);
            }

            let start = Instant::now();
            let annotated = self.annotator.annotate(&frame, ctx.scheduler.applied());
            times.annotate = start.elapsed();

            let start = Instant::now();
            if let Err(e) = writer.write(&annotated) {
                let err = PipelineError::write_failed(Some(frame_index), &e);
                log::error!("{err}");
                return Some(err);
            }
            times.encode = start.elapsed();
            ctx.frames_written += 1;

            log::trace!("{times:?}");
            ctx.times.push(times);
        }
    }

    fn transcode(
        &self,
        output_path: &Path,
        info: &SourceInfo,
        ctx: &JobContext,
        aborted: bool,
    ) -> TranscodeOutcome {
        let Some(transcoder) = &self.options.transcoder else {
            return TranscodeOutcome::Disabled;
        };
        let skip = if aborted {
            Some("output was not written completely".to_string())
        } else if ctx.frames_written == 0 {
            Some("no frames were written".to_string())
        } else if !Transcoder::applies_to(output_path) {
            Some(format!("{output_path:?} is not an mp4"))
        } else if !output_path.exists() {
            Some(format!("{output_path:?} does not exist"))
        } else {
            None
        };
        if let Some(reason) = skip {
            log::info!("Skipping re-encode: {reason}");
            return TranscodeOutcome::Skipped { reason };
        }

        match transcoder.transcode(output_path, info.fps, info.width, info.height) {
            Ok(()) => TranscodeOutcome::Replaced,
            Err(error) => {
                log::warn!("{error}, keeping original output");
                TranscodeOutcome::Failed { error }
            }
        }
    }
}

fn log_times(times: &AggregatedTimes) {
    if times.is_empty() {
        return;
    }
    // the first frame is an outlier, it pays for lazy init
    log::info!("Average frame times: {:?}", times.avg(true));
    log::info!("Min frame times: {:?}", times.min(true));
    log::info!("Max frame times: {:?}", times.max(true));
}
