use std::path::PathBuf;

use inference_common::density::round2;
use inference_common::frame_meta::FrameResult;
use inference_common::video_meta::JobResult;

/// Collects anchor frame results of one job in frame order.
#[derive(Debug, Default)]
pub struct Aggregator {
    results: Vec<FrameResult>,
}

impl Aggregator {
    pub fn push(&mut self, result: FrameResult) {
        debug_assert!(self
            .results
            .last()
            .is_none_or(|prev| prev.frame_index < result.frame_index));
        self.results.push(result);
    }

    pub fn processed_frames(&self) -> usize {
        self.results.len()
    }

    pub fn average_person_count(&self) -> f64 {
        self.average(|r| r.person_count as f64)
    }

    pub fn average_density(&self) -> f64 {
        self.average(|r| r.density_percentage)
    }

    fn average(&self, value: impl Fn(&FrameResult) -> f64) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.results.iter().map(value).sum::<f64>() / self.results.len() as f64
    }

    /// Produces the job summary, once the output file is final.
    pub fn finish(
        self,
        total_frames: u64,
        output_path: PathBuf,
        output_exists: bool,
    ) -> (JobResult, Vec<FrameResult>) {
        let result = JobResult {
            total_frames,
            processed_frames: self.processed_frames(),
            average_person_count: round2(self.average_person_count()),
            average_density: round2(self.average_density()),
            output_path,
            output_exists,
        };
        (result, self.results)
    }
}
