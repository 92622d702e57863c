use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Summary of one processed video, handed over to whatever stores results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Frame count reported by the source container.
    pub total_frames: u64,
    /// Number of anchor frames the detector was sampled on.
    pub processed_frames: usize,
    pub average_person_count: f64,
    pub average_density: f64,
    /// Final location of the annotated video, after any extension rewrite.
    pub output_path: PathBuf,
    pub output_exists: bool,
}
