use serde::{Deserialize, Serialize};

use crate::bbox::DetectionSet;
use crate::density::{density_percentage, round2};

/// Detection summary of one anchor frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    /// 1-based index of the frame in the source.
    pub frame_index: u64,
    /// Seconds since the start of the source, `frame_index / fps`.
    pub timestamp: f64,
    pub person_count: usize,
    pub density_percentage: f64,
    pub detections: DetectionSet,
}

impl FrameResult {
    pub fn new(detections: DetectionSet, fps: f64, width: u32, height: u32) -> Self {
        let frame_index = detections.anchor_frame;
        let person_count = detections.len();
        let timestamp = if fps > 0.0 {
            frame_index as f64 / fps
        } else {
            0.0
        };
        Self {
            frame_index,
            timestamp,
            person_count,
            density_percentage: round2(density_percentage(person_count, width, height)),
            detections,
        }
    }
}
