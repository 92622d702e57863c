//! Decides per frame whether the detector runs or the last result is reused.

use std::num::NonZeroU32;

use inference_common::bbox::{Detection, DetectionSet};

/// What happens to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRole {
    /// `frame_index % frame_interval == 0`: run the detector, record a result.
    Anchor,
    /// Draw the last known detections, record nothing.
    Propagated,
}

/// Per-job detection state.
///
/// Holds the most recent anchor's detections so that every frame is drawn
/// with the set of the greatest anchor index at or before it, or with
/// nothing before the first anchor.
#[derive(Debug)]
pub struct DetectionScheduler {
    frame_interval: NonZeroU32,
    last_known: Option<DetectionSet>,
}

impl DetectionScheduler {
    pub fn new(frame_interval: NonZeroU32) -> Self {
        Self {
            frame_interval,
            last_known: None,
        }
    }

    pub fn role(&self, frame_index: u64) -> FrameRole {
        if frame_index % u64::from(self.frame_interval.get()) == 0 {
            FrameRole::Anchor
        } else {
            FrameRole::Propagated
        }
    }

    /// Replaces the last known set with a freshly computed one.
    pub fn store(&mut self, set: DetectionSet) {
        debug_assert!(
            self.last_known
                .as_ref()
                .is_none_or(|prev| prev.anchor_frame < set.anchor_frame),
            "anchors must be stored in increasing order"
        );
        self.last_known = Some(set);
    }

    pub fn last_known(&self) -> Option<&DetectionSet> {
        self.last_known.as_ref()
    }

    /// Detections to draw on the current frame.
    pub fn applied(&self) -> &[Detection] {
        self.last_known
            .as_ref()
            .map(|set| set.detections.as_slice())
            .unwrap_or_default()
    }
}
