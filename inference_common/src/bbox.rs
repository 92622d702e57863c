use serde::{Deserialize, Serialize};

/// Axis aligned box in frame pixel coordinates, `(xmin, ymin)` top-left.
///
/// Coordinates are kept exactly as the detector reported them; nothing here
/// clamps them to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Builds a box from yolo style center + size.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn iou(&self, other: &Bbox) -> f32 {
        let ix = (self.xmax.min(other.xmax) - self.xmin.max(other.xmin)).max(0.0);
        let iy = (self.ymax.min(other.ymax) - self.ymin.max(other.ymin)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// `[x1, y1, x2, y2]`, the layout the detection json uses.
    pub fn as_array(&self) -> [f32; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }
}

/// A single detector hit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: Bbox,
    pub confidence: f32,
    /// Coco class index, 0 is `person`.
    #[serde(default)]
    pub class_idx: usize,
}

impl Detection {
    pub fn person(bbox: Bbox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence,
            class_idx: crate::detector::PERSON_CLASS,
        }
    }
}

/// Detections computed on one anchor frame.
///
/// Frames between two anchors are annotated with the set of the earlier
/// anchor, so `anchor_frame` is never greater than the frame it is drawn on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet {
    pub anchor_frame: u64,
    pub detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn new(anchor_frame: u64, detections: Vec<Detection>) -> Self {
        Self {
            anchor_frame,
            detections,
        }
    }

    pub fn empty(anchor_frame: u64) -> Self {
        Self::new(anchor_frame, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}
