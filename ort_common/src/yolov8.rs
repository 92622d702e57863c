//! YOLOv8 ONNX person detector.
//!
//! Frames are stretched to the square model input, run through ort, and
//! the `[1, 4 + classes, proposals]` output is decoded, filtered and NMS'd.

use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use inference_common::bbox::{Bbox, Detection};
use inference_common::detector::PersonDetector;
use ndarray::{Array4, CowArray};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;

#[derive(Debug, Clone)]
pub struct YoloParams {
    /// Side of the square model input, 640 for stock exports.
    pub input_size: u32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            iou_threshold: 0.45,
            max_detections: 300,
        }
    }
}

pub struct YoloV8 {
    session: Session,
    params: YoloParams,
}

impl YoloV8 {
    pub fn new(session: Session, params: YoloParams) -> Self {
        Self { session, params }
    }

    /// Loads a model file into a cpu session.
    pub fn from_file(path: &Path, params: YoloParams) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load yolov8 model {path:?}"))?;
        Ok(Self::new(session, params))
    }

    fn image_to_array(&self, frame: &RgbImage) -> Array4<f32> {
        let size = self.params.input_size;
        let resized = image::imageops::resize(frame, size, size, FilterType::Triangle);
        let mut array = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            array[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            array[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }
        array
    }
}

impl PersonDetector for YoloV8 {
    fn detect(
        &mut self,
        frame: &RgbImage,
        confidence_threshold: f32,
        classes: &[usize],
    ) -> Result<Vec<Detection>> {
        let input_array = CowArray::from(self.image_to_array(frame)).into_dyn();
        let input = ort::inputs![TensorRef::from_array_view(&input_array)?];
        let outputs = self.session.run(input).context("yolov8 inference failed")?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("failed to extract yolov8 output tensor")?;

        anyhow::ensure!(
            shape.len() == 3 && shape[1] > 4,
            "unexpected yolov8 output shape {shape:?}"
        );
        let rows = shape[1] as usize;
        let proposals = shape[2] as usize;

        let size = self.params.input_size as f32;
        let output = RawOutput {
            data,
            num_classes: rows - 4,
            proposals,
        };
        let candidates = output.decode(
            frame.width() as f32 / size,
            frame.height() as f32 / size,
            confidence_threshold,
            classes,
        );
        let mut kept = nms(candidates, self.params.iou_threshold);
        kept.truncate(self.params.max_detections);
        log::trace!("yolov8 kept {} detections", kept.len());
        Ok(kept)
    }
}

/// Channel-major model output: row `r` of proposal `i` is `data[r * proposals + i]`,
/// rows are `cx, cy, w, h` then one score per class.
struct RawOutput<'a> {
    data: &'a [f32],
    num_classes: usize,
    proposals: usize,
}

impl RawOutput<'_> {
    fn at(&self, row: usize, i: usize) -> f32 {
        self.data[row * self.proposals + i]
    }

    fn decode(
        &self,
        scale_x: f32,
        scale_y: f32,
        confidence_threshold: f32,
        classes: &[usize],
    ) -> Vec<Detection> {
        let mut candidates = Vec::new();
        for i in 0..self.proposals {
            let best = (0..self.num_classes)
                .filter(|c| classes.is_empty() || classes.contains(c))
                .map(|c| (c, self.at(4 + c, i)))
                .max_by(|a, b| a.1.total_cmp(&b.1));
            let Some((class_idx, score)) = best else {
                continue;
            };
            if score < confidence_threshold {
                continue;
            }
            let bbox = Bbox::from_center(
                self.at(0, i) * scale_x,
                self.at(1, i) * scale_y,
                self.at(2, i) * scale_x,
                self.at(3, i) * scale_y,
            );
            candidates.push(Detection {
                bbox,
                confidence: score,
                class_idx,
            });
        }
        candidates
    }
}

/// Greedy per-class non maximum suppression, highest confidence first.
fn nms(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let overlaps = kept.iter().any(|k| {
            k.class_idx == candidate.class_idx && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}
