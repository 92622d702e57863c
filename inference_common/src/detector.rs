use image::RgbImage;

use crate::bbox::Detection;

/// Coco index of the `person` class.
pub const PERSON_CLASS: usize = 0;

/// Object detection capability the video pipeline samples frames into.
///
/// Implementations are free to be slow; callers never retry a failed call.
/// Only detections whose class is in `classes` and whose confidence is at
/// least `confidence_threshold` are returned.
pub trait PersonDetector {
    fn detect(
        &mut self,
        frame: &RgbImage,
        confidence_threshold: f32,
        classes: &[usize],
    ) -> anyhow::Result<Vec<Detection>>;
}

impl<D: PersonDetector + ?Sized> PersonDetector for &mut D {
    fn detect(
        &mut self,
        frame: &RgbImage,
        confidence_threshold: f32,
        classes: &[usize],
    ) -> anyhow::Result<Vec<Detection>> {
        (**self).detect(frame, confidence_threshold, classes)
    }
}

impl<D: PersonDetector + ?Sized> PersonDetector for Box<D> {
    fn detect(
        &mut self,
        frame: &RgbImage,
        confidence_threshold: f32,
        classes: &[usize],
    ) -> anyhow::Result<Vec<Detection>> {
        (**self).detect(frame, confidence_threshold, classes)
    }
}
