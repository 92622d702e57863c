use std::path::Path;

use inference_common::annotate::Annotator;
use inference_common::bbox::Detection;
use inference_common::density::{density_percentage, round2};
use inference_common::detector::{PersonDetector, PERSON_CLASS};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ImageReport {
    pub person_count: usize,
    pub density_percentage: f64,
    pub detections: Vec<Detection>,
}

/// Detects people in a single image, saving `<input>.out.jpg` and a json
/// result next to it.
pub fn process_image(
    path: &Path,
    detector: &mut impl PersonDetector,
    annotator: &Annotator,
    confidence_threshold: f32,
) -> anyhow::Result<ImageReport> {
    let image = image::open(path)?.to_rgb8();
    let (width, height) = image.dimensions();

    let detections = detector.detect(&image, confidence_threshold, &[PERSON_CLASS])?;
    let report = ImageReport {
        person_count: detections.len(),
        density_percentage: round2(density_percentage(detections.len(), width, height)),
        detections,
    };
    log::info!(
        "{path:?}: {} people, density {:.2}%",
        report.person_count,
        report.density_percentage
    );

    let img_output_path = path.with_extension("out.jpg");
    annotator
        .annotate(&image, &report.detections)
        .save(&img_output_path)?;
    log::info!("Saved annotated image to {img_output_path:?}");

    let json_output_path = path.with_extension("out.json");
    serde_json::to_writer_pretty(std::fs::File::create(json_output_path)?, &report)?;

    Ok(report)
}
