//! Occupancy density estimate.
//!
//! There is no zone calibration, so every detected person is assumed to
//! cover a fixed pixel area and the covered share of the frame is reported.

/// Average on-screen area of one person, in pixels.
pub const ESTIMATED_PERSON_AREA_PX: f64 = 7500.0;

/// Percentage of the frame covered by `person_count` people, in `[0, 100]`.
pub fn density_percentage(person_count: usize, width: u32, height: u32) -> f64 {
    if person_count == 0 {
        return 0.0;
    }
    let frame_area = width as f64 * height as f64;
    if frame_area <= 0.0 {
        return 100.0;
    }
    let covered = person_count as f64 * ESTIMATED_PERSON_AREA_PX;
    (covered / frame_area * 100.0).clamp(0.0, 100.0)
}

/// Rounds to two decimals, the precision reports are published with.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
