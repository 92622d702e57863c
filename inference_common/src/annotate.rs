//! Draws detection overlays onto frames.

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::Context;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::bbox::{Bbox, Detection};

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 14.0;
/// Gap between the label baseline and the top edge of its box.
const LABEL_OFFSET: i32 = 10;
/// Keeps imageproc's i32 edge arithmetic in range, far outside any frame.
const COORD_LIMIT: f32 = (1 << 16) as f32;

/// Well known locations of a sans font, tried in order when no font is given.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/truetype/freefont/FreeSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Renders a rectangle and a `Person 0.87` style label per detection.
///
/// Boxes are drawn where the detector put them, including partly or fully
/// outside the frame; imageproc clips whatever falls off the canvas. Labels
/// need a font, without one only rectangles are drawn.
#[derive(Clone)]
pub struct Annotator {
    font: Option<FontArc>,
}

impl Annotator {
    pub fn new(font: Option<FontArc>) -> Self {
        Self { font }
    }

    /// Loads a TTF/OTF font used for labels.
    pub fn from_font_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading font {path:?}"))?;
        let font = FontArc::try_from_vec(bytes)
            .with_context(|| format!("parsing font {path:?}"))?;
        Ok(Self::new(Some(font)))
    }

    /// Uses the first loadable font from [`SYSTEM_FONTS`].
    pub fn with_system_font() -> Self {
        for candidate in SYSTEM_FONTS {
            let path = Path::new(candidate);
            if !path.exists() {
                continue;
            }
            match Self::from_font_file(path) {
                Ok(annotator) => {
                    log::debug!("Using label font {path:?}");
                    return annotator;
                }
                Err(e) => log::debug!("Skipping font {path:?}: {e:#}"),
            }
        }
        log::warn!("No usable font found, detections will be drawn without labels");
        Self::new(None)
    }

    /// Returns an annotated copy of `frame`; the input is left untouched.
    pub fn annotate(&self, frame: &RgbImage, detections: &[Detection]) -> RgbImage {
        let mut out = frame.clone();
        self.draw_mut(&mut out, detections);
        out
    }

    pub fn draw_mut(&self, canvas: &mut RgbImage, detections: &[Detection]) {
        for detection in detections {
            let (x0, y0, x1, y1) = corners(&detection.bbox);
            for t in 0..BOX_THICKNESS {
                let width = (x1 - x0 + 1 + 2 * t) as u32;
                let height = (y1 - y0 + 1 + 2 * t) as u32;
                let rect = Rect::at(x0 - t, y0 - t).of_size(width, height);
                draw_hollow_rect_mut(canvas, rect, BOX_COLOR);
            }

            if let Some(font) = &self.font {
                let label = label_for(detection);
                let y = y0 - LABEL_OFFSET - LABEL_SCALE as i32;
                draw_text_mut(
                    canvas,
                    BOX_COLOR,
                    x0,
                    y,
                    PxScale::from(LABEL_SCALE),
                    font,
                    &label,
                );
            }
        }
    }
}

impl std::fmt::Debug for Annotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Annotator")
            .field("font", &self.font.is_some())
            .finish()
    }
}

pub fn label_for(detection: &Detection) -> String {
    format!("Person {:.2}", detection.confidence)
}

/// Integer corners ordered so that `x0 <= x1` and `y0 <= y1`.
fn corners(bbox: &Bbox) -> (i32, i32, i32, i32) {
    let px = |v: f32| v.clamp(-COORD_LIMIT, COORD_LIMIT) as i32;
    let (xa, xb) = (px(bbox.xmin), px(bbox.xmax));
    let (ya, yb) = (px(bbox.ymin), px(bbox.ymax));
    (xa.min(xb), ya.min(yb), xa.max(xb), ya.max(yb))
}
