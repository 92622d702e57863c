pub mod yolov8;

pub use yolov8::{YoloParams, YoloV8};
