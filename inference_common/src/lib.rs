pub mod annotate;
pub mod bbox;
pub mod density;
pub mod detector;
pub mod frame_meta;
pub mod frame_times;
pub mod video_meta;
