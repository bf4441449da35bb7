pub mod detector;
pub mod ffmpeg;
pub mod registry;
pub mod render;
pub mod storage;
pub mod video;
