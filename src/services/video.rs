use std::path::Path;

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Output codecs in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VideoCodec {
    /// H.264, plays in every browser.
    Avc1,
    /// MPEG-4 Part 2, available in practically every encoder build.
    Mp4v,
}

impl VideoCodec {
    /// Preferred codec first, then the fallback.
    pub const PREFERENCE: [VideoCodec; 2] = [VideoCodec::Avc1, VideoCodec::Mp4v];
}

/// What a source reports about itself before any frame is read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoProperties {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Declared frame count; 0 when the container does not say.
    pub total_frames: u64,
}

/// Decoded frames, in presentation order.
#[async_trait]
pub trait FrameSource: Send {
    fn properties(&self) -> VideoProperties;

    /// Next frame, or `None` at end of stream.
    async fn read_frame(&mut self) -> Result<Option<RgbImage>, VideoError>;
}

/// Encoder for an output video of fixed size and rate.
#[async_trait]
pub trait FrameSink: Send {
    /// Frames must match the dimensions the sink was created with.
    async fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError>;

    /// Flush and close the output file.
    async fn finish(self: Box<Self>) -> Result<(), VideoError>;
}

/// Factory for sources and sinks.
#[async_trait]
pub trait VideoBackend: Send + Sync {
    async fn open_file(&self, path: &Path) -> Result<Box<dyn FrameSource>, VideoError>;

    /// Open a network stream (RTSP, HTTP, ...). Fails if the stream cannot be reached.
    async fn open_stream(&self, url: &str) -> Result<Box<dyn FrameSource>, VideoError>;

    async fn create_sink(
        &self,
        path: &Path,
        codec: VideoCodec,
        properties: &VideoProperties,
    ) -> Result<Box<dyn FrameSink>, VideoError>;
}

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unreadable media: {0}")]
    Probe(String),

    #[error("Source could not be opened: {0}")]
    Unavailable(String),

    #[error("Encoder {0} is not available")]
    CodecUnavailable(VideoCodec),

    #[error("Frame is {actual:?}, sink expects {expected:?}")]
    FrameSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Video I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoder exited with failure: {0}")]
    Encoder(String),
}
