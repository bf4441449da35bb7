use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::services::video::{
    FrameSink, FrameSource, VideoBackend, VideoCodec, VideoError, VideoProperties,
};

const STREAM_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Bytes of encoder diagnostics kept for error messages.
const STDERR_TAIL: usize = 8 * 1024;

/// Decodes and encodes through the `ffprobe` / `ffmpeg` command line tools, moving
/// raw RGB24 frames over pipes.
pub struct FfmpegBackend {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
}

impl FfmpegBackend {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    async fn probe(&self, input: &str) -> Result<VideoProperties, VideoError> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                "-select_streams",
                "v:0",
                input,
            ])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| VideoError::Spawn {
                program: self.ffprobe_path.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VideoError::Probe(format!("ffprobe failed: {stderr}")));
        }
        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn spawn_decoder(&self, input: &str) -> Result<(Child, ChildStdout), VideoError> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args([
                "-v", "error", "-i", input, "-an", "-sn", "-f", "rawvideo", "-pix_fmt", "rgb24",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VideoError::Spawn {
                program: self.ffmpeg_path.display().to_string(),
                source,
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VideoError::Unavailable("decoder has no stdout".to_string()))?;
        Ok((child, stdout))
    }

    fn open(
        &self,
        input: &str,
        properties: VideoProperties,
    ) -> Result<Box<dyn FrameSource>, VideoError> {
        if properties.width == 0 || properties.height == 0 {
            return Err(VideoError::Probe(format!(
                "no video dimensions reported for {input}"
            )));
        }
        let (child, stdout) = self.spawn_decoder(input)?;
        Ok(Box::new(FfmpegSource {
            _child: child,
            stdout,
            properties,
            frame_len: properties.width as usize * properties.height as usize * 3,
        }))
    }

    async fn encoder_available(&self, encoder: &str) -> Result<bool, VideoError> {
        let output = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-encoders"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| VideoError::Spawn {
                program: self.ffmpeg_path.display().to_string(),
                source,
            })?;
        Ok(lists_encoder(&String::from_utf8_lossy(&output.stdout), encoder))
    }
}

fn encoder_args(codec: VideoCodec) -> (&'static str, &'static [&'static str]) {
    match codec {
        VideoCodec::Avc1 => (
            "libx264",
            &["-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p"],
        ),
        VideoCodec::Mp4v => ("mpeg4", &["-c:v", "mpeg4", "-q:v", "5", "-pix_fmt", "yuv420p"]),
    }
}

#[async_trait]
impl VideoBackend for FfmpegBackend {
    async fn open_file(&self, path: &Path) -> Result<Box<dyn FrameSource>, VideoError> {
        let input = path.to_string_lossy().into_owned();
        let properties = self.probe(&input).await?;
        self.open(&input, properties)
    }

    async fn open_stream(&self, url: &str) -> Result<Box<dyn FrameSource>, VideoError> {
        let properties = tokio::time::timeout(STREAM_PROBE_TIMEOUT, self.probe(url))
            .await
            .map_err(|_| VideoError::Unavailable(format!("timed out probing {url}")))?
            .map_err(|e| VideoError::Unavailable(e.to_string()))?;
        self.open(url, properties)
    }

    async fn create_sink(
        &self,
        path: &Path,
        codec: VideoCodec,
        properties: &VideoProperties,
    ) -> Result<Box<dyn FrameSink>, VideoError> {
        let (encoder, codec_args) = encoder_args(codec);
        // ffmpeg starts happily with a missing encoder and only fails on the first
        // frame, so check up front.
        if !self.encoder_available(encoder).await? {
            return Err(VideoError::CodecUnavailable(codec));
        }

        let size = format!("{}x{}", properties.width, properties.height);
        let rate = format!("{}", properties.fps);
        let mut child = Command::new(&self.ffmpeg_path)
            .args(["-y", "-v", "error", "-f", "rawvideo", "-pix_fmt", "rgb24", "-s"])
            .arg(&size)
            .arg("-r")
            .arg(&rate)
            .args(["-i", "pipe:0"])
            .args(codec_args)
            // Even dimensions for 4:2:0 chroma subsampling.
            .args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2", "-movflags", "+faststart"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VideoError::Spawn {
                program: self.ffmpeg_path.display().to_string(),
                source,
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| VideoError::Encoder("encoder has no stdin".to_string()))?;
        // Drained while frames are written so a chatty encoder never blocks on a full pipe.
        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_tail(stderr, STDERR_TAIL)));

        Ok(Box::new(FfmpegSink {
            child,
            stdin: Some(stdin),
            stderr,
            width: properties.width,
            height: properties.height,
        }))
    }
}

struct FfmpegSource {
    _child: Child,
    stdout: ChildStdout,
    properties: VideoProperties,
    frame_len: usize,
}

#[async_trait]
impl FrameSource for FfmpegSource {
    fn properties(&self) -> VideoProperties {
        self.properties
    }

    async fn read_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
        let mut buffer = vec![0u8; self.frame_len];
        match self.stdout.read_exact(&mut buffer).await {
            Ok(_) => Ok(RgbImage::from_raw(
                self.properties.width,
                self.properties.height,
                buffer,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(VideoError::Io(e)),
        }
    }
}

struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    width: u32,
    height: u32,
}

#[async_trait]
impl FrameSink for FfmpegSink {
    async fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(VideoError::FrameSize {
                expected: (self.width, self.height),
                actual: frame.dimensions(),
            });
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| VideoError::Encoder("sink already closed".to_string()))?;
        stdin.write_all(frame.as_raw()).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), VideoError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        let status = self.child.wait().await?;
        let diagnostics = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if status.success() {
            Ok(())
        } else {
            Err(VideoError::Encoder(
                String::from_utf8_lossy(&diagnostics).trim().to_string(),
            ))
        }
    }
}

/// Read `reader` to the end, keeping only the last `limit` bytes.
async fn drain_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
        }
    }
    tail
}

/// Whether `ffmpeg -encoders` output lists `encoder`.
fn lists_encoder(listing: &str, encoder: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == encoder)
}

/// Parse the first video stream out of ffprobe JSON.
fn parse_probe_output(json_str: &str) -> Result<VideoProperties, VideoError> {
    let json: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| VideoError::Probe(format!("Failed to parse ffprobe output: {e}")))?;

    let stream = json
        .get("streams")
        .and_then(|s| s.as_array())
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s.get("codec_type").and_then(|c| c.as_str()) == Some("video"))
        })
        .ok_or_else(|| VideoError::Probe("no video stream found".to_string()))?;

    let width = stream.get("width").and_then(|w| w.as_u64()).unwrap_or(0) as u32;
    let height = stream.get("height").and_then(|h| h.as_u64()).unwrap_or(0) as u32;

    let fps = ["avg_frame_rate", "r_frame_rate"]
        .iter()
        .filter_map(|key| stream.get(*key).and_then(|f| f.as_str()))
        .filter_map(parse_rate)
        .find(|fps| *fps > 0.0)
        .unwrap_or(0.0);

    let duration = stream
        .get("duration")
        .or_else(|| json.get("format").and_then(|f| f.get("duration")))
        .and_then(|d| d.as_str())
        .and_then(|s| s.parse::<f64>().ok());

    let total_frames = stream
        .get("nb_frames")
        .and_then(|n| n.as_str())
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| duration.map(|d| (d * fps).round() as u64))
        .unwrap_or(0);

    Ok(VideoProperties {
        fps,
        width,
        height,
        total_frames,
    })
}

/// `"30000/1001"` or `"25"` to frames per second.
fn parse_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            (den > 0.0).then(|| num / den)
        }
        None => rate.parse().ok(),
    }
}
