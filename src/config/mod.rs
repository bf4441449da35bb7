use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use strum::{Display, EnumString};

use crate::jobs::JobLimits;

/// Where artifacts are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StorageBackend {
    /// `UPLOAD_DIR` / `OUTPUT_DIR` on the local filesystem.
    Local,
    /// Cloudflare R2 (S3-compatible).
    R2,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackend,

    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Scratch space for video staging and encoding.
    #[serde(default = "std::env::temp_dir")]
    pub work_dir: PathBuf,

    /// R2 settings, required when `STORAGE_BACKEND=r2`.
    pub r2_bucket: Option<String>,
    pub r2_endpoint: Option<String>,
    pub r2_access_key: Option<String>,
    pub r2_secret_key: Option<String>,
    /// Public URL prefix for R2 objects; `{R2_ENDPOINT}/{R2_BUCKET}` when unset.
    pub public_base_url: Option<String>,

    /// Base URL of the YOLO inference server.
    #[serde(default = "default_detector_url")]
    pub detector_url: String,

    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Class names, one per line. COCO-80 when unset.
    pub classes_file: Option<PathBuf>,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,

    /// How long finished job statuses stay queryable.
    #[serde(default = "default_status_ttl_secs")]
    pub status_ttl_secs: u64,

    /// Wall-clock budget per job.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_max_batch_files")]
    pub max_batch_files: usize,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    #[serde(default = "default_video_max_frames")]
    pub default_video_max_frames: u64,

    #[serde(default = "default_stream_max_frames")]
    pub default_stream_max_frames: u64,

    #[serde(default = "default_max_frames_limit")]
    pub max_frames_limit: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Local
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_detector_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_model_name() -> String {
    "yolov8n.pt".to_string()
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_status_ttl_secs() -> u64 {
    3600
}

fn default_job_timeout_secs() -> u64 {
    900
}

fn default_max_batch_files() -> usize {
    20
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_video_max_frames() -> u64 {
    30
}

fn default_stream_max_frames() -> u64 {
    10
}

fn default_max_frames_limit() -> u64 {
    3000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn job_limits(&self) -> JobLimits {
        JobLimits {
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            max_batch_files: self.max_batch_files,
            default_video_frames: self.default_video_max_frames,
            default_stream_frames: self.default_stream_max_frames,
            max_frames_limit: self.max_frames_limit,
        }
    }

    /// R2 credentials as `(bucket, endpoint, access_key, secret_key)`, or the name of
    /// the first missing variable.
    pub fn r2_settings(&self) -> Result<(&str, &str, &str, &str), &'static str> {
        let bucket = self.r2_bucket.as_deref().ok_or("R2_BUCKET")?;
        let endpoint = self.r2_endpoint.as_deref().ok_or("R2_ENDPOINT")?;
        let access_key = self.r2_access_key.as_deref().ok_or("R2_ACCESS_KEY")?;
        let secret_key = self.r2_secret_key.as_deref().ok_or("R2_SECRET_KEY")?;
        Ok((bucket, endpoint, access_key, secret_key))
    }
}
