use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle state of a detection job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Processing,
    Completed,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Processing)
    }
}

/// What a job was submitted for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    Image,
    Video,
    Batch,
    Stream,
}

/// Current observable progress of one job, as returned to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub status: JobState,
    pub progress: u8,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_files: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_files: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_frames: Option<u64>,

    /// Results so far for batches, the full payload once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    /// Initial `processing/0` record for a freshly started job.
    pub fn started(job_id: Uuid, kind: JobKind) -> Self {
        Self {
            job_id,
            kind,
            status: JobState::Processing,
            progress: 0,
            message: format!("{kind} job started"),
            total_files: None,
            processed_files: None,
            processed_frames: None,
            result: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started_record() {
        let id = Uuid::new_v4();
        let record = StatusRecord::started(id, JobKind::Video);
        assert_eq!(record.status, JobState::Processing);
        assert_eq!(record.progress, 0);
        assert_eq!(record.message, "video job started");
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let record = StatusRecord::started(Uuid::new_v4(), JobKind::Batch);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "processing");
        assert_eq!(json["kind"], "batch");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Error.is_terminal());
    }
}
