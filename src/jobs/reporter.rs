use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::jobs::JobError;
use crate::models::job::{JobKind, JobState, StatusRecord};
use crate::services::registry::StatusRegistry;

/// Writes one job's progress into the registry.
///
/// Progress only moves forward and stays below 100 until [`complete`](Self::complete).
pub struct JobReporter {
    registry: Arc<StatusRegistry>,
    job_id: Uuid,
    kind: JobKind,
    progress: AtomicU8,
    cancel: CancellationToken,
}

impl JobReporter {
    /// Register `processing/0` for a new job.
    pub fn start(registry: Arc<StatusRegistry>, job_id: Uuid, kind: JobKind) -> Self {
        let cancel = registry.register(job_id, StatusRecord::started(job_id, kind));
        tracing::info!(job_id = %job_id, kind = %kind, "Job registered");
        Self {
            registry,
            job_id,
            kind,
            progress: AtomicU8::new(0),
            cancel,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn advance(&self, progress: u8, message: impl Into<String>) {
        self.advance_with(progress, message, |_| {});
    }

    /// Move to `progress` (never backwards) and publish, letting `fill` add the
    /// kind-specific fields.
    pub fn advance_with(
        &self,
        progress: u8,
        message: impl Into<String>,
        fill: impl FnOnce(&mut StatusRecord),
    ) {
        let target = progress.min(99);
        let previous = self.progress.fetch_max(target, Ordering::SeqCst);
        let mut record = self.record(JobState::Processing, previous.max(target), message.into());
        fill(&mut record);
        tracing::debug!(
            job_id = %self.job_id,
            progress = record.progress,
            message = %record.message,
            "Job progress"
        );
        self.registry.update(self.job_id, record);
    }

    /// Fail fast if the job was cancelled or cleaned up.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn complete(
        &self,
        message: impl Into<String>,
        result: serde_json::Value,
        fill: impl FnOnce(&mut StatusRecord),
    ) {
        self.progress.store(100, Ordering::SeqCst);
        let mut record = self.record(JobState::Completed, 100, message.into());
        record.result = Some(result);
        fill(&mut record);
        self.registry.update(self.job_id, record);
    }

    pub fn fail(&self, error: &JobError) {
        let record = self.record(JobState::Error, self.progress(), error.to_string());
        self.registry.update(self.job_id, record);
    }

    fn record(&self, status: JobState, progress: u8, message: String) -> StatusRecord {
        StatusRecord {
            job_id: self.job_id,
            kind: self.kind,
            status,
            progress,
            message,
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
    use std::time::Duration;

    fn reporter() -> (Arc<StatusRegistry>, JobReporter) {
        let registry = Arc::new(StatusRegistry::new(Duration::from_secs(60)));
        let reporter = JobReporter::start(registry.clone(), Uuid::new_v4(), JobKind::Image);
        (registry, reporter)
    }

    #[test]
    fn test_progress_never_decreases() {
        let (registry, reporter) = reporter();
        reporter.advance(40, "decoded");
        reporter.advance(20, "late update");
        let record = registry.get(reporter.job_id()).unwrap();
        assert_eq!(record.progress, 40);
        assert_eq!(record.message, "late update");
    }

    #[test]
    fn test_progress_capped_until_complete() {
        let (registry, reporter) = reporter();
        reporter.advance(100, "almost");
        assert_eq!(registry.get(reporter.job_id()).unwrap().progress, 99);

        reporter.complete("done", serde_json::json!({"ok": true}), |_| {});
        let record = registry.get(reporter.job_id()).unwrap();
        assert_eq!(record.status, JobState::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.result, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn test_fail_keeps_progress_and_message() {
        let (registry, reporter) = reporter();
        reporter.advance(60, "detecting");
        reporter.fail(&JobError::InvalidInput("bad bytes".to_string()));
        let record = registry.get(reporter.job_id()).unwrap();
        assert_eq!(record.status, JobState::Error);
        assert_eq!(record.progress, 60);
        assert!(record.message.contains("bad bytes"));
    }

    #[test]
    fn test_checkpoint_observes_cancel() {
        let (registry, reporter) = reporter();
        assert!(reporter.checkpoint().is_ok());
        registry.cancel(reporter.job_id());
        assert!(matches!(reporter.checkpoint(), Err(JobError::Cancelled)));
    }
}
