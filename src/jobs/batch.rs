use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::jobs::single::ImageStages;
use crate::jobs::{validate_config, DetectionEngine, JobError, JobReporter, UploadedFile};
use crate::models::artifact::ArtifactNames;
use crate::models::detection::DetectionConfig;
use crate::models::job::{JobKind, StatusRecord};
use crate::models::responses::{BatchJobResult, ImageJobResult, Parameters, SkippedFile};

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub batch_id: Uuid,
    pub files: Vec<UploadedFile>,
    pub config: DetectionConfig,
}

impl BatchRequest {
    pub fn new(files: Vec<UploadedFile>, config: DetectionConfig) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            files,
            config,
        }
    }
}

/// Accumulated state of a running batch; the status record is a projection of it.
#[derive(Debug, Default)]
struct BatchRecord {
    total_files: usize,
    processed_files: usize,
    results: Vec<ImageJobResult>,
    skipped: Vec<SkippedFile>,
}

impl BatchRecord {
    fn project(&self, record: &mut StatusRecord) {
        record.total_files = Some(self.total_files);
        record.processed_files = Some(self.processed_files);
        record.result = serde_json::to_value(&self.results).ok();
    }
}

impl DetectionEngine {
    fn validate_batch(&self, request: &BatchRequest) -> Result<(), JobError> {
        validate_config(&request.config)?;
        if request.files.is_empty() {
            return Err(JobError::InvalidInput("No files provided".to_string()));
        }
        if request.files.len() > self.limits.max_batch_files {
            return Err(JobError::InvalidInput(format!(
                "Maximum {} files allowed per batch, got {}",
                self.limits.max_batch_files,
                request.files.len()
            )));
        }
        Ok(())
    }

    /// Process every image in order. Files that fail are skipped, never failing the batch.
    pub async fn run_batch(&self, request: BatchRequest) -> Result<BatchJobResult, JobError> {
        self.validate_batch(&request)?;
        let reporter = JobReporter::start(self.registry.clone(), request.batch_id, JobKind::Batch);
        self.execute_batch(&reporter, request).await
    }

    pub fn submit_batch(self: &Arc<Self>, request: BatchRequest) -> Result<Uuid, JobError> {
        self.validate_batch(&request)?;
        let batch_id = request.batch_id;
        let reporter = JobReporter::start(self.registry.clone(), batch_id, JobKind::Batch);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _ = engine.execute_batch(&reporter, request).await;
        });
        Ok(batch_id)
    }

    async fn execute_batch(
        &self,
        reporter: &JobReporter,
        request: BatchRequest,
    ) -> Result<BatchJobResult, JobError> {
        self.drive(reporter, self.process_batch(reporter, request)).await
    }

    async fn process_batch(
        &self,
        reporter: &JobReporter,
        request: BatchRequest,
    ) -> Result<BatchJobResult, JobError> {
        let batch_id = request.batch_id;
        let total = request.files.len();
        let mut batch = BatchRecord {
            total_files: total,
            ..BatchRecord::default()
        };

        self.store
            .create_namespace(&format!("{batch_id}/"))
            .await
            .map_err(|e| JobError::Setup(format!("failed to create batch namespace: {e}")))?;

        for (index, file) in request.files.iter().enumerate() {
            reporter.checkpoint()?;
            reporter.advance_with(
                (index * 100 / total) as u8,
                format!("Processing file {}/{}: {}", index + 1, total, file.filename),
                |record| batch.project(record),
            );

            let names = ArtifactNames::for_batch_member(batch_id, index);
            let outcome = match file.ensure_kind("image") {
                Ok(()) => {
                    self.process_image(
                        &names,
                        file,
                        &request.config,
                        ImageStages::batch_member(reporter),
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(result) => batch.results.push(result),
                Err(JobError::Cancelled) => return Err(JobError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        batch_id = %batch_id,
                        index,
                        filename = %file.filename,
                        error = %e,
                        "Skipping batch file"
                    );
                    metrics::counter!("batch_files_skipped_total").increment(1);
                    batch.skipped.push(SkippedFile {
                        index,
                        filename: file.filename.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            batch.processed_files += 1;
        }

        let result = BatchJobResult {
            success: true,
            batch_id,
            total_files: batch.total_files,
            processed_files: batch.processed_files,
            total_detections: batch.results.iter().map(|r| r.total_detections).sum(),
            results: batch.results.clone(),
            skipped: batch.skipped.clone(),
            parameters: Parameters::new(&request.config, None),
            timestamp: Utc::now(),
        };

        let message = format!(
            "Batch completed: {} of {} files processed successfully",
            result.results.len(),
            total
        );
        reporter.complete(message, serde_json::to_value(&result)?, |record| {
            record.total_files = Some(batch.total_files);
            record.processed_files = Some(batch.processed_files);
        });
        Ok(result)
    }
}
