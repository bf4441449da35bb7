use std::io::Cursor;
use std::sync::Arc;

use chrono::Utc;
use image::{ImageFormat, RgbImage};
use uuid::Uuid;

use crate::jobs::{validate_config, DetectionEngine, JobError, JobReporter, UploadedFile};
use crate::models::artifact::{ArtifactKind, ArtifactNames, ArtifactRef};
use crate::models::detection::DetectionConfig;
use crate::models::job::JobKind;
use crate::models::responses::{ImageInfo, ImageJobResult, Parameters};
use crate::services::storage::{ArtifactStore, StorageError};

#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub job_id: Uuid,
    pub file: UploadedFile,
    pub config: DetectionConfig,
}

impl ImageRequest {
    pub fn new(file: UploadedFile, config: DetectionConfig) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            file,
            config,
        }
    }

    fn validate(&self) -> Result<(), JobError> {
        validate_config(&self.config)?;
        self.file.ensure_kind("image")
    }
}

/// How one image reports back. A standalone job publishes every stage; a batch
/// member only honours the batch's cancellation.
#[derive(Clone, Copy)]
pub(crate) struct ImageStages<'a> {
    reporter: &'a JobReporter,
    publish: bool,
}

impl<'a> ImageStages<'a> {
    pub(crate) fn standalone(reporter: &'a JobReporter) -> Self {
        Self {
            reporter,
            publish: true,
        }
    }

    pub(crate) fn batch_member(reporter: &'a JobReporter) -> Self {
        Self {
            reporter,
            publish: false,
        }
    }

    fn advance(&self, progress: u8, message: impl Into<String>) {
        if self.publish {
            self.reporter.advance(progress, message);
        }
    }

    fn checkpoint(&self) -> Result<(), JobError> {
        self.reporter.checkpoint()
    }
}

/// A stored input that is deleted when dropped, including when the job future is
/// abandoned mid-flight by a timeout.
struct StagedInput {
    store: Arc<dyn ArtifactStore>,
    artifact: Option<ArtifactRef>,
}

impl StagedInput {
    async fn remove(mut self) {
        if let Some(artifact) = self.artifact.take() {
            delete_input(self.store.as_ref(), &artifact).await;
        }
    }
}

impl Drop for StagedInput {
    fn drop(&mut self) {
        let Some(artifact) = self.artifact.take() else {
            return;
        };
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { delete_input(store.as_ref(), &artifact).await });
            }
            Err(_) => {
                tracing::warn!(key = %artifact.key, "No runtime to delete abandoned input");
            }
        }
    }
}

async fn delete_input(store: &dyn ArtifactStore, input: &ArtifactRef) {
    match store.delete(input).await {
        // Already swept by cleanup.
        Ok(()) | Err(StorageError::NotFound(_)) => {}
        Err(e) => tracing::warn!(key = %input.key, error = %e, "Failed to delete input artifact"),
    }
}

/// Formats written back in the same encoding as the upload; anything else becomes PNG.
fn output_format(input: Option<ImageFormat>) -> ImageFormat {
    match input {
        Some(format @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)) => format,
        _ => ImageFormat::Png,
    }
}

fn encode_image(image: &RgbImage, format: ImageFormat) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, format)?;
    Ok(buffer.into_inner())
}

fn label_file(lines: &[String]) -> String {
    let mut contents = lines.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    contents
}

impl DetectionEngine {
    /// Detect objects in one image and wait for the result.
    pub async fn run_image(&self, request: ImageRequest) -> Result<ImageJobResult, JobError> {
        request.validate()?;
        let reporter = JobReporter::start(self.registry.clone(), request.job_id, JobKind::Image);
        self.execute_image(&reporter, request).await
    }

    /// Register the job and process it in the background.
    pub fn submit_image(self: &Arc<Self>, request: ImageRequest) -> Result<Uuid, JobError> {
        request.validate()?;
        let job_id = request.job_id;
        let reporter = JobReporter::start(self.registry.clone(), job_id, JobKind::Image);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _ = engine.execute_image(&reporter, request).await;
        });
        Ok(job_id)
    }

    async fn execute_image(
        &self,
        reporter: &JobReporter,
        request: ImageRequest,
    ) -> Result<ImageJobResult, JobError> {
        self.drive(reporter, async {
            let names = ArtifactNames::for_job(request.job_id);
            let result = self
                .process_image(
                    &names,
                    &request.file,
                    &request.config,
                    ImageStages::standalone(reporter),
                )
                .await?;
            reporter.checkpoint()?;
            let message = format!("Detected {} objects", result.total_detections);
            reporter.complete(message, serde_json::to_value(&result)?, |_| {});
            Ok(result)
        })
        .await
    }

    /// Persist, decode, detect and write outputs for one image.
    ///
    /// The input artifact is deleted on every path once it has been stored. Outputs
    /// are only written while the job has not been cancelled.
    pub(crate) async fn process_image(
        &self,
        names: &ArtifactNames,
        file: &UploadedFile,
        config: &DetectionConfig,
        stages: ImageStages<'_>,
    ) -> Result<ImageJobResult, JobError> {
        let format = image::guess_format(&file.data).ok();
        let input_ext = format
            .and_then(|f| f.extensions_str().first().map(|e| e.to_string()))
            .or_else(|| file.extension())
            .unwrap_or_else(|| "bin".to_string());
        let content_type = file
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());

        stages.checkpoint()?;
        let input = self
            .store
            .put(&names.input(&input_ext), ArtifactKind::Input, &file.data, &content_type)
            .await?;
        let input = StagedInput {
            store: Arc::clone(&self.store),
            artifact: Some(input),
        };
        stages.advance(20, "Input stored");

        let outcome = self.detect_stored_image(names, file, format, config, stages).await;

        input.remove().await;
        if outcome.is_ok() {
            stages.advance(99, "Input removed");
        }
        outcome
    }

    async fn detect_stored_image(
        &self,
        names: &ArtifactNames,
        file: &UploadedFile,
        format: Option<ImageFormat>,
        config: &DetectionConfig,
        stages: ImageStages<'_>,
    ) -> Result<ImageJobResult, JobError> {
        let data = file.data.clone();
        let frame = tokio::task::spawn_blocking(move || {
            image::load_from_memory(&data).map(|decoded| decoded.to_rgb8())
        })
        .await
        .map_err(|e| JobError::Setup(format!("decode worker failed: {e}")))?
        .map_err(|e| JobError::InvalidInput(format!("Invalid image file: {e}")))?;
        let (width, height) = frame.dimensions();
        stages.advance(40, format!("Image decoded ({width}x{height})"));

        let (detections, annotated) = self.detect_frame(&frame, config).await?;
        stages.advance(60, format!("Detected {} objects", detections.len()));

        let out_format = output_format(format);
        let out_ext = out_format.extensions_str().first().copied().unwrap_or("png");
        let encoded = tokio::task::spawn_blocking(move || encode_image(&annotated, out_format))
            .await
            .map_err(|e| JobError::Setup(format!("encode worker failed: {e}")))?
            .map_err(|e| JobError::Setup(format!("failed to encode annotated image: {e}")))?;

        stages.checkpoint()?;
        let output: ArtifactRef = self
            .store
            .put(
                &names.output(out_ext),
                ArtifactKind::AnnotatedOutput,
                &encoded,
                out_format.to_mime_type(),
            )
            .await?;

        let lines: Vec<String> = detections.iter().map(|d| d.label_line()).collect();
        stages.checkpoint()?;
        let labels = self
            .store
            .put(
                &names.labels(),
                ArtifactKind::LabelFile,
                label_file(&lines).as_bytes(),
                "text/plain",
            )
            .await?;
        stages.advance(80, "Outputs stored");

        Ok(ImageJobResult {
            success: true,
            file_id: names.file_id().to_string(),
            total_detections: detections.len(),
            detections,
            image_info: ImageInfo {
                width,
                height,
                filename: file.filename.clone(),
            },
            output_image_url: output.url,
            labels_txt_url: labels.url,
            parameters: Parameters::new(config, None),
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_follows_input() {
        assert_eq!(output_format(Some(ImageFormat::Jpeg)), ImageFormat::Jpeg);
        assert_eq!(output_format(Some(ImageFormat::WebP)), ImageFormat::WebP);
        assert_eq!(output_format(Some(ImageFormat::Bmp)), ImageFormat::Png);
        assert_eq!(output_format(None), ImageFormat::Png);
    }

    #[test]
    fn test_label_file_one_line_per_detection() {
        assert_eq!(label_file(&[]), "");
        let lines = vec![
            "car 1.00 2.00 3.00 4.00 0.9000".to_string(),
            "dog 0.00 0.00 1.00 1.00 0.5000".to_string(),
        ];
        let contents = label_file(&lines);
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn test_request_rejects_bad_threshold() {
        let request = ImageRequest::new(
            UploadedFile::new("a.png", Some("image/png".to_string()), vec![1, 2, 3]),
            DetectionConfig {
                confidence_threshold: 0.0,
                ..DetectionConfig::default()
            },
        );
        assert!(matches!(request.validate(), Err(JobError::InvalidInput(_))));
    }
}
