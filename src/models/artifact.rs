use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// Role of a persisted blob.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactKind {
    /// Uploaded media, deleted once the job is done with it.
    Input,
    AnnotatedOutput,
    LabelFile,
}

impl ArtifactKind {
    /// Recover the kind from a key produced by [`ArtifactNames`].
    pub fn from_key(key: &str) -> Self {
        if key.ends_with("_labels.txt") {
            ArtifactKind::LabelFile
        } else if key.contains("_input.") {
            ArtifactKind::Input
        } else {
            ArtifactKind::AnnotatedOutput
        }
    }
}

/// Handle to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub kind: ArtifactKind,
    pub url: String,
}

/// Key naming for everything a single unit of work persists.
///
/// Every key starts with the owning job or batch identifier, so cleanup by prefix
/// removes all of a job's outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    stem: String,
}

impl ArtifactNames {
    pub fn for_job(job_id: Uuid) -> Self {
        Self {
            stem: job_id.to_string(),
        }
    }

    /// Member `index` of a batch lives under the batch namespace as `{batch}/{batch}_{index}`.
    pub fn for_batch_member(batch_id: Uuid, index: usize) -> Self {
        Self {
            stem: format!("{batch_id}/{batch_id}_{index}"),
        }
    }

    /// Identifier reported to clients for this unit (the stem without namespace).
    pub fn file_id(&self) -> &str {
        self.stem.rsplit('/').next().unwrap_or(&self.stem)
    }

    pub fn input(&self, extension: &str) -> String {
        format!("{}_input.{extension}", self.stem)
    }

    pub fn output(&self, extension: &str) -> String {
        format!("{}_output.{extension}", self.stem)
    }

    pub fn labels(&self) -> String {
        format!("{}_labels.txt", self.stem)
    }
}
