use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};

use crate::models::artifact::{ArtifactKind, ArtifactRef};

/// Where job inputs and outputs are kept.
///
/// Keys are relative, `/`-separated names produced by
/// [`ArtifactNames`](crate::models::artifact::ArtifactNames).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// Client-facing URL for a key.
    fn url(&self, kind: ArtifactKind, key: &str) -> String;

    async fn put(
        &self,
        key: &str,
        kind: ArtifactKind,
        data: &[u8],
        content_type: &str,
    ) -> Result<ArtifactRef, StorageError>;

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, artifact: &ArtifactRef) -> Result<(), StorageError>;

    /// Size in bytes, or `None` if the artifact does not exist.
    async fn size(&self, artifact: &ArtifactRef) -> Result<Option<u64>, StorageError>;

    /// Every stored artifact whose key starts with `prefix`.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ArtifactRef>, StorageError>;

    /// Prepare a namespace (key prefix ending in `/`) for a batch of outputs.
    async fn create_namespace(&self, namespace: &str) -> Result<(), StorageError>;

    /// Drop an empty namespace. Missing namespaces are not an error.
    async fn remove_namespace(&self, namespace: &str) -> Result<(), StorageError>;
}

/// Filesystem store: inputs under `upload_dir`, outputs under `output_dir`.
pub struct LocalArtifactStore {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl LocalArtifactStore {
    pub async fn new(
        upload_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, StorageError> {
        let store = Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        };
        for dir in [&store.upload_dir, &store.output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StorageError::io(dir, e))?;
        }
        Ok(store)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn root(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Input => &self.upload_dir,
            ArtifactKind::AnnotatedOutput | ArtifactKind::LabelFile => &self.output_dir,
        }
    }

    fn resolve(&self, kind: ArtifactKind, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root(kind).join(relative))
    }

    async fn list_root(
        &self,
        kind: ArtifactKind,
        prefix: &str,
        found: &mut Vec<ArtifactRef>,
    ) -> Result<(), StorageError> {
        let root = self.root(kind);
        let mut entries = tokio::fs::read_dir(root)
            .await
            .map_err(|e| StorageError::io(root, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(root, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(prefix) {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StorageError::io(entry.path(), e))?;

            if file_type.is_file() {
                found.push(self.artifact(kind, name));
            } else if file_type.is_dir() {
                // Batch namespace: one level of member files.
                let dir = entry.path();
                let mut members = tokio::fs::read_dir(&dir)
                    .await
                    .map_err(|e| StorageError::io(&dir, e))?;
                while let Some(member) = members
                    .next_entry()
                    .await
                    .map_err(|e| StorageError::io(&dir, e))?
                {
                    let key = format!("{}/{}", name, member.file_name().to_string_lossy());
                    found.push(self.artifact(kind, key));
                }
            }
        }
        Ok(())
    }

    fn artifact(&self, kind: ArtifactKind, key: String) -> ArtifactRef {
        let kind = match kind {
            ArtifactKind::Input => ArtifactKind::Input,
            _ => ArtifactKind::from_key(&key),
        };
        ArtifactRef {
            url: self.url(kind, &key),
            key,
            kind,
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn url(&self, kind: ArtifactKind, key: &str) -> String {
        match kind {
            ArtifactKind::Input => format!("/uploads/{key}"),
            _ => format!("/outputs/{key}"),
        }
    }

    async fn put(
        &self,
        key: &str,
        kind: ArtifactKind,
        data: &[u8],
        _content_type: &str,
    ) -> Result<ArtifactRef, StorageError> {
        let path = self.resolve(kind, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(ArtifactRef {
            key: key.to_string(),
            kind,
            url: self.url(kind, key),
        })
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(artifact.kind, &artifact.key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(artifact.key.clone()))
            }
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    async fn delete(&self, artifact: &ArtifactRef) -> Result<(), StorageError> {
        let path = self.resolve(artifact.kind, &artifact.key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(artifact.key.clone()))
            }
            Err(e) => return Err(StorageError::io(&path, e)),
        }
        // Drop the namespace directory once its last member is gone; fails while non-empty.
        if let Some(parent) = path.parent() {
            if parent != self.root(artifact.kind) {
                let _ = tokio::fs::remove_dir(parent).await;
            }
        }
        Ok(())
    }

    async fn size(&self, artifact: &ArtifactRef) -> Result<Option<u64>, StorageError> {
        let path = self.resolve(artifact.kind, &artifact.key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ArtifactRef>, StorageError> {
        if prefix.is_empty() {
            return Err(StorageError::InvalidKey(prefix.to_string()));
        }
        let mut found = Vec::new();
        self.list_root(ArtifactKind::AnnotatedOutput, prefix, &mut found)
            .await?;
        self.list_root(ArtifactKind::Input, prefix, &mut found).await?;
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn create_namespace(&self, namespace: &str) -> Result<(), StorageError> {
        let path = self.resolve(ArtifactKind::AnnotatedOutput, namespace.trim_end_matches('/'))?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))
    }

    async fn remove_namespace(&self, namespace: &str) -> Result<(), StorageError> {
        let path = self.resolve(ArtifactKind::AnnotatedOutput, namespace.trim_end_matches('/'))?;
        match tokio::fs::remove_dir(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }
}

/// Cloudflare R2 (S3-compatible) store. Inputs live under `uploads/`, outputs under
/// `outputs/`.
pub struct R2ArtifactStore {
    bucket: Box<Bucket>,
    public_base_url: String,
}

impl R2ArtifactStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: Option<&str>,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let public_base_url = public_base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("{}/{}", endpoint.trim_end_matches('/'), bucket_name));

        Ok(Self {
            bucket,
            public_base_url,
        })
    }

    fn object_key(kind: ArtifactKind, key: &str) -> String {
        match kind {
            ArtifactKind::Input => format!("uploads/{key}"),
            _ => format!("outputs/{key}"),
        }
    }
}

#[async_trait]
impl ArtifactStore for R2ArtifactStore {
    fn backend(&self) -> &'static str {
        "r2"
    }

    fn url(&self, kind: ArtifactKind, key: &str) -> String {
        format!("{}/{}", self.public_base_url, Self::object_key(kind, key))
    }

    async fn put(
        &self,
        key: &str,
        kind: ArtifactKind,
        data: &[u8],
        content_type: &str,
    ) -> Result<ArtifactRef, StorageError> {
        self.bucket
            .put_object_with_content_type(Self::object_key(kind, key), data, content_type)
            .await
            .map_err(StorageError::S3)?;
        Ok(ArtifactRef {
            key: key.to_string(),
            kind,
            url: self.url(kind, key),
        })
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StorageError> {
        let response = match self
            .bucket
            .get_object(Self::object_key(artifact.kind, &artifact.key))
            .await
        {
            Ok(response) if response.status_code() == 404 => None,
            Ok(response) => Some(response),
            Err(S3Error::HttpFailWithBody(404, _)) => None,
            Err(e) => return Err(StorageError::S3(e)),
        };
        response
            .map(|r| r.to_vec())
            .ok_or_else(|| StorageError::NotFound(artifact.key.clone()))
    }

    async fn delete(&self, artifact: &ArtifactRef) -> Result<(), StorageError> {
        self.bucket
            .delete_object(Self::object_key(artifact.kind, &artifact.key))
            .await
            .map_err(StorageError::S3)?;
        Ok(())
    }

    async fn size(&self, artifact: &ArtifactRef) -> Result<Option<u64>, StorageError> {
        match self
            .bucket
            .head_object(Self::object_key(artifact.kind, &artifact.key))
            .await
        {
            Ok((_, 404)) | Err(S3Error::HttpFailWithBody(404, _)) => Ok(None),
            Ok((head, _)) => Ok(Some(head.content_length.map_or(0, |len| len.max(0) as u64))),
            Err(e) => Err(StorageError::S3(e)),
        }
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<ArtifactRef>, StorageError> {
        if prefix.is_empty() {
            return Err(StorageError::InvalidKey(prefix.to_string()));
        }
        let mut found = Vec::new();
        for (area, kind) in [
            ("outputs/", ArtifactKind::AnnotatedOutput),
            ("uploads/", ArtifactKind::Input),
        ] {
            let pages = self
                .bucket
                .list(format!("{area}{prefix}"), None)
                .await
                .map_err(StorageError::S3)?;
            for object in pages.into_iter().flat_map(|page| page.contents) {
                let key = object.key.trim_start_matches(area).to_string();
                let kind = match kind {
                    ArtifactKind::Input => ArtifactKind::Input,
                    _ => ArtifactKind::from_key(&key),
                };
                found.push(ArtifactRef {
                    url: self.url(kind, &key),
                    key,
                    kind,
                });
            }
        }
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn create_namespace(&self, _namespace: &str) -> Result<(), StorageError> {
        // Object storage has no directories; prefixes come into being on first write.
        Ok(())
    }

    async fn remove_namespace(&self, _namespace: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),

    #[error("Filesystem operation failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact key: {0:?}")]
    InvalidKey(String),
}

impl StorageError {
    fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}
