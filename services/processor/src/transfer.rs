use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

const SCHEME: &str = "s3://";

/// Errors that can occur while moving objects to or from storage
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid object path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Object not found: {0}")]
    NotFound(ObjectPath),

    #[error("Storage request failed for {path}: {message}")]
    Transport { path: ObjectPath, message: String },

    #[error("Local file error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Location of an object: `s3://<bucket>/<key...>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPath {
    pub bucket: String,
    pub key: String,
}

impl ObjectPath {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Last key segment
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Path with the last key segment removed
    pub fn parent(&self) -> ObjectPath {
        let key = match self.key.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        ObjectPath::new(self.bucket.clone(), key)
    }

    /// Path of `name` directly under this one
    pub fn join(&self, name: &str) -> ObjectPath {
        let prefix = self.key.trim_end_matches('/');
        let key = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        };
        ObjectPath::new(self.bucket.clone(), key)
    }
}

impl FromStr for ObjectPath {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| TransferError::InvalidPath {
            path: s.to_string(),
            reason,
        };

        let rest = s.strip_prefix(SCHEME).ok_or_else(|| invalid("expected s3:// scheme"))?;
        let (bucket, key) = rest.split_once('/').ok_or_else(|| invalid("missing object key"))?;

        if bucket.is_empty() {
            return Err(invalid("missing bucket"));
        }
        if key.is_empty() {
            return Err(invalid("missing object key"));
        }

        Ok(ObjectPath::new(bucket, key))
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", SCHEME, self.bucket, self.key)
    }
}

/// Raw object storage operations
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the full object body
    async fn get(&self, path: &ObjectPath) -> Result<Vec<u8>, TransferError>;

    /// Write `data` to `path`, replacing any existing object
    async fn put(&self, data: Vec<u8>, path: &ObjectPath) -> Result<(), TransferError>;

    /// Create an empty "folder" marker for `path`
    async fn create_prefix(&self, path: &ObjectPath) -> Result<(), TransferError>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "processor-config",
            ));
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(region = %config.region, "S3 object store initialized");

        Self {
            client,
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: config.part_size_bytes,
        }
    }

    fn transport<E>(path: &ObjectPath, err: E) -> TransferError
    where
        E: std::error::Error,
    {
        TransferError::Transport {
            path: path.clone(),
            message: DisplayErrorContext(err).to_string(),
        }
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, data: Vec<u8>, path: &ObjectPath) -> Result<(), TransferError> {
        self.client
            .put_object()
            .bucket(&path.bucket)
            .key(&path.key)
            .body(ByteStream::from(data))
            .content_type(content_type_for(&path.key))
            .send()
            .await
            .map_err(|e| Self::transport(path, e))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(&self, data: Vec<u8>, path: &ObjectPath) -> Result<(), TransferError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&path.bucket)
            .key(&path.key)
            .content_type(content_type_for(&path.key))
            .send()
            .await
            .map_err(|e| Self::transport(path, e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| TransferError::Transport {
                path: path.clone(),
                message: "no upload id in multipart response".to_string(),
            })?;

        let mut completed_parts = Vec::new();

        for (index, chunk) in data.chunks(self.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&path.bucket)
                .key(&path.key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| Self::transport(path, e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&path.bucket)
            .key(&path.key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| Self::transport(path, e))?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(path = %path))]
    async fn get(&self, path: &ObjectPath) -> Result<Vec<u8>, TransferError> {
        let output = match self
            .client
            .get_object()
            .bucket(&path.bucket)
            .key(&path.key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(TransferError::NotFound(path.clone()));
                }
                return Err(Self::transport(path, e));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| Self::transport(path, e))?;

        Ok(body.into_bytes().to_vec())
    }

    #[instrument(skip(self, data), fields(path = %path, size_bytes = data.len()))]
    async fn put(&self, data: Vec<u8>, path: &ObjectPath) -> Result<(), TransferError> {
        if data.len() > self.multipart_threshold_bytes {
            self.multipart_upload(data, path).await
        } else {
            self.simple_upload(data, path).await
        }
    }

    async fn create_prefix(&self, path: &ObjectPath) -> Result<(), TransferError> {
        let marker = ObjectPath::new(path.bucket.clone(), folder_key(&path.key));

        self.client
            .put_object()
            .bucket(&marker.bucket)
            .key(&marker.key)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| Self::transport(&marker, e))?;

        Ok(())
    }
}

/// Download/upload by path with a local staging directory.
///
/// Shared by the pipeline orchestrator and the bulk upload worker.
pub struct ObjectTransfer {
    store: Arc<dyn ObjectStore>,
    staging_dir: PathBuf,
}

impl ObjectTransfer {
    pub fn new(store: Arc<dyn ObjectStore>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            staging_dir: staging_dir.into(),
        }
    }

    /// Fetch `remote` into the staging directory, overwriting a previous copy
    #[instrument(skip(self), fields(remote = %remote))]
    pub async fn download(&self, remote: &ObjectPath) -> Result<PathBuf, TransferError> {
        let file_name = remote.file_name();
        if file_name.is_empty() || file_name == "." || file_name == ".." {
            return Err(TransferError::InvalidPath {
                path: remote.to_string(),
                reason: "object key has no usable file name",
            });
        }

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| TransferError::io(&self.staging_dir, e))?;

        let data = self.store.get(remote).await?;
        let local_path = self.staging_dir.join(file_name);

        tokio::fs::write(&local_path, &data)
            .await
            .map_err(|e| TransferError::io(&local_path, e))?;

        metrics::counter!("processor.bytes.downloaded").increment(data.len() as u64);
        info!(local_path = %local_path.display(), size_bytes = data.len(), "Downloaded object");

        Ok(local_path)
    }

    /// Upload a local file to `remote`, replacing any existing object
    #[instrument(skip(self), fields(local = %local.display(), remote = %remote))]
    pub async fn upload(&self, local: &Path, remote: &ObjectPath) -> Result<(), TransferError> {
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| TransferError::io(local, e))?;
        let size = data.len();

        self.store.put(data, remote).await?;

        metrics::counter!("processor.bytes.uploaded").increment(size as u64);
        debug!(size_bytes = size, "Uploaded file");
        Ok(())
    }

    /// Create the folder marker for `remote`
    pub async fn ensure_prefix(&self, remote: &ObjectPath) -> Result<(), TransferError> {
        self.store.create_prefix(remote).await?;
        debug!(prefix = %remote, "Ensured prefix marker");
        Ok(())
    }
}

/// Key of the empty object that marks a folder
pub fn folder_key(key: &str) -> String {
    if key.ends_with('/') {
        key.to_string()
    } else {
        format!("{}/", key)
    }
}

/// Get content type from the key's extension
fn content_type_for(key: &str) -> &'static str {
    let extension = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "txt" | "log" => "text/plain; charset=utf-8",
        "json" => "application/json",
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "mp4" => "video/mp4",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryObjectStore;

    #[test]
    fn test_parse_object_path() {
        let path: ObjectPath = "s3://eonpod-data/CIS/Science/16-09-2024_06-34-24/notes.txt"
            .parse()
            .unwrap();
        assert_eq!(path.bucket, "eonpod-data");
        assert_eq!(path.key, "CIS/Science/16-09-2024_06-34-24/notes.txt");
        assert_eq!(path.file_name(), "notes.txt");
        assert_eq!(
            path.parent().to_string(),
            "s3://eonpod-data/CIS/Science/16-09-2024_06-34-24"
        );
    }

    #[test]
    fn test_parse_rejects_bad_paths() {
        for bad in ["eonpod-data/key", "s3://", "s3://bucket", "s3://bucket/", "s3:///key"] {
            assert!(
                matches!(bad.parse::<ObjectPath>(), Err(TransferError::InvalidPath { .. })),
                "accepted {}",
                bad
            );
        }
    }

    #[test]
    fn test_join_and_folder_key() {
        let base = ObjectPath::new("b", "CIS/Science/");
        assert_eq!(base.join("a.txt").key, "CIS/Science/a.txt");
        assert_eq!(ObjectPath::new("b", "").join("a.txt").key, "a.txt");
        assert_eq!(folder_key("CIS/Science"), "CIS/Science/");
        assert_eq!(folder_key("CIS/Science/"), "CIS/Science/");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a/b_summary.txt"), "text/plain; charset=utf-8");
        assert_eq!(content_type_for("a/b_result.JSON"), "application/json");
        assert_eq!(content_type_for("a/recording.mp4"), "video/mp4");
        assert_eq!(content_type_for("a/noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_download_creates_staging_dir_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let remote = ObjectPath::new("bucket", "CIS/Science/lecture.txt");
        store.insert(&remote, b"first");

        let staging = tmp.path().join("downloads");
        let transfer = ObjectTransfer::new(store.clone(), &staging);

        let local = transfer.download(&remote).await.unwrap();
        assert_eq!(local, staging.join("lecture.txt"));
        assert_eq!(std::fs::read(&local).unwrap(), b"first");

        store.insert(&remote, b"second");
        transfer.download(&remote).await.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_download_missing_object() {
        let tmp = tempfile::tempdir().unwrap();
        let transfer = ObjectTransfer::new(Arc::new(InMemoryObjectStore::new()), tmp.path());

        let result = transfer
            .download(&ObjectPath::new("bucket", "missing.txt"))
            .await;
        assert!(matches!(result, Err(TransferError::NotFound(_))));
        assert!(!tmp.path().join("missing.txt").exists());
    }

    #[tokio::test]
    async fn test_upload_and_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let transfer = ObjectTransfer::new(store.clone(), tmp.path());

        let local = tmp.path().join("quiz.txt");
        std::fs::write(&local, "Question: ?").unwrap();

        let remote = ObjectPath::new("bucket", "CIS/Science/ts/quiz.txt");
        transfer.ensure_prefix(&remote.parent()).await.unwrap();
        transfer.upload(&local, &remote).await.unwrap();

        assert_eq!(store.object(&remote).unwrap(), b"Question: ?");
        assert!(store
            .object(&ObjectPath::new("bucket", "CIS/Science/ts/"))
            .unwrap()
            .is_empty());
    }
}
