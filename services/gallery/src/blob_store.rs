use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Key prefix under which payloads are stored and served
pub const UPLOADS_PREFIX: &str = "uploads";

/// Blob storage failures
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Failed to prepare upload directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write blob {name}: {source}")]
    Write {
        name: String,
        source: std::io::Error,
    },

    #[error("Failed to delete blob {name}: {source}")]
    Delete {
        name: String,
        source: std::io::Error,
    },

    #[error("Failed to upload blob {name} to S3: {message}")]
    S3 { name: String, message: String },
}

/// Durable storage for uploaded payloads
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `name` and return the URL the payload is reachable at
    async fn put(&self, name: &str, bytes: Bytes) -> Result<String, BlobError>;

    /// Remove a payload whose record was never created
    async fn delete(&self, name: &str) -> Result<(), BlobError>;
}

/// Collision-resistant blob name that keeps the original extension.
///
/// Two uploads of `cat.png` in the same millisecond still get distinct names
/// thanks to the random suffix.
pub fn generate_blob_name(original_filename: &str) -> String {
    let stem = format!(
        "{}-{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    );

    match file_extension(original_filename) {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

/// Lower-cased extension of a filename, if it has a usable one
fn file_extension(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?;
    let valid = !ext.is_empty()
        && ext.len() <= 10
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

/// Get content type for a blob name
pub fn content_type_for(name: &str) -> &'static str {
    match file_extension(name).as_deref() {
        Some("jpeg" | "jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Payloads written to a local upload directory
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    /// Create the upload directory if needed; done once at startup
    pub async fn new(
        root: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|source| BlobError::Prepare {
                path: root.clone(),
                source,
            })?;

        info!(path = %root.display(), "Upload directory ready");

        Ok(Self {
            root,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn put(&self, name: &str, bytes: Bytes) -> Result<String, BlobError> {
        let path = self.root.join(name);
        let write_err = |source: std::io::Error| BlobError::Write {
            name: name.to_string(),
            source,
        };

        // create_new: never overwrite an existing payload
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(write_err)?;
        file.write_all(&bytes).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;

        debug!(path = %path.display(), "Blob written");

        Ok(format!("{}/{}/{}", self.public_base_url, UPLOADS_PREFIX, name))
    }

    async fn delete(&self, name: &str) -> Result<(), BlobError> {
        fs::remove_file(self.root.join(name))
            .await
            .map_err(|source| BlobError::Delete {
                name: name.to_string(),
                source,
            })?;

        debug!(blob = %name, "Blob deleted");
        Ok(())
    }
}

/// Payloads uploaded to an S3 bucket
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    public_base_url: String,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

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

        let public_base_url = config
            .public_base_url
            .clone()
            .unwrap_or_else(|| {
                format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region)
            })
            .trim_end_matches('/')
            .to_string();

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url,
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, bytes), fields(bucket = %self.bucket, size_bytes = bytes.len()))]
    async fn put(&self, name: &str, bytes: Bytes) -> Result<String, BlobError> {
        let key = format!("{UPLOADS_PREFIX}/{name}");

        // if_none_match("*") keeps an existing object from being replaced
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type(content_type_for(name))
            .if_none_match("*")
            .send()
            .await
            .map_err(|e| BlobError::S3 {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        debug!(key = %key, "Blob uploaded to S3");

        Ok(format!("{}/{}", self.public_base_url, key))
    }

    async fn delete(&self, name: &str) -> Result<(), BlobError> {
        let key = format!("{UPLOADS_PREFIX}/{name}");

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| BlobError::S3 {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        debug!(key = %key, "Blob deleted from S3");
        Ok(())
    }
}
