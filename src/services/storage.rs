use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::TryStreamExt;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::{InspectReader, StreamReader};
use uuid::Uuid;

use crate::models::job::BlobRef;
use crate::models::submission::BlobRelease;

/// Readable stream of blob content.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// A blob that has been fully written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub blob: BlobRef,
    pub size: u64,
}

/// Uniform interface over the binary store holding every input and output.
///
/// Content always moves as streams so large artifacts never need to fit in
/// memory. The store is the source of truth; nothing is cached in process.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `content` into the store. The blob becomes visible only once the
    /// whole stream has been written.
    async fn put(
        &self,
        name: &str,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<StoredBlob, StorageError>;

    /// Open a blob for reading. Fails with [`StorageError::NotFound`] for
    /// unknown or deleted blobs.
    async fn get(&self, blob: &BlobRef) -> Result<BlobReader, StorageError>;

    /// Delete a blob. Deleting an absent blob succeeds.
    async fn delete(&self, blob: &BlobRef) -> Result<(), StorageError>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<(), StorageError>;

    /// Stream a blob into a local file, returning the bytes written.
    async fn materialize_to_local(&self, blob: &BlobRef, path: &Path) -> Result<u64, StorageError> {
        let mut reader = self.get(blob).await?;
        let mut file = tokio::fs::File::create(path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(written)
    }

    /// Delete every blob, reporting each outcome instead of stopping at the
    /// first failure.
    async fn release_all(&self, blobs: &[BlobRef]) -> Vec<BlobRelease> {
        let mut releases = Vec::with_capacity(blobs.len());
        for blob in blobs {
            let outcome = self.delete(blob).await;
            if let Err(ref e) = outcome {
                tracing::warn!(blob = %blob, error = %e, "Failed to release blob");
            }
            releases.push(BlobRelease {
                blob: blob.clone(),
                released: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }
        releases
    }
}

/// Build a fresh, unique object key that keeps a readable trace of the name.
fn blob_key(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .rev()
        .take(96)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}", Uuid::new_v4().simple(), cleaned.trim_start_matches('.'))
}

/// Content type for an artifact, guessed from its file extension.
pub fn content_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Client for S3-compatible object storage (Cloudflare R2, MinIO, AWS).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        region: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }
}

fn map_s3(key: &str, err: S3Error) -> StorageError {
    match err {
        S3Error::HttpFailWithBody(404, _) => StorageError::NotFound(key.to_string()),
        other => StorageError::S3(other),
    }
}

#[async_trait]
impl BlobStore for R2Client {
    async fn put(
        &self,
        name: &str,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<StoredBlob, StorageError> {
        let key = blob_key(name);
        let mut size = 0u64;
        {
            let mut reader = InspectReader::new(content, |chunk: &[u8]| size += chunk.len() as u64);
            self.bucket
                .put_object_stream_with_content_type(&mut reader, &key, content_type_for(name))
                .await
                .map_err(|e| map_s3(&key, e))?;
        }
        Ok(StoredBlob {
            blob: BlobRef::new(key),
            size,
        })
    }

    async fn get(&self, blob: &BlobRef) -> Result<BlobReader, StorageError> {
        let key = blob.as_str();
        let response = self
            .bucket
            .get_object_stream(key)
            .await
            .map_err(|e| map_s3(key, e))?;
        let chunks = response.bytes.map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(chunks)))
    }

    async fn delete(&self, blob: &BlobRef) -> Result<(), StorageError> {
        match self.bucket.delete_object(blob.as_str()).await {
            Ok(_) => Ok(()),
            Err(e) => match map_s3(blob.as_str(), e) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        match self.bucket.head_object("health-check").await {
            Ok(_) => Ok(()),
            Err(e) => match map_s3("health-check", e) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn materialize_to_local(&self, blob: &BlobRef, path: &Path) -> Result<u64, StorageError> {
        let key = blob.as_str();
        let mut file = tokio::fs::File::create(path).await?;
        self.bucket
            .get_object_to_writer(key, &mut file)
            .await
            .map_err(|e| map_s3(key, e))?;
        file.flush().await?;
        Ok(tokio::fs::metadata(path).await?.len())
    }
}

/// Blob store backed by a local directory.
///
/// Writes land in `tmp/` and are renamed into `objects/` once complete, so a
/// reader never sees a partial blob. Unfinished writes are removed.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("objects")).await?;
        tokio::fs::create_dir_all(root.join("tmp")).await?;
        Ok(Self { root })
    }

    fn object_path(&self, blob: &BlobRef) -> Result<PathBuf, StorageError> {
        let key = blob.as_str();
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(self.root.join("objects").join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        name: &str,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<StoredBlob, StorageError> {
        let blob = BlobRef::new(blob_key(name));
        let target = self.object_path(&blob)?;

        // Removed on drop unless persisted, including when this future is
        // dropped mid-copy.
        let staged = tempfile::Builder::new()
            .prefix(blob.as_str())
            .suffix(".part")
            .tempfile_in(self.root.join("tmp"))?;

        let mut file = tokio::fs::File::from_std(staged.reopen()?);
        let size = tokio::io::copy(content, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        staged.persist(&target).map_err(|e| StorageError::Io(e.error))?;
        Ok(StoredBlob { blob, size })
    }

    async fn get(&self, blob: &BlobRef) -> Result<BlobReader, StorageError> {
        match tokio::fs::File::open(self.object_path(blob)?).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(blob.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, blob: &BlobRef) -> Result<(), StorageError> {
        let path = match self.object_path(blob) {
            Ok(path) => path,
            Err(StorageError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        tokio::fs::metadata(self.root.join("objects")).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
