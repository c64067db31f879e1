//! Blob store interface for source PDFs and converted page images.
//!
//! References use the `scheme://bucket/key` form. The pipeline core only
//! needs `get` and `put`; the production backend is external, and a
//! directory-backed store covers local runs and tests.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob reference: {0}")]
    InvalidRef(String),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed `scheme://bucket/key` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl BlobRef {
    pub fn parse(reference: &str) -> Result<Self, BlobError> {
        let url = Url::parse(reference).map_err(|e| {
            BlobError::InvalidRef(format!("{}: {}", reference, e))
        })?;

        let bucket = url
            .host_str()
            .ok_or_else(|| BlobError::InvalidRef(format!("{}: missing bucket", reference)))?
            .to_string();

        let key = url.path().trim_start_matches('/').to_string();
        if key.is_empty() {
            return Err(BlobError::InvalidRef(format!("{}: missing key", reference)));
        }

        Ok(Self {
            scheme: url.scheme().to_string(),
            bucket,
            key,
        })
    }

    /// Reference for a converted page image of a scanned document.
    pub fn converted_image(bucket: &str, document_uuid: uuid::Uuid, page: u32) -> Self {
        Self {
            scheme: "s3".to_string(),
            bucket: bucket.to_string(),
            key: format!("converted-images/{}/page-{}.png", document_uuid, page),
        }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

/// Object storage seen by the pipeline.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, reference: &BlobRef) -> Result<Vec<u8>, BlobError>;
    async fn put(&self, reference: &BlobRef, bytes: &[u8]) -> Result<(), BlobError>;
}

/// Directory-backed blob store: `{root}/{bucket}/{key}`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, reference: &BlobRef) -> PathBuf {
        self.root.join(&reference.bucket).join(&reference.key)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, reference: &BlobRef) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(reference);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, reference: &BlobRef, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.path_for(reference);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ref() {
        let r = BlobRef::parse("s3://legal-docs/intake/2024/brief.pdf").unwrap();
        assert_eq!(r.scheme, "s3");
        assert_eq!(r.bucket, "legal-docs");
        assert_eq!(r.key, "intake/2024/brief.pdf");
        assert_eq!(r.to_string(), "s3://legal-docs/intake/2024/brief.pdf");
    }

    #[test]
    fn test_parse_rejects_missing_parts() {
        assert!(BlobRef::parse("not a url").is_err());
        assert!(BlobRef::parse("s3://bucket-only").is_err());
    }

    #[test]
    fn test_converted_image_layout() {
        let doc = uuid::Uuid::nil();
        let r = BlobRef::converted_image("legal-docs", doc, 2);
        assert_eq!(
            r.key,
            "converted-images/00000000-0000-0000-0000-000000000000/page-2.png"
        );
    }

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let r = BlobRef::parse("file://bucket/a/b.pdf").unwrap();

        store.put(&r, b"content").await.unwrap();
        assert_eq!(store.get(&r).await.unwrap(), b"content");

        let missing = BlobRef::parse("file://bucket/missing.pdf").unwrap();
        assert!(matches!(
            store.get(&missing).await,
            Err(BlobError::NotFound(_))
        ));
    }
}
