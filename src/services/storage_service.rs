//! src/services/storage_service.rs
//!
//! The capability the gateway needs from an object-storage backend: put, get
//! (with stat), list, delete, plus a readiness check. Handlers only ever see
//! `dyn ObjectStorage`; retries, auth and connection pooling stay inside each
//! backend.

use crate::models::object::{ObjectInfo, ObjectRef, ObjectStream, UploadDescriptor};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::{fmt, io, sync::Arc};
use thiserror::Error;

/// Machine-readable code the backends use for a missing object.
pub const NO_SUCH_KEY: &str = "NoSuchKey";

/// Lazy listing of keys. Dropping the stream stops the enumeration.
pub type KeyStream = BoxStream<'static, StorageResult<String>>;

/// The one backend handle shared by every request.
pub type SharedStorage = Arc<dyn ObjectStorage>;

/// Structured error reported by the storage service itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorResponse {
    pub message: String,
    pub code: String,
    pub bucket: String,
    pub key: String,
    /// HTTP status returned by the backend, 0 when unknown.
    pub status: u16,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Backend(ErrorResponse),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("{0}")]
    Transport(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Structured "object does not exist" error, shaped like an S3 `NoSuchKey`.
    pub fn no_such_key(object: &ObjectRef) -> Self {
        Self::Backend(ErrorResponse {
            message: "The specified key does not exist.".into(),
            code: NO_SUCH_KEY.into(),
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            status: 404,
        })
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Backend(resp) => resp.code == NO_SUCH_KEY,
            Self::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Render every diagnostic field the error carries, for logs only.
    pub fn verbose(&self) -> String {
        match self {
            Self::Backend(resp) => format!(
                "{} [code: {}, bucket: {}, key: {}, http_status: {}]",
                resp.message, resp.code, resp.bucket, resp.key, resp.status
            ),
            other => other.to_string(),
        }
    }
}

/// An open object: its byte stream plus the outcome of the stat lookup.
///
/// `info` is a separate result because a read may still proceed when only
/// the metadata lookup failed.
pub struct ObjectReader {
    pub body: ObjectStream,
    pub info: StorageResult<ObjectInfo>,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stream `upload.body` into `object` and return the number of bytes written.
    async fn put(&self, object: &ObjectRef, upload: UploadDescriptor) -> StorageResult<u64>;

    /// Open `object` for reading.
    async fn get(&self, object: &ObjectRef) -> StorageResult<ObjectReader>;

    /// Recursively enumerate keys under `prefix`, in backend order.
    fn list(&self, bucket: &str, prefix: &str) -> KeyStream;

    /// Remove `object`. A missing object is reported as a not-found error.
    async fn delete(&self, object: &ObjectRef) -> StorageResult<()>;

    /// Cheap round trip proving the backend is reachable.
    async fn check(&self) -> StorageResult<()>;
}
