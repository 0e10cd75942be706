//! Represents an object (file) addressed through the gateway.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use sqlx::FromRow;
use std::{collections::BTreeMap, fmt, io};

/// Content type used whenever the backend cannot tell us better.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Request header prefix carrying user-defined object metadata.
pub const USER_METADATA_PREFIX: &str = "x-amz-meta-";

/// A pull-based stream of object bytes.
pub type ObjectStream = BoxStream<'static, io::Result<Bytes>>;

/// Identifies a single object within a bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Top-level namespace in the storage backend (never contains `/`).
    pub bucket: String,

    /// Object key, taken verbatim from the decoded request path.
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Everything a backend needs to store one upload.
///
/// Built once per request from its headers and consumed by exactly one
/// `ObjectStorage::put` call.
pub struct UploadDescriptor {
    /// `Content-Type` of the request, `None` lets the backend pick its default.
    pub content_type: Option<String>,

    /// Parsed `Content-Length`; `None` means unknown and is never verified.
    pub declared_size: Option<u64>,

    /// User metadata (`x-amz-meta-*` headers, prefix stripped).
    pub metadata: BTreeMap<String, String>,

    /// The request body.
    pub body: ObjectStream,
}

impl fmt::Debug for UploadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadDescriptor")
            .field("content_type", &self.content_type)
            .field("declared_size", &self.declared_size)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Object metadata as reported by the backend on read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Payload size when the backend reports one.
    pub size: Option<u64>,

    /// MIME type stored with the object.
    pub content_type: String,

    /// Extra response headers, keyed by header name and copied verbatim.
    pub metadata: BTreeMap<String, Vec<String>>,
}

impl ObjectInfo {
    /// Turn user metadata into the header map returned to clients.
    pub fn user_metadata_headers<'a, I>(entries: I) -> BTreeMap<String, Vec<String>>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        entries
            .into_iter()
            .map(|(name, value)| {
                (
                    format!("{}{}", USER_METADATA_PREFIX, name.to_ascii_lowercase()),
                    vec![value.clone()],
                )
            })
            .collect()
    }
}

/// Row stored by the local backend for every object.
#[derive(Clone, FromRow, Debug)]
pub struct ObjectRecord {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub size_bytes: i64,

    /// MD5 of the payload, hex encoded.
    pub etag: String,

    /// JSON encoded user metadata.
    pub metadata: String,
    pub last_modified: DateTime<Utc>,
}

impl ObjectRecord {
    /// Decode the stored row into the metadata returned on read.
    pub fn info(&self) -> serde_json::Result<ObjectInfo> {
        let user: BTreeMap<String, String> = serde_json::from_str(&self.metadata)?;
        let mut metadata = ObjectInfo::user_metadata_headers(&user);
        metadata.insert("etag".into(), vec![format!("\"{}\"", self.etag)]);
        metadata.insert(
            "last-modified".into(),
            vec![
                self.last_modified
                    .format("%a, %d %b %Y %H:%M:%S GMT")
                    .to_string(),
            ],
        );

        Ok(ObjectInfo {
            size: u64::try_from(self.size_bytes).ok(),
            content_type: self.content_type.clone(),
            metadata,
        })
    }
}
