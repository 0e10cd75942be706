//! src/services/s3_storage.rs
//!
//! `ObjectStorage` backed by any S3-compatible endpoint (AWS, MinIO, ...)
//! through `aws-sdk-s3`. The SDK owns retries, signing and connection
//! pooling; this adapter only maps the gateway's operations onto S3 calls
//! and S3 failures onto `StorageError`.

use crate::{
    models::object::{DEFAULT_CONTENT_TYPE, ObjectInfo, ObjectRef, ObjectStream, UploadDescriptor},
    services::storage_service::{
        ErrorResponse, KeyStream, ObjectReader, ObjectStorage, StorageError, StorageResult,
    },
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region, http::HttpResponse},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::{ByteStream, DateTimeFormat},
    types::{CompletedMultipartUpload, CompletedPart},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use std::{collections::HashMap, fmt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

/// Bodies up to this size go out in one `PutObject`; larger ones are split
/// into multipart parts of (at least) this size. Also the upper bound on
/// upload bytes held in memory per request.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Connection settings for the S3 endpoint.
#[derive(Clone)]
pub struct S3Settings {
    /// `host:port` or a full URL.
    pub endpoint: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub use_ssl: bool,
    pub region: String,
}

impl S3Settings {
    /// Endpoint as a URL; bare `host:port` gets a scheme from `use_ssl`.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else {
            let scheme = if self.use_ssl { "https" } else { "http" };
            format!("{}://{}", scheme, self.endpoint)
        }
    }
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("use_ssl", &self.use_ssl)
            .field("region", &self.region)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    /// Build the client. Static credentials are used when both halves are
    /// configured, otherwise the default AWS credential chain applies.
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .endpoint_url(settings.endpoint_url());

        if let (Some(access_key), Some(secret_key)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "gateway-config",
            ));
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
        }
    }

    async fn put_multipart(
        &self,
        object: &ObjectRef,
        content_type: Option<String>,
        metadata: Option<HashMap<String, String>>,
        first_part: Bytes,
        body: &mut ObjectStream,
    ) -> StorageResult<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .set_content_type(content_type)
            .set_metadata(metadata)
            .send()
            .await
            .map_err(|err| backend_error(err, object))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Transport("multipart upload id missing".into()))?
            .to_string();

        let result = match self.upload_parts(object, &upload_id, first_part, body).await {
            Ok((parts, written)) => self
                .client
                .complete_multipart_upload()
                .bucket(&object.bucket)
                .key(&object.key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map(|_| written)
                .map_err(|err| backend_error(err, object)),
            Err(err) => Err(err),
        };

        if result.is_err() {
            if let Err(err) = self
                .client
                .abort_multipart_upload()
                .bucket(&object.bucket)
                .key(&object.key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                error!(
                    bucket = %object.bucket,
                    key = %object.key,
                    upload_id = %upload_id,
                    error = %backend_error(err, object).verbose(),
                    "failed to abort multipart upload"
                );
            }
        }
        result
    }

    /// Upload parts one at a time, so at most one part is buffered.
    async fn upload_parts(
        &self,
        object: &ObjectRef,
        upload_id: &str,
        first_part: Bytes,
        body: &mut ObjectStream,
    ) -> StorageResult<(Vec<CompletedPart>, u64)> {
        let mut parts = Vec::new();
        let mut written: u64 = 0;
        let mut part = first_part;
        let mut part_number: i32 = 1;

        while !part.is_empty() {
            let len = part.len();
            let resp = self
                .client
                .upload_part()
                .bucket(&object.bucket)
                .key(&object.key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_length(len as i64)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|err| backend_error(err, object))?;

            debug!(part_number, len, "uploaded part of {}", object);
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(resp.e_tag().map(str::to_string))
                    .build(),
            );
            written += len as u64;

            if len < PART_SIZE {
                break;
            }
            part = read_part(body, PART_SIZE).await?;
            part_number += 1;
        }

        Ok((parts, written))
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    /// Small bodies become a single `PutObject`; anything that fills a whole
    /// part switches to a multipart upload, which also covers unknown sizes.
    async fn put(&self, object: &ObjectRef, upload: UploadDescriptor) -> StorageResult<u64> {
        let UploadDescriptor {
            content_type,
            metadata,
            mut body,
            ..
        } = upload;
        let metadata: Option<HashMap<String, String>> =
            (!metadata.is_empty()).then(|| metadata.into_iter().collect());

        let first_part = read_part(&mut body, PART_SIZE).await?;
        if first_part.len() >= PART_SIZE {
            return self
                .put_multipart(object, content_type, metadata, first_part, &mut body)
                .await;
        }

        let written = first_part.len() as u64;
        self.client
            .put_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .set_content_type(content_type)
            .set_metadata(metadata)
            .content_length(written as i64)
            .body(ByteStream::from(first_part))
            .send()
            .await
            .map_err(|err| backend_error(err, object))?;

        Ok(written)
    }

    async fn get(&self, object: &ObjectRef) -> StorageResult<ObjectReader> {
        let output = self
            .client
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|err| backend_error(err, object))?;

        let mut metadata = output
            .metadata()
            .map(|user| ObjectInfo::user_metadata_headers(user))
            .unwrap_or_default();
        if let Some(etag) = output.e_tag() {
            metadata.insert("etag".into(), vec![etag.to_string()]);
        }
        if let Some(modified) = output
            .last_modified()
            .and_then(|t| t.fmt(DateTimeFormat::HttpDate).ok())
        {
            metadata.insert("last-modified".into(), vec![modified]);
        }

        let info = ObjectInfo {
            size: output.content_length().and_then(|l| u64::try_from(l).ok()),
            content_type: output
                .content_type()
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string(),
            metadata,
        };

        Ok(ObjectReader {
            body: ReaderStream::new(output.body.into_async_read()).boxed(),
            info: Ok(info),
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> KeyStream {
        let scope = ObjectRef::new(bucket, prefix);
        let pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        stream::unfold((pages, scope), |(mut pages, scope)| async move {
            let page = pages.next().await?;
            let keys: Vec<StorageResult<String>> = match page {
                Ok(output) => output
                    .contents()
                    .iter()
                    .map(|obj| Ok(obj.key().unwrap_or_default().to_string()))
                    .collect(),
                Err(err) => vec![Err(backend_error(err, &scope))],
            };
            Some((stream::iter(keys), (pages, scope)))
        })
        .flatten()
        .boxed()
    }

    async fn delete(&self, object: &ObjectRef) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|err| backend_error(err, object))?;
        Ok(())
    }

    async fn check(&self) -> StorageResult<()> {
        self.client
            .list_buckets()
            .send()
            .await
            .map_err(|err| backend_error(err, &ObjectRef::new("", "")))?;
        Ok(())
    }
}

/// Pull chunks until `limit` bytes are buffered or the body ends.
async fn read_part(body: &mut ObjectStream, limit: usize) -> StorageResult<Bytes> {
    let mut buf = BytesMut::new();
    while buf.len() < limit {
        match body.next().await {
            Some(chunk) => buf.extend_from_slice(&chunk?),
            None => break,
        }
    }
    Ok(buf.freeze())
}

/// Service errors keep every structured field S3 returned; anything without
/// an error code (timeouts, DNS, TLS) stays a plain transport error.
fn backend_error<E>(err: SdkError<E, HttpResponse>, object: &ObjectRef) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let status = err
        .raw_response()
        .map(|resp| resp.status().as_u16())
        .unwrap_or_default();

    match err.code() {
        Some(code) => StorageError::Backend(ErrorResponse {
            message: err.message().unwrap_or(code).to_string(),
            code: code.to_string(),
            bucket: object.bucket.clone(),
            key: object.key.clone(),
            status,
        }),
        None => StorageError::Transport(DisplayErrorContext(&err).to_string()),
    }
}
