//! HTTP handlers for object operations.
//! Streams object bodies in both directions without buffering them and
//! delegates storage concerns to the shared `ObjectStorage`.

use crate::{
    errors::AppError,
    models::object::{
        DEFAULT_CONTENT_TYPE, ObjectInfo, ObjectRef, USER_METADATA_PREFIX, UploadDescriptor,
    },
    services::storage_service::{ObjectReader, ObjectStorage},
};
use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, TryStreamExt};
use std::{collections::BTreeMap, io};
use tracing::{debug, error, info, warn};

const PUT_FAILED: &str = "Error putting object";
const LIST_FAILED: &str = "Error listing objects";
const DELETE_FAILED: &str = "Error deleting object";

/// POST `.../create`: upload a new object.
pub async fn create_object(
    storage: &dyn ObjectStorage,
    object: &ObjectRef,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let written = put_verified(storage, object, headers, body).await?;
    info!("Create {}: successfully uploaded {} bytes", object, written);
    Ok((StatusCode::CREATED, format!("{}: OK", object)).into_response())
}

/// PUT `.../modify`: overwrite an object; same contract as create.
pub async fn modify_object(
    storage: &dyn ObjectStorage,
    object: &ObjectRef,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let written = put_verified(storage, object, headers, body).await?;
    info!("Modify {}: successfully uploaded {} bytes", object, written);
    Ok((StatusCode::OK, format!("{}: OK", object)).into_response())
}

/// GET `.../read`: stream an object back with its metadata headers.
pub async fn read_object(
    storage: &dyn ObjectStorage,
    object: &ObjectRef,
) -> Result<Response, AppError> {
    let ObjectReader { body, info } = storage.get(object).await.map_err(|err| {
        error!("Error getting object: {}: {}", object, err.verbose());
        AppError::internal(err.to_string())
    })?;

    let mut response = Response::new(Body::empty());
    match info {
        Ok(info) => set_object_headers(response.headers_mut(), &info),
        Err(err) => {
            warn!("Error getting object info: {}: {}", object, err.verbose());
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(DEFAULT_CONTENT_TYPE),
            );
        }
    }

    // Headers are committed once the body starts; a failure past this point
    // can only be logged and surfaces to the client as an aborted transfer.
    let target = object.to_string();
    let stream = body.inspect_err(move |err| {
        error!("Error writing response: {}: {}", target, err);
    });
    *response.body_mut() = Body::from_stream(stream);
    Ok(response)
}

/// GET `.../list`: every key under the path, as a JSON array.
///
/// The first failing element aborts the listing; dropping the key stream on
/// return stops the backend enumeration.
pub async fn list_objects(
    storage: &dyn ObjectStorage,
    object: &ObjectRef,
) -> Result<Response, AppError> {
    let mut keys = storage.list(&object.bucket, &object.key);
    let mut objects = Vec::new();

    while let Some(item) = keys.next().await {
        match item {
            Ok(key) => objects.push(key),
            Err(err) => {
                error!("Error getting list of objects: {}: {}", object, err.verbose());
                return Err(AppError::internal(LIST_FAILED));
            }
        }
    }

    debug!("List {}: {} keys", object, objects.len());
    Ok(Json(objects).into_response())
}

/// DELETE `.../delete`: remove an object; deleting a missing object succeeds.
pub async fn delete_object(
    storage: &dyn ObjectStorage,
    object: &ObjectRef,
) -> Result<Response, AppError> {
    match storage.delete(object).await {
        Ok(()) => info!("Delete {}: removed", object),
        Err(err) if err.is_not_found() => info!("Delete {}: already absent", object),
        Err(err) => {
            error!("Error deleting object: {}: {}", object, err.verbose());
            return Err(AppError::internal(DELETE_FAILED));
        }
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Run the single backend put and enforce the declared-size contract.
async fn put_verified(
    storage: &dyn ObjectStorage,
    object: &ObjectRef,
    headers: &HeaderMap,
    body: Body,
) -> Result<u64, AppError> {
    let upload = upload_descriptor(object, headers, body);
    let declared_size = upload.declared_size;

    let written = storage.put(object, upload).await.map_err(|err| {
        error!("Error putting object: {}: {}", object, err.verbose());
        AppError::internal(PUT_FAILED)
    })?;

    if let Some(expected) = declared_size {
        if written != expected {
            error!(
                "Error putting object: {}: partial write [{}<{}]",
                object, written, expected
            );
            discard_partial_write(storage, object).await;
            return Err(AppError::internal(PUT_FAILED));
        }
    }

    Ok(written)
}

/// Best-effort removal of an object whose upload failed verification.
async fn discard_partial_write(storage: &dyn ObjectStorage, object: &ObjectRef) {
    match storage.delete(object).await {
        Ok(()) => info!("Discarded partial write of {}", object),
        Err(err) if err.is_not_found() => {}
        Err(err) => warn!(
            "Could not discard partial write of {}: {}",
            object,
            err.verbose()
        ),
    }
}

fn upload_descriptor(object: &ObjectRef, headers: &HeaderMap, body: Body) -> UploadDescriptor {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string());

    let body = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();

    UploadDescriptor {
        content_type,
        declared_size: declared_size(object, headers),
        metadata: user_metadata(headers),
        body,
    }
}

/// `Content-Length` as a byte count; unparsable values mean "unknown".
fn declared_size(object: &ObjectRef, headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_LENGTH)?;
    let parsed = value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok());
    if parsed.is_none() {
        warn!(
            "Error parsing Content-Length: {}: {:?}, treating size as unknown",
            object, value
        );
    }
    parsed
}

fn user_metadata(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(USER_METADATA_PREFIX)?;
            let value = value.to_str().ok()?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn set_object_headers(headers: &mut HeaderMap, info: &ObjectInfo) {
    let content_type = HeaderValue::from_str(&info.content_type).unwrap_or_else(|_| {
        warn!("Invalid content type {:?}, using default", info.content_type);
        HeaderValue::from_static(DEFAULT_CONTENT_TYPE)
    });
    headers.insert(header::CONTENT_TYPE, content_type);

    if let Some(size) = info.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }

    for (name, values) in &info.metadata {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!("Skipping metadata with invalid header name {:?}", name);
            continue;
        };
        headers.remove(&name);
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => warn!("Skipping invalid value for metadata header {}", name),
            }
        }
    }
}
