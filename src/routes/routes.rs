//! Defines routes for the object gateway.
//!
//! ## Structure
//! - **Object endpoints** (`/api/{bucket}/{path...}/{verb}`)
//!   - `POST   .../create` - upload object
//!   - `GET    .../read`   - download object
//!   - `GET    .../list`   - list keys under `path`
//!   - `DELETE .../delete` - delete object
//!   - `PUT    .../modify` - overwrite object
//!
//! - **Health endpoints**
//!   - `GET /healthz`, `GET /readyz`
//!
//! `path` may itself contain `/` (e.g. `docs/2025/report.pdf`); the verb is
//! always the last segment. Anything else is answered with 404.

use crate::{
    errors::AppError,
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{create_object, delete_object, list_objects, modify_object, read_object},
    },
    models::{identity::ClaimedIdentity, object::ObjectRef},
    services::storage_service::SharedStorage,
};
use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use tracing::info;

/// One of the five object operations the gateway exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Read,
    List,
    Delete,
    Modify,
}

impl Operation {
    fn from_request(method: &Method, verb: &str) -> Option<Self> {
        match (method, verb) {
            (&Method::POST, "create") => Some(Self::Create),
            (&Method::GET, "read") => Some(Self::Read),
            (&Method::GET, "list") => Some(Self::List),
            (&Method::DELETE, "delete") => Some(Self::Delete),
            (&Method::PUT, "modify") => Some(Self::Modify),
            _ => None,
        }
    }
}

/// Split the captured `{path...}/{verb}` tail and match it against the method.
///
/// Returns `None` for an empty or slash-containing bucket, an empty path, or
/// an unknown (method, verb) pair.
pub fn match_object_route(
    method: &Method,
    bucket: &str,
    rest: &str,
) -> Option<(Operation, ObjectRef)> {
    if bucket.is_empty() || bucket.contains('/') {
        return None;
    }
    let (path, verb) = rest.rsplit_once('/')?;
    if path.is_empty() {
        return None;
    }
    let op = Operation::from_request(method, verb)?;
    Some((op, ObjectRef::new(bucket, path)))
}

/// Build the router. The shared storage handle is the only state.
pub fn routes() -> Router<SharedStorage> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/{bucket}/{*rest}", any(dispatch))
        .fallback(|| async { AppError::not_found() })
}

async fn dispatch(
    State(storage): State<SharedStorage>,
    Path((bucket, rest)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    identity: ClaimedIdentity,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some((op, object)) = match_object_route(&method, &bucket, &rest) else {
        return AppError::not_found().into_response();
    };

    info!(
        method = %method,
        uri = %uri,
        user = identity.user(),
        email = identity.email(),
        bucket = %object.bucket,
        path = %object.key,
        "request"
    );

    let result = match op {
        Operation::Create => create_object(storage.as_ref(), &object, &headers, body).await,
        Operation::Read => read_object(storage.as_ref(), &object).await,
        Operation::List => list_objects(storage.as_ref(), &object).await,
        Operation::Delete => delete_object(storage.as_ref(), &object).await,
        Operation::Modify => modify_object(storage.as_ref(), &object, &headers, body).await,
    };
    result.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_every_verb_with_its_method() {
        let cases = [
            (Method::POST, "create", Operation::Create),
            (Method::GET, "read", Operation::Read),
            (Method::GET, "list", Operation::List),
            (Method::DELETE, "delete", Operation::Delete),
            (Method::PUT, "modify", Operation::Modify),
        ];
        for (method, verb, expected) in cases {
            let rest = format!("docs/report.pdf/{verb}");
            let (op, object) = match_object_route(&method, "mybucket", &rest).unwrap();
            assert_eq!(op, expected);
            assert_eq!(object, ObjectRef::new("mybucket", "docs/report.pdf"));
        }
    }

    #[test]
    fn verb_is_the_last_segment() {
        let (op, object) =
            match_object_route(&Method::GET, "b", "read/list/read").unwrap();
        assert_eq!(op, Operation::Read);
        assert_eq!(object.key, "read/list");
    }

    #[test]
    fn rejects_wrong_method_for_verb() {
        assert!(match_object_route(&Method::GET, "b", "k/create").is_none());
        assert!(match_object_route(&Method::POST, "b", "k/read").is_none());
        assert!(match_object_route(&Method::PATCH, "b", "k/modify").is_none());
    }

    #[test]
    fn rejects_missing_path_or_bucket() {
        assert!(match_object_route(&Method::GET, "b", "read").is_none());
        assert!(match_object_route(&Method::GET, "b", "/read").is_none());
        assert!(match_object_route(&Method::GET, "", "k/read").is_none());
        assert!(match_object_route(&Method::GET, "a/b", "k/read").is_none());
        assert!(match_object_route(&Method::GET, "b", "k/unknown").is_none());
    }
}
