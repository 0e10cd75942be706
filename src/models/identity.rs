//! Caller identity as claimed by upstream request headers.
//!
//! Nothing here is verified: a proxy in front of the gateway is expected to
//! set `X-User` / `X-Email`, and the values are only ever written to logs.

use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
};
use std::convert::Infallible;

pub const USER_HEADER: &str = "x-user";
pub const EMAIL_HEADER: &str = "x-email";

/// Unauthenticated annotation of who sent a request. Never use for access control.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClaimedIdentity {
    pub user: Option<String>,
    pub email: Option<String>,
}

impl ClaimedIdentity {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };

        Self {
            user: read(USER_HEADER),
            email: read(EMAIL_HEADER),
        }
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or_default()
    }

    pub fn email(&self) -> &str {
        self.email.as_deref().unwrap_or_default()
    }
}

impl<S> FromRequestParts<S> for ClaimedIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}
