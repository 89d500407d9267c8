use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use provision_core::credential::Secret;

use crate::error::AppError;

/// The caller's bearer token from `Authorization: Bearer <token>`.
///
/// The token is only handed on to the credential broker; it is never logged
/// or stored. Missing or malformed headers are rejected with 401.
pub struct Bearer(pub Secret);

impl<S> FromRequestParts<S> for Bearer
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;
        parse_bearer(header)
            .map(|token| Bearer(Secret::new(token)))
            .ok_or_else(|| AppError::unauthorized("malformed authorization header"))
    }
}

fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
