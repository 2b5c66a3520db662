//! Bearer-token authentication.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use subtle::ConstantTimeEq;

use crate::AppState;
use crate::error::ApiError;

/// User resolved from the request's bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        state
            .api_tokens
            .get(token)
            .map(|user| Caller(user.clone()))
            .ok_or(ApiError::Unauthorized)
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Checks the sweep trigger token, when one is configured.
pub fn authorize_trigger(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    match &state.trigger_token {
        None => Ok(()),
        Some(expected) if token_matches(bearer_token(headers), expected) => Ok(()),
        Some(_) => Err(ApiError::Unauthorized),
    }
}

/// Compares without an early exit on the first differing byte.
fn token_matches(presented: Option<&str>, expected: &str) -> bool {
    presented.is_some_and(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())))
}
