// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// All non-public endpoints require `Authorization: Bearer <token>` where the
// expected token comes from the `MERIDIAN_ADMIN_TOKEN` environment variable.
// Comparison runs in constant time. The WebSocket upgrade cannot carry
// headers from browsers, so it passes the token as a query parameter and
// calls `validate_token` directly.
// =============================================================================

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const TOKEN_ENV: &str = "MERIDIAN_ADMIN_TOKEN";

/// Compare two byte slices in constant time. Every byte of both slices is
/// examined even after a mismatch is found.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Validate a raw token string. Used by the WebSocket upgrade path.
pub fn validate_token(token: &str) -> bool {
    let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
    if expected.is_empty() {
        return false;
    }
    constant_time_eq(token.as_bytes(), expected.as_bytes())
}

/// Extractor for authenticated endpoints. Yields the validated token.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": "Forbidden", "message": self.message });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Read on every request so token rotation needs no restart.
        let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
        if expected.is_empty() {
            warn!("{TOKEN_ENV} is not set — rejecting all authenticated requests");
            return Err(AuthRejection {
                message: "server authentication not configured",
            });
        }

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let token = match header.and_then(|v| v.strip_prefix("Bearer ")) {
            Some(token) => token,
            None => {
                return Err(AuthRejection {
                    message: "missing or malformed authorization header",
                })
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthRejection {
                message: "invalid authorization token",
            });
        }

        Ok(AuthBearer(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_slices_match() {
        assert!(constant_time_eq(b"secret-token", b"secret-token"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn different_slices_do_not_match() {
        assert!(!constant_time_eq(b"secret", b"Secret"));
        assert!(!constant_time_eq(b"short", b"much-longer"));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }
}
