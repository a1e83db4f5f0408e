//! Bearer-token authentication.

use axum::http::HeaderMap;

/// Length check first, then a full XOR accumulation over every byte. No
/// short-circuit comparison ever touches the token.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Whether the request carries `Authorization: Bearer <token>` matching the
/// configured token. An unconfigured token means auth is disabled.
pub fn authorized(configured: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = configured else {
        return true;
    };
    let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(presented) = value.strip_prefix("Bearer ") else {
        return false;
    };
    constant_time_eq(presented.as_bytes(), expected.as_bytes())
}
