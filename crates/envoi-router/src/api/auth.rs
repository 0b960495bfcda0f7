//! Shared-token authentication for the live feed and history endpoints
//!
//! The token may arrive as:
//! - `Authorization: <token>`
//! - `Authorization: Bearer <token>`
//! - `?token=<token>`
//!
//! The header wins when both are present.

use axum::http::{header, HeaderMap};

/// Query parameter carrying the token for clients that cannot set headers
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Token from the Authorization header, raw or with a Bearer scheme.
pub fn header_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => value,
    };

    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Token presented by a request, from the header or else the query string.
pub fn presented_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    header_token(headers).or_else(|| {
        query_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    })
}
