use std::fmt::Write as _;

use axum::http::HeaderMap;
use axum::Router;

use crate::state::AppState;

pub mod dto;
pub mod extractors;
pub mod handlers;
pub mod magic_link;
pub mod oauth;
pub mod password;
pub mod rate_limit;
pub mod repo;
pub mod reset;
pub mod session;
pub mod wall;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::routes())
        .merge(oauth::routes())
        .merge(magic_link::routes())
        .merge(reset::routes())
}

/// Percent-encodes a value for use in a query string.
pub(crate) fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

/// Client IP from common proxy headers, for bot verification and magic-link
/// audit columns.
pub(crate) fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("/dashboard?tab=1&x=2"), "%2Fdashboard%3Ftab%3D1%26x%3D2");
        assert_eq!(urlencode("plain-value_1.2~3"), "plain-value_1.2~3");
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.2"));
        assert!(client_ip(&HeaderMap::new()).is_none());
    }
}
