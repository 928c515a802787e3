pub mod download_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod upload_handlers;

use axum::http::{HeaderMap, header};

/// Extract the bearer credential from the Authorization header, if any.
/// Absence means an anonymous caller, not a rejected one.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Caller address for the download audit trail. Only the first hop of
/// a forwarded chain is recorded.
pub(crate) fn remote_addr(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn forwarded_chain_takes_first_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(remote_addr(&headers), None);

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(remote_addr(&headers), Some("203.0.113.7".to_string()));
    }
}
