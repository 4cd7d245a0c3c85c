//! Shared HTTP plumbing for the provider adapters.
//!
//! Adapters build a `reqwest::RequestBuilder` and hand it to
//! [`send_json`], which maps transport failures and non-2xx statuses onto
//! [`ProviderError`] so [`crate::ratelimit::RateLimiter::call`] can decide
//! what to retry. Call timeouts are enforced by the limiter, not here.

use std::time::Duration;

use prism_core::store::ProviderError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::RequestBuilder;
use serde_json::Value;

/// Longest error body kept in a [`ProviderError`] message.
const MAX_ERROR_BODY: usize = 512;

pub fn client() -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("prism/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Send `request` and decode a JSON response body.
pub async fn send_json(request: RequestBuilder) -> Result<Value, ProviderError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();

    if status.is_success() {
        return response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Transient(format!("invalid response body: {}", e)));
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), retry_after, truncate(&body)))
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transient(err.to_string())
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: f64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("0.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(500)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2_000);
        assert_eq!(truncate(&body).chars().count(), MAX_ERROR_BODY + 1);
        assert_eq!(truncate("short"), "short");
    }
}
