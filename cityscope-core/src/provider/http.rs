use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode, header::RETRY_AFTER};
use serde::de::DeserializeOwned;

use crate::error::ProviderError;

/// Status, retry hint and body of an upstream reply, before any classification.
#[derive(Debug)]
pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl RawResponse {
    /// Parse a successful reply, or classify the failure status.
    pub fn into_json<T: DeserializeOwned>(self, source: &str) -> Result<T, ProviderError> {
        if !self.status.is_success() {
            return Err(self.status_error(source));
        }
        parse_json(&self.body, source)
    }

    pub fn status_error(&self, source: &str) -> ProviderError {
        let detail = format!("{source} returned {}: {}", self.status, truncate_body(&self.body));

        match self.status {
            StatusCode::TOO_MANY_REQUESTS => {
                ProviderError::RateLimited { retry_after: self.retry_after }
            }
            StatusCode::NOT_FOUND => ProviderError::NotFound(detail),
            status if status.is_server_error() => ProviderError::Unreachable(detail),
            StatusCode::REQUEST_TIMEOUT => ProviderError::Unreachable(detail),
            _ => ProviderError::InvalidResponse(detail),
        }
    }
}

pub(crate) async fn send(request: RequestBuilder, source: &str) -> Result<RawResponse, ProviderError> {
    let res = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Unreachable(format!("{source} request timed out"))
        } else {
            ProviderError::Unreachable(format!("failed to send request to {source}: {e}"))
        }
    })?;

    let status = res.status();
    let retry_after = res
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after);

    let body = res
        .text()
        .await
        .map_err(|e| ProviderError::Unreachable(format!("failed to read {source} response body: {e}")))?;

    Ok(RawResponse { status, retry_after, body })
}

pub(crate) fn parse_json<T: DeserializeOwned>(body: &str, source: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| {
        ProviderError::InvalidResponse(format!(
            "failed to parse {source} JSON ({e}): {}",
            truncate_body(body)
        ))
    })
}

/// Only the delta-seconds form; HTTP-dates are ignored.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let cut = (0..=MAX).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    }
}
