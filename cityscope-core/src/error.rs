//! Typed failures for provider fetches, city resolution and rate limiting.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ProviderKind;

/// Why a single provider fetch did not produce a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Unreachable(String),

    #[error("rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no data: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProviderError::Unreachable(_) => FailureKind::Unreachable,
            ProviderError::RateLimited { .. } => FailureKind::RateLimited,
            ProviderError::InvalidResponse(_) => FailureKind::InvalidResponse,
            ProviderError::NotFound(_) => FailureKind::NotFound,
        }
    }

    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unreachable(_))
    }
}

impl From<RateLimitExceeded> for ProviderError {
    fn from(err: RateLimitExceeded) -> Self {
        ProviderError::RateLimited { retry_after: Some(err.retry_after) }
    }
}

/// Serializable tag of a [`ProviderError`], carried on snapshot diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unreachable,
    RateLimited,
    InvalidResponse,
    NotFound,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Unreachable => "unreachable",
            FailureKind::RateLimited => "rate limited",
            FailureKind::InvalidResponse => "invalid response",
            FailureKind::NotFound => "not found",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// City names that cannot be turned into a location.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("unknown city '{0}'")]
    UnknownCity(String),

    #[error("city name '{name}' is ambiguous, candidates: {}", .candidates.join("; "))]
    AmbiguousCity { name: String, candidates: Vec<String> },

    #[error("geocoding lookup failed: {0}")]
    GeocoderUnavailable(String),
}

/// The rate limiter refused a call within the allowed wait.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit for {provider} exhausted, next slot in {retry_after:?}")]
pub struct RateLimitExceeded {
    pub provider: ProviderKind,
    pub retry_after: Duration,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!(", retry after {}s", wait.as_secs().max(1)),
        None => String::new(),
    }
}
