use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Error kinds shared by the adapters, the mapper and the run orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or unusable configuration (token, org id, Azure settings).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The remote API rejected the credentials.
    #[error("authorization failed for {service}: {message}")]
    Authorization { service: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limits, 5xx responses, timeouts and connection failures.
    #[error("transient error from {service}: {message}")]
    Transient {
        service: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Malformed payload; retrying will not help.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{service} API error ({status}): {message}")]
    Api {
        service: String,
        status: u16,
        message: String,
    },
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient { .. })
    }

    /// Errors that stop the whole run rather than a single project or issue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Configuration(_) | SyncError::Authorization { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(
        service: &str,
        status: StatusCode,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = summarize_body(body, status);
        match status.as_u16() {
            401 | 403 => SyncError::Authorization {
                service: service.to_string(),
                message,
            },
            404 => SyncError::NotFound(format!("{service}: {message}")),
            400 | 422 => SyncError::Validation(format!("{service} rejected payload: {message}")),
            408 | 429 | 500..=599 => SyncError::Transient {
                service: service.to_string(),
                message,
                retry_after,
            },
            code => SyncError::Api {
                service: service.to_string(),
                status: code,
                message,
            },
        }
    }

    /// Classify a transport-level failure from reqwest.
    pub fn from_reqwest(service: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            SyncError::Transient {
                service: service.to_string(),
                message: err.to_string(),
                retry_after: None,
            }
        } else if let Some(status) = err.status() {
            SyncError::from_status(service, status, &err.to_string(), None)
        } else {
            SyncError::Api {
                service: service.to_string(),
                status: 0,
                message: err.to_string(),
            }
        }
    }
}

fn summarize_body(body: &str, status: StatusCode) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string();
    }
    trimmed.chars().take(300).collect()
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
