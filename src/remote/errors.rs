//! Remote store error types
//!
//! Maps HTTP status codes and SDK failures to specific variants for retry and
//! errno decisions.

use aws_sdk_s3::error::{DisplayErrorContext, SdkError};

/// S3 API error types
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Credentials rejected")]
    AuthExpired,

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),
}

impl RemoteError {
    /// Map the error to an appropriate libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            RemoteError::AuthExpired => libc::EACCES,
            RemoteError::RateLimited => libc::EAGAIN,
            RemoteError::NotFound(_) => libc::ENOENT,
            RemoteError::Forbidden(_) => libc::EACCES,
            RemoteError::Network(_) => libc::EIO,
            RemoteError::Server(_, _) => libc::EIO,
            RemoteError::Timeout => libc::ETIMEDOUT,
            RemoteError::Request(_) => libc::EIO,
        }
    }

    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited
                | RemoteError::Timeout
                | RemoteError::Network(_)
                | RemoteError::Server(_, _)
                | RemoteError::AuthExpired
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }

    /// Create a RemoteError from an HTTP status code and response message
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => RemoteError::AuthExpired,
            403 => RemoteError::Forbidden(body.to_string()),
            404 => RemoteError::NotFound(body.to_string()),
            408 => RemoteError::Timeout,
            429 | 503 => RemoteError::RateLimited,
            500..=599 => RemoteError::Server(status, body.to_string()),
            _ => RemoteError::Request(format!("HTTP {}: {}", status, body)),
        }
    }

    /// Classify an SDK failure
    pub fn from_sdk<E>(err: SdkError<E>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = DisplayErrorContext(&err).to_string();
        match &err {
            SdkError::TimeoutError(_) => RemoteError::Timeout,
            SdkError::DispatchFailure(failure) if failure.is_timeout() => RemoteError::Timeout,
            SdkError::DispatchFailure(_) => RemoteError::Network(message),
            SdkError::ResponseError(_) => RemoteError::Network(message),
            SdkError::ServiceError(ctx) => {
                RemoteError::from_status(ctx.raw().status().as_u16(), &message)
            }
            _ => RemoteError::Request(message),
        }
    }
}
