//! Error types crossing the token and call seams.

use thiserror::Error;

/// Errors produced while obtaining an access token.
///
/// `Clone` because a single fetch result fans out to every request waiting
/// on the same service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    /// No token source is configured for the service.
    #[error("no token source configured for service '{0}'")]
    NotConfigured(String),

    /// The underlying fetch failed.
    #[error("token fetch failed: {0}")]
    Fetch(String),

    /// The fetch was abandoned before it produced a result.
    #[error("token fetch cancelled")]
    Cancelled,
}

/// Errors produced by a single outbound call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The request could not be sent or the response could not be read.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote end answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status returned by the remote end.
        status: http::StatusCode,
        /// Response body, lossily decoded for diagnostics.
        body: String,
    },

    /// The transport-level timeout elapsed.
    #[error("call timed out")]
    Timeout,

    /// No async runtime was available to drive the call.
    #[error("no async runtime available to issue the call")]
    RuntimeUnavailable,
}
