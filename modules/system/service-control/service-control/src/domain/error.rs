//! Error taxonomy of the service control filter.

use http::StatusCode;
use service_control_sdk::{CallError, CheckStatus, TokenError};
use thiserror::Error;

pub const REASON_ROUTE_NOT_CONFIGURED: &str = "Request path is not configured.";
pub const REASON_SERVICE_NOT_CONFIGURED: &str = "Required service is not configured.";
pub const REASON_TOKEN_FETCH_FAILED: &str = "Failed to fetch access_token";
pub const REASON_CHECK_FAILED: &str = "Check failed";

/// Per-request failures. Every variant is a terminal rejection of one request,
/// never a process-level failure.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("no requirement matches {method} {path}")]
    RoutingNotFound { method: String, path: String },

    #[error("service '{0}' is not configured")]
    ServiceNotConfigured(String),

    #[error("failed to fetch access token: {0}")]
    TokenFetchFailed(#[from] TokenError),

    #[error("check call failed: {0}")]
    CheckTransportFailed(#[from] CallError),

    #[error("check response is not valid: {0}")]
    CheckPayloadInvalid(String),

    #[error("check denied the request: {0}")]
    CheckSemanticFailure(CheckStatus),
}

impl FilterError {
    /// Client-visible rejection. Transport, payload and semantic check failures
    /// all collapse into the same response.
    #[must_use]
    pub fn rejection(&self) -> Rejection {
        match self {
            Self::RoutingNotFound { .. } => {
                Rejection::new(StatusCode::NOT_FOUND, REASON_ROUTE_NOT_CONFIGURED)
            }
            Self::ServiceNotConfigured(_) => {
                Rejection::new(StatusCode::NOT_FOUND, REASON_SERVICE_NOT_CONFIGURED)
            }
            Self::TokenFetchFailed(_) => {
                Rejection::new(StatusCode::UNAUTHORIZED, REASON_TOKEN_FETCH_FAILED)
            }
            Self::CheckTransportFailed(_)
            | Self::CheckPayloadInvalid(_)
            | Self::CheckSemanticFailure(_) => {
                Rejection::new(StatusCode::UNAUTHORIZED, REASON_CHECK_FAILED)
            }
        }
    }
}

/// Log filter errors at appropriate levels.
///
/// Cognitive complexity is inflated by tracing macro expansion.
#[allow(clippy::cognitive_complexity)]
pub(crate) fn log_filter_error(operation_id: &str, err: &FilterError) {
    match err {
        FilterError::RoutingNotFound { .. } | FilterError::ServiceNotConfigured(_) => {
            tracing::debug!(operation_id, "Request rejected: {err}");
        }
        FilterError::TokenFetchFailed(_) => {
            tracing::error!(operation_id, "Request rejected: {err}");
        }
        FilterError::CheckTransportFailed(_) | FilterError::CheckPayloadInvalid(_) => {
            tracing::warn!(operation_id, "Request rejected: {err}");
        }
        FilterError::CheckSemanticFailure(_) => {
            tracing::info!(operation_id, "Request rejected: {err}");
        }
    }
}

/// The single observable response of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    status: StatusCode,
    reason: &'static str,
}

impl Rejection {
    #[must_use]
    pub fn new(status: StatusCode, reason: &'static str) -> Self {
        Self { status, reason }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

impl axum::response::IntoResponse for Rejection {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "type": "about:blank",
            "title": self.status.canonical_reason().unwrap_or("Error"),
            "status": self.status.as_u16(),
            "detail": self.reason,
        });
        (
            self.status,
            [(http::header::CONTENT_TYPE, "application/problem+json")],
            body.to_string(),
        )
            .into_response()
    }
}

/// Errors raised while building the filter from configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),

    #[error("failed to insert uri_template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("service '{0}' is configured more than once")]
    DuplicateService(String),

    #[error("failed to load TLS root certificates: {0}")]
    TlsRoots(#[source] std::io::Error),
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use service_control_sdk::CheckCode;

    #[test]
    fn configuration_errors_map_to_404() {
        let routing = FilterError::RoutingNotFound {
            method: "GET".to_owned(),
            path: "/nope".to_owned(),
        };
        assert_eq!(routing.rejection().status(), StatusCode::NOT_FOUND);
        assert_eq!(routing.rejection().reason(), REASON_ROUTE_NOT_CONFIGURED);

        let service = FilterError::ServiceNotConfigured("svc".to_owned());
        assert_eq!(service.rejection().status(), StatusCode::NOT_FOUND);
        assert_eq!(service.rejection().reason(), REASON_SERVICE_NOT_CONFIGURED);
    }

    #[test]
    fn check_failures_collapse_to_same_rejection() {
        let cases = vec![
            FilterError::CheckTransportFailed(CallError::Transport("reset".to_owned())),
            FilterError::CheckPayloadInvalid("eof".to_owned()),
            FilterError::CheckSemanticFailure(CheckStatus::new(
                CheckCode::InvalidArgument,
                "API key not valid",
            )),
        ];
        for err in cases {
            assert_eq!(
                err.rejection(),
                Rejection::new(StatusCode::UNAUTHORIZED, REASON_CHECK_FAILED)
            );
        }
    }

    #[test]
    fn token_failure_maps_to_401() {
        let err = FilterError::from(TokenError::Fetch("metadata down".to_owned()));
        assert_eq!(err.rejection().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.rejection().reason(), REASON_TOKEN_FETCH_FAILED);
        assert!(err.to_string().contains("metadata down"));
    }

    #[test]
    fn rejection_renders_problem_details() {
        let resp = Rejection::new(StatusCode::UNAUTHORIZED, REASON_CHECK_FAILED).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
