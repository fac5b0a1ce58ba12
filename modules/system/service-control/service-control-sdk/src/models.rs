//! Domain models for the service control module.

use std::fmt;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Where a caller credential may be found on an inbound request.
///
/// Serialized externally tagged, so configuration reads naturally:
/// `{ query: key }`, `{ header: x-api-key }`, `{ cookie: api_key }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Query parameter name.
    Query(String),
    /// Header name, matched case-insensitively.
    Header(String),
    /// Cookie name.
    Cookie(String),
}

/// Authorization requirement bound to one route.
///
/// Immutable once the requirement table is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Fully qualified operation name sent to the backend (e.g. `items.list`).
    pub operation_name: String,
    /// API name reported for this operation.
    pub api_name: String,
    /// API version reported for this operation.
    pub api_version: String,
    /// Backend service the operation belongs to.
    pub service_name: String,
    /// Credential locations, tried in declared order.
    pub credential_sources: Vec<CredentialSource>,
    /// Skip the Check call entirely for this route.
    pub allow_without_credential: bool,
}

/// A bearer token handed out by a [`crate::TokenFetcher`].
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// Raw token value. `Debug` redacts it.
    pub token: SecretString,
    /// Lifetime from the moment the fetch completed.
    pub expires_in: Duration,
}

/// Canonical status code of a Check outcome, using `google.rpc.Code` numbering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckCode {
    #[default]
    Ok,
    InvalidArgument,
    PermissionDenied,
    Internal,
    Unavailable,
}

impl CheckCode {
    /// Numeric `google.rpc.Code` value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::InvalidArgument => 3,
            Self::PermissionDenied => 7,
            Self::Internal => 13,
            Self::Unavailable => 14,
        }
    }
}

/// Status carried by a [`CheckOutcome`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckStatus {
    code: CheckCode,
    message: String,
}

impl CheckStatus {
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(code: CheckCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == CheckCode::Ok
    }

    #[must_use]
    pub fn code(&self) -> CheckCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

/// Decoded result of a Check call, consumed later by the Report step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// The backend accepted the caller credential.
    pub is_credential_valid: bool,
    /// The service is enabled for the caller's project.
    pub service_is_activated: bool,
    /// Consumer project number, when the backend disclosed it.
    pub consumer_project_number: Option<String>,
    /// Overall verdict.
    pub status: CheckStatus,
}

impl CheckOutcome {
    /// Whether the credential may be attributed (billed) in the Report.
    #[must_use]
    pub fn credential_is_billable(&self) -> bool {
        self.is_credential_valid && self.service_is_activated
    }
}
