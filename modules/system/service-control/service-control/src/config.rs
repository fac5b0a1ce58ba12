//! Configuration for the service control filter.

use secrecy::SecretString;
use serde::Deserialize;
use service_control_sdk::CredentialSource;

pub const DEFAULT_SERVICE_CONTROL_URI: &str = "https://servicecontrol.googleapis.com/v1/services";

fn default_service_control_uri() -> String {
    DEFAULT_SERVICE_CONTROL_URI.to_owned()
}

fn default_refresh_margin_secs() -> u64 {
    60
}

/// Module configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServiceControlConfig {
    /// Backend services requests can be checked against.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Route requirements, one per (method, `uri_template`).
    #[serde(default)]
    pub requirements: Vec<RequirementRule>,

    #[serde(default)]
    pub token_cache: TokenCacheConfig,

    #[serde(default)]
    pub http_call: HttpCallConfig,
}

/// One backend service.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub service_name: String,
    pub producer_project_id: String,
    /// Base URI; `<service_name>:check` and `<service_name>:report` are appended.
    #[serde(default = "default_service_control_uri")]
    pub service_control_uri: String,
    /// Service config rollout id sent with every Check and Report.
    #[serde(default)]
    pub service_config_id: Option<String>,
    /// Static bearer token for the service control backend.
    #[serde(default)]
    pub access_token: Option<SecretString>,
}

/// One routing rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequirementRule {
    /// HTTP method, e.g. `GET`.
    pub method: String,
    /// URI template, e.g. `/v1/shelves/{shelf}`.
    pub uri_template: String,
    pub service_name: String,
    pub operation_name: String,
    #[serde(default)]
    pub api_name: String,
    #[serde(default)]
    pub api_version: String,
    /// Credential locations, tried in order; the last hit wins.
    #[serde(default)]
    pub api_keys: Vec<CredentialSource>,
    #[serde(default)]
    pub allow_without_api_key: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TokenCacheConfig {
    /// A cached token is refreshed once it is this close to expiring.
    pub refresh_margin_secs: u64,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: default_refresh_margin_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct HttpCallConfig {
    /// Transport-level timeout for Check and Report calls. Unset means no limit.
    pub timeout_ms: Option<u64>,
}
