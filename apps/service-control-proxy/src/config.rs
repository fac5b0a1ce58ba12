//! Proxy configuration: a YAML file overlaid with `SCP_` environment variables.

use std::net::SocketAddr;
use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use service_control::ServiceControlConfig;

const ENV_PREFIX: &str = "SCP_";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Listen address of the proxy.
    pub bind_addr: SocketAddr,
    /// Base URL of the protected backend, e.g. `http://127.0.0.1:9000`.
    pub backend_url: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub service_control: ServiceControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

/// Defaults for the top-level scalar settings.
#[derive(Serialize)]
struct Defaults {
    bind_addr: &'static str,
}

/// Load configuration.
///
/// Precedence, lowest first: built-in defaults, the YAML file (if given),
/// `SCP_*` environment variables. Nested keys use `__`, e.g.
/// `SCP_LOGGING__LEVEL=debug`.
///
/// # Errors
/// Returns an error if a source cannot be read or the merged result does not
/// deserialize.
pub fn load(path: Option<&Path>) -> Result<AppConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(Defaults {
        bind_addr: "0.0.0.0:8080",
    }));
    if let Some(path) = path {
        figment = figment.merge(Yaml::file_exact(path));
    }
    figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(Box::new)
}
