//! Service Control Module
//!
//! Intercepts inbound API requests, authorizes them against a remote service
//! control backend (Check) and records usage once they complete (Report).
//!
//! ```text
//! request ─► RequirementTable ─► CredentialExtractor ─► TokenProvider ─┐
//!                                                                      ▼
//!            downstream ◄── continue / reject ◄── Check (HttpCallClient)
//!                 │
//!                 └─► Report (fire and forget) at end of request
//! ```
//!
//! [`domain::filter::ServiceControlFilter`] owns the per-request state machine;
//! [`middleware::service_control_middleware`] drives it from an axum stack.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod credential;
pub mod domain;
pub mod http_call;
pub mod middleware;
pub mod requirements;
pub mod wire;

pub use config::ServiceControlConfig;
pub use domain::error::{ConfigError, FilterError, Rejection};
pub use domain::filter::{
    DecoderCallbacks, FilterConfig, FilterHeadersStatus, ResponseFlag, ServiceContext,
    ServiceControlFilter, StreamInfo,
};
pub use domain::stats::FilterStats;
pub use domain::token_cache::{StaticTokenFetcher, TokenCache};
pub use http_call::HyperHttpCallClient;
pub use middleware::{ServiceControlState, service_control_middleware};
pub use requirements::RequirementTable;
