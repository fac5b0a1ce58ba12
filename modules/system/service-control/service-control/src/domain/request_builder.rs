//! Construction of Check and Report payloads, and decoding of Check responses.
//!
//! Everything here is pure: no I/O, no clocks. Callers pass timestamps in.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use service_control_sdk::{CheckCode, CheckOutcome, CheckStatus};

use crate::wire::{
    CheckErrorCode, CheckRequest, CheckResponse, LogEntry, LogSeverity, MetricValueSet,
    Operation, ReportRequest,
};

const SERVICE_AGENT_LABEL: &str = "servicecontrol.googleapis.com/service_agent";
const SERVICE_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const CALLER_IP_LABEL: &str = "servicecontrol.googleapis.com/caller_ip";

const LABEL_API_METHOD: &str = "serviceruntime.googleapis.com/api_method";
const LABEL_API_VERSION: &str = "serviceruntime.googleapis.com/api_version";
const LABEL_CONSUMER_PROJECT: &str = "serviceruntime.googleapis.com/consumer_project";
const LABEL_CREDENTIAL_ID: &str = "/credential_id";
const LABEL_PROTOCOL: &str = "/protocol";
const LABEL_RESPONSE_CODE: &str = "/response_code";
const LABEL_RESPONSE_CODE_CLASS: &str = "/response_code_class";
const LABEL_STATUS_CODE: &str = "/status_code";

const PRODUCER_METRIC_PREFIX: &str = "serviceruntime.googleapis.com/api/producer/";
const CONSUMER_METRIC_PREFIX: &str = "serviceruntime.googleapis.com/api/consumer/";

const ENDPOINTS_LOG: &str = "endpoints_log";

/// Facts needed to build a Check payload.
#[derive(Debug, Clone)]
pub struct CheckRequestInfo<'a> {
    pub operation_id: &'a str,
    pub operation_name: &'a str,
    pub producer_project_id: &'a str,
    /// Extracted caller credential; `None` when extraction found nothing.
    pub api_key: Option<&'a str>,
    /// Peer address of the downstream connection, when the host knows it.
    pub caller_ip: Option<IpAddr>,
    pub start_time: DateTime<Utc>,
}

/// Facts needed to build a Report payload.
#[derive(Debug, Clone)]
pub struct ReportRequestInfo<'a> {
    pub operation_id: &'a str,
    pub operation_name: &'a str,
    pub producer_project_id: &'a str,
    /// Credential as extracted from the request. It is only written to the
    /// payload when `check_outcome` marks it billable.
    pub api_key: Option<&'a str>,
    pub api_name: &'a str,
    pub api_version: &'a str,
    pub http_method: &'a str,
    /// Request path including the query string.
    pub url: &'a str,
    pub check_outcome: Option<&'a CheckOutcome>,
    pub response_code: u16,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ReportRequestInfo<'_> {
    fn billed_api_key(&self) -> Option<&str> {
        match (self.api_key, self.check_outcome) {
            (Some(key), Some(outcome)) if !key.is_empty() && outcome.credential_is_billable() => {
                Some(key)
            }
            _ => None,
        }
    }
}

/// Per-service payload builder.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    service_config_id: Option<String>,
}

impl RequestBuilder {
    #[must_use]
    pub fn new(service_config_id: Option<String>) -> Self {
        Self { service_config_id }
    }

    #[must_use]
    pub fn build_check_request(&self, info: &CheckRequestInfo<'_>) -> CheckRequest {
        let mut labels =
            BTreeMap::from([(SERVICE_AGENT_LABEL.to_owned(), SERVICE_AGENT.to_owned())]);
        if let Some(ip) = info.caller_ip {
            labels.insert(CALLER_IP_LABEL.to_owned(), ip.to_string());
        }
        CheckRequest {
            service_config_id: self.service_config_id.clone(),
            operation: Operation {
                operation_id: info.operation_id.to_owned(),
                operation_name: info.operation_name.to_owned(),
                consumer_id: consumer_id(info.api_key, info.producer_project_id),
                start_time: timestamp(info.start_time),
                end_time: None,
                labels,
                metric_value_sets: Vec::new(),
                log_entries: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn build_report_request(&self, info: &ReportRequestInfo<'_>) -> ReportRequest {
        let billed_key = info.billed_api_key();
        let status = info
            .check_outcome
            .map_or_else(CheckStatus::ok, |o| o.status.clone());
        let consumer_project = info
            .check_outcome
            .and_then(|o| o.consumer_project_number.as_deref());

        let mut labels = BTreeMap::from([
            (SERVICE_AGENT_LABEL.to_owned(), SERVICE_AGENT.to_owned()),
            (LABEL_API_METHOD.to_owned(), info.operation_name.to_owned()),
            (LABEL_PROTOCOL.to_owned(), "http".to_owned()),
            (LABEL_RESPONSE_CODE.to_owned(), info.response_code.to_string()),
            (
                LABEL_RESPONSE_CODE_CLASS.to_owned(),
                format!("{}xx", info.response_code / 100),
            ),
            (LABEL_STATUS_CODE.to_owned(), status.code().as_i32().to_string()),
        ]);
        if !info.api_version.is_empty() {
            labels.insert(LABEL_API_VERSION.to_owned(), info.api_version.to_owned());
        }
        if let Some(key) = billed_key {
            labels.insert(LABEL_CREDENTIAL_ID.to_owned(), format!("apikey:{key}"));
        }
        if let Some(project) = consumer_project {
            labels.insert(LABEL_CONSUMER_PROJECT.to_owned(), project.to_owned());
        }

        let mut metric_value_sets = size_metrics(PRODUCER_METRIC_PREFIX, info);
        if billed_key.is_some() {
            metric_value_sets.extend(size_metrics(CONSUMER_METRIC_PREFIX, info));
        }

        ReportRequest {
            service_config_id: self.service_config_id.clone(),
            operations: vec![Operation {
                operation_id: info.operation_id.to_owned(),
                operation_name: info.operation_name.to_owned(),
                consumer_id: consumer_id(billed_key, info.producer_project_id),
                start_time: timestamp(info.start_time),
                end_time: Some(timestamp(info.end_time)),
                labels,
                metric_value_sets,
                log_entries: vec![log_entry(info, billed_key, consumer_project, &status)],
            }],
        }
    }
}

fn consumer_id(api_key: Option<&str>, producer_project_id: &str) -> String {
    match api_key {
        Some(key) if !key.is_empty() => format!("api_key:{key}"),
        _ => format!("project:{producer_project_id}"),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn size_metrics(prefix: &str, info: &ReportRequestInfo<'_>) -> Vec<MetricValueSet> {
    vec![
        MetricValueSet::single(format!("{prefix}request_count"), 1),
        MetricValueSet::single(format!("{prefix}request_sizes"), info.request_bytes),
        MetricValueSet::single(format!("{prefix}response_sizes"), info.response_bytes),
    ]
}

fn log_entry(
    info: &ReportRequestInfo<'_>,
    billed_key: Option<&str>,
    consumer_project: Option<&str>,
    status: &CheckStatus,
) -> LogEntry {
    let latency_ms = (info.end_time - info.start_time).num_milliseconds().max(0);

    let mut payload = Map::new();
    let mut put = |key: &str, value: Value| {
        payload.insert(key.to_owned(), value);
    };
    if !info.api_name.is_empty() {
        put("api_name", info.api_name.into());
    }
    if !info.api_version.is_empty() {
        put("api_version", info.api_version.into());
    }
    put("api_method", info.operation_name.into());
    if let Some(key) = billed_key {
        put("api_key", key.into());
    }
    put("http_method", info.http_method.into());
    put("url", info.url.into());
    put("log_message", format!("{} is called", info.operation_name).into());
    put("http_response_code", info.response_code.into());
    put("request_size_in_bytes", info.request_bytes.into());
    put("response_size_in_bytes", info.response_bytes.into());
    put("request_latency_in_ms", latency_ms.into());
    put("producer_project_id", info.producer_project_id.into());
    if let Some(project) = consumer_project {
        put("consumer_project_number", project.into());
    }
    if !status.is_ok() {
        put("error_cause", status.to_string().into());
    }

    LogEntry {
        name: ENDPOINTS_LOG.to_owned(),
        timestamp: timestamp(info.end_time),
        severity: if info.response_code >= 400 {
            LogSeverity::Error
        } else {
            LogSeverity::Info
        },
        struct_payload: payload,
    }
}

/// Turn a decoded Check response into a [`CheckOutcome`].
///
/// Only the first error is considered. Errors that merely mean the backend
/// could not look something up fail open.
#[must_use]
pub fn convert_check_response(response: &CheckResponse, service_name: &str) -> CheckOutcome {
    let consumer_project_number = response
        .check_info
        .as_ref()
        .and_then(|info| info.consumer_info.as_ref())
        .and_then(|consumer| consumer.project_number.as_ref())
        .map(ToString::to_string);

    let mut outcome = CheckOutcome {
        is_credential_valid: true,
        service_is_activated: true,
        consumer_project_number,
        status: CheckStatus::ok(),
    };

    let Some(error) = response.check_errors.first() else {
        return outcome;
    };

    let detail = error.detail.as_str();
    outcome.status = match error.code {
        CheckErrorCode::ApiKeyInvalid
        | CheckErrorCode::ApiKeyExpired
        | CheckErrorCode::ApiKeyNotFound
        | CheckErrorCode::InvalidCredential => {
            outcome.is_credential_valid = false;
            CheckStatus::new(
                CheckCode::InvalidArgument,
                "API key not valid. Please pass a valid API key.",
            )
        }
        CheckErrorCode::ServiceNotActivated => {
            outcome.service_is_activated = false;
            CheckStatus::new(
                CheckCode::PermissionDenied,
                format!("API {service_name} is not enabled for the project."),
            )
        }
        CheckErrorCode::NotFound | CheckErrorCode::ProjectInvalid | CheckErrorCode::ConsumerInvalid => {
            CheckStatus::new(
                CheckCode::InvalidArgument,
                "Client project not valid. Please pass a valid project.",
            )
        }
        CheckErrorCode::PermissionDenied
        | CheckErrorCode::IpAddressBlocked
        | CheckErrorCode::RefererBlocked
        | CheckErrorCode::ClientAppBlocked
        | CheckErrorCode::ApiTargetBlocked
        | CheckErrorCode::ProjectDeleted
        | CheckErrorCode::BillingDisabled => {
            CheckStatus::new(CheckCode::PermissionDenied, with_detail("Permission denied", detail))
        }
        CheckErrorCode::ResourceExhausted => {
            CheckStatus::new(CheckCode::Unavailable, with_detail("Quota exhausted", detail))
        }
        CheckErrorCode::NamespaceLookupUnavailable
        | CheckErrorCode::ServiceStatusUnavailable
        | CheckErrorCode::BillingStatusUnavailable
        | CheckErrorCode::CloudResourceManagerBackendUnavailable => {
            tracing::debug!(code = ?error.code, "Check backend dependency unavailable, failing open");
            CheckStatus::ok()
        }
        CheckErrorCode::Unspecified | CheckErrorCode::Other => CheckStatus::new(
            CheckCode::Internal,
            with_detail("Request blocked due to unsupported check error", detail),
        ),
    };
    outcome
}

fn with_detail(summary: &str, detail: &str) -> String {
    if detail.is_empty() {
        summary.to_owned()
    } else {
        format!("{summary}: {detail}")
    }
}
