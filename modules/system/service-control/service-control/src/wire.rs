//! Service Control v1 JSON payloads.
//!
//! Only the fields the filter reads or writes are modelled. Field names follow
//! the REST mapping of the protobuf messages (lower camel case, int64 as
//! string).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Body of `POST <uri>/<service>:check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_config_id: Option<String>,
    pub operation: Operation,
}

/// Body of `POST <uri>/<service>:report`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_config_id: Option<String>,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub operation_id: String,
    pub operation_name: String,
    pub consumer_id: String,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_value_sets: Vec<MetricValueSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValueSet {
    pub metric_name: String,
    pub metric_values: Vec<MetricValue>,
}

impl MetricValueSet {
    /// A metric carrying a single int64 sample.
    #[must_use]
    pub fn single(metric_name: impl Into<String>, value: u64) -> Self {
        Self {
            metric_name: metric_name.into(),
            metric_values: vec![MetricValue {
                int64_value: value.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValue {
    pub int64_value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub name: String,
    pub timestamp: String,
    pub severity: LogSeverity,
    pub struct_payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    Info,
    Error,
}

/// Response of a Check call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckResponse {
    pub operation_id: Option<String>,
    pub check_errors: Vec<CheckError>,
    pub check_info: Option<CheckInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckInfo {
    pub consumer_info: Option<ConsumerInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerInfo {
    pub project_number: Option<Int64Value>,
}

/// int64 fields arrive as strings, but numbers are accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Int64Value {
    Text(String),
    Number(i64),
}

impl std::fmt::Display for Int64Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckError {
    #[serde(default)]
    pub code: CheckErrorCode,
    #[serde(default)]
    pub detail: String,
}

/// `CheckError.Code` values the filter distinguishes.
///
/// Decodes from either the enum name or its proto number. Anything not listed
/// becomes [`CheckErrorCode::Other`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", from = "RawCheckErrorCode")]
pub enum CheckErrorCode {
    #[default]
    #[serde(rename = "ERROR_CODE_UNSPECIFIED")]
    Unspecified,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    ServiceNotActivated,
    BillingDisabled,
    ProjectDeleted,
    ProjectInvalid,
    ConsumerInvalid,
    IpAddressBlocked,
    RefererBlocked,
    ClientAppBlocked,
    ApiTargetBlocked,
    ApiKeyInvalid,
    ApiKeyExpired,
    ApiKeyNotFound,
    InvalidCredential,
    NamespaceLookupUnavailable,
    ServiceStatusUnavailable,
    BillingStatusUnavailable,
    CloudResourceManagerBackendUnavailable,
    Other,
}

const CHECK_ERROR_CODES: [(i64, &str, CheckErrorCode); 21] = [
    (0, "ERROR_CODE_UNSPECIFIED", CheckErrorCode::Unspecified),
    (5, "NOT_FOUND", CheckErrorCode::NotFound),
    (7, "PERMISSION_DENIED", CheckErrorCode::PermissionDenied),
    (8, "RESOURCE_EXHAUSTED", CheckErrorCode::ResourceExhausted),
    (104, "SERVICE_NOT_ACTIVATED", CheckErrorCode::ServiceNotActivated),
    (105, "API_KEY_INVALID", CheckErrorCode::ApiKeyInvalid),
    (107, "BILLING_DISABLED", CheckErrorCode::BillingDisabled),
    (108, "PROJECT_DELETED", CheckErrorCode::ProjectDeleted),
    (109, "IP_ADDRESS_BLOCKED", CheckErrorCode::IpAddressBlocked),
    (110, "REFERER_BLOCKED", CheckErrorCode::RefererBlocked),
    (111, "CLIENT_APP_BLOCKED", CheckErrorCode::ClientAppBlocked),
    (112, "API_KEY_EXPIRED", CheckErrorCode::ApiKeyExpired),
    (113, "API_KEY_NOT_FOUND", CheckErrorCode::ApiKeyNotFound),
    (114, "PROJECT_INVALID", CheckErrorCode::ProjectInvalid),
    (122, "API_TARGET_BLOCKED", CheckErrorCode::ApiTargetBlocked),
    (123, "INVALID_CREDENTIAL", CheckErrorCode::InvalidCredential),
    (125, "CONSUMER_INVALID", CheckErrorCode::ConsumerInvalid),
    (300, "NAMESPACE_LOOKUP_UNAVAILABLE", CheckErrorCode::NamespaceLookupUnavailable),
    (301, "SERVICE_STATUS_UNAVAILABLE", CheckErrorCode::ServiceStatusUnavailable),
    (302, "BILLING_STATUS_UNAVAILABLE", CheckErrorCode::BillingStatusUnavailable),
    (
        305,
        "CLOUD_RESOURCE_MANAGER_BACKEND_UNAVAILABLE",
        CheckErrorCode::CloudResourceManagerBackendUnavailable,
    ),
];

/// Wire shapes accepted for `CheckError.code`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCheckErrorCode {
    Name(String),
    Number(i64),
    Null,
}

impl From<RawCheckErrorCode> for CheckErrorCode {
    fn from(raw: RawCheckErrorCode) -> Self {
        let found = match raw {
            RawCheckErrorCode::Name(name) => {
                CHECK_ERROR_CODES.iter().find(|(_, n, _)| *n == name)
            }
            RawCheckErrorCode::Number(number) => {
                CHECK_ERROR_CODES.iter().find(|(n, _, _)| *n == number)
            }
            RawCheckErrorCode::Null => return Self::Unspecified,
        };
        found.map_or(Self::Other, |(_, _, code)| *code)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn check_response_decodes_errors_and_consumer_info() {
        let resp: CheckResponse = serde_json::from_value(json!({
            "operationId": "op-1",
            "checkErrors": [
                { "code": "API_KEY_INVALID", "detail": "bad key" },
                { "code": "SOMETHING_NEW" }
            ],
            "checkInfo": { "consumerInfo": { "projectNumber": "123456" } }
        }))
        .unwrap();

        assert_eq!(resp.check_errors[0].code, CheckErrorCode::ApiKeyInvalid);
        assert_eq!(resp.check_errors[1].code, CheckErrorCode::Other);
        assert!(resp.check_errors[1].detail.is_empty());
        let number = resp
            .check_info
            .and_then(|i| i.consumer_info)
            .and_then(|c| c.project_number)
            .unwrap();
        assert_eq!(number.to_string(), "123456");
    }

    #[test]
    fn check_error_code_accepts_numbers_and_defaults() {
        let resp: CheckResponse = serde_json::from_value(json!({
            "checkErrors": [
                { "code": 300, "detail": "namespace lookup down" },
                { "code": 105 },
                { "code": 9999 },
                { "detail": "no code" },
                { "code": null }
            ]
        }))
        .unwrap();

        let codes: Vec<_> = resp.check_errors.iter().map(|e| e.code).collect();
        assert_eq!(
            codes,
            [
                CheckErrorCode::NamespaceLookupUnavailable,
                CheckErrorCode::ApiKeyInvalid,
                CheckErrorCode::Other,
                CheckErrorCode::Unspecified,
                CheckErrorCode::Unspecified,
            ]
        );
    }

    #[test]
    fn check_error_code_names_match_serialized_form() {
        for (_, name, code) in CHECK_ERROR_CODES {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(name));
            let decoded: CheckErrorCode = serde_json::from_value(json!(name)).unwrap();
            assert_eq!(decoded, code);
        }
    }

    #[test]
    fn empty_object_is_a_clean_check_response() {
        let resp: CheckResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(resp, CheckResponse::default());
    }

    #[test]
    fn numeric_project_number_is_accepted() {
        let info: ConsumerInfo = serde_json::from_value(json!({ "projectNumber": 42 })).unwrap();
        assert_eq!(info.project_number, Some(Int64Value::Number(42)));
    }

    #[test]
    fn operation_omits_empty_sections() {
        let op = Operation {
            operation_id: "id".to_owned(),
            operation_name: "items.list".to_owned(),
            consumer_id: "project:p".to_owned(),
            start_time: "2024-01-01T00:00:00Z".to_owned(),
            end_time: None,
            labels: BTreeMap::new(),
            metric_value_sets: Vec::new(),
            log_entries: Vec::new(),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({
                "operationId": "id",
                "operationName": "items.list",
                "consumerId": "project:p",
                "startTime": "2024-01-01T00:00:00Z"
            })
        );
    }

    #[test]
    fn metric_values_are_int64_strings() {
        let set = MetricValueSet::single("request_count", 1);
        assert_eq!(
            serde_json::to_value(set).unwrap(),
            json!({ "metricName": "request_count", "metricValues": [{ "int64Value": "1" }] })
        );
    }
}
