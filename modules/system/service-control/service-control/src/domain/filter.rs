//! Per-request authorization state machine.
//!
//! One [`ServiceControlFilter`] lives for exactly one request:
//!
//! ```text
//! Idle ──decode_headers──► Calling ──token──► Calling ──check ok──► Complete
//!   │                         │                  │
//!   └── no route / service ───┴── token error ───┴── check error ──► Responded
//! ```
//!
//! `Responded` and `Complete` are terminal. Every callback re-reads the phase
//! under the state lock before acting, so a late token or check completion
//! after a rejection or teardown is discarded. Side effects (replies,
//! counters, outbound calls) always run after the lock is released because
//! token providers and call clients may complete inline.
//!
//! The usage report is independent of the phase and is fired from
//! [`ServiceControlFilter::log`] once the request is over.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, Uri};
use parking_lot::Mutex;
use secrecy::SecretString;
use service_control_sdk::{
    CallError, CancelHandle, CheckOutcome, HttpCallClient, Requirement, TokenError, TokenProvider,
};
use uuid::Uuid;

use crate::config::{ServiceConfig, ServiceControlConfig};
use crate::credential::CredentialExtractor;
use crate::domain::error::{ConfigError, FilterError, Rejection, log_filter_error};
use crate::domain::request_builder::{
    CheckRequestInfo, ReportRequestInfo, RequestBuilder, convert_check_response,
};
use crate::domain::stats::FilterStats;
use crate::requirements::RequirementTable;
use crate::wire::CheckResponse;

/// Host-side hooks the filter drives.
///
/// Implementations must tolerate being called from any thread, including
/// synchronously from inside [`ServiceControlFilter::decode_headers`].
pub trait DecoderCallbacks: Send + Sync {
    /// Answer the request locally; it is not forwarded.
    fn send_local_reply(&self, rejection: Rejection);

    /// Resume a request previously stopped with
    /// [`FilterHeadersStatus::StopIteration`].
    fn continue_decoding(&self);

    /// Mark the request for access logging.
    fn set_response_flag(&self, flag: ResponseFlag);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFlag {
    /// The request was rejected on behalf of the service control backend.
    UnauthorizedExternalService,
}

/// Result of [`ServiceControlFilter::decode_headers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    /// Forward the request now.
    Continue,
    /// Hold the request; a decoder callback will follow.
    StopIteration,
}

/// End-of-request facts consumed by the report.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    /// Final response code; `None` if no response was sent (reported as 500).
    pub response_code: Option<u16>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Immutable per-service settings.
#[derive(Debug)]
pub struct ServiceContext {
    service_name: String,
    producer_project_id: String,
    service_control_uri: String,
    builder: RequestBuilder,
}

impl ServiceContext {
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        producer_project_id: impl Into<String>,
        service_control_uri: impl Into<String>,
        service_config_id: Option<String>,
    ) -> Self {
        Self {
            builder: RequestBuilder::new(service_config_id),
            service_name: service_name.into(),
            producer_project_id: producer_project_id.into(),
            service_control_uri: service_control_uri.into(),
        }
    }

    #[must_use]
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self::new(
            cfg.service_name.clone(),
            cfg.producer_project_id.clone(),
            cfg.service_control_uri.clone(),
            cfg.service_config_id.clone(),
        )
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn producer_project_id(&self) -> &str {
        &self.producer_project_id
    }

    #[must_use]
    pub fn service_control_uri(&self) -> &str {
        &self.service_control_uri
    }
}

/// Process-wide filter configuration shared by all requests.
pub struct FilterConfig {
    requirements: RequirementTable,
    services: HashMap<String, Arc<ServiceContext>>,
    token_provider: Arc<dyn TokenProvider>,
    http_client: Arc<dyn HttpCallClient>,
    stats: Arc<FilterStats>,
}

impl FilterConfig {
    /// Assemble a configuration from already built parts.
    ///
    /// # Errors
    /// Returns [`ConfigError::DuplicateService`] if two contexts share a name.
    pub fn new(
        requirements: RequirementTable,
        services: impl IntoIterator<Item = ServiceContext>,
        token_provider: Arc<dyn TokenProvider>,
        http_client: Arc<dyn HttpCallClient>,
    ) -> Result<Self, ConfigError> {
        let mut by_name = HashMap::new();
        for service in services {
            let name = service.service_name.clone();
            if by_name.insert(name.clone(), Arc::new(service)).is_some() {
                return Err(ConfigError::DuplicateService(name));
            }
        }
        Ok(Self {
            requirements,
            services: by_name,
            token_provider,
            http_client,
            stats: Arc::new(FilterStats::new()),
        })
    }

    /// Build from module configuration.
    ///
    /// Requirements naming an unknown service are kept; requests matching
    /// them are answered with "service not configured".
    ///
    /// # Errors
    /// Returns an error for invalid requirement rules or duplicate services.
    pub fn from_config(
        cfg: &ServiceControlConfig,
        token_provider: Arc<dyn TokenProvider>,
        http_client: Arc<dyn HttpCallClient>,
    ) -> Result<Self, ConfigError> {
        let requirements = RequirementTable::from_rules(&cfg.requirements)?;
        let config = Self::new(
            requirements,
            cfg.services.iter().map(ServiceContext::from_config),
            token_provider,
            http_client,
        )?;
        for rule in &cfg.requirements {
            if !config.services.contains_key(&rule.service_name) {
                tracing::warn!(
                    operation_name = %rule.operation_name,
                    service_name = %rule.service_name,
                    "Requirement references a service that is not configured"
                );
            }
        }
        tracing::info!(
            requirements = config.requirements.len(),
            services = config.services.len(),
            "Service control filter configured"
        );
        Ok(config)
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<FilterStats> {
        &self.stats
    }

    #[must_use]
    pub fn service(&self, service_name: &str) -> Option<&Arc<ServiceContext>> {
        self.services.get(service_name)
    }
}

enum InFlight {
    Nothing,
    Token(CancelHandle),
    Check(CancelHandle),
}

enum Phase {
    Idle,
    Calling(InFlight),
    Responded,
    Complete,
}

struct RequestState {
    phase: Phase,
    /// `decode_headers` returned `StopIteration` and awaits `continue_decoding`.
    stopped: bool,
    token_resolved: bool,
    check_resolved: bool,
    reported: bool,
    requirement: Option<Arc<Requirement>>,
    service: Option<Arc<ServiceContext>>,
    api_key: Option<String>,
    caller_ip: Option<IpAddr>,
    token: Option<SecretString>,
    check_outcome: Option<CheckOutcome>,
    http_method: String,
    url: String,
    start_time: DateTime<Utc>,
}

impl RequestState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            stopped: false,
            token_resolved: false,
            check_resolved: false,
            reported: false,
            requirement: None,
            service: None,
            api_key: None,
            caller_ip: None,
            token: None,
            check_outcome: None,
            http_method: String::new(),
            url: String::new(),
            start_time: Utc::now(),
        }
    }
}

/// Authorization and usage reporting for a single request.
pub struct ServiceControlFilter {
    inner: Arc<FilterInner>,
}

struct FilterInner {
    config: Arc<FilterConfig>,
    callbacks: Arc<dyn DecoderCallbacks>,
    operation_id: String,
    span: tracing::Span,
    state: Mutex<RequestState>,
}

struct CheckCall {
    token: SecretString,
    payload: Bytes,
}

impl ServiceControlFilter {
    #[must_use]
    pub fn new(config: Arc<FilterConfig>, callbacks: Arc<dyn DecoderCallbacks>) -> Self {
        let operation_id = Uuid::new_v4().to_string();
        let span = tracing::debug_span!("service_control", operation_id = %operation_id);
        Self {
            inner: Arc::new(FilterInner {
                config,
                callbacks,
                operation_id,
                span,
                state: Mutex::new(RequestState::new()),
            }),
        }
    }

    /// Correlation id shared by the Check and Report of this request.
    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.inner.operation_id
    }

    /// Record the downstream peer address. It is sent with the Check, so it
    /// must be set before [`Self::decode_headers`].
    pub fn set_caller_ip(&self, ip: IpAddr) {
        self.inner.state.lock().caller_ip = Some(ip);
    }

    /// Start authorization for a request.
    ///
    /// Returns `Continue` when the request may be forwarded immediately and
    /// `StopIteration` when it must wait for
    /// [`DecoderCallbacks::continue_decoding`] or was rejected.
    pub fn decode_headers(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> FilterHeadersStatus {
        let inner = &self.inner;
        let _entered = inner.span.enter();
        let path = uri
            .path_and_query()
            .map_or_else(|| uri.path(), http::uri::PathAndQuery::as_str);

        {
            let mut st = inner.state.lock();
            st.http_method = method.to_string();
            st.url = path.to_owned();
            st.start_time = Utc::now();
        }

        let Some(requirement) = inner.config.requirements.find(method, path) else {
            inner.terminate(FilterError::RoutingNotFound {
                method: method.to_string(),
                path: uri.path().to_owned(),
            });
            return FilterHeadersStatus::StopIteration;
        };
        let service = inner.config.services.get(&requirement.service_name).cloned();
        {
            let mut st = inner.state.lock();
            st.requirement = Some(Arc::clone(&requirement));
            st.service.clone_from(&service);
        }
        let Some(service) = service else {
            inner.terminate(FilterError::ServiceNotConfigured(
                requirement.service_name.clone(),
            ));
            return FilterHeadersStatus::StopIteration;
        };

        if requirement.allow_without_credential {
            tracing::debug!(
                operation_name = %requirement.operation_name,
                "Check is not required for this operation"
            );
            inner.state.lock().phase = Phase::Complete;
            inner.config.stats.record_allowed();
            return FilterHeadersStatus::Continue;
        }

        let api_key =
            CredentialExtractor::new(uri, headers).extract(&requirement.credential_sources);
        {
            let mut st = inner.state.lock();
            st.api_key = api_key;
            st.phase = Phase::Calling(InFlight::Nothing);
            st.stopped = false;
        }

        let weak = Arc::downgrade(inner);
        let on_token = {
            let requirement = Arc::clone(&requirement);
            Box::new(move |result| FilterInner::on_token_done(&weak, &requirement, &service, result))
        };
        let handle = inner
            .config
            .token_provider
            .get_token(&requirement.service_name, on_token);

        let mut orphan = None;
        let status = {
            let mut st = inner.state.lock();
            let token_pending = !st.token_resolved;
            match st.phase {
                Phase::Complete => FilterHeadersStatus::Continue,
                Phase::Responded => {
                    if token_pending {
                        orphan = Some(handle);
                    }
                    FilterHeadersStatus::StopIteration
                }
                Phase::Calling(InFlight::Nothing) if token_pending => {
                    st.phase = Phase::Calling(InFlight::Token(handle));
                    st.stopped = true;
                    FilterHeadersStatus::StopIteration
                }
                _ => {
                    st.stopped = true;
                    FilterHeadersStatus::StopIteration
                }
            }
        };
        if let Some(mut handle) = orphan {
            handle.cancel();
        }
        if status == FilterHeadersStatus::StopIteration {
            tracing::debug!("Holding request until check completes");
        }
        status
    }

    /// Tear the request down, cancelling any in-flight token fetch or check
    /// call. Later callbacks are discarded.
    pub fn on_destroy(&self) {
        let inner = &self.inner;
        let _entered = inner.span.enter();
        let pending = {
            let mut st = inner.state.lock();
            match std::mem::replace(&mut st.phase, Phase::Responded) {
                Phase::Calling(InFlight::Token(handle) | InFlight::Check(handle)) => Some(handle),
                Phase::Complete => {
                    st.phase = Phase::Complete;
                    None
                }
                Phase::Idle | Phase::Calling(InFlight::Nothing) | Phase::Responded => None,
            }
        };
        if let Some(mut handle) = pending {
            tracing::debug!("Request torn down, cancelling in-flight call");
            handle.cancel();
        }
    }

    /// Fire the usage report for this request. Only the first call reports.
    ///
    /// The result of the report call is ignored. If no token was obtained
    /// during authorization one is requested first.
    pub fn log(&self, stream_info: &StreamInfo) {
        let inner = &self.inner;
        let _entered = inner.span.enter();
        let prepared = {
            let mut st = inner.state.lock();
            if st.reported {
                return;
            }
            st.reported = true;
            let (Some(requirement), Some(service)) = (st.requirement.clone(), st.service.clone())
            else {
                tracing::debug!("No service resolved for request, skipping report");
                return;
            };
            let request = service.builder.build_report_request(&ReportRequestInfo {
                operation_id: &inner.operation_id,
                operation_name: &requirement.operation_name,
                producer_project_id: &service.producer_project_id,
                api_key: st.api_key.as_deref(),
                api_name: &requirement.api_name,
                api_version: &requirement.api_version,
                http_method: &st.http_method,
                url: &st.url,
                check_outcome: st.check_outcome.as_ref(),
                response_code: stream_info.response_code.unwrap_or(500),
                request_bytes: stream_info.bytes_received,
                response_bytes: stream_info.bytes_sent,
                start_time: st.start_time,
                end_time: Utc::now(),
            });
            (service, st.token.clone(), serde_json::to_vec(&request))
        };

        let (service, token, encoded) = prepared;
        let payload = match encoded {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to encode report, dropping it");
                return;
            }
        };

        let client = Arc::clone(&inner.config.http_client);
        let operation_id = inner.operation_id.clone();
        if let Some(token) = token {
            send_report(&client, &service, &token, payload, operation_id);
            return;
        }

        let report_service = Arc::clone(&service);
        let _pending = inner.config.token_provider.get_token(
            &service.service_name,
            Box::new(move |result| match result {
                Ok(token) => send_report(&client, &report_service, &token, payload, operation_id),
                Err(err) => {
                    tracing::warn!(operation_id = %operation_id, error = %err, "No access token, dropping report");
                }
            }),
        );
    }
}

impl Drop for ServiceControlFilter {
    fn drop(&mut self) {
        // Late callbacks only hold a Weak; nothing to do unless still calling.
        if matches!(self.inner.state.lock().phase, Phase::Calling(_)) {
            self.on_destroy();
        }
    }
}

impl FilterInner {
    /// Reject from a non-terminal phase. No-op if already terminal.
    fn terminate(&self, err: FilterError) {
        {
            let mut st = self.state.lock();
            if matches!(st.phase, Phase::Responded | Phase::Complete) {
                return;
            }
            st.phase = Phase::Responded;
        }
        self.reply_rejected(err);
    }

    /// Side effects of a rejection. Caller has already moved to `Responded`.
    fn reply_rejected(&self, err: FilterError) {
        self.config.stats.record_denied();
        log_filter_error(&self.operation_id, &err);
        self.callbacks.send_local_reply(err.rejection());
        self.callbacks
            .set_response_flag(ResponseFlag::UnauthorizedExternalService);
    }

    fn on_token_done(
        weak: &Weak<Self>,
        requirement: &Arc<Requirement>,
        service: &Arc<ServiceContext>,
        result: Result<SecretString, TokenError>,
    ) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let _entered = inner.span.enter();

        let next = {
            let mut st = inner.state.lock();
            st.token_resolved = true;
            if !matches!(st.phase, Phase::Calling(_)) {
                tracing::debug!("Token arrived after the request was answered, ignoring");
                return;
            }
            let next = match result {
                Err(err) => Err(FilterError::TokenFetchFailed(err)),
                Ok(token) => {
                    st.token = Some(token.clone());
                    inner.build_check(&st, requirement, service, token)
                }
            };
            st.phase = match next {
                Ok(_) => Phase::Calling(InFlight::Nothing),
                Err(_) => Phase::Responded,
            };
            next
        };

        let call = match next {
            Ok(call) => call,
            Err(err) => {
                inner.reply_rejected(err);
                return;
            }
        };

        tracing::debug!(operation_name = %requirement.operation_name, "Sending check");
        let weak = Arc::downgrade(&inner);
        let check_service = Arc::clone(service);
        let handle = inner.config.http_client.call(
            &service.service_control_uri,
            &format!("{}:check", service.service_name),
            &call.token,
            call.payload,
            Box::new(move |result| FilterInner::on_check_response(&weak, &check_service, result)),
        );
        inner.hold_check_handle(handle);
    }

    fn build_check(
        &self,
        st: &RequestState,
        requirement: &Requirement,
        service: &ServiceContext,
        token: SecretString,
    ) -> Result<CheckCall, FilterError> {
        let request = service.builder.build_check_request(&CheckRequestInfo {
            operation_id: &self.operation_id,
            operation_name: &requirement.operation_name,
            producer_project_id: &service.producer_project_id,
            api_key: st.api_key.as_deref(),
            caller_ip: st.caller_ip,
            start_time: st.start_time,
        });
        let payload = serde_json::to_vec(&request)
            .map_err(|e| FilterError::CheckPayloadInvalid(format!("encode: {e}")))?;
        Ok(CheckCall {
            token,
            payload: Bytes::from(payload),
        })
    }

    fn hold_check_handle(&self, handle: CancelHandle) {
        let orphan = {
            let mut st = self.state.lock();
            if st.check_resolved {
                None
            } else {
                match st.phase {
                    Phase::Calling(InFlight::Nothing) => {
                        st.phase = Phase::Calling(InFlight::Check(handle));
                        None
                    }
                    // Torn down while the call was being issued.
                    Phase::Responded => Some(handle),
                    _ => None,
                }
            }
        };
        if let Some(mut handle) = orphan {
            handle.cancel();
        }
    }

    fn on_check_response(
        weak: &Weak<Self>,
        service: &ServiceContext,
        result: Result<Bytes, CallError>,
    ) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let _entered = inner.span.enter();

        let (verdict, resume) = {
            let mut st = inner.state.lock();
            st.check_resolved = true;
            if !matches!(st.phase, Phase::Calling(_)) {
                tracing::debug!("Check response after the request was answered, ignoring");
                return;
            }
            let verdict = match result {
                Err(err) => Err(FilterError::CheckTransportFailed(err)),
                Ok(body) => match serde_json::from_slice::<CheckResponse>(&body) {
                    Err(err) => Err(FilterError::CheckPayloadInvalid(err.to_string())),
                    Ok(response) => {
                        let outcome = convert_check_response(&response, &service.service_name);
                        let status = outcome.status.clone();
                        st.check_outcome = Some(outcome);
                        if status.is_ok() {
                            Ok(())
                        } else {
                            Err(FilterError::CheckSemanticFailure(status))
                        }
                    }
                },
            };
            st.phase = if verdict.is_ok() {
                Phase::Complete
            } else {
                Phase::Responded
            };
            (verdict, st.stopped)
        };

        match verdict {
            Ok(()) => {
                inner.config.stats.record_allowed();
                tracing::debug!("Check passed");
                if resume {
                    inner.callbacks.continue_decoding();
                }
            }
            Err(err) => inner.reply_rejected(err),
        }
    }
}

fn send_report(
    client: &Arc<dyn HttpCallClient>,
    service: &ServiceContext,
    token: &SecretString,
    payload: Bytes,
    operation_id: String,
) {
    tracing::debug!(operation_id = %operation_id, service_name = %service.service_name, "Sending report");
    let _fire_and_forget = client.call(
        &service.service_control_uri,
        &format!("{}:report", service.service_name),
        token,
        payload,
        Box::new(move |result| {
            if let Err(err) = result {
                tracing::warn!(operation_id = %operation_id, error = %err, "Report call failed");
            }
        }),
    );
}
