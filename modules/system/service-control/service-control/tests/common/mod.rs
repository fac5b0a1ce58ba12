#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

//! Recording fakes shared by the integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use service_control::{
    DecoderCallbacks, FilterConfig, Rejection, RequirementTable, ResponseFlag, ServiceContext,
};
use service_control_sdk::{
    AccessToken, CallCallback, CallError, CancelHandle, CredentialSource, HttpCallClient,
    Requirement, TokenCallback, TokenError, TokenFetcher, TokenProvider,
};
use tokio::sync::Notify;

pub const SERVICE: &str = "bookstore.endpoints.example.com";
pub const SERVICE_CONTROL_URI: &str = "http://servicecontrol.test/v1/services";
pub const PRODUCER: &str = "producer-project";

/// Token provider whose fetches stay pending until completed by the test.
#[derive(Default)]
pub struct ManualTokens {
    pending: Arc<Mutex<HashMap<u64, TokenCallback>>>,
    next_id: AtomicU64,
    requests: AtomicUsize,
    cancelled: Arc<AtomicUsize>,
    ignore_cancel: bool,
}

impl ManualTokens {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A provider that counts cancellations but still delivers afterwards.
    pub fn ignoring_cancel() -> Arc<Self> {
        Arc::new(Self {
            ignore_cancel: true,
            ..Self::default()
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Complete every pending fetch with `token`.
    pub fn complete(&self, token: &str) {
        for on_done in self.drain() {
            on_done(Ok(SecretString::from(token.to_owned())));
        }
    }

    /// Fail every pending fetch.
    pub fn fail(&self, err: &TokenError) {
        for on_done in self.drain() {
            on_done(Err(err.clone()));
        }
    }

    fn drain(&self) -> Vec<TokenCallback> {
        let mut pending = self.pending.lock();
        let mut ids: Vec<u64> = pending.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
    }
}

impl TokenProvider for ManualTokens {
    fn get_token(&self, _service_name: &str, on_done: TokenCallback) -> CancelHandle {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().insert(id, on_done);

        let pending = Arc::clone(&self.pending);
        let cancelled = Arc::clone(&self.cancelled);
        let ignore_cancel = self.ignore_cancel;
        CancelHandle::new(move || {
            cancelled.fetch_add(1, Ordering::SeqCst);
            if !ignore_cancel {
                pending.lock().remove(&id);
            }
        })
    }
}

/// Fetcher for a real token cache that blocks until released.
#[derive(Default)]
pub struct GatedFetcher {
    calls: AtomicUsize,
    gate: Notify,
}

impl GatedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl TokenFetcher for GatedFetcher {
    async fn fetch_token(&self, _service_name: &str) -> Result<AccessToken, TokenError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.gate.notified().await;
        Ok(AccessToken {
            token: SecretString::from(format!("fetched-{n}")),
            expires_in: Duration::from_secs(3600),
        })
    }
}

/// Token provider answering synchronously, like a warm cache.
pub struct InlineTokens(pub Result<&'static str, TokenError>);

impl TokenProvider for InlineTokens {
    fn get_token(&self, _service_name: &str, on_done: TokenCallback) -> CancelHandle {
        on_done(self.0.clone().map(|t| SecretString::from(t.to_owned())));
        CancelHandle::noop()
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub base_uri: String,
    pub suffix: String,
    pub token: String,
    pub payload: serde_json::Value,
}

/// Call client that records every call.
///
/// Reports succeed inline. Checks are answered inline when a reply is
/// configured, otherwise held until [`FakeCalls::complete_checks`].
#[derive(Default)]
pub struct FakeCalls {
    calls: Mutex<Vec<RecordedCall>>,
    check_reply: Mutex<Option<Result<Bytes, CallError>>>,
    held: Arc<Mutex<HashMap<u64, CallCallback>>>,
    next_id: AtomicU64,
    cancelled: Arc<AtomicUsize>,
}

impl FakeCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answering(reply: Result<&'static str, CallError>) -> Arc<Self> {
        let calls = Self::default();
        *calls.check_reply.lock() = Some(reply.map(|body| Bytes::from_static(body.as_bytes())));
        Arc::new(calls)
    }

    pub fn checks(&self) -> Vec<RecordedCall> {
        self.by_suffix(":check")
    }

    pub fn reports(&self) -> Vec<RecordedCall> {
        self.by_suffix(":report")
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.held.lock().len()
    }

    pub fn complete_checks(&self, result: &Result<&'static str, CallError>) {
        let held: Vec<CallCallback> = self.held.lock().drain().map(|(_, cb)| cb).collect();
        for on_done in held {
            on_done(result.clone().map(|body| Bytes::from_static(body.as_bytes())));
        }
    }

    fn by_suffix(&self, suffix: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.suffix.ends_with(suffix))
            .cloned()
            .collect()
    }
}

impl HttpCallClient for FakeCalls {
    fn call(
        &self,
        base_uri: &str,
        suffix: &str,
        token: &SecretString,
        payload: Bytes,
        on_done: CallCallback,
    ) -> CancelHandle {
        self.calls.lock().push(RecordedCall {
            base_uri: base_uri.to_owned(),
            suffix: suffix.to_owned(),
            token: token.expose_secret().to_owned(),
            payload: serde_json::from_slice(&payload).unwrap(),
        });

        if suffix.ends_with(":report") {
            on_done(Ok(Bytes::from_static(b"{}")));
            return CancelHandle::noop();
        }
        let reply = self.check_reply.lock().clone();
        if let Some(reply) = reply {
            on_done(reply);
            return CancelHandle::noop();
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.held.lock().insert(id, on_done);
        let held = Arc::clone(&self.held);
        let cancelled = Arc::clone(&self.cancelled);
        CancelHandle::new(move || {
            cancelled.fetch_add(1, Ordering::SeqCst);
            held.lock().remove(&id);
        })
    }
}

/// Records what the filter asked the host to do.
#[derive(Default)]
pub struct RecordingCallbacks {
    pub replies: Mutex<Vec<Rejection>>,
    pub continues: AtomicUsize,
    pub flags: Mutex<Vec<ResponseFlag>>,
}

impl RecordingCallbacks {
    pub fn continues(&self) -> usize {
        self.continues.load(Ordering::SeqCst)
    }
}

impl DecoderCallbacks for RecordingCallbacks {
    fn send_local_reply(&self, rejection: Rejection) {
        self.replies.lock().push(rejection);
    }

    fn continue_decoding(&self) {
        self.continues.fetch_add(1, Ordering::SeqCst);
    }

    fn set_response_flag(&self, flag: ResponseFlag) {
        self.flags.lock().push(flag);
    }
}

fn requirement(
    operation: &str,
    service: &str,
    sources: Vec<CredentialSource>,
    open: bool,
) -> Requirement {
    Requirement {
        operation_name: operation.to_owned(),
        api_name: "bookstore".to_owned(),
        api_version: "v1".to_owned(),
        service_name: service.to_owned(),
        credential_sources: sources,
        allow_without_credential: open,
    }
}

/// Routes used across the tests:
///
/// - `GET /v1/items`: `items.list`, credential from `query:key` then `header:x-api-key`
/// - `GET /v1/public`: `public.get`, no check required
/// - `GET /v1/orphan`: requirement naming an unconfigured service
pub fn filter_config(
    tokens: Arc<dyn TokenProvider>,
    calls: Arc<dyn HttpCallClient>,
) -> Arc<FilterConfig> {
    let mut table = RequirementTable::new();
    table
        .insert(
            Method::GET,
            "/v1/items",
            requirement(
                "items.list",
                SERVICE,
                vec![
                    CredentialSource::Query("key".to_owned()),
                    CredentialSource::Header("x-api-key".to_owned()),
                ],
                false,
            ),
        )
        .unwrap();
    table
        .insert(
            Method::GET,
            "/v1/public",
            requirement("public.get", SERVICE, Vec::new(), true),
        )
        .unwrap();
    table
        .insert(
            Method::GET,
            "/v1/orphan",
            requirement("orphan.get", "missing.endpoints.example.com", Vec::new(), false),
        )
        .unwrap();

    let config = FilterConfig::new(
        table,
        [ServiceContext::new(SERVICE, PRODUCER, SERVICE_CONTROL_URI, Some("cfg-1".to_owned()))],
        tokens,
        calls,
    )
    .unwrap();
    Arc::new(config)
}

/// Valid and activated.
pub const CHECK_OK: &str = r#"{"operationId":"op","checkInfo":{"consumerInfo":{"projectNumber":"123456"}}}"#;

pub const CHECK_KEY_INVALID: &str =
    r#"{"checkErrors":[{"code":"API_KEY_INVALID","detail":"API key not valid"}]}"#;
