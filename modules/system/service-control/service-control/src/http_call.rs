//! hyper based [`HttpCallClient`] for Check and Report calls.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use service_control_sdk::{CallCallback, CallError, CancelHandle, HttpCallClient};
use tokio_util::sync::CancellationToken;

use crate::config::HttpCallConfig;
use crate::domain::error::ConfigError;

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Issues one POST per call on its own tokio task.
///
/// No retries. The only timeout is the optional transport limit from
/// [`HttpCallConfig`].
#[derive(Clone)]
pub struct HyperHttpCallClient {
    client: HttpsClient,
    timeout: Option<Duration>,
}

impl HyperHttpCallClient {
    /// Build a client trusting the platform's native root certificates.
    ///
    /// # Errors
    /// Returns [`ConfigError::TlsRoots`] if the native roots cannot be loaded.
    pub fn new(config: &HttpCallConfig) -> Result<Self, ConfigError> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(ConfigError::TlsRoots)?
            .https_or_http()
            .enable_http1()
            .build();
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
            timeout: config.timeout_ms.map(Duration::from_millis),
        })
    }
}

impl HttpCallClient for HyperHttpCallClient {
    fn call(
        &self,
        base_uri: &str,
        suffix: &str,
        token: &SecretString,
        payload: Bytes,
        on_done: CallCallback,
    ) -> CancelHandle {
        let url = format!("{}/{suffix}", base_uri.trim_end_matches('/'));

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            on_done(Err(CallError::RuntimeUnavailable));
            return CancelHandle::noop();
        };
        let request = match build_request(&url, token, payload) {
            Ok(request) => request,
            Err(err) => {
                on_done(Err(err));
                return CancelHandle::noop();
            }
        };

        // Shared so that cancel() and completion race for the callback.
        let slot = Arc::new(Mutex::new(Some(on_done)));
        let cancel = CancellationToken::new();

        let task_slot = Arc::clone(&slot);
        let task_cancel = cancel.clone();
        let client = self.client.clone();
        let timeout = self.timeout;
        runtime.spawn(async move {
            tokio::select! {
                biased;
                () = task_cancel.cancelled() => {
                    tracing::debug!(url = %url, "Call cancelled");
                }
                result = execute(&client, request, timeout) => {
                    if let Err(err) = &result {
                        tracing::debug!(url = %url, error = %err, "Call failed");
                    }
                    let on_done = task_slot.lock().take();
                    if let Some(on_done) = on_done {
                        on_done(result);
                    }
                }
            }
        });

        CancelHandle::new(move || {
            cancel.cancel();
            drop(slot.lock().take());
        })
    }
}

fn build_request(
    url: &str,
    token: &SecretString,
    payload: Bytes,
) -> Result<Request<Full<Bytes>>, CallError> {
    let mut bearer = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
        .map_err(|_| CallError::Transport("access token is not a valid header value".to_owned()))?;
    bearer.set_sensitive(true);

    Request::builder()
        .method(Method::POST)
        .uri(url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, bearer)
        .body(Full::new(payload))
        .map_err(|e| CallError::Transport(format!("invalid request to {url}: {e}")))
}

async fn execute(
    client: &HttpsClient,
    request: Request<Full<Bytes>>,
    timeout: Option<Duration>,
) -> Result<Bytes, CallError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, send(client, request))
            .await
            .map_err(|_| CallError::Timeout)?,
        None => send(client, request).await,
    }
}

async fn send(client: &HttpsClient, request: Request<Full<Bytes>>) -> Result<Bytes, CallError> {
    let response = client
        .request(request)
        .await
        .map_err(|e| CallError::Transport(e.to_string()))?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| CallError::Transport(e.to_string()))?
        .to_bytes();

    if !status.is_success() {
        return Err(CallError::Status {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(body)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn client(timeout_ms: Option<u64>) -> HyperHttpCallClient {
        HyperHttpCallClient::new(&HttpCallConfig { timeout_ms }).unwrap()
    }

    fn token() -> SecretString {
        SecretString::from("ya29.test".to_owned())
    }

    fn channel() -> (CallCallback, oneshot::Receiver<Result<Bytes, CallError>>) {
        let (tx, rx) = oneshot::channel();
        let callback: CallCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn posts_payload_with_bearer_token() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/v1/services/bookstore:check")
                    .header("authorization", "Bearer ya29.test")
                    .header("content-type", "application/json")
                    .body(r#"{"operation":{}}"#);
                then.status(200).body(r#"{"operationId":"op-1"}"#);
            })
            .await;

        let (callback, rx) = channel();
        let _handle = client(None).call(
            &server.url("/v1/services/"),
            "bookstore:check",
            &token(),
            Bytes::from_static(br#"{"operation":{}}"#),
            callback,
        );

        let body = rx.await.unwrap().unwrap();
        assert_eq!(&body[..], br#"{"operationId":"op-1"}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST);
                then.status(403).body("forbidden");
            })
            .await;

        let (callback, rx) = channel();
        let _handle = client(None).call(
            &server.url("/v1/services"),
            "bookstore:check",
            &token(),
            Bytes::new(),
            callback,
        );

        match rx.await.unwrap() {
            Err(CallError::Status { status, body }) => {
                assert_eq!(status, http::StatusCode::FORBIDDEN);
                assert_eq!(body, "forbidden");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_timeout_is_reported() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST);
                then.status(200).delay(Duration::from_millis(500));
            })
            .await;

        let (callback, rx) = channel();
        let _handle = client(Some(20)).call(
            &server.url("/v1/services"),
            "bookstore:report",
            &token(),
            Bytes::new(),
            callback,
        );

        assert!(matches!(rx.await.unwrap(), Err(CallError::Timeout)));
    }

    #[tokio::test]
    async fn cancelled_call_never_completes() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST);
                then.status(200).delay(Duration::from_millis(200));
            })
            .await;

        let (callback, rx) = channel();
        let mut handle = client(None).call(
            &server.url("/v1/services"),
            "bookstore:check",
            &token(),
            Bytes::new(),
            callback,
        );
        handle.cancel();
        handle.cancel();

        // The callback (and its sender) is dropped without being invoked.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_transport_error() {
        let (callback, rx) = channel();
        let _handle = client(Some(2_000)).call(
            "http://127.0.0.1:1/v1/services",
            "bookstore:check",
            &token(),
            Bytes::new(),
            callback,
        );

        assert!(matches!(rx.await.unwrap(), Err(CallError::Transport(_))));
    }

    #[test]
    fn call_outside_runtime_fails_fast() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let client = runtime.block_on(async { client(None) });

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = client.call(
            "http://127.0.0.1:1",
            "svc:check",
            &token(),
            Bytes::new(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        assert!(!handle.is_armed());
        assert!(matches!(rx.recv().unwrap(), Err(CallError::RuntimeUnavailable)));
    }
}
