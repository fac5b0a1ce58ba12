//! axum middleware running a [`ServiceControlFilter`] per request.
//!
//! The report is tied to the response body rather than to the handler. It
//! fires when the body ends or is dropped, so byte counts and the end time
//! cover the whole exchange.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use http_body::Body as _;
use http_body::{Frame, SizeHint};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::domain::error::Rejection;
use crate::domain::filter::{
    DecoderCallbacks, FilterConfig, FilterHeadersStatus, ResponseFlag, ServiceControlFilter,
    StreamInfo,
};

const REASON_INCOMPLETE: &str = "Authorization did not complete";

/// State for [`service_control_middleware`].
#[derive(Clone)]
pub struct ServiceControlState {
    config: Arc<FilterConfig>,
}

impl ServiceControlState {
    #[must_use]
    pub fn new(config: Arc<FilterConfig>) -> Self {
        Self { config }
    }
}

enum Verdict {
    Continue,
    Reject(Rejection),
}

/// Turns decoder callbacks into a single verdict on a oneshot channel.
struct ChannelCallbacks {
    verdict: Mutex<Option<oneshot::Sender<Verdict>>>,
    flag: Mutex<Option<ResponseFlag>>,
}

impl ChannelCallbacks {
    fn new() -> (Arc<Self>, oneshot::Receiver<Verdict>) {
        let (tx, rx) = oneshot::channel();
        let callbacks = Arc::new(Self {
            verdict: Mutex::new(Some(tx)),
            flag: Mutex::new(None),
        });
        (callbacks, rx)
    }

    fn send(&self, verdict: Verdict) {
        if let Some(tx) = self.verdict.lock().take() {
            if tx.send(verdict).is_err() {
                // Client went away; the request guard reports it.
                tracing::trace!("Verdict receiver dropped");
            }
        }
    }
}

impl DecoderCallbacks for ChannelCallbacks {
    fn send_local_reply(&self, rejection: Rejection) {
        self.send(Verdict::Reject(rejection));
    }

    fn continue_decoding(&self) {
        self.send(Verdict::Continue);
    }

    fn set_response_flag(&self, flag: ResponseFlag) {
        *self.flag.lock() = Some(flag);
    }
}

/// Ends the filter's lifecycle when the exchange is over.
///
/// Lives in the middleware future until a response exists, then moves into
/// the response body. Dropping it at either point reports the request.
struct RequestGuard {
    filter: ServiceControlFilter,
    response_code: Option<u16>,
    bytes_received: Arc<AtomicU64>,
    bytes_sent: u64,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        // Report first: a report that needs a token joins the fetch the
        // teardown below would otherwise abort.
        self.filter.log(&StreamInfo {
            response_code: self.response_code,
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent,
        });
        self.filter.on_destroy();
    }
}

fn frame_len(frame: &Frame<Bytes>) -> u64 {
    frame
        .data_ref()
        .map_or(0, |data| u64::try_from(data.len()).unwrap_or(u64::MAX))
}

/// Request body that counts the bytes the backend reads.
struct CountingBody {
    inner: Body,
    counter: Arc<AtomicU64>,
}

impl http_body::Body for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &polled {
            self.counter.fetch_add(frame_len(frame), Ordering::Relaxed);
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Response body that counts sent bytes and reports once it is finished.
struct ReportingBody {
    inner: Body,
    guard: Option<RequestGuard>,
}

impl http_body::Body for ReportingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(guard) = self.guard.as_mut() {
                    guard.bytes_sent += frame_len(frame);
                }
            }
            Poll::Ready(Some(Err(_)) | None) => {
                drop(self.guard.take());
            }
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Service control middleware.
///
/// For each request:
/// 1. Resolves the route requirement and extracts the caller credential
/// 2. Holds the request until the Check verdict arrives
/// 3. Forwards it, or answers with the rejection
/// 4. Reports usage once the response body is done or the client disconnects
///
/// The caller IP is taken from [`ConnectInfo<SocketAddr>`] when the server
/// was built with `into_make_service_with_connect_info`.
pub async fn service_control_middleware(
    State(state): State<ServiceControlState>,
    req: Request,
    next: Next,
) -> Response {
    let (callbacks, verdict_rx) = ChannelCallbacks::new();
    let filter = ServiceControlFilter::new(Arc::clone(&state.config), callbacks.clone());
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        filter.set_caller_ip(addr.ip());
    }

    let bytes_received = Arc::new(AtomicU64::new(0));
    let req = req.map(|inner| {
        Body::new(CountingBody {
            inner,
            counter: Arc::clone(&bytes_received),
        })
    });
    let mut guard = RequestGuard {
        filter,
        response_code: None,
        bytes_received,
        bytes_sent: 0,
    };

    let verdict = match guard
        .filter
        .decode_headers(req.method(), req.uri(), req.headers())
    {
        FilterHeadersStatus::Continue => Verdict::Continue,
        FilterHeadersStatus::StopIteration => verdict_rx.await.unwrap_or_else(|_| {
            tracing::error!(
                operation_id = guard.filter.operation_id(),
                "Filter dropped the request without a verdict"
            );
            Verdict::Reject(Rejection::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                REASON_INCOMPLETE,
            ))
        }),
    };

    let response = match verdict {
        Verdict::Continue => next.run(req).await,
        Verdict::Reject(rejection) => {
            let mut response = rejection.into_response();
            if let Some(flag) = *callbacks.flag.lock() {
                response.extensions_mut().insert(flag);
            }
            response
        }
    };

    guard.response_code = Some(response.status().as_u16());
    response.map(|inner| {
        Body::new(ReportingBody {
            inner,
            guard: Some(guard),
        })
    })
}
