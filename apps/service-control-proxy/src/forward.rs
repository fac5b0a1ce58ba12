//! Forwarding of authorized requests to the backend.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use http::header::{self, HeaderName};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid backend url '{url}': {reason}")]
    InvalidBackend { url: String, reason: String },

    #[error("failed to build upstream uri: {0}")]
    Uri(#[from] http::Error),

    #[error("backend request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Forwarding failed");
        let status = match self {
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidBackend { .. } | Self::Uri(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, status.canonical_reason().unwrap_or("Error")).into_response()
    }
}

/// Plain HTTP client bound to one backend origin.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Body>,
    scheme: Scheme,
    authority: Authority,
}

impl Forwarder {
    /// # Errors
    /// Returns an error unless `backend_url` is an absolute `http` URL.
    pub fn new(backend_url: &str) -> Result<Self, ForwardError> {
        let invalid = |reason: &str| ForwardError::InvalidBackend {
            url: backend_url.to_owned(),
            reason: reason.to_owned(),
        };
        let uri: Uri = backend_url
            .parse()
            .map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        let scheme = uri.scheme().cloned().ok_or_else(|| invalid("missing scheme"))?;
        if scheme != Scheme::HTTP {
            return Err(invalid("only http backends are supported"));
        }
        let authority = uri.authority().cloned().ok_or_else(|| invalid("missing host"))?;

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            scheme,
            authority,
        })
    }

    fn upstream_uri(&self, uri: &Uri) -> Result<Uri, ForwardError> {
        let path_and_query = uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        Ok(Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()?)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Fallback handler relaying every request to the backend.
pub async fn forward(
    State(forwarder): State<Forwarder>,
    req: Request,
) -> Result<Response, ForwardError> {
    let (mut parts, body) = req.into_parts();
    parts.uri = forwarder.upstream_uri(&parts.uri)?;
    strip_hop_by_hop(&mut parts.headers);
    parts.headers.remove(header::HOST);

    tracing::debug!(method = %parts.method, uri = %parts.uri, "Forwarding request");
    let response = forwarder
        .client
        .request(Request::from_parts(parts, body))
        .await?;

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Body::new(body)))
}
