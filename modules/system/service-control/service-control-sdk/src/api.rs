//! Seam traits consumed by the service control filter.
//!
//! Token acquisition and outbound calls are callback based: the caller hands
//! over a completion callback and gets a [`CancelHandle`] back. The callback
//! fires at most once and never after the handle was cancelled.

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;

use crate::error::{CallError, TokenError};
use crate::handle::CancelHandle;
use crate::models::AccessToken;

/// Completion callback of [`TokenProvider::get_token`].
pub type TokenCallback = Box<dyn FnOnce(Result<SecretString, TokenError>) + Send + 'static>;

/// Completion callback of [`HttpCallClient::call`]; receives the raw response body.
pub type CallCallback = Box<dyn FnOnce(Result<Bytes, CallError>) + Send + 'static>;

/// Supplies bearer tokens for calls to the service control backend.
///
/// ```ignore
/// let mut handle = provider.get_token(&service_name, Box::new(move |result| on_token(result)));
/// ```
pub trait TokenProvider: Send + Sync {
    /// Request a token for `service_name`.
    ///
    /// The callback may run synchronously, before `get_token` returns, when a
    /// fresh token is already cached. Callers must not hold locks the callback
    /// needs.
    fn get_token(&self, service_name: &str, on_done: TokenCallback) -> CancelHandle;
}

/// Performs the actual token acquisition behind a caching [`TokenProvider`].
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    /// Fetch a fresh token for `service_name`.
    ///
    /// # Errors
    ///
    /// - `NotConfigured` if no source exists for the service
    /// - `Fetch` for any acquisition failure
    async fn fetch_token(&self, service_name: &str) -> Result<AccessToken, TokenError>;
}

/// Issues one outbound call to the service control backend.
pub trait HttpCallClient: Send + Sync {
    /// POST `payload` to `<base_uri>/<suffix>` authenticated with `token`.
    ///
    /// `on_done` receives the response body on success. No retries happen at
    /// this layer.
    fn call(
        &self,
        base_uri: &str,
        suffix: &str,
        token: &SecretString,
        payload: Bytes,
        on_done: CallCallback,
    ) -> CancelHandle;
}
