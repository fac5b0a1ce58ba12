#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Service Control SDK
//!
//! This crate provides the public contracts of the `service_control` module:
//!
//! - [`Requirement`], [`CredentialSource`] - per-route authorization requirements
//! - [`CheckOutcome`], [`CheckStatus`] - the decoded result of a Check call
//! - [`TokenProvider`], [`TokenFetcher`] - access token seams
//! - [`HttpCallClient`] - outbound call seam used for Check and Report
//! - [`CancelHandle`] - cancellation of in-flight token fetches and calls
//! - [`TokenError`], [`CallError`] - error types crossing the seams
//!
//! ## Usage
//!
//! ```ignore
//! use service_control_sdk::{CancelHandle, TokenProvider};
//!
//! let mut handle = tokens.get_token("bookstore.endpoints.example.com", Box::new(|result| {
//!     match result {
//!         Ok(token) => { /* issue the check call */ }
//!         Err(err) => { /* reject the request */ }
//!     }
//! }));
//!
//! // Request torn down before the token arrived: the callback never fires.
//! handle.cancel();
//! ```

pub mod api;
pub mod error;
pub mod handle;
pub mod models;

pub use api::{CallCallback, HttpCallClient, TokenCallback, TokenFetcher, TokenProvider};
pub use error::{CallError, TokenError};
pub use handle::CancelHandle;
pub use models::{
    AccessToken, CheckCode, CheckOutcome, CheckStatus, CredentialSource, Requirement,
};
