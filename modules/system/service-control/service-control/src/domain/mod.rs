//! Domain layer for service control: the per-request filter, the shared
//! token cache and the Check/Report payload builder.

pub mod error;
pub mod filter;
pub mod request_builder;
pub mod stats;
pub mod token_cache;

pub use error::{ConfigError, FilterError, Rejection};
pub use filter::{FilterConfig, ServiceContext, ServiceControlFilter};
pub use request_builder::RequestBuilder;
pub use token_cache::TokenCache;
