//! Best-effort credential extraction from query parameters, headers and cookies.

use std::collections::HashMap;

use http::{HeaderMap, Uri, header};
use service_control_sdk::CredentialSource;

/// Extracts the caller credential from one request.
///
/// The query string is parsed at most once per extractor.
pub struct CredentialExtractor<'a> {
    uri: &'a Uri,
    headers: &'a HeaderMap,
    query_params: Option<HashMap<String, String>>,
}

impl<'a> CredentialExtractor<'a> {
    #[must_use]
    pub fn new(uri: &'a Uri, headers: &'a HeaderMap) -> Self {
        Self {
            uri,
            headers,
            query_params: None,
        }
    }

    /// Try every source in declared order. Sources are not short-circuited:
    /// the last one that yields a value wins. Misses are logged, never errors.
    pub fn extract(&mut self, sources: &[CredentialSource]) -> Option<String> {
        let mut credential = None;
        for source in sources {
            let found = match source {
                CredentialSource::Query(name) => self.from_query(name),
                CredentialSource::Header(name) => self.from_header(name),
                CredentialSource::Cookie(name) => self.from_cookie(name),
            };
            match found {
                Some(value) => credential = Some(value),
                None => tracing::debug!(?source, path = %self.uri, "Credential not found"),
            }
        }
        credential
    }

    fn from_query(&mut self, name: &str) -> Option<String> {
        let uri = self.uri;
        self.query_params
            .get_or_insert_with(|| parse_query(uri.query().unwrap_or_default()))
            .get(name)
            .cloned()
    }

    fn from_header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    fn from_cookie(&self, name: &str) -> Option<String> {
        parse_cookie_value(self.headers, name)
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

/// Value of cookie `name` across all `Cookie` headers; empty values count as absent.
fn parse_cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| {
            let value = value.trim();
            value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
        })
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}
