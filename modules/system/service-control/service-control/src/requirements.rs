//! Requirement table: maps (HTTP method, path) to the configured [`Requirement`].

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use service_control_sdk::Requirement;

use crate::config::RequirementRule;
use crate::domain::error::ConfigError;

/// Route table keyed by HTTP method, one `matchit` router per method.
///
/// Static segments win over parameters, so the most specific template matches.
#[derive(Clone, Default)]
pub struct RequirementTable {
    routers: HashMap<Method, matchit::Router<Arc<Requirement>>>,
    len: usize,
}

impl RequirementTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from configured rules.
    ///
    /// # Errors
    /// Returns an error on an unknown method or an invalid/conflicting template.
    pub fn from_rules(rules: &[RequirementRule]) -> Result<Self, ConfigError> {
        let mut table = Self::new();
        for rule in rules {
            let method = Method::from_bytes(rule.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| ConfigError::InvalidMethod(rule.method.clone()))?;
            table.insert(
                method,
                &rule.uri_template,
                Requirement {
                    operation_name: rule.operation_name.clone(),
                    api_name: rule.api_name.clone(),
                    api_version: rule.api_version.clone(),
                    service_name: rule.service_name.clone(),
                    credential_sources: rule.api_keys.clone(),
                    allow_without_credential: rule.allow_without_api_key,
                },
            )?;
        }
        Ok(table)
    }

    /// Register `requirement` for `method` and `uri_template`.
    ///
    /// # Errors
    /// Returns an error if the template is unsupported or conflicts with an
    /// existing one for the same method.
    pub fn insert(
        &mut self,
        method: Method,
        uri_template: &str,
        requirement: Requirement,
    ) -> Result<(), ConfigError> {
        let route = convert_uri_template(uri_template)?;
        self.routers
            .entry(method)
            .or_insert_with(matchit::Router::new)
            .insert(route, Arc::new(requirement))
            .map_err(|e| ConfigError::InvalidTemplate {
                template: uri_template.to_owned(),
                reason: e.to_string(),
            })?;
        self.len += 1;
        Ok(())
    }

    /// Find the requirement for a request. `path` may carry a query string.
    #[must_use]
    pub fn find(&self, method: &Method, path: &str) -> Option<Arc<Requirement>> {
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        let router = self.routers.get(method)?;
        router.at(path).ok().map(|m| Arc::clone(m.value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Convert a routing-rule URI template to `matchit` syntax.
///
/// - `{var}` and `{var=*}` match one segment
/// - `{var=**}` matches the remainder of the path
/// - axum-style `:var` is accepted as `{var}`
fn convert_uri_template(template: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTemplate {
        template: template.to_owned(),
        reason: reason.to_owned(),
    };

    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                let mut var = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    var.push(c);
                }
                if !closed {
                    return Err(invalid("unterminated variable"));
                }
                let (name, pattern) = match var.split_once('=') {
                    Some((name, pattern)) => (name.trim(), Some(pattern.trim())),
                    None => (var.trim(), None),
                };
                if name.is_empty() {
                    return Err(invalid("empty variable name"));
                }
                match pattern {
                    None | Some("*") => {
                        result.push('{');
                        result.push_str(name);
                        result.push('}');
                    }
                    Some("**") => {
                        result.push_str("{*");
                        result.push_str(name);
                        result.push('}');
                    }
                    Some(_) => return Err(invalid("unsupported variable pattern")),
                }
            }
            ':' => {
                result.push('{');
                while matches!(chars.peek(), Some(c) if c.is_alphanumeric() || *c == '_') {
                    if let Some(c) = chars.next() {
                        result.push(c);
                    }
                }
                result.push('}');
            }
            _ => result.push(ch),
        }
    }

    Ok(result)
}
