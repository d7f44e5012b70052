//! Callback registration policy.
//!
//! Checks run before a start request reaches the transaction engine, in a
//! fixed order: enabled, count, then per callback URL length, scheme,
//! header size, allow-list, insecure transport. The first violation wins.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::CallbackTarget;

/// One allow-listed callback address.
///
/// The pattern is compiled when the entry is created, so a policy never
/// recompiles it per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "AddressSpec", into = "AddressSpec")]
pub struct AllowedAddress {
    pattern: String,
    allow_insecure: bool,
    matcher: Regex,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressSpec {
    pattern: String,
    allow_insecure: bool,
}

impl TryFrom<AddressSpec> for AllowedAddress {
    type Error = Error;

    fn try_from(spec: AddressSpec) -> Result<Self> {
        Self::new(spec.pattern, spec.allow_insecure)
    }
}

impl From<AllowedAddress> for AddressSpec {
    fn from(address: AllowedAddress) -> Self {
        Self {
            pattern: address.pattern,
            allow_insecure: address.allow_insecure,
        }
    }
}

impl PartialEq for AllowedAddress {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.allow_insecure == other.allow_insecure
    }
}

impl Eq for AllowedAddress {}

impl AllowedAddress {
    /// Creates an allow-list entry.
    ///
    /// `pattern` is a host glob (`*.example.com`, `localhost:*`, `*`) where
    /// `*` matches any run of characters. A pattern with a `:` is matched
    /// against `host:port`, otherwise against the host. Matching ignores
    /// case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::invalid_argument`] if the compiled pattern exceeds
    /// the regex size limit.
    pub fn new(pattern: impl Into<String>, allow_insecure: bool) -> Result<Self> {
        let pattern = pattern.into();
        let expr = format!("^{}$", regex::escape(&pattern).replace(r"\*", ".*"));
        let matcher = RegexBuilder::new(&expr)
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                Error::invalid_argument(format!("invalid callback address {pattern:?}: {e}"))
            })?;
        Ok(Self {
            pattern,
            allow_insecure,
            matcher,
        })
    }

    /// Returns the pattern as configured.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns whether plain `http` is accepted for matching URLs.
    #[must_use]
    pub const fn allow_insecure(&self) -> bool {
        self.allow_insecure
    }

    fn matches(&self, host: &str, port: Option<u16>) -> bool {
        match port {
            Some(port) if self.pattern.contains(':') => {
                self.matcher.is_match(&format!("{host}:{port}"))
            }
            _ => self.matcher.is_match(host),
        }
    }
}

/// Namespace-level limits on callback registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPolicy {
    /// Whether workflow callbacks may be attached at all.
    pub enabled: bool,
    /// Maximum URL length in bytes.
    pub url_max_length: usize,
    /// Maximum total header size (sum of key and value bytes).
    pub header_max_size: usize,
    /// Maximum callbacks per workflow run.
    pub max_per_workflow: usize,
    /// Allowed destinations.
    pub allowed_addresses: Vec<AllowedAddress>,
}

impl Default for CallbackPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            url_max_length: 1000,
            header_max_size: 8 * 1024,
            max_per_workflow: 32,
            allowed_addresses: Vec::new(),
        }
    }
}

impl CallbackPolicy {
    /// Validates the callbacks attached to a start request.
    ///
    /// An empty list is always accepted, even when callbacks are disabled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::invalid_argument`] describing the first violation.
    pub fn validate(&self, callbacks: &[CallbackTarget]) -> Result<()> {
        if callbacks.is_empty() {
            return Ok(());
        }
        if !self.enabled {
            return Err(Error::invalid_argument(
                "attaching workflow callbacks is disabled for this namespace",
            ));
        }
        if callbacks.len() > self.max_per_workflow {
            return Err(Error::invalid_argument(format!(
                "cannot attach more than {} callbacks to a workflow",
                self.max_per_workflow
            )));
        }
        callbacks.iter().try_for_each(|cb| self.validate_one(cb))
    }

    fn validate_one(&self, callback: &CallbackTarget) -> Result<()> {
        let raw = callback.url.as_str();
        if raw.len() > self.url_max_length {
            return Err(Error::invalid_argument(format!(
                "invalid url: url length longer than max length allowed of {}",
                self.url_max_length
            )));
        }

        let url = match reqwest::Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid url: unknown scheme: {raw}"
                )));
            }
        };

        let header_size: usize = callback
            .headers
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        if header_size > self.header_max_size {
            return Err(Error::invalid_argument(format!(
                "invalid header: header size longer than max allowed size of {}",
                self.header_max_size
            )));
        }

        let host = url.host_str().unwrap_or_default();
        let Some(allowed) = self
            .allowed_addresses
            .iter()
            .find(|a| a.matches(host, url.port_or_known_default()))
        else {
            return Err(Error::invalid_argument(format!(
                "invalid url: url does not match any configured callback address: {raw}"
            )));
        };

        if url.scheme() == "http" && !allowed.allow_insecure {
            return Err(Error::invalid_argument(format!(
                "invalid url: callback address does not allow insecure connections: {raw}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn policy() -> CallbackPolicy {
        CallbackPolicy {
            enabled: true,
            url_max_length: 50,
            header_max_size: 6,
            max_per_workflow: 2,
            allowed_addresses: vec![
                AllowedAddress::new("some-ignored-address", true).unwrap(),
                AllowedAddress::new("some-secure-address", false).unwrap(),
            ],
        }
    }

    fn target(url: &str) -> CallbackTarget {
        CallbackTarget::new(url)
    }

    fn message(result: Result<()>) -> String {
        result.unwrap_err().to_string()
    }

    #[test]
    fn disabled_namespace_rejects_callbacks() {
        let mut policy = policy();
        policy.enabled = false;
        assert_eq!(
            message(policy.validate(&[target("http://some-ignored-address")])),
            "attaching workflow callbacks is disabled for this namespace"
        );
        assert!(policy.validate(&[]).is_ok());
    }

    #[test]
    fn unknown_scheme() {
        assert_eq!(
            message(policy().validate(&[target("invalid")])),
            "invalid url: unknown scheme: invalid"
        );
        assert_eq!(
            message(policy().validate(&[target("ftp://some-ignored-address")])),
            "invalid url: unknown scheme: ftp://some-ignored-address"
        );
    }

    #[test]
    fn url_too_long() {
        let url = "http://some-very-very-very-very-very-very-very-long-url/x";
        assert_eq!(url.len(), 57);
        assert_eq!(
            message(policy().validate(&[target(url)])),
            "invalid url: url length longer than max length allowed of 50"
        );
    }

    #[test]
    fn header_size_counts_keys_and_values() {
        let mut cb = target("http://some-ignored-address");
        cb.headers = BTreeMap::from([("too".to_string(), "long".to_string())]);
        assert_eq!(
            message(policy().validate(&[cb])),
            "invalid header: header size longer than max allowed size of 6"
        );

        let mut cb = target("http://some-ignored-address");
        cb.headers = BTreeMap::from([("ab".to_string(), "cdef".to_string())]);
        assert!(policy().validate(&[cb]).is_ok());
    }

    #[test]
    fn too_many_callbacks() {
        let urls = [target("http://url-1"), target("http://url-2"), target("http://url-3")];
        assert_eq!(
            message(policy().validate(&urls)),
            "cannot attach more than 2 callbacks to a workflow"
        );
    }

    #[test]
    fn address_must_be_configured() {
        assert_eq!(
            message(policy().validate(&[target("http://some-unconfigured-address")])),
            "invalid url: url does not match any configured callback address: http://some-unconfigured-address"
        );
    }

    #[test]
    fn insecure_requires_opt_in() {
        assert_eq!(
            message(policy().validate(&[target("http://some-secure-address")])),
            "invalid url: callback address does not allow insecure connections: http://some-secure-address"
        );
        assert!(policy().validate(&[target("https://some-secure-address")]).is_ok());
    }

    #[test]
    fn count_checked_before_individual_urls() {
        let urls = [target("invalid"), target("invalid"), target("invalid")];
        assert_eq!(
            message(policy().validate(&urls)),
            "cannot attach more than 2 callbacks to a workflow"
        );
    }

    #[test]
    fn wildcard_patterns() {
        let mut policy = policy();
        policy.allowed_addresses = vec![
            AllowedAddress::new("*.example.com", false).unwrap(),
            AllowedAddress::new("127.0.0.1:*", true).unwrap(),
        ];
        assert!(policy.validate(&[target("https://hooks.example.com/cb")]).is_ok());
        assert!(policy.validate(&[target("http://127.0.0.1:8080/cb")]).is_ok());
        assert!(policy.validate(&[target("https://example.org")]).is_err());
    }

    #[test]
    fn pattern_semantics() {
        let any = AllowedAddress::new("*", false).unwrap();
        assert!(any.matches("anything", Some(443)));

        let suffix = AllowedAddress::new("*.Example.com", false).unwrap();
        assert!(suffix.matches("hooks.example.com", Some(443)));
        assert!(!suffix.matches("example.com", Some(443)));
        assert!(!suffix.matches("hooks.example.com.evil", Some(443)));

        // Regex metacharacters in the pattern are literals.
        let literal = AllowedAddress::new("a.c", false).unwrap();
        assert!(literal.matches("a.c", None));
        assert!(!literal.matches("abc", None));

        let port = AllowedAddress::new("localhost:*", true).unwrap();
        assert!(port.matches("localhost", Some(7243)));
        assert!(!port.matches("localhost", None));
        let fixed = AllowedAddress::new("localhost:8080", true).unwrap();
        assert!(!fixed.matches("localhost", Some(8081)));
    }

    #[test]
    fn addresses_round_trip_through_serde() {
        let address = AllowedAddress::new("*.example.com", true).unwrap();
        let json = serde_json::to_value(&address).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"pattern": "*.example.com", "allowInsecure": true})
        );
        let back: AllowedAddress = serde_json::from_value(json).unwrap();
        assert_eq!(back, address);
        assert!(back.matches("hooks.example.com", None));
    }
}
