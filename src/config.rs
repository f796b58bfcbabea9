//! Audit configuration
//!
//! The configuration is produced by an external loader (YAML file, CLI flags) and
//! handed to the engine as an immutable value. Every struct deserializes with
//! defaults for missing fields.

use crate::error::{AuditError, Result};
use crate::proxy::cloud::CloudProvider;
use ipnetwork::IpNetwork;
use regex::Regex;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Default timeout for every request in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of proxies checked at once
const DEFAULT_CONCURRENCY: usize = 10;

/// Default URL to validate proxies against
pub const DEFAULT_TEST_URL: &str = "https://api.ipify.org?format=json";

/// Default echo endpoint for anonymity checks
pub const DEFAULT_ECHO_URL: &str = "http://api.ipify.org?format=json";

/// Default user agent for outgoing requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Whether probes that need a functioning channel run on failed proxies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbePolicy {
    /// Cloud and advanced probes only run once validation passed
    #[default]
    WorkingOnly,
    /// Cloud and advanced probes run regardless of validation
    Always,
}

/// A single URL the validator requests through each proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestUrl {
    pub url: String,
    #[serde(default)]
    pub description: String,
    /// A failed required URL fails the proxy regardless of the success count
    #[serde(default)]
    pub required: bool,
}

impl TestUrl {
    pub fn new(url: &str, description: &str, required: bool) -> Self {
        Self {
            url: url.to_string(),
            description: description.to_string(),
            required,
        }
    }
}

/// Validation targets and response acceptance rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Checked alone when `test_urls` is empty
    pub default_url: String,
    pub test_urls: Vec<TestUrl>,
    pub required_success_count: usize,
    pub min_response_bytes: usize,
    pub disallowed_keywords: Vec<String>,
    pub require_status_code: Option<u16>,
    /// Regular expression that must match the response body
    pub require_content_match: Option<String>,
    pub require_header_fields: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            default_url: DEFAULT_TEST_URL.to_string(),
            test_urls: Vec::new(),
            required_success_count: 1,
            min_response_bytes: 100,
            disallowed_keywords: vec![
                "Access Denied".to_string(),
                "Proxy Error".to_string(),
                "Bad Gateway".to_string(),
                "Gateway Timeout".to_string(),
                "Service Unavailable".to_string(),
            ],
            require_status_code: None,
            require_content_match: None,
            require_header_fields: Vec::new(),
        }
    }
}

impl ValidationConfig {
    /// URLs the validator requests, in order
    pub fn targets(&self) -> Vec<TestUrl> {
        if self.test_urls.is_empty() {
            vec![TestUrl::new(&self.default_url, "default", false)]
        } else {
            self.test_urls.clone()
        }
    }
}

/// Anonymity detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymityConfig {
    pub enabled: bool,
    pub echo_url: String,
}

impl Default for AnonymityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            echo_url: DEFAULT_ECHO_URL.to_string(),
        }
    }
}

/// Cloud metadata and internal network probing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,
    pub providers: Vec<CloudProvider>,
    /// Random addresses sampled from each provider's internal ranges
    pub internal_samples: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            providers: CloudProvider::builtin(),
            internal_samples: 5,
        }
    }
}

/// Toggles for the protocol-level weakness probes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedChecks {
    pub test_protocol_smuggling: bool,
    pub test_dns_rebinding: bool,
    pub test_ipv6: bool,
    pub test_http_methods: Vec<String>,
    pub test_cache_poisoning: bool,
    pub test_host_header_injection: bool,
    pub test_path_traversal: bool,
    pub test_internal_ports: Vec<u16>,
    /// Target for the probes; the default validation URL's origin when unset
    pub target_url: Option<String>,
    pub dns_rebinding_host: String,
    pub dns_rebinding_delay_ms: u64,
    pub ipv6_target_url: String,
}

impl Default for AdvancedChecks {
    fn default() -> Self {
        Self {
            test_protocol_smuggling: false,
            test_dns_rebinding: false,
            test_ipv6: false,
            test_http_methods: Vec::new(),
            test_cache_poisoning: false,
            test_host_header_injection: false,
            test_path_traversal: false,
            test_internal_ports: Vec::new(),
            target_url: None,
            dns_rebinding_host: "make-127-0-0-1-rr.1u.ms".to_string(),
            dns_rebinding_delay_ms: 2000,
            ipv6_target_url: "http://[2001:4860:4860::8888]/".to_string(),
        }
    }
}

impl AdvancedChecks {
    /// Whether any advanced check is switched on
    pub fn any_enabled(&self) -> bool {
        self.test_protocol_smuggling
            || self.test_dns_rebinding
            || self.test_ipv6
            || !self.test_http_methods.is_empty()
            || self.test_cache_poisoning
            || self.test_host_header_injection
            || self.test_path_traversal
            || !self.test_internal_ports.is_empty()
    }
}

/// Per-request retry with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

/// Minimum spacing between requests, per target host or across all hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub delay_ms: u64,
    /// One budget per target host instead of a single global one
    pub per_host: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 1000,
            per_host: true,
        }
    }
}

impl RateLimitConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Complete configuration for an audit run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Timeout for each request in seconds
    pub timeout_secs: u64,
    /// Maximum number of proxies checked at once
    pub concurrency: usize,
    pub insecure_skip_verify: bool,
    pub user_agent: String,
    pub default_headers: BTreeMap<String, String>,
    pub probe_policy: ProbePolicy,
    pub validation: ValidationConfig,
    pub anonymity: AnonymityConfig,
    pub cloud: CloudConfig,
    pub advanced_checks: AdvancedChecks,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for Config {
    fn default() -> Self {
        let default_headers = [
            (
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
            ("Accept-Language", "en-US,en;q=0.9"),
            ("Cache-Control", "no-cache"),
            ("Pragma", "no-cache"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            concurrency: DEFAULT_CONCURRENCY,
            insecure_skip_verify: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            default_headers,
            probe_policy: ProbePolicy::default(),
            validation: ValidationConfig::default(),
            anonymity: AnonymityConfig::default(),
            cloud: CloudConfig::default(),
            advanced_checks: AdvancedChecks::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_test_url(mut self, url: &str) -> Self {
        self.validation.default_url = url.to_string();
        self
    }

    pub fn with_anonymity_check(mut self, echo_url: &str) -> Self {
        self.anonymity.enabled = true;
        self.anonymity.echo_url = echo_url.to_string();
        self
    }

    pub fn with_cloud_providers(mut self, providers: Vec<CloudProvider>) -> Self {
        self.cloud.enabled = true;
        self.cloud.providers = providers;
        self
    }

    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.probe_policy = policy;
        self
    }

    pub fn with_rate_limit(mut self, delay: Duration, per_host: bool) -> Self {
        self.rate_limit = RateLimitConfig {
            enabled: true,
            delay_ms: delay.as_millis() as u64,
            per_host,
        };
        self
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(AuditError::InvalidConfig("timeout must be at least 1 second".into()));
        }
        if self.concurrency == 0 {
            return Err(AuditError::InvalidConfig("concurrency must be at least 1".into()));
        }

        let targets = self.validation.targets();
        for target in &targets {
            Url::parse(&target.url).map_err(|e| {
                AuditError::InvalidConfig(format!("invalid test URL {}: {}", target.url, e))
            })?;
        }
        let required = self.validation.required_success_count;
        if required == 0 || required > targets.len() {
            return Err(AuditError::InvalidConfig(format!(
                "required_success_count must be between 1 and {} (got {})",
                targets.len(),
                required
            )));
        }

        for (name, value) in &self.default_headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AuditError::InvalidConfig(format!("invalid header name: {}", name)))?;
            HeaderValue::from_str(value).map_err(|_| {
                AuditError::InvalidConfig(format!("invalid value for header {}", name))
            })?;
        }
        for name in &self.validation.require_header_fields {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AuditError::InvalidConfig(format!("invalid header name: {}", name)))?;
        }

        if let Some(pattern) = &self.validation.require_content_match {
            Regex::new(pattern).map_err(|e| {
                AuditError::InvalidConfig(format!("invalid content match pattern: {}", e))
            })?;
        }

        if self.anonymity.enabled {
            Url::parse(&self.anonymity.echo_url).map_err(|e| {
                AuditError::InvalidConfig(format!("invalid echo URL: {}", e))
            })?;
        }

        for provider in &self.cloud.providers {
            for range in &provider.internal_ranges {
                range.parse::<IpNetwork>().map_err(|e| {
                    AuditError::InvalidConfig(format!(
                        "invalid internal range {} for {}: {}",
                        range, provider.name, e
                    ))
                })?;
            }
        }

        if let Some(target) = &self.advanced_checks.target_url {
            Url::parse(target).map_err(|e| {
                AuditError::InvalidConfig(format!("invalid advanced check target: {}", e))
            })?;
        }

        if self.retry.enabled && self.retry.backoff_factor < 1.0 {
            return Err(AuditError::InvalidConfig("backoff_factor must be >= 1.0".into()));
        }
        if self.rate_limit.enabled && self.rate_limit.delay_ms == 0 {
            return Err(AuditError::InvalidConfig(
                "rate limit delay must be positive when rate limiting is enabled".into(),
            ));
        }

        Ok(())
    }
}
