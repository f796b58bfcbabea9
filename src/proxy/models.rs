//! Proxy data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Proxy type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyType {
    /// Map a URL scheme to a proxy type
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(ProxyType::Http),
            "https" => Some(ProxyType::Https),
            "socks4" => Some(ProxyType::Socks4),
            "socks5" => Some(ProxyType::Socks5),
            _ => None,
        }
    }

    /// Port assumed when an address omits one
    pub fn default_port(&self) -> u16 {
        match self {
            ProxyType::Http => 80,
            ProxyType::Https => 443,
            ProxyType::Socks4 | ProxyType::Socks5 => 1080,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyType::Socks4 | ProxyType::Socks5)
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Http => write!(f, "http"),
            ProxyType::Https => write!(f, "https"),
            ProxyType::Socks4 => write!(f, "socks4"),
            ProxyType::Socks5 => write!(f, "socks5"),
        }
    }
}

/// Credentials embedded in a proxy URL, stored decoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl ProxyAuth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

/// A normalized proxy address.
///
/// Only the parser constructs these, so every value is in canonical form and the
/// canonical string is its identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proxy {
    proxy_type: ProxyType,
    /// Host as it appears in a URL (IPv6 literals keep their brackets)
    host: String,
    port: u16,
    auth: Option<ProxyAuth>,
}

impl Proxy {
    pub(crate) fn new(proxy_type: ProxyType, host: String, port: u16, auth: Option<ProxyAuth>) -> Self {
        Self {
            proxy_type,
            host,
            port,
            auth,
        }
    }

    pub fn proxy_type(&self) -> ProxyType {
        self.proxy_type
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Effective port, including the scheme default
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn auth(&self) -> Option<&ProxyAuth> {
        self.auth.as_ref()
    }

    /// Canonical proxy URL; the port is omitted when it is the scheme default
    pub fn url(&self) -> String {
        let auth_part = self.auth.as_ref().map_or(String::new(), |auth| {
            let username = urlencoding::encode(&auth.username);
            if auth.password.is_empty() {
                format!("{}@", username)
            } else {
                format!("{}:{}@", username, urlencoding::encode(&auth.password))
            }
        });

        if self.port == self.proxy_type.default_port() {
            format!("{}://{}{}", self.proxy_type, auth_part, self.host)
        } else {
            format!("{}://{}{}:{}", self.proxy_type, auth_part, self.host, self.port)
        }
    }

    /// Socket address string in HOST:PORT format
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Outcome of one validation request against one URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub url: String,
    pub success: bool,
    /// Only meaningful when `error` is empty
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    pub body_size: u64,
    pub error: Option<String>,
}

impl CheckResult {
    pub fn failed(url: &str, error: String, latency_ms: u64) -> Self {
        Self {
            url: url.to_string(),
            success: false,
            latency_ms,
            status_code: None,
            body_size: 0,
            error: Some(error),
        }
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub detected: bool,
    pub detail: String,
}

impl ProbeOutcome {
    pub fn detected(detail: impl Into<String>) -> Self {
        Self {
            detected: true,
            detail: detail.into(),
        }
    }

    pub fn clear(detail: impl Into<String>) -> Self {
        Self {
            detected: false,
            detail: detail.into(),
        }
    }
}

/// Per-proxy aggregate of the protocol-level probes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvancedCheckResult {
    pub protocol_smuggling: bool,
    pub dns_rebinding: bool,
    pub port_reachability: BTreeMap<u16, bool>,
    pub ipv6_supported: bool,
    pub method_support: BTreeMap<String, bool>,
    pub path_traversal: bool,
    pub cache_poisoning: bool,
    pub host_header_injection: bool,
    /// Free-text detail keyed by check name
    pub details: BTreeMap<String, String>,
}

impl AdvancedCheckResult {
    /// Whether any probe found a weakness
    pub fn has_findings(&self) -> bool {
        self.protocol_smuggling
            || self.dns_rebinding
            || self.path_traversal
            || self.cache_poisoning
            || self.host_header_injection
            || self.port_reachability.values().any(|open| *open)
    }
}

/// Terminal record for one proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyResult {
    pub proxy: String,
    pub proxy_type: ProxyType,
    pub working: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub is_anonymous: bool,
    pub real_ip: Option<String>,
    pub proxy_ip: Option<String>,
    pub hosting_provider: Option<String>,
    pub cloud_provider: Option<String>,
    pub internal_access: bool,
    pub metadata_access: bool,
    pub advanced: Option<AdvancedCheckResult>,
    pub check_results: Vec<CheckResult>,
    pub supports_http: bool,
    pub supports_https: bool,
    pub debug_info: String,
    pub checked_at: DateTime<Utc>,
}

impl ProxyResult {
    /// Fresh, not yet working record for a proxy
    pub fn new(proxy: &Proxy) -> Self {
        Self {
            proxy: proxy.url(),
            proxy_type: proxy.proxy_type(),
            working: false,
            latency_ms: 0,
            error: None,
            is_anonymous: false,
            real_ip: None,
            proxy_ip: None,
            hosting_provider: None,
            cloud_provider: None,
            internal_access: false,
            metadata_access: false,
            advanced: None,
            check_results: Vec::new(),
            supports_http: false,
            supports_https: false,
            debug_info: String::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn failed(proxy: &Proxy, error: String) -> Self {
        let mut result = Self::new(proxy);
        result.error = Some(error);
        result
    }

    pub fn cancelled(proxy: &Proxy) -> Self {
        Self::failed(proxy, "check cancelled".to_string())
    }

    pub fn is_working(&self) -> bool {
        self.working
    }

    /// Whether the proxy exposed any cloud metadata or internal range
    pub fn is_cloud_exposed(&self) -> bool {
        self.metadata_access || self.internal_access
    }
}

/// Run-wide statistics plus every per-proxy record in input order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_proxies: usize,
    pub working_proxies: usize,
    pub anonymous_proxies: usize,
    pub cloud_exposed: usize,
    pub internal_access: usize,
    pub metadata_access: usize,
    /// Percentage of working proxies
    pub success_rate: f64,
    pub cancelled: bool,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<ProxyResult>,
}

impl RunSummary {
    pub fn from_results(
        results: Vec<ProxyResult>,
        warnings: Vec<String>,
        cancelled: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        let total_proxies = results.len();
        let working_proxies = results.iter().filter(|r| r.working).count();
        let success_rate = if total_proxies == 0 {
            0.0
        } else {
            working_proxies as f64 / total_proxies as f64 * 100.0
        };

        Self {
            total_proxies,
            working_proxies,
            anonymous_proxies: results.iter().filter(|r| r.is_anonymous).count(),
            cloud_exposed: results.iter().filter(|r| r.is_cloud_exposed()).count(),
            internal_access: results.iter().filter(|r| r.internal_access).count(),
            metadata_access: results.iter().filter(|r| r.metadata_access).count(),
            success_rate,
            cancelled,
            warnings,
            started_at,
            finished_at: Utc::now(),
            results,
        }
    }

    /// Records of proxies that passed validation
    pub fn working(&self) -> impl Iterator<Item = &ProxyResult> {
        self.results.iter().filter(|r| r.working)
    }
}
