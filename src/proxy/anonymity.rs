//! Anonymity detection by comparing direct and proxied egress identity

use crate::config::Config;
use crate::error::{AuditError, Result};
use crate::proxy::client::Fetcher;
use crate::proxy::cloud::{detect_hosting, CloudProvider};
use crate::proxy::trace::{preview, DebugTrace};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::OnceCell;

static IPV4_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b")
        .expect("valid IPv4 pattern")
});

/// Pull the reported client address out of an echo body.
///
/// JSON `ip` or `origin` fields win; otherwise the first IPv4 literal in the text.
pub fn extract_ip(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for field in ["ip", "origin"] {
            if let Some(ip) = value.get(field).and_then(|v| v.as_str()) {
                // httpbin reports "client, proxy" chains in `origin`
                if let Some(first) = ip.split(',').map(str::trim).find(|s| !s.is_empty()) {
                    return Some(first.to_string());
                }
            }
        }
    }

    IPV4_PATTERN.find(body).map(|m| m.as_str().to_string())
}

/// Whether `text` names `real_ip` as a whole address, optionally with a port
fn mentions(text: &str, real_ip: &str) -> bool {
    let real = real_ip.parse::<IpAddr>().ok();
    text.split(|c: char| !(c.is_ascii_hexdigit() || c == '.' || c == ':'))
        .map(|token| token.trim_end_matches('.'))
        .filter(|token| !token.is_empty())
        .any(|token| match real {
            Some(real) => token_ip(token) == Some(real),
            None => token.trim_matches(':') == real_ip,
        })
}

/// Address in a token such as `1.2.3.4`, `1.2.3.4:8080`, `::1` or `:1.2.3.4`
fn token_ip(token: &str) -> Option<IpAddr> {
    token
        .parse::<IpAddr>()
        .ok()
        .or_else(|| token.parse::<SocketAddr>().ok().map(|a| a.ip()))
        .or_else(|| token.trim_matches(':').parse::<IpAddr>().ok())
}

/// Where `real_ip` shows up: the body or a header value
pub fn discloses(real_ip: &str, headers: &HeaderMap, body: &str) -> Option<String> {
    if mentions(body, real_ip) {
        return Some("response body".to_string());
    }
    headers
        .iter()
        .find(|(_, value)| value.to_str().map_or(false, |v| mentions(v, real_ip)))
        .map(|(name, _)| format!("header {}", name))
}

/// Outcome of the anonymity probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnonymityReport {
    pub is_anonymous: bool,
    pub real_ip: Option<String>,
    pub proxy_ip: Option<String>,
    pub hosting_provider: Option<String>,
}

/// Compares what an echo endpoint sees with and without the proxy.
///
/// The direct lookup happens once and is shared by every proxy checked.
#[derive(Debug)]
pub struct AnonymityDetector {
    echo_url: String,
    fetcher: Fetcher,
    real_ip: OnceCell<String>,
}

impl AnonymityDetector {
    pub fn new(echo_url: &str, fetcher: Fetcher) -> Self {
        Self {
            echo_url: echo_url.to_string(),
            fetcher,
            real_ip: OnceCell::new(),
        }
    }

    pub fn from_config(config: &Config, fetcher: Fetcher) -> Self {
        Self::new(&config.anonymity.echo_url, fetcher)
    }

    /// Our own public address, as seen by the echo endpoint without a proxy
    pub async fn real_ip(&self, direct: &Client) -> Result<&str> {
        let ip = self
            .real_ip
            .get_or_try_init(|| async {
                let response = self.fetcher.fetch(direct.get(&self.echo_url)).await?;
                extract_ip(&response.body).ok_or_else(|| {
                    AuditError::Echo(format!("no address in {}", preview(&response.body)))
                })
            })
            .await?;
        Ok(ip.as_str())
    }

    pub async fn detect(
        &self,
        direct: &Client,
        proxied: &Client,
        providers: &[CloudProvider],
        trace: &mut DebugTrace,
    ) -> Result<AnonymityReport> {
        let real_ip = self.real_ip(direct).await?.to_string();
        trace.note(format!("[ANON] real IP {}", real_ip));

        let response = self.fetcher.fetch(proxied.get(&self.echo_url)).await?;
        trace.note(format!(
            "[ANON] proxied echo {}: {}",
            response.status.as_u16(),
            preview(&response.body)
        ));

        let leak = discloses(&real_ip, &response.headers, &response.body);
        if let Some(place) = &leak {
            trace.note(format!("[ANON] real IP disclosed in {}", place));
        }

        Ok(AnonymityReport {
            is_anonymous: leak.is_none(),
            proxy_ip: extract_ip(&response.body),
            hosting_provider: detect_hosting(providers, &response.body).map(|p| p.name.clone()),
            real_ip: Some(real_ip),
        })
    }
}
