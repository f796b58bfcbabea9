//! Protocol-level weakness probes
//!
//! Every probe is independent and gated by its toggle in [`AdvancedChecks`].
//! A probe that cannot run reports `detected: false` with the error as detail.

use crate::config::{AdvancedChecks, Config};
use crate::error::{AuditError, Result};
use crate::proxy::client::{Fetched, Fetcher};
use crate::proxy::models::{AdvancedCheckResult, ProbeOutcome, Proxy};
use crate::proxy::raw::{status_codes, RawTunnel};
use crate::proxy::trace::DebugTrace;
use futures::future::join_all;
use reqwest::header::HOST;
use reqwest::{Client, Method};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Encoded traversal paths that survive URL normalization
const TRAVERSAL_PATHS: &[&str] = &[
    "/..%2f..%2f..%2f..%2f..%2fetc%2fpasswd",
    "/....//....//....//....//etc/passwd",
    "/static/..%252f..%252f..%252f..%252fetc%252fpasswd",
];

const PASSWD_SIGNATURES: &[&str] = &["root:x:0:0", "root:*:0:0"];

/// Runs the enabled advanced checks against one proxy
#[derive(Debug, Clone)]
pub struct AdvancedProber {
    checks: AdvancedChecks,
    target: Url,
    fetcher: Fetcher,
}

impl AdvancedProber {
    pub fn from_config(config: &Config, fetcher: Fetcher) -> Result<Self> {
        let checks = config.advanced_checks.clone();
        let target = match &checks.target_url {
            Some(url) => Url::parse(url)
                .map_err(|e| AuditError::InvalidConfig(format!("invalid advanced check target: {}", e)))?,
            None => {
                let first = config
                    .validation
                    .targets()
                    .into_iter()
                    .next()
                    .map(|t| t.url)
                    .unwrap_or_else(|| config.validation.default_url.clone());
                let mut url = Url::parse(&first)
                    .map_err(|e| AuditError::InvalidConfig(format!("invalid test URL {}: {}", first, e)))?;
                url.set_path("/");
                url.set_query(None);
                url
            }
        };

        Ok(Self {
            checks,
            target,
            fetcher,
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn any_enabled(&self) -> bool {
        self.checks.any_enabled()
    }

    /// Run every enabled probe; `client` must not follow redirects
    pub async fn run(&self, proxy: &Proxy, client: &Client, trace: &mut DebugTrace) -> AdvancedCheckResult {
        let mut result = AdvancedCheckResult::default();

        if self.checks.test_protocol_smuggling {
            let outcome = self.protocol_smuggling(proxy).await;
            result.protocol_smuggling = record(&mut result.details, trace, "protocol_smuggling", outcome);
        }
        if self.checks.test_dns_rebinding {
            let outcome = self.dns_rebinding(client).await;
            result.dns_rebinding = record(&mut result.details, trace, "dns_rebinding", outcome);
        }
        if self.checks.test_cache_poisoning {
            let outcome = self.cache_poisoning(client).await;
            result.cache_poisoning = record(&mut result.details, trace, "cache_poisoning", outcome);
        }
        if self.checks.test_host_header_injection {
            let outcome = self.host_header_injection(client).await;
            result.host_header_injection = record(&mut result.details, trace, "host_header_injection", outcome);
        }
        if self.checks.test_ipv6 {
            let outcome = self.ipv6(client).await;
            result.ipv6_supported = record(&mut result.details, trace, "ipv6", outcome);
        }
        if self.checks.test_path_traversal {
            let outcome = self.path_traversal(client).await;
            result.path_traversal = record(&mut result.details, trace, "path_traversal", outcome);
        }
        if !self.checks.test_http_methods.is_empty() {
            let (support, detail) = self.http_methods(client).await;
            trace.note(format!("[ADVANCED] http_methods: {}", detail));
            result.details.insert("http_methods".to_string(), detail);
            result.method_support = support.into_iter().collect();
        }
        if !self.checks.test_internal_ports.is_empty() {
            let (reachability, detail) = self.internal_ports(client).await;
            trace.note(format!("[ADVANCED] internal_ports: {}", detail));
            result.details.insert("internal_ports".to_string(), detail);
            result.port_reachability = reachability.into_iter().collect();
        }

        result
    }

    /// CL.TE request over a raw channel
    async fn protocol_smuggling(&self, proxy: &Proxy) -> ProbeOutcome {
        let mut target = self.target.clone();
        if target.scheme() == "https" && target.set_scheme("http").is_ok() {
            let _ = target.set_port(None);
        }
        let host = target.host_str().unwrap_or_default().to_string();
        let marker = Uuid::new_v4().simple().to_string();
        let body = format!("0\r\n\r\nGET /smuggled-{} HTTP/1.1\r\nX-Ignore: X", marker);

        let render = |request_target: &str| {
            format!(
                "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n{}",
                request_target,
                host,
                body.len(),
                body
            )
        };

        self.fetcher.pace(&target).await;
        match RawTunnel::exchange(proxy, &target, render, self.fetcher.timeout()).await {
            Ok(raw) => {
                let codes = status_codes(&raw);
                match codes.as_slice() {
                    [] => ProbeOutcome::clear("no HTTP response to ambiguous request"),
                    [_, _, ..] => ProbeOutcome::detected(format!(
                        "desync: {} responses to one request ({:?})",
                        codes.len(),
                        codes
                    )),
                    [code] if *code < 400 => ProbeOutcome::detected(format!(
                        "ambiguous Content-Length/Transfer-Encoding request forwarded ({})",
                        code
                    )),
                    [code] => ProbeOutcome::clear(format!("ambiguous request rejected ({})", code)),
                }
            }
            Err(e) => ProbeOutcome::clear(format!("probe failed: {}", e)),
        }
    }

    async fn dns_rebinding(&self, client: &Client) -> ProbeOutcome {
        let url = format!("http://{}/", self.checks.dns_rebinding_host);

        let first = match self.fetcher.fetch(client.get(&url)).await {
            Ok(response) => response.status.as_u16(),
            Err(e) => return ProbeOutcome::clear(format!("first request failed: {}", e)),
        };
        tokio::time::sleep(Duration::from_millis(self.checks.dns_rebinding_delay_ms)).await;
        let second = self.fetcher.fetch(client.get(&url)).await;

        match second {
            Ok(response) if response.status.as_u16() < 400 => ProbeOutcome::detected(format!(
                "rebinding host still served after delay (first: {}, second: {})",
                first,
                response.status.as_u16()
            )),
            other => ProbeOutcome::clear(format!("first: {}, second: {}", first, describe(&other))),
        }
    }

    async fn cache_poisoning(&self, client: &Client) -> ProbeOutcome {
        let token = Uuid::new_v4().simple().to_string();
        let marker = format!("poison-{}.example", &token[..12]);
        let mut url = self.target.clone();
        url.query_pairs_mut().append_pair("cb", &token);

        let poisoned = self
            .fetcher
            .fetch(client.get(url.as_str()).header("X-Forwarded-Host", &marker))
            .await;
        if let Err(e) = poisoned {
            return ProbeOutcome::clear(format!("probe failed: {}", e));
        }

        match self.fetcher.fetch(client.get(url.as_str())).await {
            Ok(clean) if carries(&clean, &marker) => {
                ProbeOutcome::detected(format!("clean request served poisoned content ({})", marker))
            }
            Ok(clean) => ProbeOutcome::clear(format!("clean response {} without marker", clean.status.as_u16())),
            Err(e) => ProbeOutcome::clear(format!("probe failed: {}", e)),
        }
    }

    async fn host_header_injection(&self, client: &Client) -> ProbeOutcome {
        let spoofed = format!("spoofed-{}.example", &Uuid::new_v4().simple().to_string()[..12]);

        let baseline = match self.fetcher.fetch(client.get(self.target.as_str())).await {
            Ok(response) => response,
            Err(e) => return ProbeOutcome::clear(format!("baseline failed: {}", e)),
        };
        let injected = match self.fetcher.fetch(client.get(self.target.as_str()).header(HOST, &spoofed)).await {
            Ok(response) => response,
            Err(e) => return ProbeOutcome::clear(format!("spoofed request failed: {}", e)),
        };

        let baseline_status = baseline.status.as_u16();
        let injected_status = injected.status.as_u16();
        if carries(&injected, &spoofed) {
            ProbeOutcome::detected(format!("spoofed Host {} reflected", spoofed))
        } else if injected_status != baseline_status && injected_status < 400 {
            ProbeOutcome::detected(format!(
                "spoofed Host routed differently ({} -> {})",
                baseline_status, injected_status
            ))
        } else {
            ProbeOutcome::clear(format!("baseline {}, spoofed {}", baseline_status, injected_status))
        }
    }

    async fn ipv6(&self, client: &Client) -> ProbeOutcome {
        match self.fetcher.fetch(client.get(&self.checks.ipv6_target_url)).await {
            Ok(response) if matches!(response.status.as_u16(), 502..=504) => {
                ProbeOutcome::clear(format!("gateway error {}", response.status.as_u16()))
            }
            Ok(response) => ProbeOutcome::detected(format!("IPv6 target answered {}", response.status.as_u16())),
            Err(e) => ProbeOutcome::clear(format!("probe failed: {}", e)),
        }
    }

    async fn path_traversal(&self, client: &Client) -> ProbeOutcome {
        let mut notes = Vec::new();
        for path in TRAVERSAL_PATHS {
            let url = format!("{}{}", self.target.origin().ascii_serialization(), path);
            match self.fetcher.fetch(client.get(&url)).await {
                Ok(response) if PASSWD_SIGNATURES.iter().any(|s| response.body.contains(s)) => {
                    return ProbeOutcome::detected(format!("passwd contents returned for {}", path));
                }
                Ok(response) => notes.push(format!("{} -> {}", path, response.status.as_u16())),
                Err(e) => notes.push(format!("{} -> {}", path, e)),
            }
        }
        ProbeOutcome::clear(notes.join("; "))
    }

    async fn http_methods(&self, client: &Client) -> (Vec<(String, bool)>, String) {
        let probes = self.checks.test_http_methods.iter().map(|name| async move {
            let name = name.to_ascii_uppercase();
            let outcome = match Method::from_bytes(name.as_bytes()) {
                Ok(method) => match self.fetcher.fetch(client.request(method, self.target.as_str())).await {
                    Ok(response) => (response.status.as_u16() < 400, response.status.as_u16().to_string()),
                    Err(e) => (false, e.to_string()),
                },
                Err(_) => (false, "invalid method".to_string()),
            };
            (name, outcome)
        });

        let results = join_all(probes).await;
        let detail = results
            .iter()
            .map(|(name, (_, note))| format!("{}={}", name, note))
            .collect::<Vec<_>>()
            .join(", ");
        let support = results
            .into_iter()
            .map(|(name, (supported, _))| (name, supported))
            .collect();
        (support, detail)
    }

    async fn internal_ports(&self, client: &Client) -> (Vec<(u16, bool)>, String) {
        let probes = self.checks.test_internal_ports.iter().map(|&port| async move {
            let url = format!("http://127.0.0.1:{}/", port);
            let outcome = match self.fetcher.fetch(client.get(&url)).await {
                Ok(response) => (response.status.as_u16() < 500, response.status.as_u16().to_string()),
                Err(e) => (false, e.to_string()),
            };
            (port, outcome)
        });

        let results = join_all(probes).await;
        let detail = results
            .iter()
            .map(|(port, (_, note))| format!("{}={}", port, note))
            .collect::<Vec<_>>()
            .join(", ");
        let reachability = results
            .into_iter()
            .map(|(port, (reachable, _))| (port, reachable))
            .collect();
        (reachability, detail)
    }
}

fn record(
    details: &mut BTreeMap<String, String>,
    trace: &mut DebugTrace,
    name: &str,
    outcome: ProbeOutcome,
) -> bool {
    trace.note(format!(
        "[ADVANCED] {}: detected={} ({})",
        name, outcome.detected, outcome.detail
    ));
    details.insert(name.to_string(), outcome.detail);
    outcome.detected
}

/// Whether `marker` appears in the body or any header value
fn carries(response: &Fetched, marker: &str) -> bool {
    response.body.contains(marker)
        || response
            .headers
            .values()
            .any(|v| v.to_str().map_or(false, |v| v.contains(marker)))
}

fn describe(response: &Result<Fetched>) -> String {
    match response {
        Ok(response) => response.status.as_u16().to_string(),
        Err(e) => e.to_string(),
    }
}
