//! Baseline validation of a proxy against the configured test URLs

use crate::config::{Config, TestUrl};
use crate::error::{AuditError, Result};
use crate::proxy::client::{Fetched, Fetcher};
use crate::proxy::models::CheckResult;
use crate::proxy::retry::RetryPolicy;
use crate::proxy::trace::{preview, DebugTrace};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName};
use reqwest::{Client, StatusCode};

/// Compiled response acceptance rules
#[derive(Debug, Clone)]
pub struct ResponseRules {
    required_status: Option<u16>,
    min_bytes: usize,
    content_match: Option<Regex>,
    disallowed_keywords: Vec<String>,
    required_headers: Vec<HeaderName>,
}

impl ResponseRules {
    pub fn from_config(config: &Config) -> Result<Self> {
        let validation = &config.validation;

        let content_match = validation
            .require_content_match
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| AuditError::InvalidConfig(format!("invalid content match pattern: {}", e)))?;

        let required_headers = validation
            .require_header_fields
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| AuditError::InvalidConfig(format!("invalid header name: {}", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            required_status: validation.require_status_code,
            min_bytes: validation.min_response_bytes,
            content_match,
            disallowed_keywords: validation
                .disallowed_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            required_headers,
        })
    }

    /// Accept or reject one response, naming the first rule it broke
    pub fn evaluate(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        body: &str,
        body_size: usize,
    ) -> std::result::Result<(), String> {
        match self.required_status {
            Some(code) if status.as_u16() != code => {
                return Err(format!("unexpected status {} (want {})", status.as_u16(), code));
            }
            None if !status.is_success() => {
                return Err(format!("unexpected status {}", status.as_u16()));
            }
            _ => {}
        }

        if body_size < self.min_bytes {
            return Err(format!(
                "response too small: {} bytes (minimum {})",
                body_size, self.min_bytes
            ));
        }

        if let Some(pattern) = &self.content_match {
            if !pattern.is_match(body) {
                return Err(format!("response does not match pattern {}", pattern.as_str()));
            }
        }

        let lowered = body.to_lowercase();
        if let Some(keyword) = self
            .disallowed_keywords
            .iter()
            .find(|k| lowered.contains(k.as_str()))
        {
            return Err(format!("response contains disallowed keyword: {}", keyword));
        }

        if let Some(missing) = self.required_headers.iter().find(|h| !headers.contains_key(*h)) {
            return Err(format!("missing required header: {}", missing));
        }

        Ok(())
    }
}

/// Result of validating one proxy
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub working: bool,
    /// Mean latency of the accepted checks
    pub latency_ms: u64,
    pub checks: Vec<CheckResult>,
    pub supports_http: bool,
    pub supports_https: bool,
    pub error: Option<String>,
}

/// Issues the validation requests for one proxy
#[derive(Debug, Clone)]
pub struct Validator {
    targets: Vec<TestUrl>,
    required_success_count: usize,
    rules: ResponseRules,
    retry: RetryPolicy,
    fetcher: Fetcher,
}

impl Validator {
    pub fn from_config(config: &Config, fetcher: Fetcher) -> Result<Self> {
        Ok(Self {
            targets: config.validation.targets(),
            required_success_count: config.validation.required_success_count,
            rules: ResponseRules::from_config(config)?,
            retry: RetryPolicy::new(&config.retry),
            fetcher,
        })
    }

    /// Request every target in order through `client` and apply the rules
    pub async fn validate(&self, client: &Client, trace: &mut DebugTrace) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();
        let mut required_failure = None;
        let mut accepted_latency = 0u64;

        for target in &self.targets {
            trace.note(format!("[VALIDATE] GET {}", target.url));
            let fetched = self
                .retry
                .run(&target.url, trace, || self.fetcher.fetch(client.get(&target.url)))
                .await;

            let check = self.record(target, fetched, trace);
            if check.success {
                accepted_latency += check.latency_ms;
                if target.url.starts_with("https://") {
                    outcome.supports_https = true;
                } else if target.url.starts_with("http://") {
                    outcome.supports_http = true;
                }
            } else if target.required && required_failure.is_none() {
                required_failure = Some(format!(
                    "required check {} failed: {}",
                    target.url,
                    check.error.as_deref().unwrap_or("unknown error")
                ));
            }
            outcome.checks.push(check);
        }

        let accepted = outcome.checks.iter().filter(|c| c.success).count();
        if accepted > 0 {
            outcome.latency_ms = accepted_latency / accepted as u64;
        }

        outcome.working = accepted >= self.required_success_count && required_failure.is_none();
        if !outcome.working {
            outcome.error = required_failure.or_else(|| match outcome.checks.as_slice() {
                [only] => only.error.clone(),
                checks => Some(format!(
                    "{} of {} checks passed, {} required",
                    accepted,
                    checks.len(),
                    self.required_success_count
                )),
            });
        }

        trace.note(format!(
            "[VALIDATE] {}/{} checks accepted, working={}",
            accepted,
            outcome.checks.len(),
            outcome.working
        ));
        outcome
    }

    fn record(&self, target: &TestUrl, fetched: Result<Fetched>, trace: &mut DebugTrace) -> CheckResult {
        match fetched {
            Ok(response) => {
                trace.note(format!(
                    "[VALIDATE] {} -> {} ({} bytes, {}ms): {}",
                    target.url,
                    response.status.as_u16(),
                    response.body_size,
                    response.latency_ms(),
                    preview(&response.body)
                ));
                let verdict = self.rules.evaluate(
                    response.status,
                    &response.headers,
                    &response.body,
                    response.body_size,
                );
                if let Err(reason) = &verdict {
                    trace.note(format!("[VALIDATE] rejected: {}", reason));
                }
                CheckResult {
                    url: target.url.clone(),
                    success: verdict.is_ok(),
                    latency_ms: response.latency_ms(),
                    status_code: Some(response.status.as_u16()),
                    body_size: response.body_size as u64,
                    error: verdict.err(),
                }
            }
            Err(e) => {
                trace.note(format!("[VALIDATE] {} failed: {}", target.url, e));
                CheckResult::failed(&target.url, e.to_string(), 0)
            }
        }
    }
}
