//! Per-proxy evaluation pipeline

use crate::config::{Config, ProbePolicy};
use crate::error::{AuditError, Result};
use crate::proxy::advanced::AdvancedProber;
use crate::proxy::anonymity::AnonymityDetector;
use crate::proxy::client::{ClientFactory, Fetcher, RedirectMode};
use crate::proxy::cloud::CloudProber;
use crate::proxy::models::{Proxy, ProxyResult};
use crate::proxy::parser::{ParsedLine, ProxyParser};
use crate::proxy::trace::DebugTrace;
use crate::proxy::validator::Validator;
use chrono::Utc;
use reqwest::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Proxy checker running validation and the optional probes
pub struct Checker {
    config: Arc<Config>,
    factory: ClientFactory,
    validator: Validator,
    anonymity: AnonymityDetector,
    cloud: CloudProber,
    advanced: AdvancedProber,
    /// Proxy-free client for the anonymity baseline
    direct: Client,
    verbose: bool,
}

impl Checker {
    /// Create a checker; invalid configuration is rejected here, before any request
    pub fn new(config: Arc<Config>, verbose: bool) -> Result<Self> {
        config.validate()?;

        let factory = ClientFactory::from_config(&config)?;
        let direct = factory.direct()?;
        let fetcher = Fetcher::from_config(&config);

        Ok(Self {
            validator: Validator::from_config(&config, fetcher.clone())?,
            anonymity: AnonymityDetector::from_config(&config, fetcher.clone()),
            cloud: CloudProber::from_config(&config, fetcher.clone()),
            advanced: AdvancedProber::from_config(&config, fetcher)?,
            factory,
            direct,
            verbose,
            config,
        })
    }

    /// Normalize a raw proxy string and check it
    pub async fn check(&self, proxy: &str) -> Result<ProxyResult> {
        match ProxyParser::parse_line(proxy) {
            ParsedLine::Valid { proxy, .. } => Ok(self.check_proxy(&proxy).await),
            ParsedLine::Invalid(reason) => Err(AuditError::InvalidProxy(reason)),
            ParsedLine::Skip => Err(AuditError::InvalidProxy("empty proxy line".to_string())),
        }
    }

    /// Like [`Checker::check_proxy`], abandoning the check once `cancel` fires
    pub async fn check_proxy_until(&self, proxy: &Proxy, cancel: &CancellationToken) -> ProxyResult {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("check of {} cancelled", proxy);
                ProxyResult::cancelled(proxy)
            }
            result = self.check_proxy(proxy) => result,
        }
    }

    /// Check a single proxy. Network failures are recorded in the result.
    #[instrument(skip(self, proxy), fields(proxy = %proxy))]
    pub async fn check_proxy(&self, proxy: &Proxy) -> ProxyResult {
        let mut trace = DebugTrace::new(self.verbose);
        let mut result = ProxyResult::new(proxy);
        trace.note(format!("[CHECK] {} ({})", proxy, proxy.proxy_type()));

        let client = match self.factory.build(proxy, RedirectMode::Follow) {
            Ok(client) => client,
            Err(e) => {
                trace.note(format!("[CHECK] client construction failed: {}", e));
                result.error = Some(e.to_string());
                return self.finish(result, trace);
            }
        };

        let outcome = self.validator.validate(&client, &mut trace).await;
        result.working = outcome.working;
        result.latency_ms = outcome.latency_ms;
        result.check_results = outcome.checks;
        result.supports_http = outcome.supports_http;
        result.supports_https = outcome.supports_https;
        result.error = outcome.error;

        let run_anonymity = result.working && self.config.anonymity.enabled;
        let may_probe = result.working || self.config.probe_policy == ProbePolicy::Always;
        let run_cloud = may_probe && self.config.cloud.enabled;
        let run_advanced = may_probe && self.advanced.any_enabled();
        if !(run_anonymity || run_cloud || run_advanced) {
            return self.finish(result, trace);
        }

        let probe_client = match self.factory.build(proxy, RedirectMode::Manual) {
            Ok(client) => client,
            Err(e) => {
                trace.note(format!("[CHECK] probe client construction failed: {}", e));
                return self.finish(result, trace);
            }
        };

        if run_anonymity {
            match self
                .anonymity
                .detect(&self.direct, &probe_client, &self.config.cloud.providers, &mut trace)
                .await
            {
                Ok(report) => {
                    result.is_anonymous = report.is_anonymous;
                    result.real_ip = report.real_ip;
                    result.proxy_ip = report.proxy_ip;
                    result.hosting_provider = report.hosting_provider;
                }
                Err(e) => trace.note(format!("[ANON] check failed: {}", e)),
            }
        }

        if run_cloud {
            if let Some(finding) = self
                .cloud
                .probe(&probe_client, &self.config.cloud.providers, &mut trace)
                .await
            {
                result.cloud_provider = Some(finding.provider);
                result.metadata_access = finding.metadata_access;
                result.internal_access = finding.internal_access;
            }
        }

        if run_advanced {
            result.advanced = Some(self.advanced.run(proxy, &probe_client, &mut trace).await);
        }

        self.finish(result, trace)
    }

    fn finish(&self, mut result: ProxyResult, trace: DebugTrace) -> ProxyResult {
        result.debug_info = trace.into_string();
        result.checked_at = Utc::now();

        if result.working {
            info!(
                "{} working ({}ms, anonymous={})",
                result.proxy, result.latency_ms, result.is_anonymous
            );
        } else {
            debug!(
                "{} not working: {}",
                result.proxy,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        result
    }
}
