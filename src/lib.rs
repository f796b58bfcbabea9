//! Proxy Audit - Concurrent Proxy Validator
//!
//! Checks candidate HTTP, HTTPS and SOCKS proxies: whether they forward traffic,
//! whether they hide the client address, whether they expose cloud metadata or
//! internal networks, and how they handle a set of protocol-level attacks.

pub mod config;
pub mod error;
pub mod proxy;

#[cfg(test)]
mod testutil;

pub use config::{
    AdvancedChecks, AnonymityConfig, CloudConfig, Config, ProbePolicy, RateLimitConfig,
    RetryConfig, TestUrl, ValidationConfig,
};
pub use error::{AuditError, Result};
pub use proxy::*;

use std::sync::Arc;

/// Check a single raw proxy string
pub async fn check(proxy: &str, config: Arc<Config>, verbose: bool) -> Result<ProxyResult> {
    Checker::new(config, verbose)?.check(proxy).await
}

/// Check every proxy in `lines` and summarize the run
pub async fn run<I, S>(lines: I, config: Arc<Config>, verbose: bool) -> Result<RunSummary>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Scheduler::from_config(config, verbose)?.run(lines).await
}
