use anyhow::{Context, Result};
use clap::Parser;
use proxy_audit::{Config, ProbePolicy, RunSummary, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Concurrent proxy validator and security auditor
#[derive(Parser)]
#[command(name = "proxy-audit")]
#[command(about = "Check proxies for reachability, anonymity and cloud exposure")]
struct Cli {
    /// Input file containing proxies, one per line
    input: PathBuf,

    /// Number of proxies checked at once
    #[arg(short = 'n', long, default_value = "10")]
    concurrency: usize,

    /// Timeout in seconds for each request
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// URL to test proxies against
    #[arg(long)]
    test_url: Option<String>,

    /// Echo service URL; enables the anonymity check
    #[arg(long)]
    anonymity: Option<String>,

    /// Probe cloud metadata endpoints and internal ranges
    #[arg(long)]
    cloud: bool,

    /// Run probes against proxies that failed validation too
    #[arg(long)]
    probe_all: bool,

    /// Minimum delay in milliseconds between requests to the same target host
    #[arg(long, value_name = "MS")]
    rate_limit: Option<u64>,

    /// Apply --rate-limit across all target hosts instead of per host
    #[arg(long, requires = "rate_limit")]
    global_rate_limit: bool,

    /// Accept invalid TLS certificates
    #[arg(long)]
    insecure: bool,

    /// Print the full run summary as JSON
    #[arg(long)]
    json: bool,

    /// Verbose logging and per-proxy debug traces
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::new()
            .with_concurrency(self.concurrency)
            .with_timeout(Duration::from_secs(self.timeout));

        if let Some(url) = &self.test_url {
            config = config.with_test_url(url);
        }
        if let Some(echo_url) = &self.anonymity {
            config = config.with_anonymity_check(echo_url);
        }
        if let Some(delay_ms) = self.rate_limit {
            config = config.with_rate_limit(Duration::from_millis(delay_ms), !self.global_rate_limit);
        }
        if self.probe_all {
            config = config.with_probe_policy(ProbePolicy::Always);
        }
        config.cloud.enabled = self.cloud;
        config.insecure_skip_verify = self.insecure;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "proxy_audit=debug"
    } else {
        "proxy_audit=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let content = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {:?}", cli.input))?;

    let config = cli.config();
    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    info!(
        "Checking proxies from {:?} (concurrency {}, timeout {}s)",
        cli.input, config.concurrency, config.timeout_secs
    );

    let scheduler = Scheduler::from_config(config, cli.verbose)?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight checks");
            trigger.cancel();
        }
    });

    let summary = scheduler.run_until(content.lines(), token).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for warning in &summary.warnings {
        eprintln!("warning: {}", warning);
    }

    println!(
        "Results: {} of {} working ({:.1}%), {} anonymous",
        summary.working_proxies,
        summary.total_proxies,
        summary.success_rate,
        summary.anonymous_proxies
    );
    if summary.cloud_exposed > 0 {
        println!(
            "Cloud exposure: {} proxies ({} metadata, {} internal)",
            summary.cloud_exposed, summary.metadata_access, summary.internal_access
        );
    }
    if summary.cancelled {
        println!("Run was cancelled; unfinished proxies are reported as failed");
    }

    let working: Vec<_> = summary.working().collect();
    if !working.is_empty() {
        println!("\nWorking proxies:");
        for result in working {
            let mut notes = Vec::new();
            if result.is_anonymous {
                notes.push("anonymous".to_string());
            }
            if let Some(provider) = &result.cloud_provider {
                notes.push(format!("cloud: {}", provider));
            }
            if result.advanced.as_ref().is_some_and(|a| a.has_findings()) {
                notes.push("protocol findings".to_string());
            }

            if notes.is_empty() {
                println!("  {} ({}ms)", result.proxy, result.latency_ms);
            } else {
                println!(
                    "  {} ({}ms) [{}]",
                    result.proxy,
                    result.latency_ms,
                    notes.join(", ")
                );
            }
        }
    }
}
