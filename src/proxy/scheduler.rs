//! Bounded-concurrency dispatch and result aggregation

use crate::config::Config;
use crate::error::Result;
use crate::proxy::checker::Checker;
use crate::proxy::models::{Proxy, ProxyResult, RunSummary};
use crate::proxy::parser::ProxyParser;
use async_trait::async_trait;
use chrono::Utc;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Anything that can turn one proxy into a result
#[async_trait]
pub trait ProxyProbe: Send + Sync + 'static {
    /// Must return promptly once `cancel` fires
    async fn probe(&self, proxy: Proxy, cancel: CancellationToken) -> ProxyResult;
}

#[async_trait]
impl ProxyProbe for Checker {
    async fn probe(&self, proxy: Proxy, cancel: CancellationToken) -> ProxyResult {
        self.check_proxy_until(&proxy, &cancel).await
    }
}

/// Counting semaphore that also tracks how many holders are running
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Held by a running worker; releases its slot on drop
#[derive(Debug)]
pub struct RunningPermit {
    gate: Arc<AdmissionGate>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RunningPermit {
    fn drop(&mut self) {
        self.gate.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Wait for a free slot; `None` once the gate is closed
    pub async fn admit(self: &Arc<Self>) -> Option<RunningPermit> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        Some(RunningPermit {
            gate: self.clone(),
            _permit: permit,
        })
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders seen
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Runs a probe over a proxy list with at most `max_concurrent` proxies in flight
pub struct Scheduler<P: ProxyProbe> {
    probe: Arc<P>,
    max_concurrent: usize,
    gate: Arc<AdmissionGate>,
}

impl Scheduler<Checker> {
    /// Scheduler driving the full check pipeline
    pub fn from_config(config: Arc<Config>, verbose: bool) -> Result<Self> {
        let concurrency = config.concurrency;
        let checker = Checker::new(config, verbose)?;
        Ok(Self::new(Arc::new(checker), concurrency))
    }
}

impl<P: ProxyProbe> Scheduler<P> {
    pub fn new(probe: Arc<P>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            probe,
            max_concurrent,
            gate: AdmissionGate::new(max_concurrent),
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Normalize `lines` and check every distinct proxy
    pub async fn run<I, S>(&self, lines: I) -> Result<RunSummary>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.run_until(lines, CancellationToken::new()).await
    }

    /// Like [`Scheduler::run`], stopping early once `cancel` fires.
    ///
    /// A cancelled run still returns one result per proxy.
    pub async fn run_until<I, S>(&self, lines: I, cancel: CancellationToken) -> Result<RunSummary>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let started_at = Utc::now();
        let normalized = ProxyParser::normalize_all(lines)?;
        info!(
            "Checking {} proxies with concurrency {}",
            normalized.proxies.len(),
            self.max_concurrent
        );

        let results = self.dispatch(normalized.proxies, cancel.clone()).await;
        let summary = RunSummary::from_results(results, normalized.warnings, cancel.is_cancelled(), started_at);

        info!(
            "Check complete: {}/{} working ({:.1}%), peak concurrency {}{}",
            summary.working_proxies,
            summary.total_proxies,
            summary.success_rate,
            self.gate.peak(),
            if summary.cancelled { ", cancelled" } else { "" }
        );
        Ok(summary)
    }

    /// Check `proxies` and return their results in input order
    pub async fn dispatch(&self, proxies: Vec<Proxy>, cancel: CancellationToken) -> Vec<ProxyResult> {
        let total = proxies.len();
        let (tx, mut rx) = mpsc::channel::<(usize, ProxyResult)>(self.max_concurrent);

        let admission = {
            let proxies = proxies.clone();
            let gate = self.gate.clone();
            let probe = self.probe.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for (index, proxy) in proxies.into_iter().enumerate() {
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = gate.admit() => permit,
                    };

                    let Some(permit) = permit else {
                        if tx.send((index, ProxyResult::cancelled(&proxy))).await.is_err() {
                            return;
                        }
                        continue;
                    };

                    let tx = tx.clone();
                    let probe = probe.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let fallback = proxy.clone();

                        // Inner task so a panicking probe surfaces as a JoinError
                        let worker = tokio::spawn(async move { probe.probe(proxy, cancel).await });
                        let result = match worker.await {
                            Ok(result) => result,
                            Err(e) => {
                                let reason = crash_reason(e);
                                error!("Worker for {} crashed: {}", fallback, reason);
                                ProxyResult::failed(&fallback, format!("worker crashed: {}", reason))
                            }
                        };

                        let _ = tx.send((index, result)).await;
                    });
                }
            })
        };

        // The channel closes once admission and every worker have dropped their sender
        let mut slots: Vec<Option<ProxyResult>> = vec![None; total];
        while let Some((index, result)) = rx.recv().await {
            slots[index] = Some(result);
        }

        if let Err(e) = admission.await {
            error!("Admission task failed: {}", e);
        }

        slots
            .into_iter()
            .zip(proxies.iter())
            .map(|(slot, proxy)| {
                slot.unwrap_or_else(|| {
                    warn!("No result produced for {}", proxy);
                    ProxyResult::failed(proxy, "no result produced".to_string())
                })
            })
            .collect()
    }
}

fn crash_reason(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task aborted".to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
