//! Proxy module for normalizing and auditing proxies
//!
//! This module provides functionality for:
//! - Normalizing proxy list lines (IP:PORT, IP:PORT:USER:PASS, URLs, ...)
//! - Validating that a proxy forwards traffic
//! - Detecting anonymity, cloud metadata exposure and protocol weaknesses
//! - Checking whole lists with bounded concurrency

pub mod advanced;
pub mod anonymity;
pub mod checker;
pub mod client;
pub mod cloud;
pub mod models;
pub mod parser;
pub mod raw;
pub mod retry;
pub mod scheduler;
pub mod throttle;
pub mod trace;
pub mod validator;

pub use advanced::AdvancedProber;
pub use anonymity::{AnonymityDetector, AnonymityReport};
pub use checker::Checker;
pub use client::{ClientFactory, ClientSettings, Fetcher, RedirectMode};
pub use cloud::{CloudFinding, CloudProber, CloudProvider};
pub use models::{
    AdvancedCheckResult, CheckResult, ProbeOutcome, Proxy, ProxyAuth, ProxyResult, ProxyType,
    RunSummary,
};
pub use parser::{NormalizedProxies, ParsedLine, ProxyParser};
pub use scheduler::{AdmissionGate, ProxyProbe, Scheduler};
pub use throttle::RequestThrottle;
pub use validator::{ResponseRules, ValidationOutcome, Validator};
