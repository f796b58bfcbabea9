//! Error types for proxy auditing

use std::time::Duration;
use thiserror::Error;

/// Unified error type for proxy auditing
#[derive(Error, Debug)]
pub enum AuditError {
    // Configuration errors
    #[error("no valid proxies found")]
    NoValidProxies,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Proxy errors
    #[error("Invalid proxy address: {0}")]
    InvalidProxy(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Failed to build client for {proxy}: {source}")]
    ClientBuild {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },

    // Request errors
    #[error("Request failed: {}", chain(.0))]
    Request(#[from] reqwest::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Unreadable echo response: {0}")]
    Echo(String),

    #[error("SOCKS handshake failed: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;

impl AuditError {
    /// Configuration-class errors abort a run before any proxy is checked.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            AuditError::NoValidProxies | AuditError::InvalidConfig(_) | AuditError::InvalidProxy(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            AuditError::Timeout(_) => true,
            AuditError::Request(e) => e.is_timeout(),
            _ => false,
        }
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for AuditError {
    fn from(err: url::ParseError) -> Self {
        AuditError::InvalidProxy(err.to_string())
    }
}

/// Render an error together with its `source()` chain.
///
/// reqwest hides the interesting part ("connection refused", "dns error") a few
/// levels down, so result records carry the whole chain.
pub fn chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
