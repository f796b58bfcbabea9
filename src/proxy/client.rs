//! HTTP client construction for proxied and direct requests

use crate::config::Config;
use crate::error::{AuditError, Result};
use crate::proxy::models::Proxy;
use crate::proxy::throttle::RequestThrottle;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client, Proxy as ReqwestProxy, Request, RequestBuilder, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Most redirects followed during validation
const MAX_REDIRECTS: usize = 10;

/// How a client treats 3xx responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    /// Follow a bounded number of redirects (validation)
    Follow,
    /// Hand 3xx responses back unchanged (anonymity and security probes)
    Manual,
}

/// Settings shared by every client the factory builds
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub timeout: Duration,
    pub insecure_skip_verify: bool,
    pub user_agent: String,
    pub headers: HeaderMap,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| AuditError::InvalidConfig(format!("invalid header name: {}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| AuditError::InvalidConfig(format!("invalid value for header {}", name)))?;
            headers.insert(name, value);
        }

        Ok(Self {
            timeout: config.timeout(),
            insecure_skip_verify: config.insecure_skip_verify,
            user_agent: config.user_agent.clone(),
            headers,
        })
    }
}

/// Builds reqwest clients bound to a single proxy
#[derive(Debug, Clone)]
pub struct ClientFactory {
    settings: ClientSettings,
}

impl ClientFactory {
    pub fn new(settings: ClientSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(ClientSettings::from_config(config)?))
    }

    /// Create a client whose traffic all goes through `proxy`
    pub fn build(&self, proxy: &Proxy, mode: RedirectMode) -> Result<Client> {
        let proxy_url = proxy.url();
        let client_error = |source| AuditError::ClientBuild {
            proxy: proxy_url.clone(),
            source,
        };

        // `all` covers both plain and TLS targets; socks schemes get a SOCKS handshake
        let reqwest_proxy = ReqwestProxy::all(&proxy_url).map_err(client_error)?;

        self.builder(mode)
            .proxy(reqwest_proxy)
            .build()
            .map_err(client_error)
    }

    /// Create a client that ignores proxies, including environment ones
    pub fn direct(&self) -> Result<Client> {
        self.builder(RedirectMode::Manual)
            .no_proxy()
            .build()
            .map_err(|source| AuditError::ClientBuild {
                proxy: "direct".to_string(),
                source,
            })
    }

    fn builder(&self, mode: RedirectMode) -> reqwest::ClientBuilder {
        let policy = match mode {
            RedirectMode::Follow => redirect::Policy::limited(MAX_REDIRECTS),
            RedirectMode::Manual => redirect::Policy::none(),
        };

        Client::builder()
            .timeout(self.settings.timeout)
            .connect_timeout(self.settings.timeout)
            .danger_accept_invalid_certs(self.settings.insecure_skip_verify)
            .user_agent(self.settings.user_agent.clone())
            .default_headers(self.settings.headers.clone())
            .redirect(policy)
    }
}

/// A fully read response
#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
    /// Body length in bytes before lossy decoding
    pub body_size: usize,
    pub latency: Duration,
}

impl Fetched {
    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

/// Send a request and read the whole body, with `timeout` as a hard ceiling
async fn execute(client: &Client, request: Request, timeout: Duration) -> Result<Fetched> {
    let start = Instant::now();

    let exchange = async {
        let response = client.execute(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.bytes().await?;
        Ok::<_, AuditError>((status, headers, bytes))
    };

    let (status, headers, bytes) = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| AuditError::Timeout(timeout))??;

    Ok(Fetched {
        status,
        headers,
        body: String::from_utf8_lossy(&bytes).into_owned(),
        body_size: bytes.len(),
        latency: start.elapsed(),
    })
}

/// Issues requests with the configured timeout, paced by a shared throttle
#[derive(Debug, Clone)]
pub struct Fetcher {
    timeout: Duration,
    throttle: Arc<RequestThrottle>,
}

impl Fetcher {
    pub fn new(timeout: Duration, throttle: Arc<RequestThrottle>) -> Self {
        Self { timeout, throttle }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.timeout(),
            Arc::new(RequestThrottle::new(&config.rate_limit)),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the rate limit of `url`'s host
    pub async fn pace(&self, url: &Url) {
        self.throttle.wait(url).await;
    }

    /// Send a request once the target host's rate limit allows it and read the
    /// whole body, with the timeout as a hard ceiling
    pub async fn fetch(&self, request: RequestBuilder) -> Result<Fetched> {
        let (client, request) = request.build_split();
        let request = request?;
        self.pace(request.url()).await;
        execute(&client, request, self.timeout).await
    }
}
