//! Hand-written HTTP exchanges through a proxy.
//!
//! Some probes need byte-level control over the request (conflicting framing
//! headers), which an HTTP client library will not send. These go over a plain
//! socket: absolute-form requests to HTTP proxies, a SOCKS tunnel otherwise.

use crate::error::{AuditError, Result};
use crate::proxy::models::{Proxy, ProxyType};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, instrument};
use url::Url;

pub struct RawTunnel;

impl RawTunnel {
    /// Open a socket on which requests for `host:port` can be written
    #[instrument(skip(proxy), fields(proxy = %proxy))]
    pub async fn connect(proxy: &Proxy, host: &str, port: u16) -> Result<TcpStream> {
        let address = proxy.address();
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let stream = match (proxy.proxy_type(), proxy.auth()) {
            (ProxyType::Http, _) => TcpStream::connect(&address).await?,
            (ProxyType::Https, _) => {
                return Err(AuditError::UnsupportedProtocol(
                    "raw requests through https proxies".to_string(),
                ))
            }
            (ProxyType::Socks4, Some(auth)) => {
                Socks4Stream::connect_with_userid(address.as_str(), (host, port), &auth.username)
                    .await?
                    .into_inner()
            }
            (ProxyType::Socks4, None) => Socks4Stream::connect(address.as_str(), (host, port))
                .await?
                .into_inner(),
            (ProxyType::Socks5, Some(auth)) => Socks5Stream::connect_with_password(
                address.as_str(),
                (host, port),
                &auth.username,
                &auth.password,
            )
            .await?
            .into_inner(),
            (ProxyType::Socks5, None) => Socks5Stream::connect(address.as_str(), (host, port))
                .await?
                .into_inner(),
        };

        debug!("raw channel to {}:{} open", host, port);
        Ok(stream)
    }

    /// Request target as the proxy expects it: absolute form for HTTP proxies,
    /// origin form inside a tunnel
    pub fn request_target(proxy: &Proxy, url: &Url) -> String {
        if proxy.proxy_type().is_socks() {
            match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            }
        } else {
            url.as_str().to_string()
        }
    }

    /// `Proxy-Authorization` line for HTTP proxies with embedded credentials
    fn authorization_line(proxy: &Proxy) -> Option<String> {
        match (proxy.proxy_type(), proxy.auth()) {
            (ProxyType::Http, Some(auth)) => {
                let credentials = format!("{}:{}", auth.username, auth.password);
                Some(format!(
                    "Proxy-Authorization: Basic {}\r\n",
                    BASE64.encode(credentials.as_bytes())
                ))
            }
            _ => None,
        }
    }

    /// Write the request produced by `render` and read until the peer closes.
    ///
    /// `render` receives the request target to put on the request line. If the
    /// deadline passes after some bytes arrived, the partial response is returned.
    pub async fn exchange<F>(proxy: &Proxy, url: &Url, render: F, timeout: Duration) -> Result<String>
    where
        F: FnOnce(&str) -> String,
    {
        if url.scheme() != "http" {
            return Err(AuditError::UnsupportedProtocol(format!(
                "raw requests need an http target, got {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| AuditError::InvalidConfig(format!("no host in {}", url)))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let mut stream = tokio::time::timeout(timeout, Self::connect(proxy, host, port))
            .await
            .map_err(|_| AuditError::Timeout(timeout))??;

        let mut request = render(&Self::request_target(proxy, url));
        if let (Some(auth), Some(line_end)) = (Self::authorization_line(proxy), request.find("\r\n")) {
            request.insert_str(line_end + 2, &auth);
        }

        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        match tokio::time::timeout(timeout, stream.read_to_end(&mut response)).await {
            Ok(Ok(_)) if response.is_empty() => {
                return Err(AuditError::Tunnel("connection closed without a response".to_string()))
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) if response.is_empty() => return Err(e.into()),
            Ok(Err(e)) => debug!("raw read ended early: {}", e),
            Err(_) if response.is_empty() => return Err(AuditError::Timeout(timeout)),
            Err(_) => debug!("raw read hit the deadline, keeping partial response"),
        }

        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

/// Status codes of every HTTP status line in `raw`
pub fn status_codes(raw: &str) -> Vec<u16> {
    raw.lines()
        .filter(|line| line.starts_with("HTTP/"))
        .filter_map(|line| line.split_whitespace().nth(1)?.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockResponse, MockServer};

    fn get(target: &str) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: target.test\r\nConnection: close\r\n\r\n",
            target
        )
    }

    #[test]
    fn test_request_target_forms() {
        let url = Url::parse("http://target.test/a/b?x=1").unwrap();
        let http: Proxy = "http://10.0.0.1:3128".parse().unwrap();
        let socks: Proxy = "socks5://10.0.0.2".parse().unwrap();
        assert_eq!(RawTunnel::request_target(&http, &url), "http://target.test/a/b?x=1");
        assert_eq!(RawTunnel::request_target(&socks, &url), "/a/b?x=1");
    }

    #[test]
    fn test_status_codes() {
        let raw = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\nHTTP/1.1 400 Bad Request\r\n\r\n";
        assert_eq!(status_codes(raw), vec![200, 400]);
        assert!(status_codes("garbage").is_empty());
    }

    #[tokio::test]
    async fn test_exchange_through_http_proxy_with_auth() {
        let server = MockServer::start(|req| {
            if req.header("Proxy-Authorization") == Some("Basic dXNlcjpwYXNz") {
                MockResponse::ok(format!("saw {}", req.target))
            } else {
                MockResponse::new(407, "auth required")
            }
        })
        .await;
        let proxy: Proxy = format!("http://user:pass@{}", server.addr()).parse().unwrap();
        let url = Url::parse("http://target.test/probe").unwrap();

        let raw = RawTunnel::exchange(&proxy, &url, get, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(status_codes(&raw), vec![200]);
        assert!(raw.ends_with("saw http://target.test/probe"));
    }

    #[tokio::test]
    async fn test_exchange_through_socks5_with_password() {
        let server =
            MockServer::start_socks(Some(("user", "p@ss")), |req| MockResponse::ok(format!("saw {}", req.target)))
                .await;
        let proxy: Proxy = format!("socks5://user:p%40ss@{}", server.addr()).parse().unwrap();
        let url = Url::parse("http://target.test/probe?x=1").unwrap();

        let raw = RawTunnel::exchange(&proxy, &url, get, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(status_codes(&raw), vec![200]);
        assert!(raw.ends_with("saw /probe?x=1"));
        assert_eq!(server.destinations(), vec!["target.test:80".to_string()]);
    }

    #[tokio::test]
    async fn test_socks5_rejects_wrong_password() {
        let server = MockServer::start_socks(Some(("user", "pass")), |_| MockResponse::ok("unreachable")).await;
        let proxy: Proxy = format!("socks5://user:wrong@{}", server.addr()).parse().unwrap();
        let url = Url::parse("http://target.test/").unwrap();

        let err = RawTunnel::exchange(&proxy, &url, get, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Socks(_)));
        assert_eq!(server.hits(), 0);
    }

    #[tokio::test]
    async fn test_exchange_through_socks4_with_userid() {
        let server = MockServer::start_socks(Some(("agent", "")), |req| MockResponse::ok(format!("saw {}", req.target))).await;
        let proxy: Proxy = format!("socks4://agent@{}", server.addr()).parse().unwrap();
        let url = Url::parse("http://target.test:8080/a").unwrap();

        let raw = RawTunnel::exchange(&proxy, &url, get, Duration::from_secs(3))
            .await
            .unwrap();
        assert!(raw.ends_with("saw /a"));
        assert_eq!(server.destinations(), vec!["target.test:8080".to_string()]);
    }

    #[tokio::test]
    async fn test_silent_close_is_a_tunnel_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
            }
        });

        let proxy: Proxy = format!("http://{}", addr).parse().unwrap();
        let url = Url::parse("http://target.test/").unwrap();
        let err = RawTunnel::exchange(&proxy, &url, get, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Tunnel(_)));
    }

    #[tokio::test]
    async fn test_https_proxy_is_unsupported() {
        let proxy: Proxy = "https://10.0.0.1:8443".parse().unwrap();
        let url = Url::parse("http://target.test/").unwrap();
        let err = RawTunnel::exchange(&proxy, &url, get, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::UnsupportedProtocol(_)));
    }

    #[tokio::test]
    async fn test_https_target_is_unsupported() {
        let proxy: Proxy = "http://10.0.0.1:3128".parse().unwrap();
        let url = Url::parse("https://target.test/").unwrap();
        let err = RawTunnel::exchange(&proxy, &url, get, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::UnsupportedProtocol(_)));
    }
}
