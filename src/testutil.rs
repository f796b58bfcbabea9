//! In-process HTTP server for tests.
//!
//! Acts as a forwarding proxy (absolute-form targets), an echo endpoint
//! (origin-form targets) or both. One request per connection. With
//! [`MockServer::start_socks`] it first runs a SOCKS4/5 handshake and then
//! serves the tunnelled request itself instead of connecting anywhere.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A parsed incoming request
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl MockRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The reply the handler wants sent back
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub delay: Option<Duration>,
    /// Bytes written verbatim instead of a formatted response
    pub raw: Option<String>,
}

impl MockResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: None,
            raw: None,
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn raw(bytes: impl Into<String>) -> Self {
        let mut response = Self::new(200, "");
        response.raw = Some(bytes.into());
        response
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn render(&self) -> String {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.body.len(),
            self.body
        ));
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Status",
    }
}

type Handler = dyn Fn(&MockRequest) -> MockResponse + Send + Sync;

/// Username and password a SOCKS listener insists on
#[derive(Debug, Clone)]
struct SocksCredentials {
    username: String,
    password: String,
}

/// A running mock server; stops when dropped
pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    destinations: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&MockRequest) -> MockResponse + Send + Sync + 'static,
    {
        Self::spawn(None, Arc::new(handler)).await
    }

    /// SOCKS4/5 listener; `credentials` switches SOCKS5 to username/password
    /// authentication and SOCKS4 to a userid check on the username
    pub async fn start_socks<F>(credentials: Option<(&str, &str)>, handler: F) -> Self
    where
        F: Fn(&MockRequest) -> MockResponse + Send + Sync + 'static,
    {
        let credentials = credentials.map(|(username, password)| SocksCredentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        Self::spawn(Some(credentials), Arc::new(handler)).await
    }

    async fn spawn(socks: Option<Option<SocksCredentials>>, handler: Arc<Handler>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let destinations = Arc::new(Mutex::new(Vec::new()));
        let socks = socks.map(Arc::new);

        let task_hits = hits.clone();
        let task_destinations = destinations.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let hits = task_hits.clone();
                let socks = socks.clone();
                let destinations = task_destinations.clone();
                tokio::spawn(async move {
                    if let Some(credentials) = socks {
                        match socks_handshake(&mut stream, (*credentials).as_ref()).await {
                            Ok(Some(destination)) => destinations.lock().unwrap().push(destination),
                            _ => return,
                        }
                    }
                    let _ = serve(stream, handler, hits).await;
                });
            }
        });

        Self {
            addr,
            hits,
            destinations,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests seen so far
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// `host:port` of every accepted SOCKS connect
    pub fn destinations(&self) -> Vec<String> {
        self.destinations.lock().unwrap().clone()
    }
}

/// Accept a SOCKS4/4a/5 connect. `Ok(None)` means the client was refused.
async fn socks_handshake(
    stream: &mut TcpStream,
    credentials: Option<&SocksCredentials>,
) -> std::io::Result<Option<String>> {
    match stream.read_u8().await? {
        5 => socks5_handshake(stream, credentials).await,
        4 => socks4_handshake(stream, credentials).await,
        _ => Ok(None),
    }
}

async fn socks5_handshake(
    stream: &mut TcpStream,
    credentials: Option<&SocksCredentials>,
) -> std::io::Result<Option<String>> {
    let count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    stream.read_exact(&mut methods).await?;

    let wanted = if credentials.is_some() { 0x02 } else { 0x00 };
    if !methods.contains(&wanted) {
        stream.write_all(&[5, 0xff]).await?;
        return Ok(None);
    }
    stream.write_all(&[5, wanted]).await?;

    if let Some(expected) = credentials {
        let _version = stream.read_u8().await?;
        let username = read_prefixed(stream).await?;
        let password = read_prefixed(stream).await?;
        let accepted = username == expected.username.as_bytes() && password == expected.password.as_bytes();
        stream.write_all(&[1, if accepted { 0 } else { 1 }]).await?;
        if !accepted {
            return Ok(None);
        }
    }

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let host = match head[3] {
        1 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        4 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            format!("[{}]", std::net::Ipv6Addr::from(ip))
        }
        _ => String::from_utf8_lossy(&read_prefixed(stream).await?).into_owned(),
    };
    let port = stream.read_u16().await?;

    stream.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0]).await?;
    Ok(Some(format!("{}:{}", host, port)))
}

async fn socks4_handshake(
    stream: &mut TcpStream,
    credentials: Option<&SocksCredentials>,
) -> std::io::Result<Option<String>> {
    let _command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;
    let userid = read_terminated(stream).await?;

    // 0.0.0.x with x > 0 announces a SOCKS4a domain after the userid
    let host = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        String::from_utf8_lossy(&read_terminated(stream).await?).into_owned()
    } else {
        std::net::Ipv4Addr::from(ip).to_string()
    };

    let accepted = credentials.map_or(true, |expected| userid == expected.username.as_bytes());
    stream
        .write_all(&[0, if accepted { 0x5a } else { 0x5b }, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(accepted.then(|| format!("{}:{}", host, port)))
}

async fn read_prefixed(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let len = stream.read_u8().await? as usize;
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}

async fn read_terminated(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    loop {
        match stream.read_u8().await? {
            0 => return Ok(bytes),
            byte => bytes.push(byte),
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, handler: Arc<Handler>, hits: Arc<AtomicUsize>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    let request = MockRequest {
        method,
        target,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    hits.fetch_add(1, Ordering::SeqCst);

    let response = if request.method.eq_ignore_ascii_case("CONNECT") {
        MockResponse::new(502, "tunnels not supported")
    } else {
        handler(&request)
    };

    if let Some(delay) = response.delay {
        tokio::time::sleep(delay).await;
    }

    let mut stream = reader.into_inner();
    stream.write_all(response.render().as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await?;

    // Drain whatever the client still sends so closing does not reset the connection
    let mut sink = [0u8; 1024];
    let _ = tokio::time::timeout(Duration::from_millis(200), async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;

    Ok(())
}
