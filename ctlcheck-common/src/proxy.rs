//! Local forward proxy for verifying that the client honors proxy variables.
//!
//! [`ProxyHarness::start`] binds an ephemeral loopback port and serves HTTP/1
//! on a private tokio runtime. `CONNECT` requests are logged as
//! `Accepting CONNECT to <host:port>` and tunneled; other requests are logged
//! as `Got request <METHOD> <uri>` and forwarded. A scenario points the
//! client's `https_proxy`/`HTTPS_PROXY` at [`ProxyHarness::endpoint`], runs
//! it, then checks [`ProxyHarness::log`] for [`expected_connect_line`].
//!
//! A harness serves exactly one scenario: [`ProxyHarness::stop`] consumes it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::errors::{HarnessError, HarnessResult};
use crate::poll::{Observation, Poller};
use crate::util::lock;

/// How long [`ProxyHarness::stop`] waits for in-flight tunnels.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Append-only record of proxy activity, shared with the accept loop.
///
/// Reads return a snapshot; the log may grow right after.
#[derive(Debug, Clone, Default)]
pub struct ProxyLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl ProxyLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, line: impl Into<String>) {
        let line = line.into();
        info!(entry = %line, "Proxy log");
        lock(&self.lines).push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    /// Lines appended after the first `index`.
    pub fn lines_since(&self, index: usize) -> Vec<String> {
        lock(&self.lines).iter().skip(index).cloned().collect()
    }

    /// Whole log as newline-terminated text.
    pub fn contents(&self) -> String {
        lock(&self.lines)
            .iter()
            .map(|line| format!("{line}\n"))
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        lock(&self.lines).iter().any(|line| line.contains(needle))
    }

    pub fn len(&self) -> usize {
        lock(&self.lines).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        lock(&self.lines).clear();
    }

    /// Wait until some line contains `needle`.
    pub fn wait_for(&self, needle: &str, timeout: Duration) -> HarnessResult<String> {
        Poller::new(
            format!("proxy log line containing {needle:?}"),
            Duration::from_millis(20),
            timeout,
        )
        .run(|| {
            let lines = self.lines();
            match lines.iter().find(|line| line.contains(needle)) {
                Some(line) => Observation::Converged(line.clone()),
                None => Observation::Pending(format!("{} lines", lines.len())),
            }
        })
    }
}

/// Running forward proxy.
pub struct ProxyHarness {
    addr: SocketAddr,
    log: ProxyLog,
    shutdown: Option<oneshot::Sender<()>>,
    runtime: Option<Runtime>,
}

impl ProxyHarness {
    /// Bind `127.0.0.1:0` and start serving.
    ///
    /// A bind failure is returned as a setup failure and never retried.
    pub fn start() -> HarnessResult<Self> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
            .map_err(|e| HarnessError::Setup(format!("proxy bind failed: {e}")))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ctlcheck-proxy")
            .enable_all()
            .build()
            .map_err(|e| HarnessError::Setup(format!("proxy runtime: {e}")))?;

        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };

        let log = ProxyLog::new();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        runtime.spawn(accept_loop(listener, log.clone(), shutdown_rx));

        info!(%addr, "Proxy harness listening");
        Ok(Self {
            addr,
            log,
            shutdown: Some(shutdown_tx),
            runtime: Some(runtime),
        })
    }

    /// `http://127.0.0.1:<port>`, the value for proxy environment variables.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn log(&self) -> &ProxyLog {
        &self.log
    }

    /// Tear down the listener and every open tunnel.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
            info!(addr = %self.addr, entries = self.log.len(), "Proxy harness stopped");
        }
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, log: ProxyLog, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(val) => val,
                    Err(err) => {
                        warn!(%err, "Proxy accept error");
                        continue;
                    }
                };
                debug!(%peer, "Proxy accepted connection");
                let log = log.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, log.clone()));
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await
                    {
                        debug!(%err, %peer, "Proxy connection ended with error");
                    }
                });
            }
            _ = &mut shutdown => {
                debug!("Proxy accept loop shutting down");
                break;
            }
        }
    }
}

async fn handle(req: Request<Incoming>, log: ProxyLog) -> Result<Response<ProxyBody>, Infallible> {
    if req.method() == Method::CONNECT {
        let Some(authority) = req.uri().authority().map(ToString::to_string) else {
            log.append(format!("Rejecting CONNECT to {}", req.uri()));
            return Ok(text_response(
                StatusCode::BAD_REQUEST,
                "CONNECT target must be host:port",
            ));
        };
        log.append(format!("Accepting CONNECT to {authority}"));

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => match tunnel(upgraded, &authority).await {
                    Ok((up, down)) => debug!(%authority, up, down, "Tunnel closed"),
                    Err(err) => debug!(%authority, %err, "Tunnel failed"),
                },
                Err(err) => debug!(%authority, %err, "CONNECT upgrade failed"),
            }
        });
        return Ok(Response::new(empty_body()));
    }

    log.append(format!("Got request {} {}", req.method(), req.uri()));
    Ok(forward(req).await)
}

async fn tunnel(upgraded: Upgraded, authority: &str) -> std::io::Result<(u64, u64)> {
    let mut server = TcpStream::connect(authority).await?;
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, &mut server).await
}

async fn forward(req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(host) = req.uri().host().map(str::to_string) else {
        return text_response(StatusCode::BAD_REQUEST, "proxy requests need an absolute URI");
    };
    let port = req.uri().port_u16().unwrap_or(80);

    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(err) => {
            return text_response(StatusCode::BAD_GATEWAY, &format!("dial {host}:{port}: {err}"));
        }
    };
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
    {
        Ok(pair) => pair,
        Err(err) => return text_response(StatusCode::BAD_GATEWAY, &format!("handshake: {err}")),
    };
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(%err, "Upstream connection error");
        }
    });

    let (mut parts, body) = req.into_parts();
    parts.uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse::<Uri>()
        .unwrap_or_default();
    parts.headers.remove("proxy-connection");
    parts.headers.remove("proxy-authorization");

    match sender.send_request(Request::from_parts(parts, body)).await {
        Ok(resp) => resp.map(BodyExt::boxed),
        Err(err) => text_response(StatusCode::BAD_GATEWAY, &format!("upstream: {err}")),
    }
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

/// Proxy environment variable spellings the client is expected to honor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVar {
    HttpsLower,
    HttpsUpper,
}

impl ProxyVar {
    pub const ALL: [ProxyVar; 2] = [ProxyVar::HttpsLower, ProxyVar::HttpsUpper];

    pub fn name(self) -> &'static str {
        match self {
            ProxyVar::HttpsLower => "https_proxy",
            ProxyVar::HttpsUpper => "HTTPS_PROXY",
        }
    }

    pub fn env_pair(self, endpoint: &str) -> (String, String) {
        (self.name().to_string(), endpoint.to_string())
    }
}

impl std::fmt::Display for ProxyVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Log line the proxy writes when the client tunnels to `server`.
///
/// `https://10.0.0.1:6443/api` gives `Accepting CONNECT to 10.0.0.1:6443`.
pub fn expected_connect_line(server: &str) -> String {
    let host = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    let host = host.strip_suffix('/').unwrap_or(host);
    let host = host.strip_suffix("/api").unwrap_or(host);
    format!("Accepting CONNECT to {host}")
}
