//! HTTP probes against the API server or a client-owned proxy.
//!
//! TCP requests go through a blocking `ureq` agent. Unix-domain sockets,
//! which `ureq` cannot dial, use a one-shot `hyper` connection on a
//! current-thread runtime.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use ureq::{Agent, SendBody};

use crate::errors::{HarnessError, HarnessResult};
use crate::upload::StreamingUpload;

/// Default per-request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Status and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> HarnessResult<T> {
        serde_json::from_str(&self.body).map_err(|e| HarnessError::Parse {
            what: "response body".to_string(),
            detail: e.to_string(),
        })
    }

    /// Fail unless the status is 2xx.
    pub fn require_success(self) -> HarnessResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HarnessError::Http(format!(
                "unexpected status {}: {}",
                self.status,
                self.body.trim()
            )))
        }
    }
}

/// `{"versions": [...]}` as served at `/api`.
#[derive(Debug, Deserialize)]
struct ApiVersions {
    versions: Vec<String>,
}

fn agent(timeout: Duration) -> Agent {
    let config = Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(timeout))
        .build();
    config.into()
}

fn read_response(mut response: ureq::http::Response<ureq::Body>) -> HarnessResult<HttpResponse> {
    let status = response.status().as_u16();
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| HarnessError::Http(format!("reading body: {e}")))?;
    Ok(HttpResponse { status, body })
}

/// GET `url` over TCP.
pub fn get(url: &str, timeout: Duration) -> HarnessResult<HttpResponse> {
    debug!(%url, "HTTP GET");
    let response = agent(timeout)
        .get(url)
        .call()
        .map_err(|e| HarnessError::Http(format!("GET {url}: {e}")))?;
    read_response(response)
}

/// GET `path` from a server listening on the Unix-domain socket `socket`.
pub fn get_unix(socket: &Path, path: &str, timeout: Duration) -> HarnessResult<HttpResponse> {
    debug!(socket = %socket.display(), %path, "HTTP GET over unix socket");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| HarnessError::Setup(format!("http runtime: {e}")))?;

    runtime.block_on(async {
        tokio::time::timeout(timeout, unix_request(socket, path))
            .await
            .map_err(|_| HarnessError::Timeout(timeout))?
    })
}

async fn unix_request(socket: &Path, path: &str) -> HarnessResult<HttpResponse> {
    let http_err = |what: &str, e: hyper::Error| HarnessError::Http(format!("{what}: {e}"));

    let stream = tokio::net::UnixStream::connect(socket).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| http_err("handshake", e))?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(%err, "Unix socket connection error");
        }
    });

    let request = Request::get(path)
        .header(hyper::header::HOST, "localhost")
        .body(Empty::<Bytes>::new())
        .map_err(|e| HarnessError::Http(format!("building request for {path}: {e}")))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| http_err("request", e))?;

    let status = response.status().as_u16();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| http_err("reading body", e))?
        .to_bytes();
    Ok(HttpResponse {
        status,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// POST `upload` to `url` as a chunked body, then check the producer's
/// completion signal. A producer failure takes precedence over whatever
/// the transport reported, since it is the root cause.
pub fn post_streaming(
    url: &str,
    mut upload: StreamingUpload,
    timeout: Duration,
) -> HarnessResult<HttpResponse> {
    let content_type = upload.content_type();
    debug!(%url, file = upload.file_name(), "Streaming upload POST");

    let sent = agent(timeout)
        .post(url)
        .header("Content-Type", content_type.as_str())
        .send(SendBody::from_reader(&mut upload));

    let produced = upload.finish();
    let response = match (sent, produced) {
        (_, Err(err)) => {
            warn!(%url, %err, "Upload producer failed");
            return Err(err);
        }
        (Err(err), Ok(_)) => return Err(HarnessError::Http(format!("POST {url}: {err}"))),
        (Ok(response), Ok(bytes)) => {
            debug!(%url, bytes, "Upload body fully sent");
            response
        }
    };
    read_response(response)
}

/// API versions the server advertises at `<base_url>/api`.
pub fn api_versions(base_url: &str, timeout: Duration) -> HarnessResult<Vec<String>> {
    let url = format!("{}/api", base_url.trim_end_matches('/'));
    parse_api_versions(get(&url, timeout)?)
}

/// [`api_versions`] through a Unix-socket-bound proxy.
pub fn api_versions_unix(socket: &Path, timeout: Duration) -> HarnessResult<Vec<String>> {
    parse_api_versions(get_unix(socket, "/api", timeout)?)
}

fn parse_api_versions(response: HttpResponse) -> HarnessResult<Vec<String>> {
    let versions: ApiVersions = response.require_success()?.json()?;
    if versions.versions.is_empty() {
        return Err(HarnessError::Parse {
            what: "api versions".to_string(),
            detail: "server advertised no versions".to_string(),
        });
    }
    Ok(versions.versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    const VERSIONS: &str = r#"{"kind":"APIVersions","versions":["v1"]}"#;

    fn http_reply(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Read a request head and return its request line.
    fn read_head<R: BufRead>(reader: &mut R) -> String {
        let mut request_line = String::new();
        reader.read_line(&mut request_line).unwrap();
        let mut line = String::new();
        while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
            line.clear();
        }
        request_line
    }

    fn serve_once(reply: String) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let request_line = read_head(&mut reader);
            let mut conn = conn;
            conn.write_all(reply.as_bytes()).unwrap();
            request_line
        });
        (base, handle)
    }

    #[test]
    fn test_api_versions_over_tcp() {
        let (base, server) = serve_once(http_reply("200 OK", VERSIONS));
        let versions = api_versions(&base, Duration::from_secs(5)).unwrap();
        assert_eq!(versions, vec!["v1"]);
        assert_eq!(server.join().unwrap(), "GET /api HTTP/1.1\r\n");
    }

    #[test]
    fn test_error_status_is_returned_not_raised() {
        let (base, server) = serve_once(http_reply("404 Not Found", "{}"));
        let response = get(&format!("{base}/api/v1/nope"), Duration::from_secs(5)).unwrap();
        assert_eq!(response.status, 404);
        assert!(response.require_success().is_err());
        server.join().unwrap();
    }

    #[test]
    fn test_get_unix() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("proxy.sock");
        let listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let request_line = read_head(&mut reader);
            let mut conn = conn;
            conn.write_all(http_reply("200 OK", VERSIONS).as_bytes()).unwrap();
            request_line
        });

        let versions = api_versions_unix(&socket, Duration::from_secs(5)).unwrap();
        assert_eq!(versions, vec!["v1"]);
        assert_eq!(server.join().unwrap(), "GET /api HTTP/1.1\r\n");
    }

    #[test]
    fn test_post_streaming_sends_multipart_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "hello upload").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/v1/proxy/upload", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            read_head(&mut reader);
            // Chunked body ends with a zero-length chunk.
            let mut body = Vec::new();
            let mut byte = [0u8; 1];
            while !body.ends_with(b"0\r\n\r\n") {
                reader.read_exact(&mut byte).unwrap();
                body.push(byte[0]);
            }
            let mut conn = conn;
            conn.write_all(http_reply("201 Created", "{}").as_bytes()).unwrap();
            String::from_utf8_lossy(&body).into_owned()
        });

        let upload = StreamingUpload::new(&path).unwrap();
        let boundary = upload.boundary().to_string();
        let response = post_streaming(&url, upload, Duration::from_secs(5)).unwrap();
        assert_eq!(response.status, 201);

        let body = server.join().unwrap();
        assert!(body.contains("filename=\"hello.txt\""));
        assert!(body.contains("hello upload"));
        assert!(body.contains(&format!("--{boundary}--")));
    }

    #[test]
    fn test_unreachable_server_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = get(&format!("http://{addr}/api"), Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, HarnessError::Http(_)));
    }
}
