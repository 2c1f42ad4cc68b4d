//! Scripted HTTP/1.1 server for transport tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use skiff_core::Profile;

/// One request as the server saw it
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub type Responder = dyn Fn(&Recorded) -> Vec<u8> + Send + Sync;

pub struct MockServer {
    pub port: u16,
    requests: Arc<Mutex<Vec<Recorded>>>,
    accepted: Arc<AtomicUsize>,
}

impl MockServer {
    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    /// TCP connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Profile pointing at this server with path-style addressing
    pub fn profile(&self) -> Profile {
        let mut profile = Profile::new("mock", "127.0.0.1");
        profile.port = self.port;
        profile
    }
}

/// Route `tracing` output through the test harness when `RUST_LOG` is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Serve every connection with `responder`, one reply per request
///
/// `Expect: 100-continue` is answered before the body is read. A reply
/// carrying `Connection: close` ends its connection.
pub async fn serve(responder: impl Fn(&Recorded) -> Vec<u8> + Send + Sync + 'static) -> MockServer {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::new(AtomicUsize::new(0));
    let responder: Arc<Responder> = Arc::new(responder);

    let (reqs, count) = (Arc::clone(&requests), Arc::clone(&accepted));
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            count.fetch_add(1, Ordering::SeqCst);
            let (reqs, responder) = (Arc::clone(&reqs), Arc::clone(&responder));
            tokio::spawn(async move {
                let mut stream = BufReader::new(socket);
                while let Some(recorded) = read_request(&mut stream).await {
                    let reply = responder(&recorded);
                    reqs.lock().push(recorded);
                    if stream.get_mut().write_all(&reply).await.is_err() {
                        return;
                    }
                    let text = String::from_utf8_lossy(&reply).to_ascii_lowercase();
                    if text.contains("connection: close") {
                        let _ = stream.get_mut().shutdown().await;
                        return;
                    }
                }
            });
        }
    });

    MockServer {
        port,
        requests,
        accepted,
    }
}

async fn read_request(stream: &mut BufReader<tokio::net::TcpStream>) -> Option<Recorded> {
    let mut line = String::new();
    if stream.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let mut recorded = Recorded {
        request_line: line.trim_end().to_string(),
        ..Default::default()
    };
    loop {
        let mut header = String::new();
        if stream.read_line(&mut header).await.ok()? == 0 {
            return None;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        let (name, value) = header.split_once(':')?;
        recorded
            .headers
            .push((name.trim().to_string(), value.trim().to_string()));
    }

    if recorded
        .header("expect")
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    {
        stream
            .get_mut()
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .await
            .ok()?;
    }
    let len: usize = recorded
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.ok()?;
    recorded.body = body;
    Some(recorded)
}

/// A complete reply with a Content-Length body
pub fn reply(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status}\r\n");
    for (k, v) in headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    let mut out = out.into_bytes();
    out.extend_from_slice(body);
    out
}

/// A reply whose body is sent with chunked transfer-coding
pub fn chunked_reply(chunks: &[&[u8]]) -> Vec<u8> {
    let mut out = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    for chunk in chunks {
        out.extend_from_slice(format!("{:x};ext=1\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\nX-Trailer: done\r\n\r\n");
    out
}
