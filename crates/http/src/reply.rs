//! HTTP/1.x reply parsing
//!
//! The status line and header block are parsed with `httparse`; the body is
//! framed by `Transfer-Encoding: chunked`, `Content-Length`, or the end of
//! the stream when the reply closes the connection.

use skiff_core::{CollectingConsumer, Dict, Error, ReplyConsumer, Result};

use crate::connection::Connection;

const MAX_HEADERS: usize = 100;
const READ_CHUNK: usize = 16 * 1024;
const MAX_CHUNK_LINE: usize = 1024;

/// A parsed reply
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub status: u16,
    pub reason: String,
    /// Minor HTTP version: 0 or 1
    pub version: u8,
    pub headers: Dict,
    /// Body, when it was requested
    pub body: Option<Vec<u8>>,
    pub connection_close: bool,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 1xx replies such as `100 Continue`
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get_ci(name).map(|v| v.joined())
    }
}

/// Whether a reply forbids reusing its connection
///
/// True for `Connection: close`, and for HTTP/1.0 unless the peer sent
/// `Connection: keep-alive`.
pub fn connection_close(version: u8, headers: &Dict) -> bool {
    let token = headers.get_ci("connection").map(|v| v.joined());
    let has = |want: &str| {
        token.as_deref().is_some_and(|t| {
            t.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(want))
        })
    };
    if has("close") {
        return true;
    }
    version == 0 && !has("keep-alive")
}

enum BodyFraming {
    None,
    Chunked,
    Length(u64),
    UntilClose,
}

fn body_framing(reply: &Reply) -> Result<BodyFraming> {
    if reply.is_interim() || reply.status == 204 || reply.status == 304 {
        return Ok(BodyFraming::None);
    }
    let chunked = reply.header("transfer-encoding").is_some_and(|te| {
        te.split(',')
            .any(|part| part.trim().eq_ignore_ascii_case("chunked"))
    });
    if chunked {
        return Ok(BodyFraming::Chunked);
    }
    if let Some(len) = reply.header("content-length") {
        let len = len
            .trim()
            .parse()
            .map_err(|_| Error::Framing(format!("bad Content-Length '{len}'")))?;
        return Ok(BodyFraming::Length(len));
    }
    if reply.connection_close {
        Ok(BodyFraming::UntilClose)
    } else {
        Ok(BodyFraming::None)
    }
}

/// Parse the status line and header block
async fn read_head(conn: &mut Connection) -> Result<Reply> {
    let max = conn.limits().max_header_size;
    let mut head: Vec<u8> = Vec::new();

    loop {
        let available = conn.peek().await?;
        if available.is_empty() {
            return Err(conn.closed_error("connection closed before reply headers"));
        }
        let before = head.len();
        head.extend_from_slice(&available);

        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut slots);
        match response.parse(&head) {
            Ok(httparse::Status::Complete(len)) if len > max => {
                return Err(conn.protocol_error(format!(
                    "reply header block exceeds {max} bytes"
                )));
            }
            Ok(httparse::Status::Complete(len)) => {
                conn.consume(len - before)?;
                let mut headers = Dict::new();
                for h in response.headers.iter() {
                    let value = String::from_utf8_lossy(h.value).into_owned();
                    tracing::trace!(header = h.name, value = %value, "reply header");
                    headers.add(h.name, value);
                }
                let version = response.version.unwrap_or(1);
                let close = connection_close(version, &headers);
                return Ok(Reply {
                    status: response.code.unwrap_or(0),
                    reason: response.reason.unwrap_or_default().to_string(),
                    version,
                    headers,
                    body: None,
                    connection_close: close,
                });
            }
            Ok(httparse::Status::Partial) => {
                conn.consume(available.len())?;
                if head.len() > max {
                    return Err(conn.protocol_error(format!(
                        "reply header block exceeds {max} bytes"
                    )));
                }
            }
            Err(e) => return Err(conn.protocol_error(format!("unparsable reply: {e}"))),
        }
    }
}

async fn read_exact_into(
    conn: &mut Connection,
    mut len: u64,
    sink: &mut dyn ReplyConsumer,
) -> Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    while len > 0 {
        let want = len.min(READ_CHUNK as u64) as usize;
        let got = conn.read(&mut buf[..want]).await?;
        if got == 0 {
            return Err(conn.closed_error("connection closed mid-body"));
        }
        sink.on_chunk(&buf[..got])?;
        len -= got as u64;
    }
    Ok(())
}

async fn read_chunked(conn: &mut Connection, sink: &mut dyn ReplyConsumer) -> Result<()> {
    loop {
        let line = conn.read_line(MAX_CHUNK_LINE).await?;
        let text = String::from_utf8_lossy(&line);
        let size_field = text.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_field, 16)
            .map_err(|_| conn.protocol_error(format!("bad chunk size '{size_field}'")))?;
        if size == 0 {
            // trailer section ends with an empty line
            loop {
                let trailer = conn.read_line(MAX_CHUNK_LINE).await?;
                if trailer == b"\r\n" || trailer == b"\n" {
                    return Ok(());
                }
            }
        }
        read_exact_into(conn, size, sink).await?;
        let crlf = conn.read_line(MAX_CHUNK_LINE).await?;
        if crlf != b"\r\n" && crlf != b"\n" {
            return Err(conn.protocol_error("chunk not terminated by CRLF"));
        }
    }
}

async fn read_until_close(conn: &mut Connection, sink: &mut dyn ReplyConsumer) -> Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let got = conn.read(&mut buf).await?;
        if got == 0 {
            return Ok(());
        }
        sink.on_chunk(&buf[..got])?;
    }
}

async fn read_body(
    conn: &mut Connection,
    reply: &Reply,
    sink: &mut dyn ReplyConsumer,
) -> Result<()> {
    let result = match body_framing(reply) {
        Ok(BodyFraming::None) => Ok(()),
        Ok(BodyFraming::Length(len)) => read_exact_into(conn, len, sink).await,
        Ok(BodyFraming::Chunked) => read_chunked(conn, sink).await,
        Ok(BodyFraming::UntilClose) => read_until_close(conn, sink).await,
        Err(e) => Err(e),
    };
    // a partially read body leaves the stream out of sync
    if result.is_err() {
        conn.mark_close();
    }
    result
}

struct Discard;

impl ReplyConsumer for Discard {
    fn on_chunk(&mut self, _chunk: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Record the reply's reuse verdict and turn a non-2xx status into an error,
/// draining its body first so the connection stays in sync
async fn settle(conn: &mut Connection, reply: &Reply, want_body: bool) -> Result<()> {
    if reply.connection_close {
        conn.mark_close();
    }
    if reply.is_success() || reply.is_interim() {
        return Ok(());
    }
    tracing::debug!(status = reply.status, reason = %reply.reason, "non-success reply");
    if want_body {
        read_body(conn, reply, &mut Discard).await?;
    }
    Err(Error::HttpStatus { code: reply.status })
}

/// Read one reply into memory
///
/// With `want_body` unset the body is not read at all, as for HEAD. Interim
/// `1xx` replies are returned as-is. Non-2xx replies become
/// [`Error::HttpStatus`].
pub async fn read_http_reply(conn: &mut Connection, want_body: bool) -> Result<Reply> {
    let mut reply = read_head(conn).await?;
    settle(conn, &reply, want_body).await?;
    if want_body && !reply.is_interim() {
        let mut collected = CollectingConsumer::default();
        read_body(conn, &reply, &mut collected).await?;
        reply.body = Some(collected.data);
    }
    Ok(reply)
}

/// Read one reply, streaming headers and body chunks into `consumer`
///
/// Interim replies are skipped. A consumer error aborts the read, marks the
/// connection for termination and is returned unchanged.
pub async fn read_http_reply_buffered(
    conn: &mut Connection,
    want_body: bool,
    consumer: &mut dyn ReplyConsumer,
) -> Result<Reply> {
    let reply = loop {
        let reply = read_head(conn).await?;
        if !reply.is_interim() {
            break reply;
        }
    };
    settle(conn, &reply, want_body).await?;

    let delivered = deliver(conn, &reply, want_body, consumer).await;
    if delivered.is_err() {
        conn.mark_close();
    }
    delivered.map(|()| reply)
}

async fn deliver(
    conn: &mut Connection,
    reply: &Reply,
    want_body: bool,
    consumer: &mut dyn ReplyConsumer,
) -> Result<()> {
    for (name, value) in reply.headers.iter() {
        consumer.on_header(name, &value.joined())?;
    }
    if want_body {
        read_body(conn, reply, consumer).await?;
    }
    Ok(())
}
