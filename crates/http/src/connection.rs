//! Checked-out connection

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use skiff_core::{Cause, Error, Result};

use crate::pool::{ConnectionLimits, PoolShared, Stream};

/// One live socket checked out of a [`ConnectionPool`](crate::ConnectionPool)
///
/// Exactly one of [`release`](Connection::release) or
/// [`terminate`](Connection::terminate) disposes of it; dropping it without
/// either closes the socket.
pub struct Connection {
    io: Option<BufReader<Stream>>,
    host: String,
    port: u16,
    pool: Arc<PoolShared>,
    limits: ConnectionLimits,
    reusable: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("limits", &self.limits)
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        io: BufReader<Stream>,
        (host, port): (String, u16),
        pool: Arc<PoolShared>,
        limits: ConnectionLimits,
    ) -> Self {
        Self {
            io: Some(io),
            host,
            port,
            pool,
            limits,
            reusable: true,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// Whether nothing so far rules out returning this connection to the pool
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Forbid reuse; the next [`finish`](Connection::finish) terminates
    pub fn mark_close(&mut self) {
        self.reusable = false;
    }

    fn io(&mut self) -> Result<&mut BufReader<Stream>> {
        self.io
            .as_mut()
            .ok_or_else(|| Error::unreachable(Cause::Closed, "connection already disposed"))
    }

    fn fail(&mut self, cause: Cause, detail: String) -> Error {
        tracing::warn!(host = %self.host, port = self.port, %cause, %detail, "transport failure");
        self.reusable = false;
        Error::unreachable(cause, detail)
    }

    /// Write every buffer in order, retrying short writes
    ///
    /// The timeout covers the whole batch. Any failure marks the connection
    /// for termination.
    pub async fn writev_all(&mut self, bufs: &[&[u8]], timeout: Duration) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut written = 0;

        while written < total {
            let slices = remaining(bufs, written);
            let io = self.io()?;
            let n = match tokio::time::timeout_at(deadline, io.write_vectored(&slices)).await {
                Ok(Ok(0)) => {
                    return Err(self.fail(Cause::Closed, "peer stopped accepting data".into()));
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(self.fail(Cause::Io, format!("write failed: {e}"))),
                Err(_) => return Err(self.fail(Cause::Timeout, "write timed out".into())),
            };
            written += n;
        }

        let io = self.io()?;
        match tokio::time::timeout_at(deadline, io.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(Cause::Io, format!("flush failed: {e}"))),
            Err(_) => Err(self.fail(Cause::Timeout, "write timed out".into())),
        }
    }

    /// [`writev_all`](Connection::writev_all) under the write timeout
    pub async fn write_all(&mut self, bufs: &[&[u8]]) -> Result<()> {
        let timeout = self.limits.write_timeout;
        self.writev_all(bufs, timeout).await
    }

    /// Read into `buf`; 0 means end of stream
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.limits.read_timeout;
        let io = self.io()?;
        match tokio::time::timeout(timeout, io.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(self.fail(Cause::Io, format!("read failed: {e}"))),
            Err(_) => Err(self.fail(Cause::Timeout, "read timed out".into())),
        }
    }

    /// Read up to and including the next `\n`, at most `limit` bytes
    pub(crate) async fn read_line(&mut self, limit: usize) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let timeout = self.limits.read_timeout;
            let io = self.io()?;
            let filled = match tokio::time::timeout(timeout, io.fill_buf()).await {
                Ok(Ok(buf)) => {
                    let (take, done) = match buf.iter().position(|&b| b == b'\n') {
                        Some(pos) => (pos + 1, true),
                        None => (buf.len(), false),
                    };
                    line.extend_from_slice(&buf[..take]);
                    Ok((take, done))
                }
                Ok(Err(e)) => Err((Cause::Io, format!("read failed: {e}"))),
                Err(_) => Err((Cause::Timeout, "read timed out".to_string())),
            };
            let (take, done) = filled.map_err(|(cause, detail)| self.fail(cause, detail))?;
            if take == 0 {
                return Err(self.fail(Cause::Closed, "connection closed mid-line".into()));
            }
            self.io()?.consume(take);
            if done {
                return Ok(line);
            }
            if line.len() > limit {
                return Err(self.fail(Cause::Protocol, "line too long".into()));
            }
        }
    }

    /// Bytes already buffered or newly read, without consuming them
    pub(crate) async fn peek(&mut self) -> Result<Vec<u8>> {
        let timeout = self.limits.read_timeout;
        let io = self.io()?;
        let peeked = match tokio::time::timeout(timeout, io.fill_buf()).await {
            Ok(Ok(buf)) => Ok(buf.to_vec()),
            Ok(Err(e)) => Err((Cause::Io, format!("read failed: {e}"))),
            Err(_) => Err((Cause::Timeout, "read timed out".to_string())),
        };
        peeked.map_err(|(cause, detail)| self.fail(cause, detail))
    }

    pub(crate) fn consume(&mut self, amt: usize) -> Result<()> {
        self.io()?.consume(amt);
        Ok(())
    }

    pub(crate) fn protocol_error(&mut self, detail: impl Into<String>) -> Error {
        self.fail(Cause::Protocol, detail.into())
    }

    pub(crate) fn closed_error(&mut self, detail: impl Into<String>) -> Error {
        self.fail(Cause::Closed, detail.into())
    }

    /// Return the connection to its pool
    pub fn release(mut self) {
        if let Some(io) = self.io.take() {
            tracing::debug!(host = %self.host, port = self.port, "releasing connection");
            self.pool.check_in(&self.host, self.port, io);
        }
    }

    /// Close the socket; it is never reused
    pub fn terminate(mut self) {
        if self.io.take().is_some() {
            tracing::debug!(host = %self.host, port = self.port, "terminating connection");
            self.pool.note_terminated();
        }
    }

    /// Release if the exchange left the connection reusable, else terminate
    pub fn finish(self) {
        if self.reusable {
            self.release();
        } else {
            self.terminate();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.io.take().is_some() {
            self.pool.note_terminated();
        }
    }
}

/// Slices covering what is left of `bufs` after `skip` bytes
fn remaining<'a>(bufs: &[&'a [u8]], mut skip: usize) -> Vec<IoSlice<'a>> {
    let mut out = Vec::with_capacity(bufs.len());
    for buf in bufs {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        out.push(IoSlice::new(&buf[skip..]));
        skip = 0;
    }
    out
}
