//! Connection pool
//!
//! Idle sockets are kept per `host:port`. The pool lock only guards the map;
//! dialing happens outside it, so a slow connect never blocks other callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;

use skiff_core::{Cause, Error, Profile, Result};

use crate::connection::Connection;

/// Byte stream a connection runs over: plain TCP or TLS
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type Stream = Box<dyn AsyncStream>;

/// Establishes new streams for the pool
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<Stream>;
}

/// Dials TCP, wrapping the socket in TLS when the profile asks for HTTPS
pub struct TcpConnector {
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsConnector>,
}

impl TcpConnector {
    /// Plain TCP connector
    pub fn plain() -> Self {
        Self {
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[cfg(feature = "tls")]
    pub fn for_profile(profile: &Profile) -> Result<Self> {
        if !profile.use_https {
            return Ok(Self::plain());
        }
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
        Ok(Self {
            tls: Some(tokio_rustls::TlsConnector::from(Arc::new(config))),
        })
    }

    #[cfg(not(feature = "tls"))]
    pub fn for_profile(profile: &Profile) -> Result<Self> {
        if profile.use_https {
            return Err(Error::NotSupported("https (built without the tls feature)"));
        }
        Ok(Self::plain())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<Stream> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;

        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            let name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let stream = tls.connect(name, tcp).await?;
            return Ok(Box::new(stream));
        }

        Ok(Box::new(tcp))
    }
}

/// Counters of pool activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Fresh connections established
    pub dialed: u64,
    /// Checkouts served from an idle connection
    pub reused: u64,
    /// Connections returned to the pool
    pub released: u64,
    /// Connections closed instead of returned
    pub terminated: u64,
}

#[derive(Default)]
struct Counters {
    dialed: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
    terminated: AtomicU64,
}

type HostKey = (String, u16);

pub(crate) struct PoolShared {
    idle: Mutex<HashMap<HostKey, Vec<BufReader<Stream>>>>,
    counters: Counters,
    max_idle_per_host: Option<usize>,
}

impl PoolShared {
    /// Park a stream for reuse, or close it when the host's idle slots are full
    pub(crate) fn check_in(&self, host: &str, port: u16, io: BufReader<Stream>) {
        let overflow = {
            let mut idle = self.idle.lock();
            let slot = idle.entry((host.to_string(), port)).or_default();
            match self.max_idle_per_host {
                Some(max) if slot.len() >= max => Some(io),
                _ => {
                    slot.push(io);
                    None
                }
            }
        };
        match overflow {
            Some(io) => {
                tracing::debug!(host, port, "idle slots full, closing connection");
                drop(io);
                self.note_terminated();
            }
            None => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn note_terminated(&self) {
        self.counters.terminated.fetch_add(1, Ordering::Relaxed);
    }
}

/// Timeouts and limits applied to every connection the pool hands out
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_header_size: usize,
}

impl ConnectionLimits {
    pub fn from_profile(profile: &Profile) -> Self {
        let timeouts = profile.timeout_config();
        Self {
            connect_timeout: timeouts.connect(),
            read_timeout: timeouts.read(),
            write_timeout: timeouts.write(),
            max_header_size: profile.max_header_size,
        }
    }
}

/// Shared pool of idle connections, cheap to clone
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    connector: Arc<dyn Connector>,
    limits: ConnectionLimits,
}

impl ConnectionPool {
    /// Pool for a profile, dialing with [`TcpConnector`]
    pub fn new(profile: &Profile) -> Result<Self> {
        let connector = TcpConnector::for_profile(profile)?;
        Ok(Self::with_connector(
            Arc::new(connector),
            ConnectionLimits::from_profile(profile),
            profile.max_idle_per_host,
        ))
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        limits: ConnectionLimits,
        max_idle_per_host: Option<usize>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                idle: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                max_idle_per_host,
            }),
            connector,
            limits,
        }
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// Check out a connection to `host:port`, reusing an idle one if possible
    pub async fn open_host(&self, host: &str, port: u16) -> Result<Connection> {
        let key = (host.to_string(), port);
        let reused = self.shared.idle.lock().get_mut(&key).and_then(Vec::pop);
        if let Some(io) = reused {
            self.shared.counters.reused.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(host, port, "reusing pooled connection");
            return Ok(Connection::new(io, key, Arc::clone(&self.shared), self.limits));
        }

        tracing::debug!(host, port, "dialing");
        let dial = tokio::time::timeout(
            self.limits.connect_timeout,
            self.connector.connect(host, port),
        )
        .await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(host, port, error = %e, "dial failed");
                return Err(Error::unreachable(Cause::Dial, format!("{host}:{port}: {e}")));
            }
            Err(_) => {
                tracing::warn!(host, port, "dial timed out");
                return Err(Error::unreachable(
                    Cause::Timeout,
                    format!("connecting to {host}:{port}"),
                ));
            }
        };
        self.shared.counters.dialed.fetch_add(1, Ordering::Relaxed);
        Ok(Connection::new(
            BufReader::new(stream),
            key,
            Arc::clone(&self.shared),
            self.limits,
        ))
    }

    /// Idle connections currently pooled for `host:port`
    pub fn idle_count(&self, host: &str, port: u16) -> usize {
        self.shared
            .idle
            .lock()
            .get(&(host.to_string(), port))
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            dialed: c.dialed.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            released: c.released.load(Ordering::Relaxed),
            terminated: c.terminated.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ConnectionLimits {
        ConnectionLimits {
            connect_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            max_header_size: 8192,
        }
    }

    fn duplex_stream() -> Stream {
        let (client, _server) = tokio::io::duplex(64);
        Box::new(client)
    }

    #[tokio::test]
    async fn test_dial_failure_is_unreachable() {
        let mut mock = MockConnector::new();
        mock.expect_connect().times(1).returning(|_, _| {
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            ))
        });
        let pool = ConnectionPool::with_connector(Arc::new(mock), limits(), None);

        let err = pool.open_host("storage.local", 9000).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Unreachable {
                cause: Cause::Dial,
                ..
            }
        ));
        assert_eq!(err.status(), skiff_core::Status::NotFound);
        assert_eq!(pool.stats().dialed, 0);
    }

    #[tokio::test]
    async fn test_release_then_reuse() {
        let mut mock = MockConnector::new();
        mock.expect_connect()
            .withf(|host, port| host == "a.local" && *port == 80)
            .times(1)
            .returning(|_, _| Ok(duplex_stream()));
        let pool = ConnectionPool::with_connector(Arc::new(mock), limits(), None);

        let conn = pool.open_host("a.local", 80).await.unwrap();
        conn.release();
        assert_eq!(pool.idle_count("a.local", 80), 1);

        let conn = pool.open_host("a.local", 80).await.unwrap();
        assert_eq!(pool.idle_count("a.local", 80), 0);
        conn.terminate();

        assert_eq!(
            pool.stats(),
            PoolStats {
                dialed: 1,
                reused: 1,
                released: 1,
                terminated: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_terminated_connection_not_reused() {
        let mut mock = MockConnector::new();
        mock.expect_connect()
            .times(2)
            .returning(|_, _| Ok(duplex_stream()));
        let pool = ConnectionPool::with_connector(Arc::new(mock), limits(), None);

        pool.open_host("b.local", 80).await.unwrap().terminate();
        assert_eq!(pool.idle_count("b.local", 80), 0);
        pool.open_host("b.local", 80).await.unwrap().release();
        assert_eq!(pool.stats().dialed, 2);
    }

    #[tokio::test]
    async fn test_pools_are_keyed_by_port() {
        let mut mock = MockConnector::new();
        mock.expect_connect()
            .times(2)
            .returning(|_, _| Ok(duplex_stream()));
        let pool = ConnectionPool::with_connector(Arc::new(mock), limits(), None);

        pool.open_host("c.local", 80).await.unwrap().release();
        let other = pool.open_host("c.local", 8080).await.unwrap();
        assert_eq!(pool.idle_count("c.local", 80), 1);
        other.release();
        assert_eq!(pool.idle_count("c.local", 8080), 1);
    }

    #[tokio::test]
    async fn test_idle_limit() {
        let mut mock = MockConnector::new();
        mock.expect_connect()
            .times(2)
            .returning(|_, _| Ok(duplex_stream()));
        let pool = ConnectionPool::with_connector(Arc::new(mock), limits(), Some(1));

        let first = pool.open_host("d.local", 80).await.unwrap();
        let second = pool.open_host("d.local", 80).await.unwrap();
        first.release();
        second.release();
        assert_eq!(pool.idle_count("d.local", 80), 1);

        let stats = pool.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.terminated, 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_counts_as_terminated() {
        let mut mock = MockConnector::new();
        mock.expect_connect()
            .times(1)
            .returning(|_, _| Ok(duplex_stream()));
        let pool = ConnectionPool::with_connector(Arc::new(mock), limits(), None);

        drop(pool.open_host("e.local", 80).await.unwrap());
        assert_eq!(pool.stats().terminated, 1);
        assert_eq!(pool.idle_count("e.local", 80), 0);
    }
}
