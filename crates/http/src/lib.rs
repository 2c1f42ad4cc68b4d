//! skiff-http: pooled HTTP/1.1 transport for skiff
//!
//! - [`ConnectionPool`] hands out [`Connection`]s keyed by host and port,
//!   dialing plain TCP or (with the `tls` feature) TLS
//! - [`read_http_reply`] and [`read_http_reply_buffered`] parse replies into
//!   memory or through a [`ReplyConsumer`](skiff_core::ReplyConsumer)
//! - [`HttpBackend`] implements [`Backend`](skiff_core::Backend) on top

pub mod client;
pub mod connection;
pub mod pool;
pub mod reply;

pub use client::HttpBackend;
pub use connection::Connection;
pub use pool::{
    AsyncStream, ConnectionLimits, ConnectionPool, Connector, PoolStats, Stream, TcpConnector,
};
pub use reply::{Reply, connection_close, read_http_reply, read_http_reply_buffered};
