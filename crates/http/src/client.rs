//! Generic HTTP backend
//!
//! Every operation follows the same exchange: describe it on a [`Request`],
//! build and sign the header store, check out a connection, send the framed
//! request plus body, read the reply and dispose of the connection according
//! to what the reply and the I/O said.

use std::sync::Arc;

use async_trait::async_trait;
use jiff::Timestamp;

use skiff_core::{
    Backend, Behavior, Cause, Condition, CopyOptions, Dialect, Dict, Error, Listing, Method,
    Object, PlainDialect, Profile, PutOptions, Range, ReplyConsumer, Request, Result,
    SystemMetadata, Target, Upload, gen_http_request, gen_url, metadata_from_headers,
};

use crate::connection::Connection;
use crate::pool::ConnectionPool;
use crate::reply::{Reply, read_http_reply, read_http_reply_buffered};

/// Terminates the header block; the framer leaves it to the transport
const CRLF: &[u8] = b"\r\n";

/// [`Backend`] over the pooled HTTP/1.1 transport
pub struct HttpBackend<D = PlainDialect> {
    profile: Arc<Profile>,
    pool: ConnectionPool,
    dialect: D,
}

impl HttpBackend<PlainDialect> {
    /// Unsigned backend for a profile
    pub fn new(profile: Profile) -> Result<Self> {
        Self::with_dialect(profile, PlainDialect)
    }
}

impl<D: Dialect> HttpBackend<D> {
    pub fn with_dialect(profile: Profile, dialect: D) -> Result<Self> {
        let pool = ConnectionPool::new(&profile)?;
        Ok(Self::with_pool(Arc::new(profile), pool, dialect))
    }

    /// Backend sharing an existing pool
    pub fn with_pool(profile: Arc<Profile>, pool: ConnectionPool, dialect: D) -> Self {
        Self {
            profile,
            pool,
            dialect,
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn request(&self, method: Method, target: &Target) -> Result<Request> {
        let mut req = Request::new(Arc::clone(&self.profile), method);
        req.set_bucket(&target.bucket)?;
        req.set_resource(&target.resource)?;
        if let Some(sub) = &target.subresource {
            req.set_subresource(sub)?;
        }
        req.add_behavior(Behavior::KEEP_ALIVE);
        Ok(req)
    }

    fn apply_put_options(req: &mut Request, options: &PutOptions) {
        req.add_metadata(&options.metadata);
        if let Some(acl) = options.acl {
            req.set_canned_acl(acl);
        }
        if let Some(content_type) = &options.content_type {
            req.set_content_type(content_type);
        }
        if options.encrypted {
            req.add_behavior(Behavior::ENCRYPT);
        }
    }

    /// Build, sign and frame; nothing touches the network yet
    fn frame(&self, req: &mut Request, query: Option<&Dict>) -> Result<(Vec<u8>, String)> {
        let mut headers = req.build()?;
        self.dialect.sign(req, &mut headers)?;
        let frame = gen_http_request(req, &headers, query, self.profile.max_header_size)?;
        let host = req
            .host()
            .ok_or_else(|| Error::InvalidArgument("request has no host".into()))?
            .to_string();
        Ok((frame, host))
    }

    /// One request/reply exchange with the body held in memory
    async fn exchange(
        &self,
        mut req: Request,
        query: Option<&Dict>,
        body: &[u8],
        want_body: bool,
    ) -> Result<Reply> {
        let (frame, host) = self.frame(&mut req, query)?;
        tracing::debug!(method = %req.method(), host = %host, body = body.len(), "exchange");
        let mut conn = self.pool.open_host(&host, req.port()).await?;
        let result = send_and_read(&mut conn, &[frame.as_slice(), CRLF, body], want_body).await;
        conn.finish();
        result
    }

    /// Like [`exchange`](Self::exchange) but streams the reply into `consumer`
    async fn exchange_streamed(
        &self,
        mut req: Request,
        consumer: &mut dyn ReplyConsumer,
    ) -> Result<Reply> {
        let (frame, host) = self.frame(&mut req, None)?;
        tracing::debug!(method = %req.method(), host = %host, "streamed exchange");
        let mut conn = self.pool.open_host(&host, req.port()).await?;
        let result = async {
            conn.write_all(&[frame.as_slice(), CRLF]).await?;
            read_http_reply_buffered(&mut conn, true, consumer).await
        }
        .await;
        conn.finish();
        result
    }

    /// Send headers with `Expect: 100-continue` and hand the connection to
    /// an upload once the peer agrees to take the body
    async fn start_upload(&self, mut req: Request, data_len: u64) -> Result<Box<dyn Upload>> {
        req.set_chunk(None, data_len);
        req.add_behavior(Behavior::EXPECT);
        let (frame, host) = self.frame(&mut req, None)?;
        tracing::debug!(method = %req.method(), host = %host, data_len, "streamed upload");
        let mut conn = self.pool.open_host(&host, req.port()).await?;

        let continued = async {
            conn.write_all(&[frame.as_slice(), CRLF]).await?;
            let reply = read_http_reply(&mut conn, true).await?;
            if reply.status != 100 {
                return Err(Error::unreachable(
                    Cause::Protocol,
                    format!("expected 100 Continue, got {}", reply.status),
                ));
            }
            Ok::<(), Error>(())
        }
        .await;

        match continued {
            Ok(()) => Ok(Box::new(HttpUpload {
                conn: Some(conn),
                remaining: data_len,
            })),
            Err(e) => {
                // the peer may still expect a body we will never send
                conn.terminate();
                Err(e)
            }
        }
    }

    async fn head_reply(&self, target: &Target, condition: Option<&Condition>) -> Result<Reply> {
        let mut req = self.request(Method::Head, target)?;
        if let Some(condition) = condition {
            req.set_condition(condition);
        }
        self.exchange(req, None, &[], false).await
    }

    async fn get_reply(
        &self,
        target: &Target,
        condition: Option<&Condition>,
        range: Option<Range>,
    ) -> Result<Object> {
        let mut req = self.request(Method::Get, target)?;
        if let Some(condition) = condition {
            req.set_condition(condition);
        }
        if let Some(range) = range {
            req.set_range(range);
        }
        let reply = self.exchange(req, None, &[], true).await?;
        Ok(Object {
            metadata: metadata_from_headers(&reply.headers, &self.profile.header_prefix),
            data: reply.body.unwrap_or_default(),
        })
    }
}

async fn send_and_read(conn: &mut Connection, bufs: &[&[u8]], want_body: bool) -> Result<Reply> {
    conn.write_all(bufs).await?;
    loop {
        let reply = read_http_reply(conn, want_body).await?;
        if !reply.is_interim() {
            return Ok(reply);
        }
    }
}

/// Streamed request body on a checked-out connection
struct HttpUpload {
    conn: Option<Connection>,
    remaining: u64,
}

#[async_trait]
impl Upload for HttpUpload {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() as u64 > self.remaining {
            return Err(Error::InvalidArgument(format!(
                "write of {} bytes exceeds the {} declared bytes left",
                buf.len(),
                self.remaining
            )));
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::unreachable(Cause::Closed, "upload already finished"))?;
        conn.write_all(&[buf]).await?;
        self.remaining -= buf.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<Dict> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| Error::unreachable(Cause::Closed, "upload already finished"))?;
        if self.remaining != 0 {
            // dropping the connection terminates it
            return Err(Error::InvalidArgument(format!(
                "upload ended {} bytes short of its declared length",
                self.remaining
            )));
        }
        let result = send_and_read(&mut conn, &[], true).await;
        conn.finish();
        Ok(result?.headers)
    }
}

#[async_trait]
impl<D: Dialect> Backend for HttpBackend<D> {
    async fn list_bucket(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Listing> {
        tracing::debug!(bucket, ?prefix, ?delimiter, "list_bucket");
        let req = self.request(Method::Get, &Target::new(bucket, ""))?;
        let mut query = Dict::new();
        if let Some(prefix) = prefix {
            query.insert("prefix", prefix);
        }
        if let Some(delimiter) = delimiter {
            query.insert("delimiter", delimiter);
        }
        let query = (!query.is_empty()).then_some(query);
        let reply = self.exchange(req, query.as_ref(), &[], true).await?;
        self.dialect
            .parse_listing(reply.body.as_deref().unwrap_or_default())
    }

    async fn get(&self, target: &Target, condition: Option<&Condition>) -> Result<Object> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, "get");
        self.get_reply(target, condition, None).await
    }

    async fn get_range(
        &self,
        target: &Target,
        condition: Option<&Condition>,
        range: Range,
    ) -> Result<Object> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, range = %range.header_value(), "get_range");
        self.get_reply(target, condition, Some(range)).await
    }

    async fn get_buffered(
        &self,
        target: &Target,
        condition: Option<&Condition>,
        range: Option<Range>,
        consumer: &mut dyn ReplyConsumer,
    ) -> Result<()> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, "get_buffered");
        let mut req = self.request(Method::Get, target)?;
        if let Some(condition) = condition {
            req.set_condition(condition);
        }
        if let Some(range) = range {
            req.set_range(range);
        }
        self.exchange_streamed(req, consumer).await.map(|_| ())
    }

    async fn put(&self, target: &Target, options: &PutOptions, data: &[u8]) -> Result<()> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, len = data.len(), "put");
        let mut req = self.request(Method::Put, target)?;
        Self::apply_put_options(&mut req, options);
        req.add_behavior(Behavior::MD5);
        req.set_chunk(Some(data), data.len() as u64);
        self.exchange(req, None, data, true).await.map(|_| ())
    }

    async fn put_buffered(
        &self,
        target: &Target,
        options: &PutOptions,
        data_len: u64,
    ) -> Result<Box<dyn Upload>> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, data_len, "put_buffered");
        let mut req = self.request(Method::Put, target)?;
        Self::apply_put_options(&mut req, options);
        self.start_upload(req, data_len).await
    }

    async fn post(
        &self,
        target: &Target,
        options: &PutOptions,
        data: &[u8],
    ) -> Result<Option<String>> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, len = data.len(), "post");
        let mut req = self.request(Method::Post, target)?;
        Self::apply_put_options(&mut req, options);
        req.set_chunk(Some(data), data.len() as u64);
        let reply = self.exchange(req, None, data, true).await?;
        Ok(reply.header("location"))
    }

    async fn post_buffered(
        &self,
        target: &Target,
        options: &PutOptions,
        data_len: u64,
    ) -> Result<Box<dyn Upload>> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, data_len, "post_buffered");
        let mut req = self.request(Method::Post, target)?;
        Self::apply_put_options(&mut req, options);
        self.start_upload(req, data_len).await
    }

    async fn head(&self, target: &Target, condition: Option<&Condition>) -> Result<Dict> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, "head");
        let reply = self.head_reply(target, condition).await?;
        Ok(metadata_from_headers(
            &reply.headers,
            &self.profile.header_prefix,
        ))
    }

    async fn head_all(&self, target: &Target, condition: Option<&Condition>) -> Result<Dict> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, "head_all");
        Ok(self.head_reply(target, condition).await?.headers)
    }

    async fn head_sysmd(
        &self,
        target: &Target,
        condition: Option<&Condition>,
    ) -> Result<SystemMetadata> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, "head_sysmd");
        let reply = self.head_reply(target, condition).await?;
        Ok(SystemMetadata::from_headers(
            &reply.headers,
            &self.profile.delimiter,
            &target.resource,
        ))
    }

    async fn delete(&self, target: &Target) -> Result<()> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, "delete");
        let req = self.request(Method::Delete, target)?;
        self.exchange(req, None, &[], true).await.map(|_| ())
    }

    async fn copy(&self, src: &Target, dst: &Target, options: &CopyOptions) -> Result<()> {
        tracing::debug!(
            src_bucket = %src.bucket,
            src = %src.resource,
            dst_bucket = %dst.bucket,
            dst = %dst.resource,
            "copy"
        );
        let mut req = self.request(Method::Put, dst)?;
        req.set_src_bucket(&src.bucket)?;
        req.set_src_resource(&src.resource)?;
        if let Some(sub) = &src.subresource {
            req.set_src_subresource(sub)?;
        }
        req.add_behavior(Behavior::COPY);
        req.set_metadata_directive(options.directive);
        req.add_metadata(&options.metadata);
        if let Some(acl) = options.acl {
            req.set_canned_acl(acl);
        }
        if let Some(condition) = &options.condition {
            req.set_copy_source_condition(condition);
        }
        self.exchange(req, None, &[], true).await.map(|_| ())
    }

    async fn genurl(&self, target: &Target, expires: Timestamp) -> Result<String> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, %expires, "genurl");
        let mut req = Request::new(Arc::clone(&self.profile), Method::Get);
        req.set_bucket(&target.bucket)?;
        req.set_resource(&target.resource)?;
        req.add_behavior(Behavior::QUERY_STRING);
        req.set_expires(expires);
        let mut headers = req.build()?;
        self.dialect.sign(&req, &mut headers)?;
        gen_url(&req, &headers)
    }

    async fn get_id_path(&self, bucket: &str) -> Result<Option<String>> {
        Ok(self.dialect.id_path(bucket))
    }
}

