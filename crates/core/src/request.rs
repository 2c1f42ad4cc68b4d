//! Request descriptor
//!
//! A [`Request`] accumulates everything one storage operation needs: method,
//! addressing, conditions, range, metadata and behavior flags. [`Request::build`]
//! turns it into the canonical header store a dialect signs and the framer
//! serializes. Building captures the request date, so it happens exactly once.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bitflags::bitflags;
use jiff::Timestamp;
use md5::{Digest, Md5};

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::profile::Profile;

/// Maximum length of a bucket, resource, or inode key
pub const MAX_PATH_LEN: usize = 1024;

/// Format of HTTP dates (RFC 1123, always GMT)
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

bitflags! {
    /// Request construction options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Behavior: u32 {
        /// Address the bucket as a subdomain of the host
        const VIRTUAL_HOSTING = 1 << 0;
        /// Send a Content-MD5 header computed from the chunk
        const MD5 = 1 << 1;
        /// Body is encrypted on the fly; its digest cannot be sent up front
        const ENCRYPT = 1 << 2;
        /// Send `Expect: 100-continue` and wait before streaming the body
        const EXPECT = 1 << 3;
        /// Authenticate through the query string instead of headers
        const QUERY_STRING = 1 << 4;
        /// Server-side copy from the source bucket/resource
        const COPY = 1 << 5;
        /// Ask the peer to keep the connection open
        const KEEP_ALIVE = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Head,
    Delete,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predefined access policies applied to written objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CannedAcl {
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
}

impl CannedAcl {
    pub const fn as_str(self) -> &'static str {
        match self {
            CannedAcl::Private => "private",
            CannedAcl::PublicRead => "public-read",
            CannedAcl::PublicReadWrite => "public-read-write",
            CannedAcl::AuthenticatedRead => "authenticated-read",
            CannedAcl::BucketOwnerRead => "bucket-owner-read",
            CannedAcl::BucketOwnerFullControl => "bucket-owner-full-control",
        }
    }
}

/// Whether a copy keeps the source metadata or replaces it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataDirective {
    Copy,
    Replace,
}

impl MetadataDirective {
    pub const fn as_str(self) -> &'static str {
        match self {
            MetadataDirective::Copy => "COPY",
            MetadataDirective::Replace => "REPLACE",
        }
    }
}

/// One conditional predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    IfModifiedSince(Timestamp),
    IfUnmodifiedSince(Timestamp),
    IfMatch(String),
    IfNoneMatch(String),
}

impl Predicate {
    fn header_suffix(&self) -> &'static str {
        match self {
            Predicate::IfModifiedSince(_) => "if-modified-since",
            Predicate::IfUnmodifiedSince(_) => "if-unmodified-since",
            Predicate::IfMatch(_) => "if-match",
            Predicate::IfNoneMatch(_) => "if-none-match",
        }
    }

    fn header_name(&self) -> &'static str {
        match self {
            Predicate::IfModifiedSince(_) => "If-Modified-Since",
            Predicate::IfUnmodifiedSince(_) => "If-Unmodified-Since",
            Predicate::IfMatch(_) => "If-Match",
            Predicate::IfNoneMatch(_) => "If-None-Match",
        }
    }

    fn header_value(&self) -> String {
        match self {
            Predicate::IfModifiedSince(ts) | Predicate::IfUnmodifiedSince(ts) => {
                http_date(*ts)
            }
            Predicate::IfMatch(etag) | Predicate::IfNoneMatch(etag) => etag.clone(),
        }
    }
}

/// Ordered set of predicates, all of which are emitted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition {
    predicates: Vec<Predicate>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn push(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// Byte range with optional bounds; at least one bound is defined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    start: Option<u64>,
    end: Option<u64>,
}

impl Range {
    pub fn new(start: Option<u64>, end: Option<u64>) -> Result<Self> {
        if start.is_none() && end.is_none() {
            return Err(Error::InvalidArgument(
                "range needs a start or an end".into(),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Option<u64> {
        self.start
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Value of the `Range` header
    pub fn header_value(&self) -> String {
        match (self.start, self.end) {
            (Some(s), Some(e)) => format!("bytes={s}-{e}"),
            (Some(s), None) => format!("bytes={s}-"),
            (None, Some(e)) => format!("bytes=-{e}"),
            // unreachable by construction
            (None, None) => "bytes=0-".to_string(),
        }
    }
}

/// Request body descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub len: u64,
    md5: Option<[u8; 16]>,
}

/// Render a timestamp as an HTTP date
pub fn http_date(ts: Timestamp) -> String {
    ts.strftime(HTTP_DATE_FORMAT).to_string()
}

fn check_len(what: &str, value: &str) -> Result<()> {
    if value.len() > MAX_PATH_LEN {
        return Err(Error::NameTooLong(format!(
            "{what} exceeds {MAX_PATH_LEN} bytes"
        )));
    }
    Ok(())
}

/// Mutable descriptor of one storage operation
#[derive(Debug, Clone)]
pub struct Request {
    profile: Arc<Profile>,
    method: Method,
    bucket: Option<String>,
    resource: Option<String>,
    subresource: Option<String>,
    src_bucket: Option<String>,
    src_resource: Option<String>,
    src_subresource: Option<String>,
    metadata: Dict,
    canned_acl: Option<CannedAcl>,
    metadata_directive: Option<MetadataDirective>,
    content_type: Option<String>,
    condition: Condition,
    copy_source_condition: Condition,
    range: Option<Range>,
    expires: Option<Timestamp>,
    chunk: Option<Chunk>,
    behavior: Behavior,
    host: Option<String>,
    built: bool,
}

impl Request {
    /// Create a request for a profile; virtual hosting follows the profile
    pub fn new(profile: Arc<Profile>, method: Method) -> Self {
        let behavior = if profile.virtual_hosting {
            Behavior::VIRTUAL_HOSTING
        } else {
            Behavior::empty()
        };
        Self {
            profile,
            method,
            bucket: None,
            resource: None,
            subresource: None,
            src_bucket: None,
            src_resource: None,
            src_subresource: None,
            metadata: Dict::new(),
            canned_acl: None,
            metadata_directive: None,
            content_type: None,
            condition: Condition::new(),
            copy_source_condition: Condition::new(),
            range: None,
            expires: None,
            chunk: None,
            behavior,
            host: None,
            built: false,
        }
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn set_bucket(&mut self, bucket: &str) -> Result<()> {
        check_len("bucket", bucket)?;
        self.bucket = Some(bucket.to_string());
        Ok(())
    }

    pub fn set_resource(&mut self, resource: &str) -> Result<()> {
        check_len("resource", resource)?;
        self.resource = Some(resource.to_string());
        Ok(())
    }

    pub fn set_subresource(&mut self, subresource: &str) -> Result<()> {
        check_len("subresource", subresource)?;
        self.subresource = Some(subresource.to_string());
        Ok(())
    }

    pub fn set_src_bucket(&mut self, bucket: &str) -> Result<()> {
        check_len("source bucket", bucket)?;
        self.src_bucket = Some(bucket.to_string());
        Ok(())
    }

    pub fn set_src_resource(&mut self, resource: &str) -> Result<()> {
        check_len("source resource", resource)?;
        self.src_resource = Some(resource.to_string());
        Ok(())
    }

    pub fn set_src_subresource(&mut self, subresource: &str) -> Result<()> {
        check_len("source subresource", subresource)?;
        self.src_subresource = Some(subresource.to_string());
        Ok(())
    }

    pub fn set_condition(&mut self, condition: &Condition) {
        self.condition = condition.clone();
    }

    pub fn set_copy_source_condition(&mut self, condition: &Condition) {
        self.copy_source_condition = condition.clone();
    }

    /// Set the byte range; both bounds undefined is rejected
    pub fn add_range(&mut self, start: Option<u64>, end: Option<u64>) -> Result<()> {
        self.range = Some(Range::new(start, end)?);
        Ok(())
    }

    pub fn set_range(&mut self, range: Range) {
        self.range = Some(range);
    }

    pub fn set_expires(&mut self, expires: Timestamp) {
        self.expires = Some(expires);
    }

    /// Merge user metadata; existing keys are replaced
    pub fn add_metadata(&mut self, metadata: &Dict) {
        self.metadata.merge(metadata);
    }

    pub fn set_canned_acl(&mut self, acl: CannedAcl) {
        self.canned_acl = Some(acl);
    }

    pub fn set_metadata_directive(&mut self, directive: MetadataDirective) {
        self.metadata_directive = Some(directive);
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_string());
    }

    /// Describe the request body. When the buffer is known its MD5 is taken
    /// now, so the buffer need not outlive the request.
    pub fn set_chunk(&mut self, data: Option<&[u8]>, len: u64) {
        let md5 = data.map(|d| {
            let mut out = [0u8; 16];
            out.copy_from_slice(&Md5::digest(d));
            out
        });
        self.chunk = Some(Chunk { len, md5 });
    }

    pub fn add_behavior(&mut self, flags: Behavior) {
        self.behavior.insert(flags);
    }

    pub fn rm_behavior(&mut self, flags: Behavior) {
        self.behavior.remove(flags);
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn subresource(&self) -> Option<&str> {
        self.subresource.as_deref()
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn expires(&self) -> Option<Timestamp> {
        self.expires
    }

    /// Whether the bucket travels in the Host header rather than the path
    pub fn bucket_in_host(&self) -> bool {
        self.behavior.contains(Behavior::VIRTUAL_HOSTING) && self.bucket.is_some()
    }

    /// Host to dial, resolved by [`Request::build`]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.profile.port
    }

    /// Produce the canonical header store
    pub fn build(&mut self) -> Result<Dict> {
        if self.built {
            return Err(Error::InvalidArgument("request already built".into()));
        }
        if self.resource.is_none() {
            return Err(Error::InvalidArgument("resource not set".into()));
        }
        self.built = true;

        let profile = Arc::clone(&self.profile);
        let prefix = profile.header_prefix.as_str();
        let mut headers = Dict::new();

        let host = match (&self.bucket, self.bucket_in_host()) {
            (Some(bucket), true) => format!("{bucket}.{}", profile.host),
            _ => profile.host.clone(),
        };
        let host_header = if profile.port == 80 {
            host.clone()
        } else {
            format!("{host}:{}", profile.port)
        };
        headers.insert("Host", host_header);
        self.host = Some(host);

        let query_auth = self.behavior.contains(Behavior::QUERY_STRING);
        if query_auth {
            let expires = self.expires.ok_or_else(|| {
                Error::InvalidArgument("query string authentication needs an expiry".into())
            })?;
            headers.insert("Expires", expires.as_second().to_string());
        } else {
            headers.insert("Date", http_date(Timestamp::now()));
        }

        if let Some(range) = &self.range {
            headers.insert("Range", range.header_value());
        }

        for predicate in self.condition.predicates() {
            headers.insert(predicate.header_name(), predicate.header_value());
        }

        if let Some(chunk) = &self.chunk {
            headers.insert("Content-Length", chunk.len.to_string());
            let wants_md5 = self.behavior.contains(Behavior::MD5)
                && !self.behavior.contains(Behavior::ENCRYPT);
            if let (true, Some(digest)) = (wants_md5, chunk.md5) {
                headers.insert("Content-MD5", STANDARD.encode(digest));
            }
        } else if matches!(self.method, Method::Put | Method::Post) {
            headers.insert("Content-Length", "0");
        }

        if let Some(content_type) = &self.content_type {
            headers.insert("Content-Type", content_type.as_str());
        }

        if self.behavior.contains(Behavior::EXPECT) {
            headers.insert("Expect", "100-continue");
        }

        if let Some(acl) = self.canned_acl {
            headers.insert(format!("{prefix}acl"), acl.as_str());
        }

        if self.behavior.contains(Behavior::COPY) {
            let src_bucket = self
                .src_bucket
                .as_deref()
                .ok_or_else(|| Error::InvalidArgument("copy needs a source bucket".into()))?;
            let src_resource = self
                .src_resource
                .as_deref()
                .ok_or_else(|| Error::InvalidArgument("copy needs a source resource".into()))?;
            let mut source = format!(
                "/{src_bucket}{}",
                crate::framing::encode_resource(src_resource, &profile)
            );
            if let Some(sub) = &self.src_subresource {
                source.push('?');
                source.push_str(sub);
            }
            headers.insert(format!("{prefix}copy-source"), source);
            if let Some(directive) = self.metadata_directive {
                headers.insert(format!("{prefix}metadata-directive"), directive.as_str());
            }
            for predicate in self.copy_source_condition.predicates() {
                headers.insert(
                    format!("{prefix}copy-source-{}", predicate.header_suffix()),
                    predicate.header_value(),
                );
            }
        }

        for (key, value) in self.metadata.iter() {
            headers.insert(format!("{prefix}meta-{key}"), value.clone());
        }

        if self.behavior.contains(Behavior::KEEP_ALIVE) {
            headers.insert("Connection", "keep-alive");
        }

        if !query_auth {
            if let (Some(access), Some(secret)) = (&profile.access_key, &profile.secret_key) {
                let token = STANDARD.encode(format!("{access}:{secret}"));
                headers.insert("Authorization", format!("Basic {token}"));
            }
        }

        tracing::trace!(method = %self.method, headers = headers.len(), "request built");
        Ok(headers)
    }
}
