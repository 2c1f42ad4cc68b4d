//! Backend trait definition
//!
//! [`Backend`] is the dispatch table every storage backend implements. Each
//! operation has a default body returning [`Error::NotSupported`], so a
//! backend only overrides what it can do and callers get a clean error for
//! the rest.
//!
//! [`Dialect`] carries the backend-specific pieces the generic HTTP adapter
//! cannot know: request signing, listing decoding and ID-path policy.

use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::request::{CannedAcl, Condition, MetadataDirective, Range, Request};

/// Addresses one resource in one bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub bucket: String,
    pub resource: String,
    pub subresource: Option<String>,
}

impl Target {
    pub fn new(bucket: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            resource: resource.into(),
            subresource: None,
        }
    }

    pub fn with_subresource(mut self, subresource: impl Into<String>) -> Self {
        self.subresource = Some(subresource.into());
        self
    }
}

/// Options for writes
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub metadata: Dict,
    pub acl: Option<CannedAcl>,
    pub content_type: Option<String>,
    /// Body is encrypted on the fly by the caller
    pub encrypted: bool,
}

/// Options for server-side copies
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub directive: MetadataDirective,
    pub metadata: Dict,
    pub acl: Option<CannedAcl>,
    pub condition: Option<Condition>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            directive: MetadataDirective::Copy,
            metadata: Dict::new(),
            acl: None,
            condition: None,
        }
    }
}

/// One object returned by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ObjectEntry {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified: None,
            etag: None,
        }
    }
}

/// Result of one prefix/delimiter LIST call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub objects: Vec<ObjectEntry>,
    #[serde(default)]
    pub common_prefixes: Vec<String>,
}

/// Kind of a namespace entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Directory,
    Regular,
    Undefined,
}

/// System metadata extracted from reply headers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemMetadata {
    pub size: Option<u64>,
    pub last_modified: Option<Timestamp>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub file_type: Option<FileType>,
}

impl SystemMetadata {
    /// Size formatted for display
    pub fn size_human(&self) -> Option<String> {
        self.size
            .map(|s| humansize::format_size(s, humansize::BINARY))
    }

    /// Extract system metadata from a reply header store
    pub fn from_headers(headers: &Dict, delimiter: &str, resource: &str) -> Self {
        let field = |name: &str| headers.get_ci(name).map(|v| v.joined());
        let size = field("content-length").and_then(|v| v.trim().parse().ok());
        let last_modified = field("last-modified").and_then(|v| parse_http_date(&v));
        let etag = field("etag").map(|e| e.trim_matches('"').to_string());
        let file_type = if !delimiter.is_empty() && resource.ends_with(delimiter) {
            FileType::Directory
        } else {
            FileType::Regular
        };
        Self {
            size,
            last_modified,
            etag,
            content_type: field("content-type"),
            file_type: Some(file_type),
        }
    }
}

/// Parse an RFC 1123 HTTP date
pub fn parse_http_date(value: &str) -> Option<Timestamp> {
    let tm = jiff::fmt::strtime::parse(crate::request::HTTP_DATE_FORMAT, value.trim()).ok()?;
    let dt = tm.to_datetime().ok()?;
    dt.to_zoned(jiff::tz::TimeZone::UTC)
        .ok()
        .map(|zoned| zoned.timestamp())
}

/// Object body plus its user metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Object {
    pub data: Vec<u8>,
    pub metadata: Dict,
}

/// Extract user metadata (`{prefix}meta-*`) from reply headers
pub fn metadata_from_headers(headers: &Dict, header_prefix: &str) -> Dict {
    let marker = format!("{}meta-", header_prefix.to_ascii_lowercase());
    headers
        .iter()
        .filter_map(|(k, v)| {
            let lower = k.to_ascii_lowercase();
            lower
                .strip_prefix(&marker)
                .map(|name| (name.to_string(), v.clone()))
        })
        .collect()
}

/// Consumer of a streamed reply
///
/// Returning an error from either method aborts the read; the error is
/// returned verbatim by the operation that drove the consumer.
pub trait ReplyConsumer: Send {
    fn on_header(&mut self, _name: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    fn on_chunk(&mut self, chunk: &[u8]) -> Result<()>;
}

/// Consumer that accumulates a reply in memory
#[derive(Debug, Default)]
pub struct CollectingConsumer {
    pub headers: Dict,
    pub data: Vec<u8>,
}

impl ReplyConsumer for CollectingConsumer {
    fn on_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.headers.add(name, value);
        Ok(())
    }

    fn on_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.data.extend_from_slice(chunk);
        Ok(())
    }
}

/// An in-progress streamed upload holding a checked-out connection
#[async_trait]
pub trait Upload: Send {
    /// Send the next part of the body
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Read the final reply and dispose of the connection; returns the
    /// reply headers
    async fn finish(self: Box<Self>) -> Result<Dict>;
}

/// Backend-specific protocol hooks
pub trait Dialect: Send + Sync {
    /// Add authentication to a built header store
    fn sign(&self, _req: &Request, _headers: &mut Dict) -> Result<()> {
        Ok(())
    }

    /// Decode a listing reply body
    fn parse_listing(&self, _body: &[u8]) -> Result<Listing> {
        Err(Error::NotSupported("list_bucket"))
    }

    /// Prefix under which ID-addressed objects live
    fn id_path(&self, _bucket: &str) -> Option<String> {
        None
    }
}

/// Dialect with no signing and no listing support
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainDialect;

impl Dialect for PlainDialect {}

/// Storage backend dispatch table
///
/// Unimplemented operations fail with [`Error::NotSupported`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// List a bucket with an optional prefix and delimiter
    async fn list_bucket(
        &self,
        _bucket: &str,
        _prefix: Option<&str>,
        _delimiter: Option<&str>,
    ) -> Result<Listing> {
        Err(Error::NotSupported("list_bucket"))
    }

    async fn get(&self, _target: &Target, _condition: Option<&Condition>) -> Result<Object> {
        Err(Error::NotSupported("get"))
    }

    async fn get_range(
        &self,
        _target: &Target,
        _condition: Option<&Condition>,
        _range: Range,
    ) -> Result<Object> {
        Err(Error::NotSupported("get_range"))
    }

    /// Stream an object through a consumer
    async fn get_buffered(
        &self,
        _target: &Target,
        _condition: Option<&Condition>,
        _range: Option<Range>,
        _consumer: &mut dyn ReplyConsumer,
    ) -> Result<()> {
        Err(Error::NotSupported("get_buffered"))
    }

    async fn put(&self, _target: &Target, _options: &PutOptions, _data: &[u8]) -> Result<()> {
        Err(Error::NotSupported("put"))
    }

    /// Start a streamed upload of `data_len` bytes
    async fn put_buffered(
        &self,
        _target: &Target,
        _options: &PutOptions,
        _data_len: u64,
    ) -> Result<Box<dyn Upload>> {
        Err(Error::NotSupported("put_buffered"))
    }

    /// Create an object whose name the backend chooses; returns its location
    async fn post(
        &self,
        _target: &Target,
        _options: &PutOptions,
        _data: &[u8],
    ) -> Result<Option<String>> {
        Err(Error::NotSupported("post"))
    }

    async fn post_buffered(
        &self,
        _target: &Target,
        _options: &PutOptions,
        _data_len: u64,
    ) -> Result<Box<dyn Upload>> {
        Err(Error::NotSupported("post_buffered"))
    }

    /// User metadata of an object
    async fn head(&self, _target: &Target, _condition: Option<&Condition>) -> Result<Dict> {
        Err(Error::NotSupported("head"))
    }

    /// Every reply header of a HEAD request
    async fn head_all(&self, _target: &Target, _condition: Option<&Condition>) -> Result<Dict> {
        Err(Error::NotSupported("head_all"))
    }

    async fn head_sysmd(
        &self,
        _target: &Target,
        _condition: Option<&Condition>,
    ) -> Result<SystemMetadata> {
        Err(Error::NotSupported("head_sysmd"))
    }

    async fn delete(&self, _target: &Target) -> Result<()> {
        Err(Error::NotSupported("delete"))
    }

    async fn copy(&self, _src: &Target, _dst: &Target, _options: &CopyOptions) -> Result<()> {
        Err(Error::NotSupported("copy"))
    }

    /// Pre-signed URL valid until `expires`
    async fn genurl(&self, _target: &Target, _expires: Timestamp) -> Result<String> {
        Err(Error::NotSupported("genurl"))
    }

    /// Prefix under which ID-addressed objects live; `None` means empty
    async fn get_id_path(&self, _bucket: &str) -> Result<Option<String>> {
        Err(Error::NotSupported("get_id_path"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;

    impl Backend for Empty {}

    #[tokio::test]
    async fn test_default_slots_not_supported() {
        let backend = Empty;
        let target = Target::new("b", "/k");
        let err = backend.get(&target, None).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported("get")));
        let err = backend.delete(&target).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported("delete")));
        let err = backend.get_id_path("b").await.unwrap_err();
        assert!(matches!(err, Error::NotSupported("get_id_path")));
    }

    #[test]
    fn test_metadata_from_headers() {
        let mut headers = Dict::new();
        headers.insert("Content-Length", "12");
        headers.insert("X-Amz-Meta-Color", "blue");
        headers.insert("x-amz-meta-size", "xl");
        let md = metadata_from_headers(&headers, "x-amz-");
        assert_eq!(md.len(), 2);
        assert_eq!(md.get_str("color"), Some("blue"));
        assert_eq!(md.get_str("size"), Some("xl"));
    }

    #[test]
    fn test_system_metadata() {
        let mut headers = Dict::new();
        headers.insert("content-length", "2048");
        headers.insert("ETag", "\"abc\"");
        headers.insert("Last-Modified", "Sun, 06 Nov 1994 08:49:37 GMT");
        let sysmd = SystemMetadata::from_headers(&headers, "/", "dir/");
        assert_eq!(sysmd.size, Some(2048));
        assert_eq!(sysmd.etag.as_deref(), Some("abc"));
        assert_eq!(sysmd.file_type, Some(FileType::Directory));
        assert_eq!(
            sysmd.last_modified,
            Some(Timestamp::from_second(784111777).unwrap())
        );
        assert_eq!(sysmd.size_human().as_deref(), Some("2 KiB"));
    }

    #[test]
    fn test_collecting_consumer() {
        let mut consumer = CollectingConsumer::default();
        consumer.on_header("ETag", "x").unwrap();
        consumer.on_chunk(b"ab").unwrap();
        consumer.on_chunk(b"cd").unwrap();
        assert_eq!(consumer.data, b"abcd");
        assert_eq!(consumer.headers.get_str("ETag"), Some("x"));
    }
}
