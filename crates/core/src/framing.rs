//! HTTP/1.1 request framing
//!
//! Serializes a built [`Request`] and its header store into a request line and
//! header block, or into a pre-signed URL. Both share the resource and query
//! serialization so a URL and a framed request address the same object.
//!
//! The blank line ending the header block is left to the transport, which
//! appends it together with the body.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::profile::Profile;
use crate::request::Request;

/// Characters left alone: RFC 3986 unreserved set
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Unreserved set plus the path separator
const PATH: &AsciiSet = &UNRESERVED.remove(b'/');

/// Wire form of a resource, always starting with exactly one `/`
pub fn encode_resource(resource: &str, profile: &Profile) -> String {
    if profile.url_encoding && profile.encode_slashes {
        // only the separator is literal; further leading slashes are key bytes
        let key = resource.strip_prefix('/').unwrap_or(resource);
        return format!("/{}", utf8_percent_encode(key, UNRESERVED));
    }
    let key = resource.trim_start_matches('/');
    if profile.url_encoding {
        format!("/{}", utf8_percent_encode(key, PATH))
    } else {
        format!("/{key}")
    }
}

fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, UNRESERVED).to_string()
}

/// Path and query string of a request as sent on the wire
pub fn request_target(req: &Request, query: Option<&Dict>) -> Result<String> {
    let resource = req
        .resource()
        .ok_or_else(|| Error::InvalidArgument("resource not set".into()))?;
    let profile = req.profile();

    let mut target = String::new();
    if let (Some(bucket), false) = (req.bucket(), req.bucket_in_host()) {
        target.push('/');
        target.push_str(bucket);
    }
    target.push_str(&encode_resource(resource, profile));

    let mut sep = '?';
    if let Some(sub) = req.subresource().filter(|s| !s.is_empty()) {
        target.push(sep);
        target.push_str(sub);
        sep = '&';
    }
    if let Some(query) = query {
        for (key, value) in query.iter() {
            target.push(sep);
            target.push_str(&encode_query_value(key));
            target.push('=');
            target.push_str(&encode_query_value(&value.joined()));
            sep = '&';
        }
    }
    Ok(target)
}

/// Append-only buffer that refuses to grow past a fixed budget
struct Framer {
    buf: Vec<u8>,
    max_len: usize,
}

impl Framer {
    fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_len.min(4096)),
            max_len,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > self.max_len {
            return Err(Error::Framing(format!(
                "request header exceeds {} bytes",
                self.max_len
            )));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}

/// Frame the request line and header block
///
/// Produces `METHOD SP target SP HTTP/1.1 CRLF` followed by one
/// `Key: Value CRLF` line per header in insertion order.
pub fn gen_http_request(
    req: &Request,
    headers: &Dict,
    query: Option<&Dict>,
    max_len: usize,
) -> Result<Vec<u8>> {
    let target = request_target(req, query)?;
    let mut framer = Framer::new(max_len);

    framer.push(req.method().as_str().as_bytes())?;
    framer.push(b" ")?;
    framer.push(target.as_bytes())?;
    framer.push(b" HTTP/1.1\r\n")?;

    for (key, value) in headers.iter() {
        let value = value.joined();
        tracing::trace!(header = key, value = %value, "framing header");
        framer.push(key.as_bytes())?;
        framer.push(b": ")?;
        framer.push(value.as_bytes())?;
        framer.push(b"\r\n")?;
    }

    Ok(framer.buf)
}

/// Produce a pre-signed URL
///
/// Every header store entry except `Host` becomes a query parameter, so
/// whatever the dialect put there (expiry, key id, signature) travels in the
/// URL instead of in headers.
pub fn gen_url(req: &Request, headers: &Dict) -> Result<String> {
    let host = req
        .host()
        .ok_or_else(|| Error::InvalidArgument("request not built".into()))?;
    let profile = req.profile();

    let params: Dict = headers
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case("host"))
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    let target = request_target(req, Some(&params))?;

    let default_port = if profile.use_https { 443 } else { 80 };
    if profile.port == default_port {
        Ok(format!("{}://{host}{target}", profile.scheme()))
    } else {
        Ok(format!("{}://{host}:{}{target}", profile.scheme(), profile.port))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use jiff::Timestamp;

    use super::*;
    use crate::request::{Behavior, Method};

    fn request(profile: Profile, bucket: &str, resource: &str) -> Request {
        let mut req = Request::new(Arc::new(profile), Method::Get);
        req.set_bucket(bucket).unwrap();
        req.set_resource(resource).unwrap();
        req
    }

    fn request_line(framed: &[u8]) -> String {
        let text = String::from_utf8(framed.to_vec()).unwrap();
        text.split("\r\n").next().unwrap().to_string()
    }

    #[test]
    fn test_virtual_hosted_request_line() {
        let mut req = request(Profile::new("p", "s3.amazonaws.com"), "examplebucket", "/test.txt");
        req.add_behavior(Behavior::VIRTUAL_HOSTING);
        let headers = req.build().unwrap();
        let framed = gen_http_request(&req, &headers, None, 8192).unwrap();
        assert_eq!(request_line(&framed), "GET /test.txt HTTP/1.1");
    }

    #[test]
    fn test_path_style_request_line() {
        let mut req = request(Profile::new("p", "s3.amazonaws.com"), "examplebucket", "/test.txt");
        req.rm_behavior(Behavior::VIRTUAL_HOSTING);
        let headers = req.build().unwrap();
        let framed = gen_http_request(&req, &headers, None, 8192).unwrap();
        assert_eq!(
            request_line(&framed),
            "GET /examplebucket/test.txt HTTP/1.1"
        );
    }

    #[test]
    fn test_header_block_shape() {
        let mut req = request(Profile::new("p", "h"), "b", "k");
        let headers = req.build().unwrap();
        let framed = gen_http_request(&req, &headers, None, 8192).unwrap();
        let text = String::from_utf8(framed).unwrap();

        assert!(text.starts_with("GET "));
        assert!(text.ends_with("\r\n"));
        assert!(!text.ends_with("\r\n\r\n"));
        let first = text.lines().next().unwrap();
        assert_eq!(first.matches(' ').count(), 2);
        assert!(text.contains("\r\nHost: h\r\n"));
    }

    #[test]
    fn test_leading_separator_normalized() {
        let profile = Profile::new("p", "h");
        assert_eq!(encode_resource("a/b", &profile), "/a/b");
        assert_eq!(encode_resource("/a/b", &profile), "/a/b");
        assert_eq!(encode_resource("", &profile), "/");
    }

    #[test]
    fn test_encoding_policies() {
        let mut profile = Profile::new("p", "h");
        assert_eq!(encode_resource("/dir/my file", &profile), "/dir/my%20file");

        profile.encode_slashes = true;
        assert_eq!(encode_resource("/dir/my file", &profile), "/dir%2Fmy%20file");
        assert_eq!(encode_resource("//lead", &profile), "/%2Flead");

        profile.url_encoding = false;
        assert_eq!(encode_resource("dir/my file", &profile), "/dir/my file");
    }

    #[test]
    fn test_query_order_is_insertion_order() {
        let mut req = request(Profile::new("p", "h"), "b", "/");
        req.set_subresource("acl").unwrap();
        let mut query = Dict::new();
        query.insert("prefix", "photos/2024 jan");
        query.insert("delimiter", "/");
        let headers = req.build().unwrap();
        let framed = gen_http_request(&req, &headers, Some(&query), 8192).unwrap();
        assert_eq!(
            request_line(&framed),
            "GET /b/?acl&prefix=photos%2F2024%20jan&delimiter=%2F HTTP/1.1"
        );
    }

    #[test]
    fn test_overflow_is_framing_error() {
        let mut req = request(Profile::new("p", "h"), "b", "/k");
        let headers = req.build().unwrap();
        let err = gen_http_request(&req, &headers, None, 16).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[test]
    fn test_gen_url() {
        let mut profile = Profile::new("p", "h").with_credentials("AK", "SK");
        profile.port = 9000;
        let mut req = request(profile, "b", "/a b");
        req.add_behavior(Behavior::QUERY_STRING);
        req.set_expires(Timestamp::from_second(1_700_000_000).unwrap());
        let headers = req.build().unwrap();
        let url = gen_url(&req, &headers).unwrap();
        assert_eq!(url, "http://h:9000/b/a%20b?Expires=1700000000");
    }
}
