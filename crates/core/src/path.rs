//! Path parsing and key arithmetic
//!
//! Locators have the format `bucket:path`; a locator without a colon names a
//! path in the session's current bucket. Key helpers operate on flat object
//! keys using the configured namespace delimiter, purely lexically: nothing
//! here checks that a key exists.

use crate::error::{Error, Result};

/// A parsed `bucket:path` locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    /// Bucket name, if the locator named one
    pub bucket: Option<String>,
    /// Path inside the bucket, absolute or relative to the current directory
    pub path: String,
}

impl Locator {
    pub fn new(bucket: Option<&str>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.map(str::to_string),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.bucket {
            Some(bucket) => write!(f, "{bucket}:{}", self.path),
            None => f.write_str(&self.path),
        }
    }
}

/// Parse a locator string
pub fn parse_locator(locator: &str) -> Result<Locator> {
    match locator.split_once(':') {
        Some((bucket, path)) => {
            if bucket.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "empty bucket in locator '{locator}'"
                )));
            }
            Ok(Locator::new(Some(bucket), path))
        }
        None => Ok(Locator::new(None, locator)),
    }
}

/// Key of the lexical parent directory; the root's parent is the root
pub fn parent_key(key: &str, delimiter: &str) -> String {
    if key.is_empty() || delimiter.is_empty() {
        return String::new();
    }
    let trimmed = key.strip_suffix(delimiter).unwrap_or(key);
    match trimmed.rfind(delimiter) {
        Some(pos) => trimmed[..pos + delimiter.len()].to_string(),
        None => String::new(),
    }
}

/// Final path component of a key, ignoring a trailing delimiter
pub fn last_component<'a>(key: &'a str, delimiter: &str) -> &'a str {
    if delimiter.is_empty() {
        return key;
    }
    let trimmed = key.strip_suffix(delimiter).unwrap_or(key);
    match trimmed.rfind(delimiter) {
        Some(pos) => &trimmed[pos + delimiter.len()..],
        None => trimmed,
    }
}

/// Split a path into its parent path and final name
///
/// Returns `None` for the parent when the path has no delimiter. A path
/// whose only delimiter is the leading one has the delimiter as its parent.
pub fn split_last<'a>(path: &'a str, delimiter: &str) -> (Option<&'a str>, &'a str) {
    if delimiter.is_empty() {
        return (None, path);
    }
    let trimmed = path.strip_suffix(delimiter).unwrap_or(path);
    match trimmed.rfind(delimiter) {
        Some(0) => (Some(&trimmed[..delimiter.len()]), &trimmed[delimiter.len()..]),
        Some(pos) => (Some(&trimmed[..pos]), &trimmed[pos + delimiter.len()..]),
        None => (None, trimmed),
    }
}

/// Whether a path is absolute
pub fn is_absolute(path: &str, delimiter: &str) -> bool {
    !delimiter.is_empty() && path.starts_with(delimiter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locator_with_bucket() {
        let loc = parse_locator("photos:/2024/jan").unwrap();
        assert_eq!(loc.bucket.as_deref(), Some("photos"));
        assert_eq!(loc.path, "/2024/jan");
        assert_eq!(loc.to_string(), "photos:/2024/jan");
    }

    #[test]
    fn test_parse_locator_without_bucket() {
        let loc = parse_locator("docs/readme").unwrap();
        assert_eq!(loc.bucket, None);
        assert_eq!(loc.path, "docs/readme");
    }

    #[test]
    fn test_parse_locator_empty_bucket() {
        assert!(matches!(
            parse_locator(":/x"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_parent_key() {
        assert_eq!(parent_key("a/b/c/", "/"), "a/b/");
        assert_eq!(parent_key("a/b/", "/"), "a/");
        assert_eq!(parent_key("a/", "/"), "");
        assert_eq!(parent_key("", "/"), "");
        assert_eq!(parent_key("a/file", "/"), "a/");
        assert_eq!(parent_key("x::y::", "::"), "x::");
    }

    #[test]
    fn test_last_component() {
        assert_eq!(last_component("a/b/", "/"), "b");
        assert_eq!(last_component("a/file.txt", "/"), "file.txt");
        assert_eq!(last_component("top", "/"), "top");
        assert_eq!(last_component("", "/"), "");
    }

    #[test]
    fn test_split_last() {
        assert_eq!(split_last("a/b/c", "/"), (Some("a/b"), "c"));
        assert_eq!(split_last("a/b/c/", "/"), (Some("a/b"), "c"));
        assert_eq!(split_last("/top", "/"), (Some("/"), "top"));
        assert_eq!(split_last("name", "/"), (None, "name"));
    }

    #[test]
    fn test_is_absolute() {
        assert!(is_absolute("/a", "/"));
        assert!(!is_absolute("a/b", "/"));
        assert!(!is_absolute("a", ""));
    }
}
