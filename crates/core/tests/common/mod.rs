//! In-memory backend shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use skiff_core::{
    Backend, CopyOptions, Dict, Error, Listing, MetadataDirective, Object, ObjectEntry,
    PutOptions, Range, ReplyConsumer, Result, SystemMetadata, Target, Upload,
};
use skiff_core::request::Condition;

#[derive(Debug, Clone, Default)]
pub struct Stored {
    pub data: Vec<u8>,
    pub metadata: Dict,
}

type Store = BTreeMap<(String, String), Stored>;

/// Bucket/key store with S3-style prefix/delimiter listings
#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
    lists: Arc<Mutex<usize>>,
    deletes: Arc<Mutex<Vec<String>>>,
    /// Deleting a missing key succeeds, as on S3
    idempotent_delete: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Self::default()
    }

    /// Backend whose DELETE of a missing key reports success
    pub fn idempotent() -> Self {
        Self {
            idempotent_delete: true,
            ..Self::new()
        }
    }

    pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) {
        self.store.lock().insert(
            (bucket.to_string(), key.to_string()),
            Stored {
                data: data.to_vec(),
                metadata: Dict::new(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Stored> {
        self.store
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.store
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Keys passed to DELETE, in order
    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().clone()
    }

    /// Number of LIST calls served
    pub fn list_calls(&self) -> usize {
        *self.lists.lock()
    }

    fn find(&self, target: &Target) -> Result<Stored> {
        self.object(&target.bucket, &target.resource)
            .ok_or_else(|| Error::NotFound(target.resource.clone()))
    }

    fn headers_of(stored: &Stored) -> Dict {
        let mut headers = Dict::new();
        headers.insert("Content-Length", stored.data.len().to_string());
        headers.insert("ETag", "\"mem\"");
        for (k, v) in stored.metadata.iter() {
            headers.insert(format!("x-amz-meta-{k}"), v.clone());
        }
        headers
    }
}

pub struct MemoryUpload {
    store: Arc<Mutex<Store>>,
    key: (String, String),
    metadata: Dict,
    declared: u64,
    buf: Vec<u8>,
}

#[async_trait]
impl Upload for MemoryUpload {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.buf.len() as u64 + buf.len() as u64 > self.declared {
            return Err(Error::InvalidArgument("body longer than declared".into()));
        }
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<Dict> {
        if self.buf.len() as u64 != self.declared {
            return Err(Error::InvalidArgument(format!(
                "declared {} bytes, wrote {}",
                self.declared,
                self.buf.len()
            )));
        }
        let this = *self;
        this.store.lock().insert(
            this.key,
            Stored {
                data: this.buf,
                metadata: this.metadata,
            },
        );
        Ok(Dict::new())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn list_bucket(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Listing> {
        *self.lists.lock() += 1;
        let prefix = prefix.unwrap_or("");
        let mut listing = Listing::default();
        for ((b, key), stored) in self.store.lock().iter() {
            if b != bucket || !key.starts_with(prefix) {
                continue;
            }
            let rest = &key[prefix.len()..];
            let split = delimiter
                .filter(|d| !d.is_empty())
                .and_then(|d| rest.find(d).map(|pos| pos + d.len()));
            match split {
                Some(end) => {
                    let common = format!("{prefix}{}", &rest[..end]);
                    if !listing.common_prefixes.contains(&common) {
                        listing.common_prefixes.push(common);
                    }
                }
                _ => listing
                    .objects
                    .push(ObjectEntry::new(key.clone(), stored.data.len() as u64)),
            }
        }
        Ok(listing)
    }

    async fn get(&self, target: &Target, _condition: Option<&Condition>) -> Result<Object> {
        let stored = self.find(target)?;
        Ok(Object {
            data: stored.data,
            metadata: stored.metadata,
        })
    }

    async fn get_range(
        &self,
        target: &Target,
        _condition: Option<&Condition>,
        range: Range,
    ) -> Result<Object> {
        let stored = self.find(target)?;
        let len = stored.data.len() as u64;
        let start = range.start().unwrap_or(0).min(len) as usize;
        let end = range.end().map(|e| (e + 1).min(len)).unwrap_or(len) as usize;
        Ok(Object {
            data: stored.data[start..end.max(start)].to_vec(),
            metadata: stored.metadata,
        })
    }

    async fn get_buffered(
        &self,
        target: &Target,
        _condition: Option<&Condition>,
        _range: Option<Range>,
        consumer: &mut dyn ReplyConsumer,
    ) -> Result<()> {
        let stored = self.find(target)?;
        for (name, value) in Self::headers_of(&stored).iter() {
            consumer.on_header(name, &value.joined())?;
        }
        // odd chunk size so envelope headers and blocks straddle chunks
        for chunk in stored.data.chunks(7) {
            consumer.on_chunk(chunk)?;
        }
        Ok(())
    }

    async fn put(&self, target: &Target, options: &PutOptions, data: &[u8]) -> Result<()> {
        self.store.lock().insert(
            (target.bucket.clone(), target.resource.clone()),
            Stored {
                data: data.to_vec(),
                metadata: options.metadata.clone(),
            },
        );
        Ok(())
    }

    async fn put_buffered(
        &self,
        target: &Target,
        options: &PutOptions,
        data_len: u64,
    ) -> Result<Box<dyn Upload>> {
        Ok(Box::new(MemoryUpload {
            store: Arc::clone(&self.store),
            key: (target.bucket.clone(), target.resource.clone()),
            metadata: options.metadata.clone(),
            declared: data_len,
            buf: Vec::new(),
        }))
    }

    async fn head_all(&self, target: &Target, _condition: Option<&Condition>) -> Result<Dict> {
        Ok(Self::headers_of(&self.find(target)?))
    }

    async fn head_sysmd(
        &self,
        target: &Target,
        _condition: Option<&Condition>,
    ) -> Result<SystemMetadata> {
        let stored = self.find(target)?;
        Ok(SystemMetadata::from_headers(
            &Self::headers_of(&stored),
            "/",
            &target.resource,
        ))
    }

    async fn delete(&self, target: &Target) -> Result<()> {
        self.deletes.lock().push(target.resource.clone());
        let removed = self
            .store
            .lock()
            .remove(&(target.bucket.clone(), target.resource.clone()));
        match removed {
            Some(_) => Ok(()),
            None if self.idempotent_delete => Ok(()),
            None => Err(Error::NotFound(target.resource.clone())),
        }
    }

    async fn copy(&self, src: &Target, dst: &Target, options: &CopyOptions) -> Result<()> {
        let mut stored = self.find(src)?;
        if options.directive == MetadataDirective::Replace {
            stored.metadata = options.metadata.clone();
        }
        self.store
            .lock()
            .insert((dst.bucket.clone(), dst.resource.clone()), stored);
        Ok(())
    }
}
