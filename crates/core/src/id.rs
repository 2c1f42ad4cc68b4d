//! ID-addressed access
//!
//! [`IdBackend`] wraps another backend and treats each target's resource as
//! an identifier. The resource actually sent is `"{id_path}/{id}"`, where
//! `id_path` comes from the wrapped backend's `get_id_path`. Posts target
//! the ID path itself and let the backend choose the name.

use async_trait::async_trait;
use jiff::Timestamp;

use crate::backend::{
    Backend, CopyOptions, Listing, Object, PutOptions, ReplyConsumer, SystemMetadata, Target,
    Upload,
};
use crate::dict::Dict;
use crate::error::Result;
use crate::request::{Condition, Range};

/// Decorator mapping identifiers to resources
pub struct IdBackend<B> {
    inner: B,
}

impl<B: Backend> IdBackend<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn id_path(&self, bucket: &str) -> Result<String> {
        Ok(self.inner.get_id_path(bucket).await?.unwrap_or_default())
    }

    /// Resource path of an identifier
    async fn resolve(&self, target: &Target) -> Result<Target> {
        let id_path = self.id_path(&target.bucket).await?;
        Ok(Target {
            bucket: target.bucket.clone(),
            resource: format!("{id_path}/{}", target.resource),
            subresource: target.subresource.clone(),
        })
    }

    async fn post_target(&self, target: &Target) -> Result<Target> {
        let id_path = self.id_path(&target.bucket).await?;
        Ok(Target {
            bucket: target.bucket.clone(),
            resource: id_path,
            subresource: target.subresource.clone(),
        })
    }
}

#[async_trait]
impl<B: Backend> Backend for IdBackend<B> {
    async fn list_bucket(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<Listing> {
        self.inner.list_bucket(bucket, prefix, delimiter).await
    }

    async fn get(&self, target: &Target, condition: Option<&Condition>) -> Result<Object> {
        let target = self.resolve(target).await?;
        self.inner.get(&target, condition).await
    }

    async fn get_range(
        &self,
        target: &Target,
        condition: Option<&Condition>,
        range: Range,
    ) -> Result<Object> {
        let target = self.resolve(target).await?;
        self.inner.get_range(&target, condition, range).await
    }

    async fn get_buffered(
        &self,
        target: &Target,
        condition: Option<&Condition>,
        range: Option<Range>,
        consumer: &mut dyn ReplyConsumer,
    ) -> Result<()> {
        let target = self.resolve(target).await?;
        self.inner
            .get_buffered(&target, condition, range, consumer)
            .await
    }

    async fn put(&self, target: &Target, options: &PutOptions, data: &[u8]) -> Result<()> {
        let target = self.resolve(target).await?;
        self.inner.put(&target, options, data).await
    }

    async fn put_buffered(
        &self,
        target: &Target,
        options: &PutOptions,
        data_len: u64,
    ) -> Result<Box<dyn Upload>> {
        let target = self.resolve(target).await?;
        self.inner.put_buffered(&target, options, data_len).await
    }

    async fn post(
        &self,
        target: &Target,
        options: &PutOptions,
        data: &[u8],
    ) -> Result<Option<String>> {
        let target = self.post_target(target).await?;
        self.inner.post(&target, options, data).await
    }

    async fn post_buffered(
        &self,
        target: &Target,
        options: &PutOptions,
        data_len: u64,
    ) -> Result<Box<dyn Upload>> {
        let target = self.post_target(target).await?;
        self.inner.post_buffered(&target, options, data_len).await
    }

    async fn head(&self, target: &Target, condition: Option<&Condition>) -> Result<Dict> {
        let target = self.resolve(target).await?;
        self.inner.head(&target, condition).await
    }

    async fn head_all(&self, target: &Target, condition: Option<&Condition>) -> Result<Dict> {
        let target = self.resolve(target).await?;
        self.inner.head_all(&target, condition).await
    }

    async fn head_sysmd(
        &self,
        target: &Target,
        condition: Option<&Condition>,
    ) -> Result<SystemMetadata> {
        let target = self.resolve(target).await?;
        self.inner.head_sysmd(&target, condition).await
    }

    async fn delete(&self, target: &Target) -> Result<()> {
        let target = self.resolve(target).await?;
        self.inner.delete(&target).await
    }

    async fn copy(&self, src: &Target, dst: &Target, options: &CopyOptions) -> Result<()> {
        let src = self.resolve(src).await?;
        let dst = self.resolve(dst).await?;
        self.inner.copy(&src, &dst, options).await
    }

    async fn genurl(&self, target: &Target, expires: Timestamp) -> Result<String> {
        let target = self.resolve(target).await?;
        self.inner.genurl(&target, expires).await
    }

    async fn get_id_path(&self, bucket: &str) -> Result<Option<String>> {
        self.inner.get_id_path(bucket).await
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::error::Error;

    /// Records the resources it is asked for
    #[derive(Default)]
    struct Recorder {
        id_path: Option<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Backend for Recorder {
        async fn get(&self, target: &Target, _condition: Option<&Condition>) -> Result<Object> {
            self.seen.lock().push(target.resource.clone());
            Ok(Object::default())
        }

        async fn post(
            &self,
            target: &Target,
            _options: &PutOptions,
            _data: &[u8],
        ) -> Result<Option<String>> {
            self.seen.lock().push(target.resource.clone());
            Ok(Some("generated".into()))
        }

        async fn get_id_path(&self, _bucket: &str) -> Result<Option<String>> {
            Ok(self.id_path.clone())
        }
    }

    /// Has operations but no ID path
    struct NoIdPath;

    #[async_trait]
    impl Backend for NoIdPath {
        async fn get(&self, _target: &Target, _condition: Option<&Condition>) -> Result<Object> {
            Ok(Object::default())
        }
    }

    #[tokio::test]
    async fn test_id_resource_composition() {
        let backend = IdBackend::new(Recorder {
            id_path: Some("objects".into()),
            ..Default::default()
        });
        backend.get(&Target::new("b", "42"), None).await.unwrap();
        assert_eq!(backend.inner().seen.lock().as_slice(), ["objects/42"]);
    }

    #[tokio::test]
    async fn test_missing_id_path_is_empty() {
        let backend = IdBackend::new(Recorder::default());
        backend.get(&Target::new("b", "42"), None).await.unwrap();
        assert_eq!(backend.inner().seen.lock().as_slice(), ["/42"]);
    }

    #[tokio::test]
    async fn test_post_targets_id_path() {
        let backend = IdBackend::new(Recorder {
            id_path: Some("objects".into()),
            ..Default::default()
        });
        let location = backend
            .post(&Target::new("b", "ignored"), &PutOptions::default(), b"x")
            .await
            .unwrap();
        assert_eq!(location.as_deref(), Some("generated"));
        assert_eq!(backend.inner().seen.lock().as_slice(), ["objects"]);
    }

    #[tokio::test]
    async fn test_get_id_path_checked_first() {
        let backend = IdBackend::new(NoIdPath);
        let err = backend.get(&Target::new("b", "1"), None).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported("get_id_path")));
    }

    #[tokio::test]
    async fn test_unset_slot_not_supported() {
        let backend = IdBackend::new(Recorder::default());
        let err = backend.delete(&Target::new("b", "1")).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported("delete")));
    }
}
