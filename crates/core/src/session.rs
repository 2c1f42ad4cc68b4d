//! Session facade
//!
//! A [`Session`] binds a backend to a profile and keeps the state POSIX-style
//! callers expect: a current bucket and one working directory per bucket.
//! Every operation takes a locator (`bucket:path` or a bare path) and
//! resolves relative paths against the bucket's working directory.

use std::collections::HashMap;
use std::sync::Arc;

use jiff::Timestamp;
use parking_lot::Mutex;

use crate::backend::{
    Backend, CopyOptions, FileType, PutOptions, ReplyConsumer, SystemMetadata, Target,
    metadata_from_headers,
};
use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::path::{is_absolute, parse_locator};
use crate::profile::Profile;
use crate::request::{Condition, MetadataDirective, Range};
use crate::vdir::{DirHandle, Inode, Resolved, Vdir};
use crate::vfile::{self, ReadInfo, VfileFlags, WriteHandle};

#[derive(Debug, Default)]
struct SessionState {
    bucket: Option<String>,
    cwds: HashMap<String, Inode>,
}

/// A bucket, a path in it, and the working directory it is relative to
struct Place {
    bucket: String,
    path: String,
    cwd: Inode,
}

/// Locator-based access to one backend
pub struct Session {
    backend: Arc<dyn Backend>,
    profile: Arc<Profile>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>, profile: Arc<Profile>) -> Self {
        let state = SessionState {
            bucket: profile.base_bucket.clone(),
            cwds: HashMap::new(),
        };
        Self {
            backend,
            profile,
            state: Mutex::new(state),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    fn vdir(&self) -> Vdir<'_> {
        Vdir::new(self.backend.as_ref(), &self.profile.delimiter)
    }

    /// Current bucket
    pub fn bucket(&self) -> Option<String> {
        self.state.lock().bucket.clone()
    }

    pub fn set_bucket(&self, bucket: &str) {
        self.state.lock().bucket = Some(bucket.to_string());
    }

    /// Working directory of a bucket (the current one when `None`)
    pub fn cwd(&self, bucket: Option<&str>) -> Result<Inode> {
        let state = self.state.lock();
        let bucket = bucket
            .map(str::to_string)
            .or_else(|| state.bucket.clone())
            .ok_or_else(|| Error::InvalidArgument("no current bucket".into()))?;
        Ok(state.cwds.get(&bucket).cloned().unwrap_or_default())
    }

    fn place(&self, locator: &str) -> Result<Place> {
        let loc = parse_locator(locator)?;
        let state = self.state.lock();
        let bucket = loc
            .bucket
            .or_else(|| state.bucket.clone())
            .ok_or_else(|| Error::InvalidArgument(format!("no bucket for '{locator}'")))?;
        let cwd = state.cwds.get(&bucket).cloned().unwrap_or_default();
        Ok(Place {
            bucket,
            path: loc.path,
            cwd,
        })
    }

    /// Object key a locator names, without looking anything up
    fn target(&self, locator: &str) -> Result<Target> {
        let place = self.place(locator)?;
        let delimiter = self.profile.delimiter.as_str();
        let key = if is_absolute(&place.path, delimiter) {
            place.path[delimiter.len()..].to_string()
        } else {
            format!("{}{}", place.cwd.key(), place.path)
        };
        if key.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "'{locator}' does not name an object"
            )));
        }
        Ok(Target::new(place.bucket, key))
    }

    /// Resolve a locator to an inode
    pub async fn namei(&self, locator: &str) -> Result<Resolved> {
        let place = self.place(locator)?;
        self.vdir().namei(&place.path, &place.bucket, &place.cwd).await
    }

    /// Open a directory for enumeration
    pub async fn opendir(&self, locator: &str) -> Result<DirHandle> {
        let place = self.place(locator)?;
        let vdir = self.vdir();
        let resolved = vdir.namei(&place.path, &place.bucket, &place.cwd).await?;
        if resolved.file_type != FileType::Directory {
            return Err(Error::NotDirectory(locator.to_string()));
        }
        vdir.opendir(&place.bucket, &resolved.inode).await
    }

    /// Change the working directory; also makes its bucket current
    pub async fn chdir(&self, locator: &str) -> Result<()> {
        let place = self.place(locator)?;
        let resolved = self
            .vdir()
            .namei(&place.path, &place.bucket, &place.cwd)
            .await?;
        if resolved.file_type != FileType::Directory {
            return Err(Error::InvalidArgument(format!(
                "'{locator}' is not a directory"
            )));
        }
        let mut state = self.state.lock();
        state.cwds.insert(place.bucket.clone(), resolved.inode);
        state.bucket = Some(place.bucket);
        Ok(())
    }

    pub async fn mkdir(&self, locator: &str) -> Result<Inode> {
        let place = self.place(locator)?;
        self.vdir().mkdir(&place.bucket, &place.path, &place.cwd).await
    }

    pub async fn mknod(&self, locator: &str) -> Result<Inode> {
        let place = self.place(locator)?;
        self.vdir().mknod(&place.bucket, &place.path, &place.cwd).await
    }

    pub async fn rmdir(&self, locator: &str) -> Result<()> {
        let place = self.place(locator)?;
        self.vdir().rmdir(&place.bucket, &place.path, &place.cwd).await
    }

    /// Open a streamed write of `data_len` plaintext bytes
    pub async fn open_write(
        &self,
        locator: &str,
        flags: VfileFlags,
        options: PutOptions,
        data_len: u64,
        expected_md5: Option<String>,
    ) -> Result<WriteHandle> {
        let target = self.target(locator)?;
        WriteHandle::open(
            self.backend.as_ref(),
            &target,
            flags,
            options,
            data_len,
            self.profile.encrypt_key.as_deref(),
            expected_md5,
        )
        .await
    }

    /// Stream an object into `consumer`
    pub async fn open_read(
        &self,
        locator: &str,
        flags: VfileFlags,
        condition: Option<&Condition>,
        consumer: &mut dyn ReplyConsumer,
    ) -> Result<ReadInfo> {
        let target = self.target(locator)?;
        vfile::open_read(
            self.backend.as_ref(),
            &target,
            flags,
            condition,
            &self.profile.header_prefix,
            self.profile.encrypt_key.as_deref(),
            consumer,
        )
        .await
    }

    /// Read a byte range of an object into memory
    pub async fn open_read_range(
        &self,
        locator: &str,
        flags: VfileFlags,
        condition: Option<&Condition>,
        range: Range,
    ) -> Result<(Vec<u8>, ReadInfo)> {
        let target = self.target(locator)?;
        vfile::open_read_range(
            self.backend.as_ref(),
            &target,
            flags,
            condition,
            range,
            &self.profile.header_prefix,
            self.profile.encrypt_key.as_deref(),
        )
        .await
    }

    /// Delete an object
    pub async fn unlink(&self, locator: &str) -> Result<()> {
        let target = self.target(locator)?;
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, "unlink");
        self.backend.delete(&target).await
    }

    /// System and user metadata of an object
    pub async fn getattr(&self, locator: &str) -> Result<(SystemMetadata, Dict)> {
        let target = self.target(locator)?;
        let headers = self.backend.head_all(&target, None).await?;
        let sysmd = SystemMetadata::from_headers(&headers, &self.profile.delimiter, &target.resource);
        let metadata = metadata_from_headers(&headers, &self.profile.header_prefix);
        Ok((sysmd, metadata))
    }

    /// Replace the user metadata of an object in place
    pub async fn setattr(&self, locator: &str, metadata: &Dict) -> Result<()> {
        let target = self.target(locator)?;
        let options = CopyOptions {
            directive: MetadataDirective::Replace,
            metadata: metadata.clone(),
            ..Default::default()
        };
        self.backend.copy(&target, &target, &options).await
    }

    /// Pre-signed URL for an object
    pub async fn fgenurl(&self, locator: &str, expires: Timestamp) -> Result<String> {
        let target = self.target(locator)?;
        self.backend.genurl(&target, expires).await
    }

    /// Server-side copy between two locators
    pub async fn fcopy(&self, src: &str, dst: &str) -> Result<()> {
        let src = self.target(src)?;
        let dst = self.target(dst)?;
        self.backend.copy(&src, &dst, &CopyOptions::default()).await
    }
}
