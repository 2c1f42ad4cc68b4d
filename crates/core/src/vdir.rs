//! Virtual directories over a flat key namespace
//!
//! Directories are emulated with prefix/delimiter listings. A directory's
//! inode is its key prefix ending with the delimiter; the root is the empty
//! key. Creating a directory writes a zero-length marker object at that key.
//!
//! `..` is resolved lexically on the key string and never checks that the
//! parent exists. The root's `..` is the root.

use jiff::Timestamp;

use crate::backend::{Backend, FileType, Listing, PutOptions, Target};
use crate::error::{Error, Result};
use crate::path::{is_absolute, last_component, parent_key, split_last};
use crate::request::{CannedAcl, MAX_PATH_LEN};

/// Maximum length of one path component
pub const MAX_NAME_LEN: usize = 255;

/// Position in the flat key namespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Inode {
    key: String,
}

impl Inode {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.len() > MAX_PATH_LEN {
            return Err(Error::NameTooLong(key));
        }
        Ok(Self { key })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_root(&self) -> bool {
        self.key.is_empty()
    }

    /// Listing prefix for this inode; the root lists without one
    fn prefix(&self) -> Option<&str> {
        if self.is_root() { None } else { Some(&self.key) }
    }
}

impl std::fmt::Display for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub name: String,
    pub inode: Inode,
    pub file_type: FileType,
    pub last_modified: Option<Timestamp>,
    pub size: u64,
}

/// Result of resolving a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub parent: Inode,
    pub inode: Inode,
    pub file_type: FileType,
}

/// Snapshot of one directory listing with read cursors
#[derive(Debug)]
pub struct DirHandle {
    inode: Inode,
    delimiter: String,
    listing: Listing,
    files_cursor: usize,
    prefixes_cursor: usize,
}

impl DirHandle {
    fn new(inode: Inode, delimiter: &str, listing: Listing) -> Self {
        Self {
            inode,
            delimiter: delimiter.to_string(),
            listing,
            files_cursor: 0,
            prefixes_cursor: 0,
        }
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// Whether both enumerations are exhausted
    pub fn eof(&self) -> bool {
        self.files_cursor >= self.listing.objects.len()
            && self.prefixes_cursor >= self.listing.common_prefixes.len()
    }

    /// Next entry: objects first, then common prefixes
    ///
    /// Past the end this fails with `NotFound`; check [`DirHandle::eof`] to
    /// tell normal termination apart.
    pub fn readdir(&mut self) -> Result<Dirent> {
        if let Some(object) = self.listing.objects.get(self.files_cursor) {
            self.files_cursor += 1;
            let suffix = object
                .key
                .strip_prefix(self.inode.key.as_str())
                .unwrap_or(&object.key);
            let file_type = if object.key.ends_with(self.delimiter.as_str()) {
                FileType::Directory
            } else {
                FileType::Regular
            };
            let name = if suffix.is_empty() || suffix == self.delimiter {
                ".".to_string()
            } else {
                self.entry_name(suffix)?
            };
            return Ok(Dirent {
                name,
                inode: Inode::new(object.key.clone())?,
                file_type,
                last_modified: object.last_modified,
                size: object.size,
            });
        }

        if let Some(prefix) = self.listing.common_prefixes.get(self.prefixes_cursor) {
            self.prefixes_cursor += 1;
            let suffix = prefix
                .strip_prefix(self.inode.key.as_str())
                .unwrap_or(prefix);
            return Ok(Dirent {
                name: self.entry_name(suffix)?,
                inode: Inode::new(prefix.clone())?,
                file_type: FileType::Directory,
                last_modified: None,
                size: 0,
            });
        }

        Err(Error::NotFound(format!("end of directory {}", self.inode)))
    }

    fn entry_name(&self, suffix: &str) -> Result<String> {
        let name = suffix.strip_suffix(self.delimiter.as_str()).unwrap_or(suffix);
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong(name.to_string()));
        }
        Ok(name.to_string())
    }
}

fn check_name(name: &str, delimiter: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong(name.to_string()));
    }
    if !delimiter.is_empty() && name.contains(delimiter) {
        return Err(Error::InvalidArgument(format!(
            "name '{name}' contains the delimiter"
        )));
    }
    Ok(())
}

/// Directory operations against one backend
pub struct Vdir<'a> {
    backend: &'a dyn Backend,
    delimiter: &'a str,
}

impl<'a> Vdir<'a> {
    pub fn new(backend: &'a dyn Backend, delimiter: &'a str) -> Self {
        Self { backend, delimiter }
    }

    pub fn delimiter(&self) -> &str {
        self.delimiter
    }

    /// Resolve one name inside a directory
    pub async fn lookup(&self, bucket: &str, parent: &Inode, name: &str) -> Result<(Inode, FileType)> {
        tracing::debug!(bucket, parent = %parent, name, "lookup");

        if name == "." {
            return Ok((parent.clone(), FileType::Directory));
        }
        if name == ".." {
            let key = parent_key(parent.key(), self.delimiter);
            return Ok((Inode::new(key)?, FileType::Directory));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong(name.to_string()));
        }

        let listing = self
            .backend
            .list_bucket(bucket, parent.prefix(), Some(self.delimiter))
            .await?;

        for object in &listing.objects {
            let Some(suffix) = object.key.strip_prefix(parent.key()) else {
                continue;
            };
            if suffix.is_empty() || suffix == self.delimiter {
                continue;
            }
            if last_component(suffix, self.delimiter) == name {
                let file_type = if object.key.ends_with(self.delimiter) {
                    FileType::Directory
                } else {
                    FileType::Regular
                };
                return Ok((Inode::new(object.key.clone())?, file_type));
            }
        }

        for prefix in &listing.common_prefixes {
            let Some(suffix) = prefix.strip_prefix(parent.key()) else {
                continue;
            };
            if last_component(suffix, self.delimiter) == name {
                return Ok((Inode::new(prefix.clone())?, FileType::Directory));
            }
        }

        Err(Error::NotFound(format!("{}{name}", parent.key())))
    }

    /// Resolve a path left to right from the root or from `base`
    pub async fn namei(&self, path: &str, bucket: &str, base: &Inode) -> Result<Resolved> {
        tracing::debug!(bucket, path, base = %base, "namei");

        if path == self.delimiter {
            return Ok(Resolved {
                parent: Inode::root(),
                inode: Inode::root(),
                file_type: FileType::Directory,
            });
        }

        let start = if is_absolute(path, self.delimiter) {
            Inode::root()
        } else {
            base.clone()
        };

        let components: Vec<&str> = if self.delimiter.is_empty() {
            vec![path]
        } else {
            path.split(self.delimiter).filter(|c| !c.is_empty()).collect()
        };

        let mut parent = start.clone();
        let mut current = start;
        let mut file_type = FileType::Directory;

        for (i, name) in components.iter().enumerate() {
            if name.len() > MAX_NAME_LEN {
                return Err(Error::NameTooLong(name.to_string()));
            }
            let (inode, kind) = self.lookup(bucket, &current, name).await?;
            let is_last = i + 1 == components.len();
            if !is_last && kind != FileType::Directory {
                return Err(Error::NotDirectory(inode.key().to_string()));
            }
            parent = std::mem::replace(&mut current, inode);
            file_type = kind;
        }

        Ok(Resolved {
            parent,
            inode: current,
            file_type,
        })
    }

    /// Snapshot a directory with one LIST call
    pub async fn opendir(&self, bucket: &str, inode: &Inode) -> Result<DirHandle> {
        tracing::debug!(bucket, inode = %inode, "opendir");
        let listing = self
            .backend
            .list_bucket(bucket, inode.prefix(), Some(self.delimiter))
            .await?;
        Ok(DirHandle::new(inode.clone(), self.delimiter, listing))
    }

    /// Release a directory snapshot
    pub fn closedir(&self, handle: DirHandle) {
        drop(handle);
    }

    /// Number of entries besides `.`
    pub async fn count_entries(&self, bucket: &str, inode: &Inode) -> Result<usize> {
        let mut handle = self.opendir(bucket, inode).await?;
        let mut count = 0;
        while !handle.eof() {
            let entry = handle.readdir()?;
            if entry.name != "." {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn make_entry(&self, bucket: &str, parent: &Inode, name: &str, suffix: &str) -> Result<Inode> {
        check_name(name, self.delimiter)?;
        let inode = Inode::new(format!("{}{name}{suffix}", parent.key()))?;
        let options = PutOptions {
            acl: Some(CannedAcl::Private),
            ..Default::default()
        };
        self.backend
            .put(&Target::new(bucket, inode.key()), &options, &[])
            .await?;
        Ok(inode)
    }

    /// Create a directory marker `parent + name + delimiter`
    pub async fn mkdir_at(&self, bucket: &str, parent: &Inode, name: &str) -> Result<Inode> {
        tracing::debug!(bucket, parent = %parent, name, "mkdir");
        self.make_entry(bucket, parent, name, self.delimiter).await
    }

    /// Create an empty regular object `parent + name`
    pub async fn mknod_at(&self, bucket: &str, parent: &Inode, name: &str) -> Result<Inode> {
        tracing::debug!(bucket, parent = %parent, name, "mknod");
        self.make_entry(bucket, parent, name, "").await
    }

    /// Remove an empty directory marker
    pub async fn rmdir_at(&self, bucket: &str, parent: &Inode, name: &str) -> Result<()> {
        tracing::debug!(bucket, parent = %parent, name, "rmdir");
        if name == "." || name.is_empty() {
            return Err(Error::InvalidArgument(format!("cannot remove '{name}'")));
        }
        let mut key = format!("{}{name}", parent.key());
        if !key.ends_with(self.delimiter) {
            key.push_str(self.delimiter);
        }
        let inode = Inode::new(key)?;

        let entries = self.count_entries(bucket, &inode).await?;
        if entries > 0 {
            return Err(Error::NotEmpty(inode.key().to_string()));
        }
        self.backend.delete(&Target::new(bucket, inode.key())).await
    }

    /// Resolve the directory that will hold the last component of `path`
    async fn resolve_parent<'p>(&self, bucket: &str, path: &'p str, base: &Inode) -> Result<(Inode, &'p str)> {
        let (parent_path, name) = split_last(path, self.delimiter);
        let parent = match parent_path {
            None => base.clone(),
            Some(p) => {
                let resolved = self.namei(p, bucket, base).await?;
                if resolved.file_type != FileType::Directory {
                    return Err(Error::NotDirectory(p.to_string()));
                }
                resolved.inode
            }
        };
        Ok((parent, name))
    }

    async fn create_path(&self, bucket: &str, path: &str, base: &Inode, directory: bool) -> Result<Inode> {
        match self.namei(path, bucket, base).await {
            Ok(_) => return Err(Error::AlreadyExists(path.to_string())),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let (parent, name) = self.resolve_parent(bucket, path, base).await?;
        if directory {
            self.mkdir_at(bucket, &parent, name).await
        } else {
            self.mknod_at(bucket, &parent, name).await
        }
    }

    /// Create a directory at a path; an existing path fails with `AlreadyExists`
    pub async fn mkdir(&self, bucket: &str, path: &str, base: &Inode) -> Result<Inode> {
        self.create_path(bucket, path, base, true).await
    }

    /// Create an empty regular object at a path
    pub async fn mknod(&self, bucket: &str, path: &str, base: &Inode) -> Result<Inode> {
        self.create_path(bucket, path, base, false).await
    }

    /// Remove the empty directory at a path
    ///
    /// A path that does not resolve fails with `NotFound` and deletes nothing.
    pub async fn rmdir(&self, bucket: &str, path: &str, base: &Inode) -> Result<()> {
        let resolved = self.namei(path, bucket, base).await?;
        if resolved.inode.is_root() {
            return Err(Error::InvalidArgument("cannot remove the root".into()));
        }
        if resolved.file_type != FileType::Directory {
            return Err(Error::NotDirectory(path.to_string()));
        }
        // `..` components leave namei's parent off the lexical one
        let parent = Inode::new(parent_key(resolved.inode.key(), self.delimiter))?;
        let name = last_component(resolved.inode.key(), self.delimiter);
        self.rmdir_at(bucket, &parent, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ObjectEntry;

    fn handle(inode: &str, objects: &[&str], prefixes: &[&str]) -> DirHandle {
        let listing = Listing {
            objects: objects.iter().map(|k| ObjectEntry::new(*k, 3)).collect(),
            common_prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        };
        DirHandle::new(Inode::new(inode).unwrap(), "/", listing)
    }

    #[test]
    fn test_readdir_order_and_types() {
        let mut dir = handle("a/", &["a/", "a/file.txt"], &["a/sub/"]);

        let e = dir.readdir().unwrap();
        assert_eq!(e.name, ".");
        assert_eq!(e.file_type, FileType::Directory);

        let e = dir.readdir().unwrap();
        assert_eq!(e.name, "file.txt");
        assert_eq!(e.file_type, FileType::Regular);
        assert_eq!(e.size, 3);
        assert_eq!(e.inode.key(), "a/file.txt");

        let e = dir.readdir().unwrap();
        assert_eq!(e.name, "sub");
        assert_eq!(e.file_type, FileType::Directory);
        assert_eq!(e.inode.key(), "a/sub/");

        assert!(dir.eof());
        assert!(matches!(dir.readdir(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_empty_handle_is_eof() {
        let mut dir = handle("", &[], &[]);
        assert!(dir.eof());
        assert!(dir.readdir().is_err());
    }

    #[test]
    fn test_inode_bounds() {
        assert!(Inode::root().is_root());
        assert!(Inode::new("x".repeat(MAX_PATH_LEN)).is_ok());
        assert!(matches!(
            Inode::new("x".repeat(MAX_PATH_LEN + 1)),
            Err(Error::NameTooLong(_))
        ));
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("ok", "/").is_ok());
        assert!(matches!(check_name("", "/"), Err(Error::InvalidArgument(_))));
        assert!(matches!(check_name("a/b", "/"), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            check_name(&"n".repeat(MAX_NAME_LEN + 1), "/"),
            Err(Error::NameTooLong(_))
        ));
    }
}
