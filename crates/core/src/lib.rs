//! skiff-core: Core library for the skiff object storage client
//!
//! This crate provides the backend-agnostic parts of skiff:
//! - Request descriptors and HTTP/1.1 request framing
//! - The `Backend` dispatch trait and the ID-addressing decorator
//! - Virtual directories emulated over prefix/delimiter listings
//! - Streaming file handles with MD5 digests and stream encryption
//! - Profile and configuration management
//!
//! The transport lives in `skiff-http`; anything that implements `Backend`
//! can drive the directory and file layers, which keeps them testable
//! without a network.

pub mod backend;
pub mod config;
pub mod crypto;
pub mod dict;
pub mod error;
pub mod framing;
pub mod id;
pub mod path;
pub mod profile;
pub mod request;
pub mod session;
pub mod vdir;
pub mod vfile;

pub use backend::{
    Backend, CollectingConsumer, CopyOptions, Dialect, FileType, Listing, Object, ObjectEntry,
    PlainDialect, PutOptions, ReplyConsumer, SystemMetadata, Target, Upload,
    metadata_from_headers,
};
pub use config::{Config, ConfigManager};
pub use dict::{Dict, Value};
pub use error::{Cause, Error, Result, Status};
pub use framing::{gen_http_request, gen_url};
pub use id::IdBackend;
pub use path::{Locator, parse_locator};
pub use profile::{Profile, ProfileManager, TimeoutConfig};
pub use request::{
    Behavior, CannedAcl, Condition, MetadataDirective, Method, Predicate, Range, Request,
};
pub use session::Session;
pub use vdir::{DirHandle, Dirent, Inode, Resolved, Vdir};
pub use vfile::{CloseInfo, ReadFilter, ReadInfo, VfileFlags, WriteHandle};
