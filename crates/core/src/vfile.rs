//! Streaming file handles
//!
//! A [`WriteHandle`] sits between the caller's buffers and a streamed upload,
//! folding each buffer into a running MD5 and optionally sealing it in the
//! encryption envelope. Reads go through a [`ReadFilter`], which detects the
//! envelope marker in the first bytes of a reply and decrypts the rest
//! before the caller's consumer sees it.

use bitflags::bitflags;
use md5::{Digest, Md5};

use crate::backend::{
    Backend, CollectingConsumer, PutOptions, ReplyConsumer, Target, Upload,
    metadata_from_headers,
};
use crate::crypto::{self, Decryptor, Encryptor, HEADER_LEN, MAGIC};
use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::request::{Condition, Range};

bitflags! {
    /// Options for opening a handle
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VfileFlags: u32 {
        /// Create the object if it does not exist
        const CREAT = 1 << 0;
        /// Fail if the object already exists
        const EXCL = 1 << 1;
        /// Compute an MD5 of the plaintext
        const MD5 = 1 << 2;
        /// Seal writes in, and open reads from, the encryption envelope
        const ENCRYPT = 1 << 3;
    }
}

/// What a closed handle reports
#[derive(Debug, Clone, Default)]
pub struct CloseInfo {
    /// Hex MD5 of the plaintext, when requested
    pub md5: Option<String>,
    /// Reply headers of the final exchange
    pub headers: Dict,
}

/// What a completed read reports
#[derive(Debug, Clone, Default)]
pub struct ReadInfo {
    /// User metadata of the object
    pub metadata: Dict,
    /// Hex MD5 of the delivered plaintext, when requested
    pub md5: Option<String>,
    /// Whether the stored object carried the encryption envelope
    pub encrypted: bool,
}

/// Whether an error means the object is simply absent
fn is_absent(err: &Error) -> bool {
    matches!(err, Error::NotFound(_) | Error::HttpStatus { code: 404 })
}

/// Open handle for a streamed write
pub struct WriteHandle {
    upload: Box<dyn Upload>,
    digest: Option<Md5>,
    encryptor: Option<Encryptor>,
    expected_md5: Option<String>,
}

impl WriteHandle {
    /// Open an upload of `data_len` plaintext bytes
    ///
    /// With `ENCRYPT` the wire length accounts for the envelope and
    /// `passphrase` is required. `expected_md5` (hex) is checked at close.
    pub async fn open(
        backend: &dyn Backend,
        target: &Target,
        flags: VfileFlags,
        mut options: PutOptions,
        data_len: u64,
        passphrase: Option<&str>,
        expected_md5: Option<String>,
    ) -> Result<Self> {
        tracing::debug!(bucket = %target.bucket, resource = %target.resource, ?flags, data_len, "open for write");

        if flags.contains(VfileFlags::EXCL) || !flags.contains(VfileFlags::CREAT) {
            match backend.head_sysmd(target, None).await {
                Ok(_) if flags.contains(VfileFlags::EXCL) => {
                    return Err(Error::AlreadyExists(target.resource.clone()));
                }
                Ok(_) => {}
                Err(e) if is_absent(&e) && flags.contains(VfileFlags::CREAT) => {}
                Err(e) => return Err(e),
            }
        }

        let encryptor = if flags.contains(VfileFlags::ENCRYPT) {
            let pass = passphrase.ok_or_else(|| {
                Error::InvalidArgument("encryption requested without a passphrase".into())
            })?;
            options.encrypted = true;
            Some(Encryptor::new(pass))
        } else {
            None
        };
        let wire_len = if encryptor.is_some() {
            crypto::sealed_len(data_len)
        } else {
            data_len
        };

        let upload = backend.put_buffered(target, &options, wire_len).await?;
        Ok(Self {
            upload,
            digest: flags.contains(VfileFlags::MD5).then(Md5::new),
            encryptor,
            expected_md5,
        })
    }

    /// Send the next plaintext buffer
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if let Some(digest) = self.digest.as_mut() {
            digest.update(buf);
        }
        match self.encryptor.as_mut() {
            Some(enc) => {
                let sealed = enc.update(buf)?;
                if !sealed.is_empty() {
                    self.upload.write(&sealed).await?;
                }
                Ok(())
            }
            None => self.upload.write(buf).await,
        }
    }

    /// Flush the final cipher block, finish the upload and check the digest
    pub async fn close(self) -> Result<CloseInfo> {
        let WriteHandle {
            mut upload,
            digest,
            encryptor,
            expected_md5,
        } = self;

        if let Some(enc) = encryptor {
            let tail = enc.finalize()?;
            upload.write(&tail).await?;
        }
        let headers = upload.finish().await?;

        let md5 = digest.map(|d| hex::encode(d.finalize()));
        if let (Some(expected), Some(actual)) = (&expected_md5, &md5) {
            if !expected.eq_ignore_ascii_case(actual) {
                return Err(Error::Integrity {
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(CloseInfo { md5, headers })
    }
}

enum ReadState {
    /// Buffering the first bytes until the envelope can be recognized
    Detecting(Vec<u8>),
    Plain,
    Decrypting(Decryptor),
}

/// Consumer adapter that digests and decrypts a reply on its way through
pub struct ReadFilter<'a> {
    inner: &'a mut dyn ReplyConsumer,
    digest: Option<Md5>,
    state: ReadState,
    passphrase: Option<String>,
    headers: Dict,
    encrypted: bool,
}

impl<'a> ReadFilter<'a> {
    pub fn new(inner: &'a mut dyn ReplyConsumer, flags: VfileFlags, passphrase: Option<&str>) -> Self {
        let state = if flags.contains(VfileFlags::ENCRYPT) {
            ReadState::Detecting(Vec::with_capacity(HEADER_LEN))
        } else {
            ReadState::Plain
        };
        Self {
            inner,
            digest: flags.contains(VfileFlags::MD5).then(Md5::new),
            state,
            passphrase: passphrase.map(str::to_string),
            headers: Dict::new(),
            encrypted: false,
        }
    }

    fn deliver(&mut self, plain: &[u8]) -> Result<()> {
        if plain.is_empty() {
            return Ok(());
        }
        if let Some(digest) = self.digest.as_mut() {
            digest.update(plain);
        }
        self.inner.on_chunk(plain)
    }

    fn detect(&mut self, buffered: Vec<u8>) -> Result<()> {
        let prefix_len = buffered.len().min(MAGIC.len());
        if buffered[..prefix_len] != MAGIC[..prefix_len] {
            self.state = ReadState::Plain;
            return self.deliver(&buffered);
        }
        if buffered.len() < HEADER_LEN {
            self.state = ReadState::Detecting(buffered);
            return Ok(());
        }
        let salt = crypto::parse_header(&buffered)
            .ok_or_else(|| Error::Crypto("malformed envelope header".into()))?;
        let pass = self.passphrase.as_deref().ok_or_else(|| {
            Error::InvalidArgument("object is encrypted but no passphrase is set".into())
        })?;
        let mut dec = Decryptor::new(pass, &salt)?;
        self.encrypted = true;
        let plain = dec.update(&buffered[HEADER_LEN..]);
        self.state = ReadState::Decrypting(dec);
        self.deliver(&plain)
    }

    /// Flush buffered state once the reply is complete
    pub fn finish(mut self) -> Result<ReadInfo> {
        match std::mem::replace(&mut self.state, ReadState::Plain) {
            // shorter than an envelope header: plain content
            ReadState::Detecting(buffered) => self.deliver(&buffered)?,
            ReadState::Decrypting(dec) => {
                let tail = dec.finalize()?;
                self.deliver(&tail)?;
            }
            ReadState::Plain => {}
        }
        Ok(ReadInfo {
            metadata: self.headers,
            md5: self.digest.map(|d| hex::encode(d.finalize())),
            encrypted: self.encrypted,
        })
    }

    /// Reply headers seen so far
    pub fn headers(&self) -> &Dict {
        &self.headers
    }
}

impl ReplyConsumer for ReadFilter<'_> {
    fn on_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.headers.add(name, value);
        self.inner.on_header(name, value)
    }

    fn on_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        match &mut self.state {
            ReadState::Plain => self.deliver(chunk),
            ReadState::Decrypting(dec) => {
                let plain = dec.update(chunk);
                self.deliver(&plain)
            }
            ReadState::Detecting(buf) => {
                let mut buffered = std::mem::take(buf);
                buffered.extend_from_slice(chunk);
                self.detect(buffered)
            }
        }
    }
}

/// Stream an object into `consumer`, decrypting it when flagged
pub async fn open_read(
    backend: &dyn Backend,
    target: &Target,
    flags: VfileFlags,
    condition: Option<&Condition>,
    header_prefix: &str,
    passphrase: Option<&str>,
    consumer: &mut dyn ReplyConsumer,
) -> Result<ReadInfo> {
    tracing::debug!(bucket = %target.bucket, resource = %target.resource, ?flags, "open for read");
    let mut filter = ReadFilter::new(consumer, flags, passphrase);
    backend
        .get_buffered(target, condition, None, &mut filter)
        .await?;
    let mut info = filter.finish()?;
    info.metadata = metadata_from_headers(&info.metadata, header_prefix);
    Ok(info)
}

/// Read a byte range of an object into memory
///
/// Ciphertext cannot be opened at an arbitrary offset, so with `ENCRYPT` the
/// whole object is fetched, opened and then sliced.
pub async fn open_read_range(
    backend: &dyn Backend,
    target: &Target,
    flags: VfileFlags,
    condition: Option<&Condition>,
    range: Range,
    header_prefix: &str,
    passphrase: Option<&str>,
) -> Result<(Vec<u8>, ReadInfo)> {
    if !flags.contains(VfileFlags::ENCRYPT) {
        let object = backend.get_range(target, condition, range).await?;
        let md5 = flags
            .contains(VfileFlags::MD5)
            .then(|| hex::encode(Md5::digest(&object.data)));
        let info = ReadInfo {
            metadata: object.metadata,
            md5,
            encrypted: false,
        };
        return Ok((object.data, info));
    }

    let mut collected = CollectingConsumer::default();
    let info = open_read(
        backend,
        target,
        flags,
        condition,
        header_prefix,
        passphrase,
        &mut collected,
    )
    .await?;
    let data = slice_range(collected.data, range);
    Ok((data, info))
}

fn slice_range(mut data: Vec<u8>, range: Range) -> Vec<u8> {
    let len = data.len() as u64;
    let (start, end) = match (range.start(), range.end()) {
        (Some(s), Some(e)) => (s, e.saturating_add(1)),
        (Some(s), None) => (s, len),
        // suffix range: the last `n` bytes
        (None, Some(n)) => (len.saturating_sub(n), len),
        (None, None) => (0, len),
    };
    let end = end.min(len) as usize;
    let start = (start as usize).min(end);
    data.truncate(end);
    data.drain(..start);
    data
}
