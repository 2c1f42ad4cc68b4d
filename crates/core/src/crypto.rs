//! Stream encryption envelope
//!
//! Encrypted objects start with the 8-byte marker `Salted__` and an 8-byte
//! random salt, followed by AES-256-CBC ciphertext with PKCS#7 padding. Key
//! and IV come from the passphrase and salt through the OpenSSL
//! `EVP_BytesToKey` derivation (MD5, one iteration), so objects can be
//! opened with `openssl enc -d -aes-256-cbc -md md5`.
//!
//! Both directions work incrementally on arbitrary chunk boundaries.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rand::RngCore;

use crate::error::{Error, Result};

/// Marker at the start of every encrypted object
pub const MAGIC: &[u8; 8] = b"Salted__";

pub const SALT_LEN: usize = 8;

/// Marker plus salt
pub const HEADER_LEN: usize = MAGIC.len() + SALT_LEN;

const BLOCK: usize = 16;
const KEY_LEN: usize = 32;

type CbcEnc = cbc::Encryptor<Aes256>;
type CbcDec = cbc::Decryptor<Aes256>;

/// Size on the wire of `plain_len` bytes once sealed
pub const fn sealed_len(plain_len: u64) -> u64 {
    HEADER_LEN as u64 + (plain_len / BLOCK as u64 + 1) * BLOCK as u64
}

/// Derive key and IV from a passphrase and salt
pub fn derive_key_iv(passphrase: &[u8], salt: &[u8; SALT_LEN]) -> ([u8; KEY_LEN], [u8; BLOCK]) {
    let mut material = Vec::with_capacity(KEY_LEN + BLOCK + 16);
    let mut prev: Vec<u8> = Vec::new();
    while material.len() < KEY_LEN + BLOCK {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(passphrase);
        hasher.update(salt);
        prev = hasher.finalize().to_vec();
        material.extend_from_slice(&prev);
    }
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; BLOCK];
    key.copy_from_slice(&material[..KEY_LEN]);
    iv.copy_from_slice(&material[KEY_LEN..KEY_LEN + BLOCK]);
    (key, iv)
}

fn cipher_err(e: impl std::fmt::Display) -> Error {
    Error::Crypto(e.to_string())
}

/// Incremental encryptor; emits the envelope header with its first output
pub struct Encryptor {
    passphrase: Vec<u8>,
    salt: Option<[u8; SALT_LEN]>,
    cipher: Option<CbcEnc>,
    pending: Vec<u8>,
}

impl Encryptor {
    /// Encryptor with a fresh random salt, drawn at the first update
    pub fn new(passphrase: &str) -> Self {
        Self {
            passphrase: passphrase.as_bytes().to_vec(),
            salt: None,
            cipher: None,
            pending: Vec::with_capacity(BLOCK),
        }
    }

    /// Encryptor with a fixed salt
    pub fn with_salt(passphrase: &str, salt: [u8; SALT_LEN]) -> Self {
        Self {
            salt: Some(salt),
            ..Self::new(passphrase)
        }
    }

    /// Whether the marker and salt have been emitted
    pub fn header_emitted(&self) -> bool {
        self.cipher.is_some()
    }

    fn start(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.cipher.is_some() {
            return Ok(());
        }
        let salt = match self.salt {
            Some(salt) => salt,
            None => {
                let mut salt = [0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                salt
            }
        };
        let (key, iv) = derive_key_iv(&self.passphrase, &salt);
        self.cipher = Some(CbcEnc::new_from_slices(&key, &iv).map_err(cipher_err)?);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&salt);
        Ok(())
    }

    fn seal_blocks(&mut self, out: &mut Vec<u8>, full: usize) -> Result<()> {
        let cipher = self
            .cipher
            .as_mut()
            .ok_or_else(|| Error::Crypto("cipher not initialized".into()))?;
        let start = out.len();
        out.extend(self.pending.drain(..full));
        for block in out[start..].chunks_exact_mut(BLOCK) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    /// Encrypt the next plaintext chunk; returns what is ready to send
    pub fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() + HEADER_LEN + BLOCK);
        self.start(&mut out)?;
        self.pending.extend_from_slice(input);
        let full = self.pending.len() / BLOCK * BLOCK;
        self.seal_blocks(&mut out, full)?;
        Ok(out)
    }

    /// Pad and encrypt the final block
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN + BLOCK);
        self.start(&mut out)?;
        let pad = BLOCK - self.pending.len() % BLOCK;
        self.pending.extend(std::iter::repeat_n(pad as u8, pad));
        let full = self.pending.len();
        self.seal_blocks(&mut out, full)?;
        Ok(out)
    }
}

/// Incremental decryptor for a payload whose header was already consumed
pub struct Decryptor {
    cipher: CbcDec,
    pending: Vec<u8>,
}

impl Decryptor {
    pub fn new(passphrase: &str, salt: &[u8; SALT_LEN]) -> Result<Self> {
        let (key, iv) = derive_key_iv(passphrase.as_bytes(), salt);
        Ok(Self {
            cipher: CbcDec::new_from_slices(&key, &iv).map_err(cipher_err)?,
            pending: Vec::with_capacity(BLOCK * 2),
        })
    }

    fn open_blocks(&mut self, count: usize) -> Vec<u8> {
        let mut out: Vec<u8> = self.pending.drain(..count * BLOCK).collect();
        for block in out.chunks_exact_mut(BLOCK) {
            self.cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    /// Decrypt the next ciphertext chunk. The last complete block is held
    /// back until [`Decryptor::finalize`] since it carries the padding.
    pub fn update(&mut self, input: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(input);
        let blocks = self.pending.len() / BLOCK;
        let ready = if self.pending.len() % BLOCK == 0 {
            blocks.saturating_sub(1)
        } else {
            blocks
        };
        self.open_blocks(ready)
    }

    /// Decrypt the held-back block and strip the padding
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        if self.pending.len() != BLOCK {
            return Err(Error::Crypto(format!(
                "truncated ciphertext: {} trailing bytes",
                self.pending.len()
            )));
        }
        let mut out = self.open_blocks(1);
        let pad = out.last().copied().unwrap_or(0) as usize;
        if pad == 0 || pad > BLOCK || !out[BLOCK - pad..].iter().all(|&b| b as usize == pad) {
            return Err(Error::Crypto("bad padding; wrong passphrase?".into()));
        }
        out.truncate(BLOCK - pad);
        Ok(out)
    }
}

/// Split an envelope header into its salt, if `header` starts with the marker
pub fn parse_header(header: &[u8]) -> Option<[u8; SALT_LEN]> {
    if header.len() < HEADER_LEN || &header[..MAGIC.len()] != MAGIC {
        return None;
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&header[MAGIC.len()..HEADER_LEN]);
    Some(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; SALT_LEN] = [1, 2, 3, 4, 5, 6, 7, 8];

    fn seal(pass: &str, chunks: &[&[u8]]) -> Vec<u8> {
        let mut enc = Encryptor::with_salt(pass, SALT);
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(enc.update(chunk).unwrap());
        }
        out.extend(enc.finalize().unwrap());
        out
    }

    fn open(pass: &str, sealed: &[u8], step: usize) -> Result<Vec<u8>> {
        let salt = parse_header(sealed).unwrap();
        let mut dec = Decryptor::new(pass, &salt)?;
        let mut out = Vec::new();
        for chunk in sealed[HEADER_LEN..].chunks(step) {
            out.extend(dec.update(chunk));
        }
        out.extend(dec.finalize()?);
        Ok(out)
    }

    #[test]
    fn test_derivation_matches_bytes_to_key() {
        let (key, iv) = derive_key_iv(b"secret", &SALT);
        let d1 = Md5::new().chain_update(b"secret").chain_update(SALT).finalize();
        let d2 = Md5::new()
            .chain_update(d1)
            .chain_update(b"secret")
            .chain_update(SALT)
            .finalize();
        let d3 = Md5::new()
            .chain_update(d2)
            .chain_update(b"secret")
            .chain_update(SALT)
            .finalize();
        assert_eq!(&key[..16], d1.as_slice());
        assert_eq!(&key[16..], d2.as_slice());
        assert_eq!(&iv[..], d3.as_slice());
    }

    #[test]
    fn test_header_emitted_once() {
        let sealed = seal("pw", &[b"hello ", b"world"]);
        assert_eq!(&sealed[..8], MAGIC);
        assert_eq!(&sealed[8..16], &SALT);
        assert_eq!(sealed.windows(8).filter(|w| w == MAGIC).count(), 1);
        assert_eq!(sealed.len() as u64, sealed_len(11));
    }

    #[test]
    fn test_roundtrip_across_chunk_boundaries() {
        let data: Vec<u8> = (0..100u8).collect();
        let sealed = seal("pw", &[&data[..7], &data[7..40], &data[40..]]);
        for step in [1, 5, 16, 33, 200] {
            assert_eq!(open("pw", &sealed, step).unwrap(), data);
        }
    }

    #[test]
    fn test_block_aligned_and_empty_inputs() {
        let data = [7u8; 32];
        let sealed = seal("pw", &[&data]);
        assert_eq!(sealed.len() as u64, sealed_len(32));
        assert_eq!(open("pw", &sealed, 16).unwrap(), data);

        let sealed = seal("pw", &[]);
        assert_eq!(sealed.len(), HEADER_LEN + 16);
        assert!(open("pw", &sealed, 16).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_passphrase_or_truncation() {
        let sealed = seal("pw", &[b"some plaintext"]);
        let result = open("other", &sealed, 16);
        // a wrong key almost always yields invalid padding
        if let Ok(plain) = result {
            assert_ne!(plain, b"some plaintext");
        }

        let truncated = &sealed[..sealed.len() - 3];
        assert!(matches!(open("pw", truncated, 16), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_parse_header() {
        assert!(parse_header(b"Salted__12345678rest").is_some());
        assert!(parse_header(b"Salted__123").is_none());
        assert!(parse_header(b"plaintext content").is_none());
    }

    #[test]
    fn test_random_salt_differs() {
        let mut a = Encryptor::new("pw");
        let mut b = Encryptor::new("pw");
        assert!(!a.header_emitted());
        let ha = a.update(b"x").unwrap();
        let hb = b.update(b"x").unwrap();
        assert!(a.header_emitted());
        assert_ne!(&ha[8..16], &hb[8..16]);
    }
}
