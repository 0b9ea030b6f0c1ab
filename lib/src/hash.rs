//! Sha256 digests with serializable intermediate state.
//!
//! The appenders must be able to persist their hash states and continue the
//! computation in a later invocation, possibly in a different process. The
//! stock streaming hashers keep their state private, so this module drives
//! the `sha2` crate's compression function directly; the resumable state is
//! the eight 32-bit words of the chaining value, the processed byte count,
//! and the unprocessed tail of the input.

use std::fmt::{self, Display};
use std::io::Read;
use std::str::FromStr;

use generic_array::typenum::U64;
use generic_array::GenericArray;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::compress256;
use sha2::{Digest as _, Sha256};

use crate::{Error, Result};

/// A decently large buffer; system calls are expensive.
const BUF_CAPACITY: usize = 131072;

/// Identifies marker and layout version of a [`ResumableSha256`] snapshot.
const SNAPSHOT_MARKER: &[u8; 4] = b"ih01";

/// Sha256 initial chaining values, per FIPS 180-4.
const SHA256_INIT: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// The hash algorithms understood by this crate.
///
/// Only sha256 is produced today; sha512 is reserved in the state magic
/// format and will be added here when needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    /// SHA-256, the default for OCI content addressing.
    Sha256,
}

impl HashAlgorithm {
    /// The canonical lowercase name, as used in digest strings and magics.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    /// The digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
        }
    }
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(HashAlgorithm::Sha256),
            o => Err(Error::UnsupportedAlgorithm(o.to_string())),
        }
    }
}

/// A completed digest: an algorithm plus the raw digest bytes.
///
/// Displays (and serializes) in the conventional `sha256:<hex>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: HashAlgorithm,
    bytes: Box<[u8]>,
}

impl Digest {
    /// Wrap raw digest bytes. The length must match the algorithm.
    pub fn new(algorithm: HashAlgorithm, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != algorithm.digest_len() {
            return Err(Error::BadState(format!(
                "digest length {} does not match {algorithm}",
                bytes.len()
            )));
        }
        Ok(Self {
            algorithm,
            bytes: bytes.into_boxed_slice(),
        })
    }

    /// The algorithm that produced this digest.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The digest as lowercase hex, without an algorithm prefix.
    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, hexpart) = s
            .split_once(':')
            .ok_or_else(|| Error::BadState(format!("malformed digest {s:?}")))?;
        let algorithm = HashAlgorithm::from_str(algo)?;
        let bytes =
            hex::decode(hexpart).map_err(|e| Error::BadState(format!("malformed digest: {e}")))?;
        Digest::new(algorithm, bytes)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_str(&s).map_err(D::Error::custom)
    }
}

/// A streaming sha256 whose internal state can be snapshotted and restored.
///
/// `finalize` is non-destructive: it pads a copy of the state, so the hasher
/// can be snapshotted (and continued) after producing a digest.
#[derive(Debug, Clone)]
pub struct ResumableSha256 {
    state: [u32; 8],
    /// Bytes fully folded into `state`; always a multiple of 64.
    len: u64,
    buf: [u8; 64],
    buf_len: usize,
}

impl Default for ResumableSha256 {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumableSha256 {
    /// A fresh hasher.
    pub fn new() -> Self {
        Self {
            state: SHA256_INIT,
            len: 0,
            buf: [0u8; 64],
            buf_len: 0,
        }
    }

    fn compress_block(state: &mut [u32; 8], block: &[u8]) {
        debug_assert_eq!(block.len(), 64);
        let block: &GenericArray<u8, U64> = GenericArray::from_slice(block);
        compress256(state, std::slice::from_ref(block));
    }

    /// Fold `data` into the hash state.
    pub fn update(&mut self, data: &[u8]) {
        let mut data = data;
        if self.buf_len > 0 {
            let take = (64 - self.buf_len).min(data.len());
            self.buf[self.buf_len..self.buf_len + take].copy_from_slice(&data[..take]);
            self.buf_len += take;
            data = &data[take..];
            if self.buf_len == 64 {
                let buf = self.buf;
                Self::compress_block(&mut self.state, &buf);
                self.len += 64;
                self.buf_len = 0;
            }
        }
        let mut chunks = data.chunks_exact(64);
        for block in &mut chunks {
            Self::compress_block(&mut self.state, block);
            self.len += 64;
        }
        let rest = chunks.remainder();
        if !rest.is_empty() {
            self.buf[..rest.len()].copy_from_slice(rest);
            self.buf_len = rest.len();
        }
    }

    /// Total number of bytes hashed so far.
    pub fn count(&self) -> u64 {
        self.len + self.buf_len as u64
    }

    /// Produce the digest of everything hashed so far.
    ///
    /// The live state is untouched; further `update` calls continue from
    /// where the input left off.
    pub fn finalize(&self) -> Digest {
        let mut state = self.state;
        let bits = self.count() * 8;
        // Padding: 0x80, zeros, and the 64-bit big-endian bit count, filling
        // out one or two final blocks.
        let mut tail = [0u8; 128];
        tail[..self.buf_len].copy_from_slice(&self.buf[..self.buf_len]);
        tail[self.buf_len] = 0x80;
        let blocks = if self.buf_len < 56 { 1 } else { 2 };
        tail[blocks * 64 - 8..blocks * 64].copy_from_slice(&bits.to_be_bytes());
        for i in 0..blocks {
            Self::compress_block(&mut state, &tail[i * 64..(i + 1) * 64]);
        }
        let mut bytes = Vec::with_capacity(32);
        for word in state {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        Digest {
            algorithm: HashAlgorithm::Sha256,
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// Serialize the internal state.
    ///
    /// The layout is opaque to callers; the only guarantee is that
    /// [`ResumableSha256::restore`] of the same implementation accepts it.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(45 + self.buf_len);
        out.extend_from_slice(SNAPSHOT_MARKER);
        for word in self.state {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&self.len.to_be_bytes());
        out.push(self.buf_len as u8);
        out.extend_from_slice(&self.buf[..self.buf_len]);
        out
    }

    /// Rebuild a hasher from a snapshot produced by [`ResumableSha256::snapshot`].
    pub fn restore(data: &[u8]) -> Result<Self> {
        let bad = |msg: &str| Error::BadState(msg.to_string());
        if data.len() < 45 {
            return Err(bad("hash state truncated"));
        }
        if &data[..4] != SNAPSHOT_MARKER {
            return Err(bad("unrecognized hash state marker"));
        }
        let mut state = [0u32; 8];
        for (i, word) in state.iter_mut().enumerate() {
            let off = 4 + i * 4;
            *word = u32::from_be_bytes(data[off..off + 4].try_into().expect("4 bytes"));
        }
        let len = u64::from_be_bytes(data[36..44].try_into().expect("8 bytes"));
        let buf_len = data[44] as usize;
        if len % 64 != 0 || buf_len >= 64 || data.len() != 45 + buf_len {
            return Err(bad("inconsistent hash state"));
        }
        let mut buf = [0u8; 64];
        buf[..buf_len].copy_from_slice(&data[45..]);
        Ok(Self {
            state,
            len,
            buf,
            buf_len,
        })
    }
}

/// One-shot sha256 of an in-memory buffer.
pub fn sha256(data: &[u8]) -> Digest {
    let bytes = Sha256::digest(data).to_vec();
    Digest {
        algorithm: HashAlgorithm::Sha256,
        bytes: bytes.into_boxed_slice(),
    }
}

/// Sha256 of everything readable from `src`, returning the byte count too.
pub fn sha256_reader(mut src: impl Read) -> Result<(Digest, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_CAPACITY];
    let mut size = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let digest = Digest {
        algorithm: HashAlgorithm::Sha256,
        bytes: hasher.finalize().to_vec().into_boxed_slice(),
    };
    Ok((digest, size))
}
