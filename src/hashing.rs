//! Tools for hashing file contents into a [`ContentHash`]

use std::fmt;
use std::io::prelude::*;

use anyhow::{Result, ensure};
use data_encoding::HEXLOWER;
use sha1::{Digest, Sha1, digest::Output};

type Sha1Digest = Output<Sha1>;

/// Width of a [`ContentHash`] in bytes.
///
/// Doubles as the inline-content threshold: a regular file no longer than
/// this is stored verbatim in the metadata instead of as a repository
/// object.
pub const HASH_SIZE: usize = 20;

/// The hash (a SHA1) used to identify stored objects.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ContentHash {
    digest: Sha1Digest,
}

impl ContentHash {
    /// Calculates the hash of the given bytes
    pub fn hash(bytes: &[u8]) -> Self {
        Self {
            digest: Sha1::digest(bytes),
        }
    }

    fn from_digest(digest: Sha1Digest) -> Self {
        Self { digest }
    }

    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self {
            digest: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.digest.as_slice()
    }

    /// Lowercase hex, always 40 characters.
    pub fn hex(&self) -> String {
        HEXLOWER.encode(&self.digest)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ digest: {} }}", self.hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl serde::Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.digest.as_slice())
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<ContentHash, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        let bytes: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| serde::de::Error::invalid_length(b.len(), &"a 20-byte hash"))?;
        Ok(ContentHash::from_bytes(bytes))
    }
}

/// Reads `r` to the end in bounded chunks, returning the bytes read and
/// their hash.
///
/// `expected_size` is the size the caller's `lstat` reported. A file that
/// grows or shrinks mid-read would poison the snapshot, so any drift is an
/// error.
pub fn read_and_hash<R: Read>(r: &mut R, expected_size: u64) -> Result<(Vec<u8>, ContentHash)> {
    const CHUNK_SIZE: usize = 64 * 1024;

    let mut hasher = Sha1::new();
    let mut bytes = Vec::with_capacity(expected_size.min(CHUNK_SIZE as u64) as usize);
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let count = r.read(&mut buf)?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
        bytes.extend_from_slice(&buf[..count]);
    }
    ensure!(
        bytes.len() as u64 == expected_size,
        "file changed size mid-read: expected {} bytes, read {}",
        expected_size,
        bytes.len()
    );
    Ok((bytes, ContentHash::from_digest(hasher.finalize())))
}
