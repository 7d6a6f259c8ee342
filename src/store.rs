//! The content-addressed object store.
//!
//! An object is one regular file's verbatim bytes, filed under a path
//! derived from its hash, its size, and a collision slot. Identical files
//! dedup to the same object; different files unlucky enough to share a
//! hash and size get distinct slots.

use std::io::{self, prelude::*};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::error::Error;
use crate::file_util::DirWriter;
use crate::fs::{FileKind, Filesystem, mkdir_all};
use crate::hashing::ContentHash;

/// The repository-relative path of an object.
///
/// The 40 hex characters of the hash fan out as one character, then two,
/// then the rest; size and slot follow in unpadded hex. The split widths
/// are baked into every existing repository - don't touch them.
pub fn object_path(hash: &ContentHash, size: u64, slot: u8) -> Utf8PathBuf {
    let hex = hash.hex();
    Utf8PathBuf::from(format!(
        "{}/{}/{}x{:x}x{:x}",
        &hex[..1],
        &hex[1..3],
        &hex[3..],
        size,
        slot
    ))
}

pub struct ObjectStore<'a> {
    fs: &'a dyn Filesystem,
    repository: &'a Utf8Path,
}

impl<'a> ObjectStore<'a> {
    pub fn new(fs: &'a dyn Filesystem, repository: &'a Utf8Path) -> Self {
        Self { fs, repository }
    }

    /// Files `bytes` under the lowest free slot for `(hash, size)`,
    /// reusing an existing slot when its object is byte-identical.
    pub fn store_new(&self, bytes: &[u8], hash: &ContentHash, size: u64) -> Result<u8> {
        debug_assert_eq!(bytes.len() as u64, size);
        for slot in 0..=u8::MAX {
            let rel = object_path(hash, size, slot);
            let abs = self.repository.join(&rel);
            // lstat, not stat: a symlink squatting on an object path is an
            // occupied slot, not an object to follow.
            match self.fs.lstat(&abs) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.write_object(bytes, &abs)?;
                    debug!("Stored {rel}");
                    return Ok(slot);
                }
                Err(e) => return Err(e).with_context(|| format!("Couldn't stat {abs}")),
                Ok(stat) if stat.kind == FileKind::Regular && stat.size == size => {
                    if self.read_at(&abs)? == bytes {
                        trace!("{rel} already stored");
                        return Ok(slot);
                    }
                }
                // Same hash and size but different bytes (or not even a
                // regular file): try the next slot.
                Ok(_) => {}
            }
        }
        Err(Error::HashCollisionSpaceExhausted { hash: *hash, size }.into())
    }

    /// Reads an object back.
    pub fn read(&self, hash: &ContentHash, size: u64, slot: u8) -> Result<Vec<u8>> {
        let rel = object_path(hash, size, slot);
        let abs = self.repository.join(&rel);
        match self.fs.open_read(&abs) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::ObjectMissing { path: rel }.into())
            }
            Err(e) => Err(e).with_context(|| format!("Couldn't open {abs}")),
            Ok(mut r) => {
                let mut bytes = Vec::with_capacity(size as usize);
                r.read_to_end(&mut bytes)
                    .with_context(|| format!("Couldn't read {abs}"))?;
                Ok(bytes)
            }
        }
    }

    fn read_at(&self, abs: &Utf8Path) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.fs
            .open_read(abs)
            .and_then(|mut r| r.read_to_end(&mut bytes))
            .with_context(|| format!("Couldn't read {abs}"))?;
        Ok(bytes)
    }

    fn write_object(&self, bytes: &[u8], abs: &Utf8Path) -> Result<()> {
        let dir = abs.parent().expect("object paths have parents");
        mkdir_all(self.fs, dir).with_context(|| format!("Couldn't create {dir}"))?;
        let mut writer = DirWriter::create(self.fs, dir)?;
        writer.write_all(bytes)?;
        writer.commit(abs.file_name().expect("object paths have names"))
    }
}
