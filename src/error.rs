//! Failure kinds the rest of the tool (and its callers) can match on.
//!
//! Most errors propagate as [`anyhow::Error`] chains with path context
//! attached at the syscall site; these are the few where behavior depends
//! on *which* failure happened.

use camino::Utf8PathBuf;

use crate::hashing::ContentHash;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the repository is in use by another process")]
    RepositoryBusy,

    #[error("all 256 slots for {hash}x{size:x} are taken")]
    HashCollisionSpaceExhausted { hash: ContentHash, size: u64 },

    #[error("missing object {path}")]
    ObjectMissing { path: Utf8PathBuf },

    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    #[error("invalid arguments")]
    InvalidArgument,
}
