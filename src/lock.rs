//! One writer per repository, enforced with an advisory lock.

use std::fs::{File, OpenOptions};

use anyhow::{Context, Result};
use camino::Utf8Path;
use rustix::fs::FlockOperation;
use tracing::*;

use crate::error::Error;

pub const LOCKFILE_NAME: &str = "lockfile";

/// Holds `<repo>/lockfile` exclusively until dropped (in practice, until
/// the process exits - every command takes it first and keeps it).
#[derive(Debug)]
pub struct RepoLock {
    _file: File,
}

impl RepoLock {
    pub fn acquire(repository: &Utf8Path) -> Result<Self> {
        let path = repository.join(LOCKFILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Couldn't open {path}"))?;
        match rustix::fs::flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {
                trace!("Locked {path}");
                Ok(Self { _file: file })
            }
            Err(rustix::io::Errno::WOULDBLOCK) => Err(Error::RepositoryBusy.into()),
            Err(e) => Err(anyhow::Error::from(std::io::Error::from(e))
                .context(format!("Couldn't lock {path}"))),
        }
    }
}
