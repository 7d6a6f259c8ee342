use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::codec;
use crate::fs::RealFilesystem;
use crate::lock::RepoLock;
use crate::restore;

pub fn run(repository: &Utf8Path, target_id: u64, path: &Utf8Path) -> Result<()> {
    let fs = RealFilesystem;
    let _lock = RepoLock::acquire(repository)?;

    let metadata = codec::load(&fs, repository)?
        .with_context(|| format!("{repository} has no metadata; nothing was ever backed up"))?;
    restore::restore(&metadata, &fs, repository, target_id, path)
}
