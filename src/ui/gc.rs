use anyhow::Result;
use camino::Utf8Path;

use crate::codec;
use crate::file_util::nice_size;
use crate::fs::RealFilesystem;
use crate::gc;
use crate::lock::RepoLock;

pub fn run(repository: &Utf8Path) -> Result<()> {
    let fs = RealFilesystem;
    let _lock = RepoLock::acquire(repository)?;

    // No metadata means nothing is referenced and almost everything goes.
    let metadata = codec::load(&fs, repository)?.unwrap_or_default();
    let stats = gc::collect_garbage(&metadata, &fs, repository, None)?;
    println!("deleted {} items ({})", stats.items, nice_size(stats.bytes));
    Ok(())
}
