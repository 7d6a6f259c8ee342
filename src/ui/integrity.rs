use anyhow::{Result, bail};
use camino::Utf8Path;

use crate::check;
use crate::codec;
use crate::fs::RealFilesystem;
use crate::lock::RepoLock;

pub fn run(repository: &Utf8Path) -> Result<()> {
    let fs = RealFilesystem;
    let _lock = RepoLock::acquire(repository)?;

    let metadata = codec::load(&fs, repository)?.unwrap_or_default();
    let broken = check::check_integrity(&metadata, &fs, repository)?;
    if broken.is_empty() {
        println!("all stored data checks out");
        return Ok(());
    }
    for path in &broken {
        println!("{path}: corrupted");
    }
    bail!("{} corrupted node(s)", broken.len())
}
