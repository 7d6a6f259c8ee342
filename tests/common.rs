#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use assert_cmd::Command;
use walkdir::WalkDir;

/// A command against the given repository; callers add the subcommand
/// words and stdin.
pub fn cli_run(repository: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME"))?;
    cmd.arg(repository);
    Ok(cmd)
}

/// A backup invocation that answers the prompt with yes.
pub fn backup_yes(repository: &Path) -> Result<Command> {
    let mut cmd = cli_run(repository)?;
    cmd.write_stdin("y\n");
    Ok(cmd)
}

pub fn make_repo(repository: &Path, config: &str) {
    fs::create_dir_all(repository).expect("Couldn't create test repository");
    fs::write(repository.join("config"), config).expect("Couldn't write config");
}

pub fn files_in(p: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(p)
        .into_iter()
        .map(|e| e.expect("couldn't walk dir"))
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
}

/// Object files in the repository, i.e. everything but the bookkeeping.
pub fn objects_in(repository: &Path) -> Vec<PathBuf> {
    let mut objects: Vec<PathBuf> = files_in(repository)
        .filter(|p| {
            let name = p.file_name().unwrap().to_str().unwrap();
            !matches!(name, "config" | "metadata" | "lockfile" | "tmp-file")
        })
        .collect();
    objects.sort();
    objects
}

/// Pushes a file's mtime into the past so a later rewrite is always
/// detectable in whole seconds.
pub fn age_file(path: &Path) -> Result<()> {
    let old = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000_000);
    fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(old)?;
    Ok(())
}
