use anyhow::{Context, Result, bail};
use camino::Utf8Path;

use crate::backup;
use crate::change::ChangeSummary;
use crate::codec;
use crate::file_util::nice_size;
use crate::fs::RealFilesystem;
use crate::lock::RepoLock;
use crate::metadata::BackupHint;
use crate::search::{CONFIG_NAME, SearchTree};

use super::confirm;

pub fn run(repository: &Utf8Path) -> Result<()> {
    let fs = RealFilesystem;
    let _lock = RepoLock::acquire(repository)?;

    let config_path = repository.join(CONFIG_NAME);
    let config_text = match std::fs::read_to_string(&config_path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("{repository} has no config file; create {config_path} first")
        }
        other => other.with_context(|| format!("Couldn't read {config_path}"))?,
    };
    let tree =
        SearchTree::parse(&config_text).with_context(|| format!("Couldn't parse {config_path}"))?;

    let mut metadata = codec::load(&fs, repository)?.unwrap_or_default();
    let summary = backup::plan(&mut metadata, &fs, repository, &tree)?;
    if summary.is_empty() {
        println!("nothing to back up");
        return Ok(());
    }

    print_summary(&summary);
    if !confirm("proceed?")? {
        bail!("backup aborted");
    }
    backup::finish(&mut metadata, &fs, repository)
}

fn print_summary(summary: &ChangeSummary) {
    for (hint, path) in &summary.changes {
        let sigil = if hint.contains(BackupHint::ADDED) {
            "+"
        } else if hint.intersects(BackupHint::REMOVED | BackupHint::LOST) {
            "-"
        } else {
            "M"
        };
        println!("{sigil} {path}");
    }
    if summary.config_changed {
        println!("M the selection config");
    }
    println!(
        "{} changes, {} to store",
        summary.changes.len(),
        nice_size(summary.new_bytes)
    );
}
