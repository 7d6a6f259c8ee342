//! Verifying stored objects against their recorded hashes.

use std::collections::HashMap;
use std::io::prelude::*;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::fs::{FileKind, Filesystem};
use crate::hashing::ContentHash;
use crate::metadata::{BackupHint, HistoryPoint, Metadata, PathState, RegularContent};
use crate::search::CONFIG_NAME;
use crate::store;

/// Re-hashes every object the metadata references and returns the paths
/// of nodes with at least one unhealthy history point - empty means the
/// repository checks out. Objects shared through dedup are read once.
pub fn check_integrity(
    metadata: &Metadata,
    fs: &dyn Filesystem,
    repository: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>> {
    let mut verdicts: HashMap<Utf8PathBuf, bool> = HashMap::new();
    let mut broken = Vec::new();

    for idx in metadata.preorder() {
        let node = metadata.node(idx);
        if node.hint.contains(BackupHint::NOT_PART_OF_REPOSITORY) {
            continue;
        }
        if !history_healthy(&node.history, fs, repository, &mut verdicts)? {
            broken.push(node.path.clone());
        }
    }
    // The recorded selection configs answer to the same standard.
    if !history_healthy(&metadata.config_history, fs, repository, &mut verdicts)? {
        broken.push(Utf8PathBuf::from(CONFIG_NAME));
    }
    Ok(broken)
}

fn history_healthy(
    history: &[HistoryPoint],
    fs: &dyn Filesystem,
    repository: &Utf8Path,
    verdicts: &mut HashMap<Utf8PathBuf, bool>,
) -> Result<bool> {
    let mut healthy = true;
    for point in history {
        if let PathState::Regular {
            size,
            content: RegularContent::Stored { hash, slot },
            ..
        } = &point.state
        {
            if !object_healthy(fs, repository, verdicts, hash, *size, *slot)? {
                healthy = false;
            }
        }
    }
    Ok(healthy)
}

fn object_healthy(
    fs: &dyn Filesystem,
    repository: &Utf8Path,
    verdicts: &mut HashMap<Utf8PathBuf, bool>,
    hash: &ContentHash,
    size: u64,
    slot: u8,
) -> Result<bool> {
    let rel = store::object_path(hash, size, slot);
    if let Some(known) = verdicts.get(&rel) {
        return Ok(*known);
    }
    let abs = repository.join(&rel);
    let healthy = match fs.lstat(&abs) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e).with_context(|| format!("Couldn't stat {abs}")),
        Ok(stat) if stat.kind != FileKind::Regular || stat.size != size => false,
        Ok(_) => {
            let mut bytes = Vec::with_capacity(size as usize);
            fs.open_read(&abs)
                .and_then(|mut r| r.read_to_end(&mut bytes))
                .with_context(|| format!("Couldn't read {abs}"))?;
            bytes.len() as u64 == size && ContentHash::hash(&bytes) == *hash
        }
    };
    if !healthy {
        warn!("{rel} doesn't match its record");
    }
    verdicts.insert(rel, healthy);
    Ok(healthy)
}
