//! Deleting repository objects nothing references anymore.

use std::collections::HashSet;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::codec::METADATA_NAME;
use crate::fs::{Filesystem, RemovalStats, recursive_remove_if};
use crate::lock::LOCKFILE_NAME;
use crate::metadata::{BackupHint, HistoryPoint, Metadata, PathState, RegularContent};
use crate::search::CONFIG_NAME;
use crate::store;

/// An optional window into a running sweep: `callback` runs after
/// deletions with the bytes freed so far, at most `max_calls` times.
/// Keep it quick - the sweep waits on it.
pub struct Progress<'a> {
    pub callback: &'a mut dyn FnMut(u64),
    pub max_calls: u32,
}

/// Removes everything in the repository that no history point references:
/// stray objects, leftover scratch files, emptied fan-out directories.
/// Top-level `config`, `metadata` and `lockfile` always stay.
pub fn collect_garbage(
    metadata: &Metadata,
    fs: &dyn Filesystem,
    repository: &Utf8Path,
    mut progress: Option<Progress>,
) -> Result<RemovalStats> {
    let referenced = referenced_paths(metadata);
    debug!("{} referenced objects", referenced.len());

    let mut calls = 0u32;
    let stats = recursive_remove_if(
        fs,
        repository,
        &mut |path, _| {
            let rel = path
                .strip_prefix(repository)
                .expect("the walk stays inside the repository");
            if matches!(rel.as_str(), CONFIG_NAME | METADATA_NAME | LOCKFILE_NAME) {
                return false;
            }
            !referenced.contains(rel)
        },
        &mut |stats| {
            if let Some(p) = progress.as_mut() {
                if calls < p.max_calls {
                    (p.callback)(stats.bytes);
                    calls += 1;
                }
            }
        },
    )?;
    info!("Deleted {} items ({} bytes)", stats.items, stats.bytes);
    Ok(stats)
}

/// Every repository-relative object path some history still points at.
/// Nodes flagged as not part of the repository contribute nothing - their
/// objects live elsewhere, whatever squats at the derived paths here is
/// fair game.
fn referenced_paths(metadata: &Metadata) -> HashSet<Utf8PathBuf> {
    fn add_all(history: &[HistoryPoint], referenced: &mut HashSet<Utf8PathBuf>) {
        for point in history {
            if let PathState::Regular {
                size,
                content: RegularContent::Stored { hash, slot },
                ..
            } = &point.state
            {
                referenced.insert(store::object_path(hash, *size, *slot));
            }
        }
    }

    let mut referenced = HashSet::new();
    for idx in metadata.preorder() {
        let node = metadata.node(idx);
        if node.hint.contains(BackupHint::NOT_PART_OF_REPOSITORY) {
            continue;
        }
        add_all(&node.history, &mut referenced);
    }
    add_all(&metadata.config_history, &mut referenced);
    referenced
}
