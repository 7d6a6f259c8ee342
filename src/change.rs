//! Applying one filesystem scan to the metadata tree: the change
//! detection at the heart of every backup.

use std::collections::HashSet;
use std::io::prelude::*;

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::fs::{FileKind, Filesystem, Lstat};
use crate::hashing::HASH_SIZE;
use crate::metadata::{
    BackupHint, CURRENT_BACKUP, Metadata, NodeIdx, PathState, Policy, RegularContent,
};
use crate::search::{self, SearchResult, SearchTree};

/// What one scan wants to back up, for showing before committing to it.
#[derive(Debug, Default)]
pub struct ChangeSummary {
    /// Changed nodes in walk order, with what changed about them.
    pub changes: Vec<(BackupHint, Utf8PathBuf)>,
    /// File bytes awaiting hashing and storing.
    pub new_bytes: u64,
    /// The selection config itself changed since the last backup.
    pub config_changed: bool,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && !self.config_changed
    }

    fn note(&mut self, hint: BackupHint, path: &Utf8Path) {
        if !hint.is_empty() {
            self.changes.push((hint, path.to_owned()));
        }
    }
}

/// Runs the search over the filesystem and folds every observation into
/// the metadata, recording new history points under the in-progress
/// backup. Content of changed files larger than a hash is left
/// [`Pending`](RegularContent::Pending) for the backup finisher.
pub fn apply_scan(
    metadata: &mut Metadata,
    fs: &dyn Filesystem,
    tree: &SearchTree,
) -> Result<ChangeSummary> {
    // Hints describe one run; only the repository-membership bit sticks.
    let all: Vec<NodeIdx> = metadata.preorder().collect();
    for &idx in &all {
        let node = metadata.node_mut(idx);
        node.hint &= BackupHint::NOT_PART_OF_REPOSITORY;
    }

    let mut summary = ChangeSummary::default();
    let mut visited = HashSet::new();
    search::search(fs, tree, &mut |entry| {
        apply_entry(metadata, fs, entry, &mut visited, &mut summary)
    })?;
    sweep_unvisited(metadata, fs, &visited, &mut summary)?;
    Ok(summary)
}

fn apply_entry(
    metadata: &mut Metadata,
    fs: &dyn Filesystem,
    entry: SearchResult,
    visited: &mut HashSet<NodeIdx>,
    summary: &mut ChangeSummary,
) -> Result<()> {
    if entry.stat.kind == FileKind::Other {
        warn!("{}: unsupported file type, skipped", entry.path);
        return Ok(());
    }

    let idx = match metadata.lookup(&entry.path) {
        Some(idx) => idx,
        None => {
            let parent = match entry.path.parent() {
                Some(p) if p.as_str() != "/" => Some(
                    metadata
                        .lookup(p)
                        .with_context(|| format!("{p} seen after its contents"))?,
                ),
                _ => None,
            };
            let name = entry.path.file_name().expect("search yields named paths");
            metadata.insert_under(parent, name, entry.policy)?
        }
    };
    visited.insert(idx);

    let mut hint = BackupHint::empty();
    if metadata.node(idx).policy != entry.policy {
        hint |= BackupHint::POLICY_CHANGED;
        metadata.node_mut(idx).policy = entry.policy;
    }

    // What the filesystem says this is now...
    let mut candidate = state_from_fs(fs, &entry.path, &entry.stat)?;

    // ...versus what we have on record. Track always measures against its
    // freshest point, even one that records a disappearance; the
    // overwriting policies measure against the last state that existed.
    let previous = {
        let node = metadata.node(idx);
        match entry.policy {
            Policy::Track => node.newest(),
            _ => node.newest_existing(),
        }
        .map(|point| point.state.clone())
    };

    let mut state_hint = match &previous {
        None => BackupHint::ADDED,
        Some(previous) => diff_states(previous, &mut candidate),
    };
    // A mirrored entity coming back from under its disappearance marker
    // differs from the marker even when it matches its old self.
    if entry.policy != Policy::Track
        && metadata
            .node(idx)
            .newest()
            .is_some_and(|p| p.state.is_non_existing())
    {
        state_hint |= BackupHint::CONTENT_CHANGED;
    }
    hint |= state_hint;

    if !state_hint.is_empty() {
        if let PathState::Regular {
            size,
            content: RegularContent::Pending,
            ..
        } = &candidate
        {
            summary.new_bytes += size;
        }
        match entry.policy {
            Policy::Track => metadata.append_history(idx, CURRENT_BACKUP, candidate)?,
            Policy::None | Policy::Copy | Policy::Mirror => {
                metadata.drop_history_tail(idx, 0);
                metadata.append_history(idx, CURRENT_BACKUP, candidate)?;
            }
        }
    } else if hint.contains(BackupHint::POLICY_CHANGED) && entry.policy != Policy::Track {
        // No new state, but the history must shrink to the new policy.
        metadata.drop_history_tail(idx, 1);
    }

    summary.note(hint, &entry.path);
    metadata.node_mut(idx).hint |= hint;
    Ok(())
}

/// Builds the candidate state for an observed entity. Files small enough
/// to store inline are read right away (their bytes are what gets
/// compared); larger files stay [`Pending`](RegularContent::Pending)
/// until we know their content actually needs hashing.
pub(crate) fn state_from_fs(fs: &dyn Filesystem, path: &Utf8Path, stat: &Lstat) -> Result<PathState> {
    let state = match stat.kind {
        FileKind::Directory => PathState::Directory {
            uid: stat.uid,
            gid: stat.gid,
            mode: stat.mode,
            mtime: stat.mtime,
        },
        FileKind::Symlink => PathState::Symlink {
            uid: stat.uid,
            gid: stat.gid,
            target: fs
                .read_symlink(path)
                .with_context(|| format!("Couldn't read symlink {path}"))?,
        },
        FileKind::Regular => {
            let content = if stat.size == 0 {
                RegularContent::Empty
            } else if stat.size <= HASH_SIZE as u64 {
                let mut bytes = Vec::with_capacity(stat.size as usize);
                fs.open_read(path)
                    .and_then(|mut r| r.read_to_end(&mut bytes))
                    .with_context(|| format!("Couldn't read {path}"))?;
                ensure!(
                    bytes.len() as u64 == stat.size,
                    "{path} changed size mid-read"
                );
                RegularContent::Inline { bytes }
            } else {
                RegularContent::Pending
            };
            PathState::Regular {
                uid: stat.uid,
                gid: stat.gid,
                mode: stat.mode,
                mtime: stat.mtime,
                size: stat.size,
                content,
            }
        }
        FileKind::Other => unreachable!("callers filter these"),
    };
    Ok(state)
}

/// Compares the candidate against the previous state, returning the
/// observed deltas. May resolve the candidate's pending content in place
/// when size and mtime vouch for the recorded object.
pub(crate) fn diff_states(previous: &PathState, candidate: &mut PathState) -> BackupHint {
    use BackupHint as H;

    let mut hint = H::empty();
    if previous.kind() != candidate.kind() {
        // Type changes always count as content changes, and the fresh
        // entity never inherits the old hash.
        hint |= H::CONTENT_CHANGED;
        if matches!(candidate, PathState::Regular { size, .. } if *size > HASH_SIZE as u64) {
            hint |= H::FRESH_HASH;
        }
        return hint;
    }

    match (previous, candidate) {
        (
            PathState::Regular {
                uid: puid,
                gid: pgid,
                mode: pmode,
                mtime: pmtime,
                size: psize,
                content: pcontent,
            },
            PathState::Regular {
                uid,
                gid,
                mode,
                mtime,
                size,
                content,
            },
        ) => {
            if *puid != *uid || *pgid != *gid {
                hint |= H::OWNER_CHANGED;
            }
            if *pmode != *mode {
                hint |= H::PERMISSIONS_CHANGED;
            }
            if *pmtime != *mtime {
                hint |= H::TIMESTAMP_CHANGED;
            }
            if *psize != *size {
                hint |= H::CONTENT_CHANGED;
                if *size > HASH_SIZE as u64 {
                    hint |= H::FRESH_HASH;
                }
            } else if *size <= HASH_SIZE as u64 {
                if *pcontent != *content {
                    hint |= H::CONTENT_CHANGED;
                }
            } else if *pmtime == *mtime {
                // Same size and same mtime: trust the recorded object
                // instead of rehashing untold gigabytes.
                *content = pcontent.clone();
            } else {
                hint |= H::CONTENT_CHANGED | H::FRESH_HASH;
            }
        }
        (
            PathState::Symlink {
                uid: puid,
                gid: pgid,
                target: ptarget,
            },
            PathState::Symlink { uid, gid, target },
        ) => {
            if *puid != *uid || *pgid != *gid {
                hint |= H::OWNER_CHANGED;
            }
            if *ptarget != *target {
                hint |= H::CONTENT_CHANGED;
            }
        }
        (
            PathState::Directory {
                uid: puid,
                gid: pgid,
                mode: pmode,
                mtime: pmtime,
            },
            PathState::Directory {
                uid,
                gid,
                mode,
                mtime,
            },
        ) => {
            if *puid != *uid || *pgid != *gid {
                hint |= H::OWNER_CHANGED;
            }
            if *pmode != *mode {
                hint |= H::PERMISSIONS_CHANGED;
            }
            if *pmtime != *mtime {
                hint |= H::TIMESTAMP_CHANGED;
            }
        }
        _ => unreachable!("kinds match"),
    }
    hint
}

/// Nodes the scan never reached either vanished from disk or fell out of
/// the config's scope. Children go first so ancestors see their pruned
/// subtrees.
fn sweep_unvisited(
    metadata: &mut Metadata,
    fs: &dyn Filesystem,
    visited: &HashSet<NodeIdx>,
    summary: &mut ChangeSummary,
) -> Result<()> {
    let all: Vec<NodeIdx> = metadata.preorder().collect();
    for idx in all.into_iter().rev() {
        if visited.contains(&idx) {
            continue;
        }
        let (path, policy) = {
            let node = metadata.node(idx);
            (node.path.clone(), node.policy)
        };

        if fs.exists(&path) {
            // Still on disk; the config just doesn't cover it anymore.
            // Not worth a summary line every single run.
            trace!("{path} is loose");
            metadata.node_mut(idx).hint |= BackupHint::LOOSE;
            continue;
        }

        match policy {
            Policy::Track | Policy::Mirror => {
                if metadata
                    .node(idx)
                    .newest()
                    .is_some_and(|p| !p.state.is_non_existing())
                {
                    // Mirror keeps its last real state under the marker;
                    // Track just grows by one.
                    metadata.append_history(idx, CURRENT_BACKUP, PathState::NonExisting)?;
                    metadata.node_mut(idx).hint |= BackupHint::REMOVED;
                    summary.note(BackupHint::REMOVED, &path);
                }
            }
            Policy::None | Policy::Copy => {
                if metadata.node(idx).subnodes.is_empty() {
                    summary.note(BackupHint::LOST, &path);
                    metadata.remove_node(idx);
                } else if !metadata.node(idx).history.is_empty() {
                    // Descendants with history keep it alive as a bare
                    // structural ancestor.
                    metadata.drop_history_tail(idx, 0);
                    metadata.node_mut(idx).hint |= BackupHint::LOST;
                    summary.note(BackupHint::LOST, &path);
                }
            }
        }
    }
    Ok(())
}
