//! Rebuilding part of the filesystem as it looked at a given backup.

use std::io::prelude::*;

use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use tracing::*;

use crate::file_util::DirWriter;
use crate::fs::{self, FileKind, Filesystem};
use crate::metadata::{Metadata, NodeIdx, PathState, Policy, RegularContent};
use crate::store::ObjectStore;

/// Rebuilds `root` and everything under it as of backup `target_id`:
/// recorded entities come back with their contents, targets, mode bits
/// and mtimes; entities absent at that point are removed if present.
/// Stops on the first I/O error - rerunning after fixing the cause is
/// always safe.
pub fn restore(
    metadata: &Metadata,
    fs: &dyn Filesystem,
    repository: &Utf8Path,
    target_id: u64,
    root: &Utf8Path,
) -> Result<()> {
    let store = ObjectStore::new(fs, repository);
    if root.as_str() == "/" {
        for &top in metadata.roots() {
            restore_node(metadata, fs, &store, top, target_id)?;
        }
        return Ok(());
    }

    let idx = metadata
        .lookup(root)
        .with_context(|| format!("{root} isn't part of any backup"))?;
    // The target's ancestors have to exist to restore into, but they're
    // not being restored themselves; missing ones become plain
    // directories.
    if let Some(parent) = root.parent() {
        fs::mkdir_all(fs, parent).with_context(|| format!("Couldn't create {parent}"))?;
    }
    restore_node(metadata, fs, &store, idx, target_id)
}

fn restore_node(
    metadata: &Metadata,
    fs: &dyn Filesystem,
    store: &ObjectStore,
    idx: NodeIdx,
    target_id: u64,
) -> Result<()> {
    let node = metadata.node(idx);
    let path = &node.path;
    match metadata.state_at(idx, target_id) {
        None | Some(PathState::NonExisting) => {
            trace!("{path} doesn't exist at backup {target_id}");
            fs::remove_all(fs, path)?;
        }
        Some(PathState::Directory { mode, mtime, .. }) => {
            match fs.lstat(path) {
                Ok(stat) if stat.kind == FileKind::Directory => {}
                Ok(_) => {
                    fs::remove_all(fs, path)?;
                    fs.mkdir(path)
                        .with_context(|| format!("Couldn't create {path}"))?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    fs.mkdir(path)
                        .with_context(|| format!("Couldn't create {path}"))?;
                }
                Err(e) => return Err(e).with_context(|| format!("Couldn't stat {path}")),
            }
            for &sub in &node.subnodes {
                restore_node(metadata, fs, store, sub, target_id)?;
            }
            // Mode and mtime go on last - filling the directory would
            // stomp an earlier mtime, and a read-only mode would lock us
            // out of our own restore. Structural ancestors aren't data;
            // they only need to exist.
            if node.policy != Policy::None {
                fs.set_mode(path, *mode)
                    .with_context(|| format!("Couldn't chmod {path}"))?;
                fs.set_mtime(path, *mtime)
                    .with_context(|| format!("Couldn't set times on {path}"))?;
            }
        }
        Some(PathState::Symlink { target, .. }) => {
            fs::remove_all(fs, path)?;
            fs.make_symlink(target, path)
                .with_context(|| format!("Couldn't link {path} -> {target}"))?;
        }
        Some(PathState::Regular {
            mode,
            mtime,
            size,
            content,
            ..
        }) => {
            if fs
                .lstat(path)
                .is_ok_and(|stat| stat.kind == FileKind::Directory)
            {
                // A rename won't replace a directory.
                fs::remove_all(fs, path)?;
            }
            let parent = path.parent().expect("nodes live below /");
            let mut writer = DirWriter::create(fs, parent)?;
            match content {
                RegularContent::Empty => {}
                RegularContent::Inline { bytes } => writer.write_all(bytes)?,
                RegularContent::Stored { hash, slot } => {
                    let bytes = store.read(hash, *size, *slot)?;
                    writer.write_all(&bytes)?;
                }
                RegularContent::Pending => bail!("{path} was never fully backed up"),
            }
            writer.commit(path.file_name().expect("nodes have names"))?;
            fs.set_mode(path, *mode)
                .with_context(|| format!("Couldn't chmod {path}"))?;
            fs.set_mtime(path, *mtime)
                .with_context(|| format!("Couldn't set times on {path}"))?;
        }
    }
    Ok(())
}
