//! The in-memory metadata model: which paths we watch, the states we saw
//! them in, and which backups those observations belong to.
//!
//! Nodes and backup points form a graph with lots of shared references
//! (every history point names a backup, nodes point at parents and
//! children), so both live in index-addressed arenas owned by
//! [`Metadata`] and reference counts on backups are kept by hand.

use std::collections::HashMap;

use anyhow::{Result, ensure};
use bitflags::bitflags;
use camino::{Utf8Path, Utf8PathBuf};
use serde_derive::{Deserialize, Serialize};

use crate::fs::FileKind;
use crate::hashing::ContentHash;

/// How much history a node keeps across backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// A structural ancestor only, never backed up in its own right.
    None,
    /// Keep the latest state, overwriting on every change.
    Copy,
    /// As `Copy`, but remember when the entity disappears.
    Mirror,
    /// Keep every state ever observed.
    Track,
}

bitflags! {
    /// What the change detector saw at a node this run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BackupHint: u16 {
        const ADDED = 1 << 0;
        const REMOVED = 1 << 1;
        const LOST = 1 << 2;
        const POLICY_CHANGED = 1 << 3;
        const LOOSE = 1 << 4;
        const OWNER_CHANGED = 1 << 5;
        const PERMISSIONS_CHANGED = 1 << 6;
        const TIMESTAMP_CHANGED = 1 << 7;
        const CONTENT_CHANGED = 1 << 8;
        const FRESH_HASH = 1 << 9;
        /// This node's objects were never stored here; garbage collection
        /// and integrity checks leave them alone.
        const NOT_PART_OF_REPOSITORY = 1 << 10;
    }
}

/// A regular file's bytes, keyed by size: nothing for empty files,
/// verbatim bytes for files no longer than a hash, a repository object
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegularContent {
    Empty,
    Inline {
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    },
    Stored {
        hash: ContentHash,
        slot: u8,
    },
    /// Waiting for the backup finisher to hash and store the file.
    /// Never persisted.
    Pending,
}

/// One observed state of a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum PathState {
    NonExisting,
    Regular {
        uid: u32,
        gid: u32,
        mode: u32,
        mtime: i64,
        size: u64,
        content: RegularContent,
    },
    Symlink {
        uid: u32,
        gid: u32,
        target: Utf8PathBuf,
    },
    Directory {
        uid: u32,
        gid: u32,
        mode: u32,
        mtime: i64,
    },
}

impl PathState {
    /// The filesystem entity this state describes, if it describes one.
    pub fn kind(&self) -> Option<FileKind> {
        match self {
            PathState::NonExisting => None,
            PathState::Regular { .. } => Some(FileKind::Regular),
            PathState::Symlink { .. } => Some(FileKind::Symlink),
            PathState::Directory { .. } => Some(FileKind::Directory),
        }
    }

    pub fn is_non_existing(&self) -> bool {
        matches!(self, PathState::NonExisting)
    }
}

/// A backup point: one completed (or in-progress) snapshot of everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    /// 0 while in progress; assigned at persist time, newest highest.
    pub id: u64,
    /// Seconds since the epoch; 0 while in progress.
    pub completion_time: i64,
    /// How many history points reference this backup.
    pub ref_count: u64,
}

impl Backup {
    fn in_progress() -> Self {
        Self {
            id: 0,
            completion_time: 0,
            ref_count: 0,
        }
    }
}

/// Handle to a [`Backup`] in the metadata's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackupIdx(usize);

/// The in-progress backup every new observation lands under.
pub const CURRENT_BACKUP: BackupIdx = BackupIdx(0);

/// Handle to a [`PathNode`] in the metadata's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIdx(usize);

/// One (backup, state) observation. Histories keep these newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub backup: BackupIdx,
    pub state: PathState,
}

/// A watched path.
#[derive(Debug)]
pub struct PathNode {
    /// Full path, no trailing slash.
    pub path: Utf8PathBuf,
    pub policy: Policy,
    pub hint: BackupHint,
    /// Newest first; backup ids strictly decrease down the list.
    pub history: Vec<HistoryPoint>,
    pub subnodes: Vec<NodeIdx>,
    pub parent: Option<NodeIdx>,
}

impl PathNode {
    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or(self.path.as_str())
    }

    pub fn newest(&self) -> Option<&HistoryPoint> {
        self.history.first()
    }

    /// The newest point that records an actual entity.
    pub fn newest_existing(&self) -> Option<&HistoryPoint> {
        self.history.iter().find(|p| !p.state.is_non_existing())
    }
}

#[derive(Debug)]
pub struct Metadata {
    /// `backups[0]` is always the in-progress backup. Completed ones
    /// follow in arbitrary arena order; freed ones (`ref_count == 0`)
    /// linger as tombstones until the next encode drops them.
    backups: Vec<Backup>,
    /// History of the selection config file itself.
    pub config_history: Vec<HistoryPoint>,
    nodes: Vec<Option<PathNode>>,
    /// Top-level nodes in insertion order.
    roots: Vec<NodeIdx>,
    path_table: HashMap<Utf8PathBuf, NodeIdx>,
    total_path_count: u64,
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            backups: vec![Backup::in_progress()],
            config_history: Vec::new(),
            nodes: Vec::new(),
            roots: Vec::new(),
            path_table: HashMap::new(),
            total_path_count: 0,
        }
    }

    pub fn backup(&self, idx: BackupIdx) -> &Backup {
        &self.backups[idx.0]
    }

    pub fn current_backup(&self) -> &Backup {
        &self.backups[0]
    }

    /// Completed backups still referenced by some history.
    pub fn completed_backups(&self) -> impl Iterator<Item = (BackupIdx, &Backup)> {
        self.backups
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, b)| b.ref_count > 0)
            .map(|(i, b)| (BackupIdx(i), b))
    }

    pub fn max_backup_id(&self) -> u64 {
        self.completed_backups()
            .map(|(_, b)| b.id)
            .max()
            .unwrap_or(0)
    }

    /// Registers a completed backup (decoding, tests).
    pub fn add_completed_backup(&mut self, id: u64, completion_time: i64) -> BackupIdx {
        self.backups.push(Backup {
            id,
            completion_time,
            ref_count: 0,
        });
        BackupIdx(self.backups.len() - 1)
    }

    /// Ordering key for history: the in-progress backup outranks
    /// everything already persisted.
    fn ordinal(&self, idx: BackupIdx) -> u64 {
        if idx == CURRENT_BACKUP {
            u64::MAX
        } else {
            self.backups[idx.0].id
        }
    }

    pub fn node(&self, idx: NodeIdx) -> &PathNode {
        self.nodes[idx.0].as_ref().expect("removed node")
    }

    pub fn node_mut(&mut self, idx: NodeIdx) -> &mut PathNode {
        self.nodes[idx.0].as_mut().expect("removed node")
    }

    pub fn lookup(&self, path: &Utf8Path) -> Option<NodeIdx> {
        self.path_table.get(path).copied()
    }

    pub fn roots(&self) -> &[NodeIdx] {
        &self.roots
    }

    pub fn total_path_count(&self) -> u64 {
        self.total_path_count
    }

    /// Creates a node under `parent` (or at top level) and registers it.
    pub fn insert_under(
        &mut self,
        parent: Option<NodeIdx>,
        name: &str,
        policy: Policy,
    ) -> Result<NodeIdx> {
        let path = match parent {
            Some(p) => self.node(p).path.join(name),
            None => Utf8PathBuf::from("/").join(name),
        };
        ensure!(
            !self.path_table.contains_key(&path),
            "{path} is already registered"
        );
        self.nodes.push(Some(PathNode {
            path: path.clone(),
            policy,
            hint: BackupHint::empty(),
            history: Vec::new(),
            subnodes: Vec::new(),
            parent,
        }));
        let idx = NodeIdx(self.nodes.len() - 1);
        match parent {
            Some(p) => self.node_mut(p).subnodes.push(idx),
            None => self.roots.push(idx),
        }
        self.path_table.insert(path, idx);
        self.total_path_count += 1;
        Ok(idx)
    }

    /// Prepends a point observed under `backup`; stale inserts are
    /// rejected so ids keep strictly decreasing down every history.
    pub fn append_history(
        &mut self,
        node: NodeIdx,
        backup: BackupIdx,
        state: PathState,
    ) -> Result<()> {
        if let Some(newest) = self.node(node).history.first() {
            ensure!(
                self.ordinal(backup) > self.ordinal(newest.backup),
                "{}: history point isn't newer than the recorded ones",
                self.node(node).path
            );
        }
        self.backups[backup.0].ref_count += 1;
        self.nodes[node.0]
            .as_mut()
            .expect("removed node")
            .history
            .insert(0, HistoryPoint { backup, state });
        Ok(())
    }

    /// Same, for the selection config's own history.
    pub fn append_config_history(&mut self, backup: BackupIdx, state: PathState) -> Result<()> {
        if let Some(newest) = self.config_history.first() {
            ensure!(
                self.ordinal(backup) > self.ordinal(newest.backup),
                "config history point isn't newer than the recorded ones"
            );
        }
        self.backups[backup.0].ref_count += 1;
        self.config_history.insert(0, HistoryPoint { backup, state });
        Ok(())
    }

    /// Drops all but the newest `keep` points, releasing their backups.
    /// This is how a Copy or Mirror node collapses its history.
    pub fn drop_history_tail(&mut self, node: NodeIdx, keep: usize) {
        let tail = {
            let n = self.nodes[node.0].as_mut().expect("removed node");
            if n.history.len() <= keep {
                return;
            }
            n.history.split_off(keep)
        };
        for point in tail {
            self.backups[point.backup.0].ref_count -= 1;
        }
    }

    /// Unregisters a leaf node. Subtrees go leaves-first.
    pub fn remove_node(&mut self, node: NodeIdx) {
        assert!(
            self.node(node).subnodes.is_empty(),
            "removing a node that still has subnodes"
        );
        self.drop_history_tail(node, 0);
        let removed = self.nodes[node.0].take().expect("removed node");
        self.path_table.remove(&removed.path);
        let siblings = match removed.parent {
            Some(p) => &mut self.nodes[p.0].as_mut().expect("removed node").subnodes,
            None => &mut self.roots,
        };
        siblings.retain(|&s| s != node);
        self.total_path_count -= 1;
    }

    /// Pre-order over all nodes: top-level paths in insertion order, then
    /// subnodes likewise. Change reporting depends on this being stable.
    pub fn preorder(&self) -> Preorder<'_> {
        Preorder {
            metadata: self,
            stack: self.roots.iter().rev().copied().collect(),
        }
    }

    /// The node's state as of backup `target_id`: the newest completed
    /// point no newer than the target.
    pub fn state_at(&self, node: NodeIdx, target_id: u64) -> Option<&PathState> {
        self.node(node)
            .history
            .iter()
            .find(|p| {
                let b = &self.backups[p.backup.0];
                b.id != 0 && b.id <= target_id
            })
            .map(|p| &p.state)
    }

    /// Retires the in-progress backup as the newest completed one,
    /// returning its assigned id - unless nothing references it, in which
    /// case there is nothing to retire and no id is burned.
    pub fn promote_current(&mut self, completion_time: i64) -> Option<u64> {
        if self.backups[0].ref_count == 0 {
            return None;
        }
        let id = self.max_backup_id() + 1;
        let mut finished = std::mem::replace(&mut self.backups[0], Backup::in_progress());
        finished.id = id;
        finished.completion_time = completion_time;
        self.backups.push(finished);
        let promoted = BackupIdx(self.backups.len() - 1);

        for node in self.nodes.iter_mut().flatten() {
            for point in &mut node.history {
                if point.backup == CURRENT_BACKUP {
                    point.backup = promoted;
                }
            }
        }
        for point in &mut self.config_history {
            if point.backup == CURRENT_BACKUP {
                point.backup = promoted;
            }
        }
        Some(id)
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Preorder<'a> {
    metadata: &'a Metadata,
    stack: Vec<NodeIdx>,
}

impl Iterator for Preorder<'_> {
    type Item = NodeIdx;

    fn next(&mut self) -> Option<NodeIdx> {
        let idx = self.stack.pop()?;
        let node = self.metadata.node(idx);
        self.stack.extend(node.subnodes.iter().rev().copied());
        Some(idx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dir_state(mtime: i64) -> PathState {
        PathState::Directory {
            uid: 1000,
            gid: 1000,
            mode: 0o755,
            mtime,
        }
    }

    #[test]
    fn insert_and_lookup() -> Result<()> {
        let mut md = Metadata::new();
        let home = md.insert_under(None, "home", Policy::None)?;
        let user = md.insert_under(Some(home), "user", Policy::Track)?;

        assert_eq!(md.lookup(Utf8Path::new("/home")), Some(home));
        assert_eq!(md.lookup(Utf8Path::new("/home/user")), Some(user));
        assert_eq!(md.node(user).path, "/home/user");
        assert_eq!(md.node(user).name(), "user");
        assert_eq!(md.total_path_count(), 2);

        // No two nodes may share a path.
        assert!(md.insert_under(Some(home), "user", Policy::Copy).is_err());
        Ok(())
    }

    #[test]
    fn preorder_is_insertion_ordered() -> Result<()> {
        let mut md = Metadata::new();
        let b = md.insert_under(None, "b", Policy::None)?;
        let a = md.insert_under(None, "a", Policy::None)?;
        let b_kid = md.insert_under(Some(b), "kid", Policy::Copy)?;
        let order: Vec<NodeIdx> = md.preorder().collect();
        assert_eq!(order, [b, b_kid, a]);
        Ok(())
    }

    #[test]
    fn history_rejects_stale_points() -> Result<()> {
        let mut md = Metadata::new();
        let node = md.insert_under(None, "etc", Policy::Track)?;
        let old = md.add_completed_backup(1, 100);
        let newer = md.add_completed_backup(2, 200);

        md.append_history(node, old, dir_state(10))?;
        md.append_history(node, newer, dir_state(20))?;
        // Can't slide an older backup in on top.
        assert!(md.append_history(node, old, dir_state(30)).is_err());
        // The in-progress backup always counts as newest.
        md.append_history(node, CURRENT_BACKUP, dir_state(40))?;

        assert_eq!(md.backup(old).ref_count, 1);
        assert_eq!(md.backup(newer).ref_count, 1);
        assert_eq!(md.current_backup().ref_count, 1);
        Ok(())
    }

    #[test]
    fn dropping_tails_releases_backups() -> Result<()> {
        let mut md = Metadata::new();
        let node = md.insert_under(None, "etc", Policy::Track)?;
        let b1 = md.add_completed_backup(1, 100);
        let b2 = md.add_completed_backup(2, 200);
        md.append_history(node, b1, dir_state(10))?;
        md.append_history(node, b2, dir_state(20))?;

        md.drop_history_tail(node, 1);
        assert_eq!(md.node(node).history.len(), 1);
        assert_eq!(md.backup(b1).ref_count, 0);
        assert_eq!(md.backup(b2).ref_count, 1);
        assert_eq!(md.max_backup_id(), 2);
        Ok(())
    }

    #[test]
    fn promote_repoints_history() -> Result<()> {
        let mut md = Metadata::new();
        let node = md.insert_under(None, "etc", Policy::Track)?;
        md.append_history(node, CURRENT_BACKUP, dir_state(10))?;

        let id = md.promote_current(12345).unwrap();
        assert_eq!(id, 1);
        assert_eq!(md.current_backup().ref_count, 0);

        let point = &md.node(node).history[0];
        assert_eq!(md.backup(point.backup).id, 1);
        assert_eq!(md.backup(point.backup).completion_time, 12345);
        assert_eq!(md.backup(point.backup).ref_count, 1);

        // Nothing new recorded: nothing to promote, no id burned.
        assert_eq!(md.promote_current(12346), None);
        Ok(())
    }

    #[test]
    fn state_at_picks_the_newest_at_or_before() -> Result<()> {
        let mut md = Metadata::new();
        let node = md.insert_under(None, "etc", Policy::Track)?;
        let b1 = md.add_completed_backup(1, 100);
        let b3 = md.add_completed_backup(3, 300);
        md.append_history(node, b1, dir_state(10))?;
        md.append_history(node, b3, dir_state(30))?;

        assert_eq!(md.state_at(node, 0), None);
        assert_eq!(md.state_at(node, 1), Some(&dir_state(10)));
        assert_eq!(md.state_at(node, 2), Some(&dir_state(10)));
        assert_eq!(md.state_at(node, 3), Some(&dir_state(30)));
        assert_eq!(md.state_at(node, 99), Some(&dir_state(30)));
        Ok(())
    }

    #[test]
    fn remove_node_unregisters() -> Result<()> {
        let mut md = Metadata::new();
        let home = md.insert_under(None, "home", Policy::None)?;
        let user = md.insert_under(Some(home), "user", Policy::Copy)?;
        md.append_history(user, CURRENT_BACKUP, dir_state(1))?;

        md.remove_node(user);
        assert_eq!(md.lookup(Utf8Path::new("/home/user")), None);
        assert_eq!(md.total_path_count(), 1);
        assert_eq!(md.current_backup().ref_count, 0);
        assert!(md.node(home).subnodes.is_empty());
        Ok(())
    }
}
