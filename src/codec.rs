//! Reading and writing the metadata file.
//!
//! The on-disk form is eight magic bytes followed by one CBOR document.
//! Backups are written newest first and only while something references
//! them; history points name their backup by position in that list. Node
//! paths aren't stored - they rebuild from parent joins while decoding.

use std::collections::HashMap;
use std::io::{self, prelude::*};

use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::error::Error;
use crate::file_util::{DirWriter, check_magic};
use crate::fs::Filesystem;
use crate::hashing::HASH_SIZE;
use crate::metadata::{
    Backup, BackupHint, BackupIdx, HistoryPoint, Metadata, NodeIdx, PathState, Policy,
    RegularContent,
};

pub const METADATA_NAME: &str = "metadata";
const MAGIC_BYTES: &[u8] = b"nbmeta\x00\x01";

#[derive(Debug, Serialize, Deserialize)]
struct DiskMetadata {
    backups: Vec<DiskBackup>,
    config_history: Vec<DiskPoint>,
    paths: Vec<DiskNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskBackup {
    id: u64,
    completion_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskPoint {
    /// Position in [`DiskMetadata::backups`].
    backup: u64,
    state: PathState,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskNode {
    name: String,
    policy: Policy,
    hint: u16,
    history: Vec<DiskPoint>,
    subnodes: Vec<DiskNode>,
}

fn corrupt(msg: impl Into<String>) -> anyhow::Error {
    Error::CorruptMetadata(msg.into()).into()
}

pub fn encode(metadata: &Metadata) -> Result<Vec<u8>> {
    let mut live: Vec<(BackupIdx, &Backup)> = metadata.completed_backups().collect();
    live.sort_by(|a, b| b.1.id.cmp(&a.1.id));
    let positions: HashMap<BackupIdx, u64> = live
        .iter()
        .enumerate()
        .map(|(position, (idx, _))| (*idx, position as u64))
        .collect();

    let disk = DiskMetadata {
        backups: live
            .iter()
            .map(|(_, b)| DiskBackup {
                id: b.id,
                completion_time: b.completion_time,
            })
            .collect(),
        config_history: points_to_disk(&metadata.config_history, &positions)?,
        paths: metadata
            .roots()
            .iter()
            .map(|&root| node_to_disk(metadata, root, &positions))
            .collect::<Result<_>>()?,
    };

    let mut bytes = Vec::from(MAGIC_BYTES);
    ciborium::ser::into_writer(&disk, &mut bytes).context("CBOR encoding of metadata failed")?;
    Ok(bytes)
}

fn node_to_disk(
    metadata: &Metadata,
    idx: NodeIdx,
    positions: &HashMap<BackupIdx, u64>,
) -> Result<DiskNode> {
    let node = metadata.node(idx);
    Ok(DiskNode {
        name: node.name().to_owned(),
        policy: node.policy,
        hint: node.hint.bits(),
        history: points_to_disk(&node.history, positions)
            .with_context(|| format!("Couldn't persist {}", node.path))?,
        subnodes: node
            .subnodes
            .iter()
            .map(|&sub| node_to_disk(metadata, sub, positions))
            .collect::<Result<_>>()?,
    })
}

fn points_to_disk(
    history: &[HistoryPoint],
    positions: &HashMap<BackupIdx, u64>,
) -> Result<Vec<DiskPoint>> {
    history
        .iter()
        .map(|point| {
            if matches!(
                &point.state,
                PathState::Regular {
                    content: RegularContent::Pending,
                    ..
                }
            ) {
                bail!("unresolved file contents can't be persisted");
            }
            let backup = *positions
                .get(&point.backup)
                .context("history references an unpersisted backup")?;
            Ok(DiskPoint {
                backup,
                state: point.state.clone(),
            })
        })
        .collect()
}

pub fn decode(bytes: &[u8]) -> Result<Metadata> {
    let mut r = bytes;
    check_magic(&mut r, MAGIC_BYTES).map_err(|e| corrupt(format!("{e:#}")))?;
    let disk: DiskMetadata = ciborium::de::from_reader(r)
        .map_err(|e| corrupt(format!("CBOR decoding failed: {e}")))?;

    let mut metadata = Metadata::new();
    let mut backup_idxs = Vec::with_capacity(disk.backups.len());
    let mut last_id = u64::MAX;
    for backup in &disk.backups {
        if backup.id == 0 || backup.id >= last_id {
            return Err(corrupt("backup ids must be nonzero and strictly decreasing"));
        }
        last_id = backup.id;
        backup_idxs.push(metadata.add_completed_backup(backup.id, backup.completion_time));
    }

    // Histories are stored newest first but append wants them oldest
    // first so its ordering checks can do their job.
    for point in disk.config_history.iter().rev() {
        let (backup, state) = resolve_point(point, &backup_idxs)?;
        validate_state(&state)?;
        metadata
            .append_config_history(backup, state)
            .map_err(|e| corrupt(format!("{e:#}")))?;
    }

    for node in &disk.paths {
        attach_node(&mut metadata, None, node, &backup_idxs)?;
    }
    Ok(metadata)
}

fn resolve_point(point: &DiskPoint, backup_idxs: &[BackupIdx]) -> Result<(BackupIdx, PathState)> {
    let idx = backup_idxs
        .get(point.backup as usize)
        .ok_or_else(|| corrupt(format!("history references backup #{}", point.backup)))?;
    Ok((*idx, point.state.clone()))
}

fn attach_node(
    metadata: &mut Metadata,
    parent: Option<NodeIdx>,
    disk: &DiskNode,
    backup_idxs: &[BackupIdx],
) -> Result<()> {
    if disk.name.is_empty() || disk.name.contains('/') {
        return Err(corrupt(format!("bad node name {:?}", disk.name)));
    }
    let idx = metadata
        .insert_under(parent, &disk.name, disk.policy)
        .map_err(|e| corrupt(format!("{e:#}")))?;
    metadata.node_mut(idx).hint = BackupHint::from_bits(disk.hint)
        .ok_or_else(|| corrupt(format!("unknown hint bits {:#x}", disk.hint)))?;

    for point in disk.history.iter().rev() {
        let (backup, state) = resolve_point(point, backup_idxs)?;
        validate_state(&state)?;
        metadata
            .append_history(idx, backup, state)
            .map_err(|e| corrupt(format!("{e:#}")))?;
    }
    validate_history(metadata, idx)?;

    for sub in &disk.subnodes {
        attach_node(metadata, Some(idx), sub, backup_idxs)?;
    }
    Ok(())
}

/// The content tag must agree with the size, always.
fn validate_state(state: &PathState) -> Result<()> {
    let PathState::Regular { size, content, .. } = state else {
        return Ok(());
    };
    let consistent = match content {
        RegularContent::Empty => *size == 0,
        RegularContent::Inline { bytes } => {
            *size > 0 && *size <= HASH_SIZE as u64 && bytes.len() as u64 == *size
        }
        RegularContent::Stored { .. } => *size > HASH_SIZE as u64,
        RegularContent::Pending => false,
    };
    if !consistent {
        return Err(corrupt(format!("file content doesn't fit its size {size}")));
    }
    Ok(())
}

/// What a node's policy permits of its history.
fn validate_history(metadata: &Metadata, idx: NodeIdx) -> Result<()> {
    let node = metadata.node(idx);
    let ok = match node.policy {
        Policy::None | Policy::Copy => {
            node.history.len() <= 1 && node.newest().is_none_or(|p| !p.state.is_non_existing())
        }
        // A mirrored entity that disappeared keeps its last real state
        // under the marker; that's the only two-point shape allowed.
        Policy::Mirror => match node.history.len() {
            0 | 1 => node.newest().is_none_or(|p| !p.state.is_non_existing()),
            2 => {
                node.history[0].state.is_non_existing()
                    && !node.history[1].state.is_non_existing()
            }
            _ => false,
        },
        Policy::Track => true,
    };
    if !ok {
        return Err(corrupt(format!(
            "{}: history not permitted by its {:?} policy",
            node.path, node.policy
        )));
    }
    Ok(())
}

/// Writes the metadata into `<repo>/metadata`, atomically.
pub fn save(fs: &dyn Filesystem, repository: &Utf8Path, metadata: &Metadata) -> Result<()> {
    let bytes = encode(metadata)?;
    let mut writer = DirWriter::create(fs, repository)?;
    writer.write_all(&bytes)?;
    writer.commit(METADATA_NAME).context("Couldn't save metadata")?;
    debug!("Saved metadata ({} bytes)", bytes.len());
    Ok(())
}

/// Loads `<repo>/metadata`; `None` if there isn't one yet.
pub fn load(fs: &dyn Filesystem, repository: &Utf8Path) -> Result<Option<Metadata>> {
    let path = repository.join(METADATA_NAME);
    let mut r = match fs.open_read(&path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        other => other.with_context(|| format!("Couldn't open {path}"))?,
    };
    let mut bytes = Vec::new();
    r.read_to_end(&mut bytes)
        .with_context(|| format!("Couldn't read {path}"))?;
    decode(&bytes)
        .map(Some)
        .with_context(|| format!("Couldn't load {path}"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hashing::ContentHash;
    use crate::metadata::CURRENT_BACKUP;

    fn build_test_metadata() -> Metadata {
        let mut md = Metadata::new();
        let b1 = md.add_completed_backup(1, 1_600_000_000);
        let b2 = md.add_completed_backup(2, 1_600_086_400);

        md.append_config_history(
            b2,
            PathState::Regular {
                uid: 0,
                gid: 0,
                mode: 0o644,
                mtime: 1000,
                size: 9,
                content: RegularContent::Inline {
                    bytes: b"[track]\n/".to_vec(),
                },
            },
        )
        .unwrap();

        let etc = md.insert_under(None, "etc", Policy::None).unwrap();
        md.append_history(
            etc,
            b2,
            PathState::Directory {
                uid: 0,
                gid: 0,
                mode: 0o755,
                mtime: 500,
            },
        )
        .unwrap();

        let passwd = md.insert_under(Some(etc), "passwd", Policy::Track).unwrap();
        md.append_history(
            passwd,
            b1,
            PathState::Regular {
                uid: 0,
                gid: 0,
                mode: 0o644,
                mtime: 400,
                size: 100,
                content: RegularContent::Stored {
                    hash: ContentHash::hash(b"old passwd"),
                    slot: 0,
                },
            },
        )
        .unwrap();
        md.append_history(
            passwd,
            b2,
            PathState::Regular {
                uid: 0,
                gid: 0,
                mode: 0o644,
                mtime: 450,
                size: 120,
                content: RegularContent::Stored {
                    hash: ContentHash::hash(b"new passwd"),
                    slot: 1,
                },
            },
        )
        .unwrap();

        let link = md.insert_under(Some(etc), "mtab", Policy::Copy).unwrap();
        md.append_history(
            link,
            b2,
            PathState::Symlink {
                uid: 0,
                gid: 0,
                target: "/proc/self/mounts".into(),
            },
        )
        .unwrap();

        let gone = md.insert_under(Some(etc), "rumors", Policy::Mirror).unwrap();
        md.append_history(
            gone,
            b1,
            PathState::Regular {
                uid: 0,
                gid: 0,
                mode: 0o600,
                mtime: 300,
                size: 3,
                content: RegularContent::Inline {
                    bytes: b"shh".to_vec(),
                },
            },
        )
        .unwrap();
        md.append_history(gone, b2, PathState::NonExisting).unwrap();

        md
    }

    #[test]
    fn round_trips_byte_for_byte() -> Result<()> {
        let md = build_test_metadata();
        let encoded = encode(&md)?;
        let decoded = decode(&encoded)?;
        assert_eq!(encode(&decoded)?, encoded);
        assert_eq!(decoded.total_path_count(), md.total_path_count());
        assert_eq!(decoded.max_backup_id(), 2);
        Ok(())
    }

    #[test]
    fn unreferenced_backups_are_not_persisted() -> Result<()> {
        let mut md = build_test_metadata();
        md.add_completed_backup(7, 12345);
        let decoded = decode(&encode(&md)?)?;
        assert_eq!(decoded.max_backup_id(), 2);
        Ok(())
    }

    #[test]
    fn in_progress_observations_must_be_promoted_first() {
        let mut md = Metadata::new();
        let node = md.insert_under(None, "etc", Policy::Copy).unwrap();
        md.append_history(
            node,
            CURRENT_BACKUP,
            PathState::Directory {
                uid: 0,
                gid: 0,
                mode: 0o755,
                mtime: 0,
            },
        )
        .unwrap();
        // The point references the in-progress backup, which encode
        // rightly refuses to write out.
        assert!(encode(&md).is_err());
        md.promote_current(999).unwrap();
        assert!(encode(&md).is_ok());
    }

    #[test]
    fn pending_content_is_not_persistable() {
        let mut md = Metadata::new();
        let b1 = md.add_completed_backup(1, 100);
        let node = md.insert_under(None, "f", Policy::Copy).unwrap();
        md.append_history(
            node,
            b1,
            PathState::Regular {
                uid: 0,
                gid: 0,
                mode: 0o644,
                mtime: 0,
                size: 100,
                content: RegularContent::Pending,
            },
        )
        .unwrap();
        assert!(encode(&md).is_err());
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let err = decode(b"definitely not metadata").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CorruptMetadata(_))
        ));
    }

    #[test]
    fn truncation_is_corrupt() -> Result<()> {
        let bytes = encode(&build_test_metadata())?;
        let err = decode(&bytes[..bytes.len() - 7]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CorruptMetadata(_))
        ));
        Ok(())
    }

    #[test]
    fn unknown_hints_are_corrupt() -> Result<()> {
        let mut md = build_test_metadata();
        let etc = md.lookup(Utf8Path::new("/etc")).unwrap();
        md.node_mut(etc).hint = BackupHint::from_bits_retain(1 << 15);
        let err = decode(&encode(&md)?).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CorruptMetadata(_))
        ));
        Ok(())
    }

    #[test]
    fn content_must_fit_the_size() {
        // An inline record claiming more bytes than it carries.
        let bad = DiskMetadata {
            backups: vec![DiskBackup {
                id: 1,
                completion_time: 100,
            }],
            config_history: Vec::new(),
            paths: vec![DiskNode {
                name: "f".into(),
                policy: Policy::Copy,
                hint: 0,
                history: vec![DiskPoint {
                    backup: 0,
                    state: PathState::Regular {
                        uid: 0,
                        gid: 0,
                        mode: 0o644,
                        mtime: 0,
                        size: 19,
                        content: RegularContent::Inline {
                            bytes: b"only nine".to_vec(),
                        },
                    },
                }],
                subnodes: Vec::new(),
            }],
        };
        let mut bytes = Vec::from(MAGIC_BYTES);
        ciborium::ser::into_writer(&bad, &mut bytes).unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CorruptMetadata(_))
        ));
    }

    #[test]
    fn copy_nodes_may_not_hoard_history() {
        let bad = DiskMetadata {
            backups: vec![
                DiskBackup {
                    id: 2,
                    completion_time: 200,
                },
                DiskBackup {
                    id: 1,
                    completion_time: 100,
                },
            ],
            config_history: Vec::new(),
            paths: vec![DiskNode {
                name: "d".into(),
                policy: Policy::Copy,
                hint: 0,
                history: vec![
                    DiskPoint {
                        backup: 0,
                        state: PathState::Directory {
                            uid: 0,
                            gid: 0,
                            mode: 0o755,
                            mtime: 2,
                        },
                    },
                    DiskPoint {
                        backup: 1,
                        state: PathState::Directory {
                            uid: 0,
                            gid: 0,
                            mode: 0o755,
                            mtime: 1,
                        },
                    },
                ],
                subnodes: Vec::new(),
            }],
        };
        let mut bytes = Vec::from(MAGIC_BYTES);
        ciborium::ser::into_writer(&bad, &mut bytes).unwrap();
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::CorruptMetadata(_))
        ));
    }

    #[test]
    fn save_and_load() -> Result<()> {
        let fs = crate::fs::memory::MemoryFilesystem::new();
        fs.add_dir("/repo");
        let repo = Utf8Path::new("/repo");

        assert!(load(&fs, repo)?.is_none());

        let md = build_test_metadata();
        save(&fs, repo, &md)?;
        assert!(!fs.exists(Utf8Path::new("/repo/tmp-file")));

        let loaded = load(&fs, repo)?.expect("metadata exists now");
        assert_eq!(encode(&loaded)?, encode(&md)?);
        Ok(())
    }
}
