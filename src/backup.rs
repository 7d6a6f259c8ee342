//! Running a whole backup: scan and detect, hash and store what's new,
//! then advance and persist the metadata.

use anyhow::{Context, Result, ensure};
use camino::Utf8Path;
use jiff::Timestamp;
use tracing::*;

use crate::change::{self, ChangeSummary};
use crate::codec;
use crate::fs::{FileKind, Filesystem};
use crate::hashing::{self, HASH_SIZE};
use crate::metadata::{CURRENT_BACKUP, Metadata, NodeIdx, PathState, RegularContent};
use crate::search::{CONFIG_NAME, SearchTree};
use crate::store::ObjectStore;

/// Scans the filesystem and folds what it finds into the metadata,
/// returning what would be backed up. Nothing is written yet; that's
/// [`finish`]'s job once the user agrees.
pub fn plan(
    metadata: &mut Metadata,
    fs: &dyn Filesystem,
    repository: &Utf8Path,
    tree: &SearchTree,
) -> Result<ChangeSummary> {
    let mut summary = change::apply_scan(metadata, fs, tree)?;
    track_config(metadata, fs, repository, &mut summary)?;
    Ok(summary)
}

/// The selection config gets its own history, so an old backup can always
/// say what it was selected by.
fn track_config(
    metadata: &mut Metadata,
    fs: &dyn Filesystem,
    repository: &Utf8Path,
    summary: &mut ChangeSummary,
) -> Result<()> {
    let path = repository.join(CONFIG_NAME);
    let stat = fs
        .lstat(&path)
        .with_context(|| format!("Couldn't stat {path}"))?;
    ensure!(stat.kind == FileKind::Regular, "{path} isn't a regular file");

    let mut candidate = change::state_from_fs(fs, &path, &stat)?;
    let previous = metadata.config_history.first().map(|p| p.state.clone());
    let changed = match &previous {
        None => true,
        Some(previous) => !change::diff_states(previous, &mut candidate).is_empty(),
    };
    if changed {
        debug!("The selection config changed");
        summary.config_changed = true;
        metadata.append_config_history(CURRENT_BACKUP, candidate)?;
    }
    Ok(())
}

/// Completes a planned backup. Every object lands fsync'd before the
/// metadata is rewritten, so a crash leaves the repository either as it
/// was or fully advanced - at worst with some unreferenced objects for
/// the next garbage collection.
pub fn finish(metadata: &mut Metadata, fs: &dyn Filesystem, repository: &Utf8Path) -> Result<()> {
    let store = ObjectStore::new(fs, repository);

    let nodes: Vec<NodeIdx> = metadata.preorder().collect();
    for idx in nodes {
        let pending = {
            let node = metadata.node(idx);
            match node.newest().map(|p| &p.state) {
                Some(PathState::Regular {
                    size,
                    content: RegularContent::Pending,
                    ..
                }) => Some((node.path.clone(), *size)),
                _ => None,
            }
        };
        let Some((path, size)) = pending else {
            continue;
        };
        let content = store_file(&store, fs, &path, size)?;
        let PathState::Regular { content: slot, .. } =
            &mut metadata.node_mut(idx).history[0].state
        else {
            unreachable!("just matched a regular state");
        };
        *slot = content;
    }

    if let Some(PathState::Regular {
        size,
        content: RegularContent::Pending,
        ..
    }) = metadata.config_history.first().map(|p| &p.state)
    {
        let content = store_file(&store, fs, &repository.join(CONFIG_NAME), *size)?;
        let PathState::Regular { content: slot, .. } = &mut metadata.config_history[0].state
        else {
            unreachable!("just matched a regular state");
        };
        *slot = content;
    }

    match metadata.promote_current(Timestamp::now().as_second()) {
        Some(id) => info!("Completed backup {id}"),
        None => debug!("Nothing referenced the new backup point; not assigning an id"),
    }
    codec::save(fs, repository, metadata)
}

/// Reads and hashes one file, storing it as an object when it's too big
/// to keep inline.
fn store_file(
    store: &ObjectStore,
    fs: &dyn Filesystem,
    path: &Utf8Path,
    expected_size: u64,
) -> Result<RegularContent> {
    let mut r = fs
        .open_read(path)
        .with_context(|| format!("Couldn't open {path}"))?;
    let (bytes, hash) = hashing::read_and_hash(&mut r, expected_size)
        .with_context(|| format!("Couldn't hash {path}"))?;
    Ok(if expected_size == 0 {
        RegularContent::Empty
    } else if expected_size <= HASH_SIZE as u64 {
        RegularContent::Inline { bytes }
    } else {
        let slot = store.store_new(&bytes, &hash, expected_size)?;
        RegularContent::Stored { hash, slot }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::memory::MemoryFilesystem;
    use crate::hashing::ContentHash;
    use crate::store::object_path;

    const REPO: &str = "/repo";
    const CONFIG: &str = "[copy]\n/data\n";

    fn setup() -> (MemoryFilesystem, SearchTree) {
        let fs = MemoryFilesystem::new();
        fs.add_dir(REPO);
        fs.add_file("/repo/config", CONFIG.as_bytes());
        (fs, SearchTree::parse(CONFIG).unwrap())
    }

    fn run_backup(fs: &MemoryFilesystem, tree: &SearchTree, metadata: &mut Metadata) -> Result<ChangeSummary> {
        let summary = plan(metadata, fs, Utf8Path::new(REPO), tree)?;
        if !summary.is_empty() {
            finish(metadata, fs, Utf8Path::new(REPO))?;
        }
        Ok(summary)
    }

    #[test]
    fn first_backup_stores_and_persists() -> Result<()> {
        let (fs, tree) = setup();
        let payload = [42u8; 64];
        fs.add_file("/data/big", &payload);
        fs.add_file("/data/small", b"inline me");

        let mut md = Metadata::new();
        let summary = run_backup(&fs, &tree, &mut md)?;
        assert!(!summary.is_empty());
        assert_eq!(summary.new_bytes, 64);

        // The object landed where its hash says.
        let expected = Utf8Path::new(REPO).join(object_path(&ContentHash::hash(&payload), 64, 0));
        assert_eq!(fs.file_bytes(&expected), payload);
        // The metadata landed too, and the scratch file is gone.
        assert!(fs.exists(Utf8Path::new("/repo/metadata")));
        assert!(!fs.exists(Utf8Path::new("/repo/tmp-file")));
        assert_eq!(md.max_backup_id(), 1);

        // Nothing is left half-resolved.
        let reloaded = codec::load(&fs, Utf8Path::new(REPO))?.unwrap();
        assert_eq!(codec::encode(&reloaded)?, codec::encode(&md)?);
        Ok(())
    }

    #[test]
    fn quiet_rescans_burn_no_ids_and_write_no_objects() -> Result<()> {
        let (fs, tree) = setup();
        fs.add_file("/data/big", &[1u8; 99]);

        let mut md = Metadata::new();
        run_backup(&fs, &tree, &mut md)?;
        let objects_before = fs.all_paths();

        let summary = run_backup(&fs, &tree, &mut md)?;
        assert!(summary.is_empty());
        assert_eq!(md.max_backup_id(), 1);
        assert_eq!(fs.all_paths(), objects_before);
        Ok(())
    }

    #[test]
    fn identical_files_share_one_object() -> Result<()> {
        let (fs, tree) = setup();
        let payload = [9u8; 50];
        fs.add_file("/data/twin-a", &payload);
        fs.add_file("/data/twin-b", &payload);

        let mut md = Metadata::new();
        run_backup(&fs, &tree, &mut md)?;

        let object_count = fs
            .all_paths()
            .iter()
            .filter(|p| p.as_str().contains("x32x"))
            .count();
        assert_eq!(object_count, 1);

        let a = md.lookup(Utf8Path::new("/data/twin-a")).unwrap();
        let b = md.lookup(Utf8Path::new("/data/twin-b")).unwrap();
        assert_eq!(
            md.node(a).newest().unwrap().state,
            md.node(b).newest().unwrap().state
        );
        Ok(())
    }

    #[test]
    fn the_config_is_remembered_too() -> Result<()> {
        let (fs, tree) = setup();
        fs.add_file("/data/f", b"x");

        let mut md = Metadata::new();
        run_backup(&fs, &tree, &mut md)?;
        assert_eq!(md.config_history.len(), 1);

        // An unchanged config doesn't grow its history.
        fs.add_file("/data/f", b"xy");
        run_backup(&fs, &tree, &mut md)?;
        assert_eq!(md.config_history.len(), 1);

        // A changed one does - and big configs become objects.
        let fat_config = format!("{CONFIG}# padding padding padding padding\n");
        fs.add_file("/repo/config", fat_config.as_bytes());
        let summary = plan(&mut md, &fs, Utf8Path::new(REPO), &tree)?;
        assert!(summary.config_changed);
        finish(&mut md, &fs, Utf8Path::new(REPO))?;
        assert_eq!(md.config_history.len(), 2);
        assert!(matches!(
            &md.config_history[0].state,
            PathState::Regular {
                content: RegularContent::Stored { .. },
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn a_file_vanishing_mid_backup_aborts() -> Result<()> {
        let (fs, tree) = setup();
        fs.add_file("/data/doomed", &[3u8; 77]);

        let mut md = Metadata::new();
        let summary = plan(&mut md, &fs, Utf8Path::new(REPO), &tree)?;
        assert!(!summary.is_empty());

        fs.remove(Utf8Path::new("/data/doomed")).unwrap();
        assert!(finish(&mut md, &fs, Utf8Path::new(REPO)).is_err());
        // The metadata was never rewritten.
        assert!(!fs.exists(Utf8Path::new("/repo/metadata")));
        Ok(())
    }
}
