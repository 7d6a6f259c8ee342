//! The filesystem capability: every syscall the engine needs, behind a
//! trait so the interesting logic can run against an in-memory tree in
//! tests.

use std::fs::{self, File};
use std::io::{self, prelude::*};

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

pub mod memory;

/// What an `lstat` says a path is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    /// Sockets, FIFOs, devices - nothing we back up.
    Other,
}

/// The slice of `stat` the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lstat {
    pub kind: FileKind,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits only; the type bits are already in `kind`.
    pub mode: u32,
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: i64,
}

/// An open file being written. `sync` must push it to stable storage.
pub trait FileWrite: Write {
    fn sync(&mut self) -> io::Result<()>;
}

impl FileWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

pub trait Filesystem {
    fn lstat(&self, path: &Utf8Path) -> io::Result<Lstat>;
    /// Like `lstat`, but following symlinks.
    fn stat(&self, path: &Utf8Path) -> io::Result<Lstat>;
    /// Existence per `lstat`: a dangling symlink exists.
    fn exists(&self, path: &Utf8Path) -> bool {
        self.lstat(path).is_ok()
    }
    fn read_symlink(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf>;
    fn open_read(&self, path: &Utf8Path) -> io::Result<Box<dyn Read>>;
    fn create_write(&self, path: &Utf8Path) -> io::Result<Box<dyn FileWrite>>;
    fn mkdir(&self, path: &Utf8Path) -> io::Result<()>;
    fn make_symlink(&self, target: &Utf8Path, link: &Utf8Path) -> io::Result<()>;
    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()>;
    /// Removes a file, symlink, or *empty* directory.
    fn remove(&self, path: &Utf8Path) -> io::Result<()>;
    /// Entry names (not paths), sorted lexicographically.
    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<String>>;
    /// Sets mtime (and atime, which nobody compares) in whole seconds.
    fn set_mtime(&self, path: &Utf8Path, mtime: i64) -> io::Result<()>;
    fn set_mode(&self, path: &Utf8Path, mode: u32) -> io::Result<()>;
    fn fsync_dir(&self, path: &Utf8Path) -> io::Result<()>;
}

/// The real deal, straight to the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFilesystem;

fn lstat_of(meta: &fs::Metadata) -> Lstat {
    use std::os::unix::fs::MetadataExt;

    let kind = if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else if meta.is_dir() {
        FileKind::Directory
    } else if meta.is_file() {
        FileKind::Regular
    } else {
        FileKind::Other
    };
    Lstat {
        kind,
        uid: meta.uid(),
        gid: meta.gid(),
        mode: meta.mode() & 0o7777,
        size: meta.size(),
        mtime: meta.mtime(),
    }
}

impl Filesystem for RealFilesystem {
    fn lstat(&self, path: &Utf8Path) -> io::Result<Lstat> {
        fs::symlink_metadata(path).map(|m| lstat_of(&m))
    }

    fn stat(&self, path: &Utf8Path) -> io::Result<Lstat> {
        fs::metadata(path).map(|m| lstat_of(&m))
    }

    fn read_symlink(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        let target = fs::read_link(path)?;
        Utf8PathBuf::from_path_buf(target)
            .map_err(|t| io::Error::new(io::ErrorKind::InvalidData, format!("{t:?} isn't UTF-8")))
    }

    fn open_read(&self, path: &Utf8Path) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(File::open(path)?))
    }

    fn create_write(&self, path: &Utf8Path) -> io::Result<Box<dyn FileWrite>> {
        Ok(Box::new(File::create(path)?))
    }

    fn mkdir(&self, path: &Utf8Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn make_symlink(&self, target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        if self.lstat(path)?.kind == FileKind::Directory {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let name = entry?.file_name();
            match name.into_string() {
                Ok(name) => names.push(name),
                Err(name) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{name:?} isn't UTF-8"),
                    ));
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn set_mtime(&self, path: &Utf8Path, mtime: i64) -> io::Result<()> {
        use rustix::fs::{AtFlags, CWD, Timespec, Timestamps, utimensat};

        let stamp = Timespec {
            tv_sec: mtime,
            tv_nsec: 0,
        };
        utimensat(
            CWD,
            path.as_std_path(),
            &Timestamps {
                last_access: stamp,
                last_modification: stamp,
            },
            AtFlags::SYMLINK_NOFOLLOW,
        )
        .map_err(io::Error::from)
    }

    fn set_mode(&self, path: &Utf8Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    fn fsync_dir(&self, path: &Utf8Path) -> io::Result<()> {
        File::open(path)?.sync_all()
    }
}

/// Creates `dir` and any missing ancestors.
pub fn mkdir_all(fs: &dyn Filesystem, dir: &Utf8Path) -> io::Result<()> {
    if fs.exists(dir) {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        mkdir_all(fs, parent)?;
    }
    match fs.mkdir(dir) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

/// Removes `path` and (for a directory) everything under it.
pub fn remove_all(fs: &dyn Filesystem, path: &Utf8Path) -> Result<()> {
    let stat = match fs.lstat(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        other => other.with_context(|| format!("Couldn't stat {path}"))?,
    };
    if stat.kind == FileKind::Directory {
        for name in fs
            .read_dir(path)
            .with_context(|| format!("Couldn't read {path}"))?
        {
            remove_all(fs, &path.join(name))?;
        }
    }
    fs.remove(path)
        .with_context(|| format!("Couldn't remove {path}"))
}

/// What a [`recursive_remove_if`] walk removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemovalStats {
    pub items: u64,
    /// Regular-file bytes only; directories and symlinks count as zero.
    pub bytes: u64,
}

/// Post-order walk under `root`, removing the entries the predicate
/// approves.
///
/// The predicate sees every descendant (directories after their
/// contents); a directory is only removed once it is empty. The observer,
/// if any, runs after each removal with the running totals.
pub fn recursive_remove_if(
    fs: &dyn Filesystem,
    root: &Utf8Path,
    predicate: &mut dyn FnMut(&Utf8Path, &Lstat) -> bool,
    observer: &mut dyn FnMut(&RemovalStats),
) -> Result<RemovalStats> {
    let root_stat = fs
        .stat(root)
        .with_context(|| format!("Couldn't stat {root}"))?;
    ensure!(
        root_stat.kind == FileKind::Directory,
        "{root} is not a directory"
    );
    let mut stats = RemovalStats::default();
    remove_under(fs, root, predicate, observer, &mut stats)?;
    Ok(stats)
}

fn remove_under(
    fs: &dyn Filesystem,
    dir: &Utf8Path,
    predicate: &mut dyn FnMut(&Utf8Path, &Lstat) -> bool,
    observer: &mut dyn FnMut(&RemovalStats),
    stats: &mut RemovalStats,
) -> Result<()> {
    for name in fs
        .read_dir(dir)
        .with_context(|| format!("Couldn't read {dir}"))?
    {
        let path = dir.join(&name);
        // lstat, not stat: a symlink is an item of its own,
        // never a detour into whatever it points at.
        let stat = fs
            .lstat(&path)
            .with_context(|| format!("Couldn't stat {path}"))?;

        if stat.kind == FileKind::Directory {
            remove_under(fs, &path, predicate, observer, stats)?;
        }
        if !predicate(&path, &stat) {
            continue;
        }
        if stat.kind == FileKind::Directory && !fs.read_dir(&path)?.is_empty() {
            trace!("{path} kept: not empty");
            continue;
        }
        fs.remove(&path)
            .with_context(|| format!("Couldn't remove {path}"))?;
        trace!("Removed {path}");
        stats.items += 1;
        if stat.kind == FileKind::Regular {
            stats.bytes += stat.size;
        }
        observer(stats);
    }
    Ok(())
}
