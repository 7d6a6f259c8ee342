//! An in-memory [`Filesystem`] so tests don't have to touch disk.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::rc::Rc;

use camino::{Utf8Path, Utf8PathBuf};

use super::{FileKind, FileWrite, Filesystem, Lstat};

#[derive(Debug, Clone)]
enum Entry {
    File {
        bytes: Vec<u8>,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
    },
    Dir {
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
    },
    Symlink {
        target: Utf8PathBuf,
        uid: u32,
        gid: u32,
    },
}

type Entries = BTreeMap<Utf8PathBuf, Entry>;

/// A filesystem in a map. Clones share the same tree, so a test can keep a
/// handle while the code under test holds another.
#[derive(Debug, Clone)]
pub struct MemoryFilesystem {
    entries: Rc<RefCell<Entries>>,
}

const DEFAULT_UID: u32 = 1000;
const DEFAULT_GID: u32 = 1000;

fn not_found(path: &Utf8Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path} not found"))
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        let mut entries = Entries::new();
        entries.insert(
            Utf8PathBuf::from("/"),
            Entry::Dir {
                mode: 0o755,
                uid: 0,
                gid: 0,
                mtime: 0,
            },
        );
        Self {
            entries: Rc::new(RefCell::new(entries)),
        }
    }

    fn ensure_parents(&self, path: &Utf8Path) {
        if let Some(parent) = path.parent() {
            if !self.entries.borrow().contains_key(parent) {
                self.ensure_parents(parent);
                self.entries.borrow_mut().insert(
                    parent.to_owned(),
                    Entry::Dir {
                        mode: 0o755,
                        uid: DEFAULT_UID,
                        gid: DEFAULT_GID,
                        mtime: 0,
                    },
                );
            }
        }
    }

    pub fn add_dir(&self, path: impl AsRef<Utf8Path>) {
        let path = path.as_ref();
        self.ensure_parents(path);
        self.entries.borrow_mut().insert(
            path.to_owned(),
            Entry::Dir {
                mode: 0o755,
                uid: DEFAULT_UID,
                gid: DEFAULT_GID,
                mtime: 0,
            },
        );
    }

    pub fn add_file(&self, path: impl AsRef<Utf8Path>, bytes: &[u8]) {
        let path = path.as_ref();
        self.ensure_parents(path);
        self.entries.borrow_mut().insert(
            path.to_owned(),
            Entry::File {
                bytes: bytes.to_vec(),
                mode: 0o644,
                uid: DEFAULT_UID,
                gid: DEFAULT_GID,
                mtime: 0,
            },
        );
    }

    pub fn add_symlink(&self, path: impl AsRef<Utf8Path>, target: impl AsRef<Utf8Path>) {
        let path = path.as_ref();
        self.ensure_parents(path);
        self.entries.borrow_mut().insert(
            path.to_owned(),
            Entry::Symlink {
                target: target.as_ref().to_owned(),
                uid: DEFAULT_UID,
                gid: DEFAULT_GID,
            },
        );
    }

    pub fn set_owner(&self, path: impl AsRef<Utf8Path>, new_uid: u32, new_gid: u32) {
        let path = path.as_ref();
        match self.entries.borrow_mut().get_mut(path).expect("no entry") {
            Entry::File { uid, gid, .. }
            | Entry::Dir { uid, gid, .. }
            | Entry::Symlink { uid, gid, .. } => {
                *uid = new_uid;
                *gid = new_gid;
            }
        }
    }

    pub fn file_bytes(&self, path: impl AsRef<Utf8Path>) -> Vec<u8> {
        match self.entries.borrow().get(path.as_ref()) {
            Some(Entry::File { bytes, .. }) => bytes.clone(),
            other => panic!("{}: not a file ({other:?})", path.as_ref()),
        }
    }

    pub fn all_paths(&self) -> Vec<Utf8PathBuf> {
        self.entries.borrow().keys().cloned().collect()
    }

    /// Follows symlinks, including intermediate ones. Relative targets
    /// resolve against the link's directory.
    fn resolve(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        let mut path = path.to_owned();
        for _ in 0..8 {
            let target = match self.entries.borrow().get(&path) {
                Some(Entry::Symlink { target, .. }) => target.clone(),
                Some(_) => return Ok(path),
                None => return Err(not_found(&path)),
            };
            path = if target.is_absolute() {
                target
            } else {
                path.parent().unwrap_or(Utf8Path::new("/")).join(target)
            };
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("too many symlinks resolving {path}"),
        ))
    }

    fn lstat_entry(entry: &Entry) -> Lstat {
        match entry {
            Entry::File {
                bytes,
                mode,
                uid,
                gid,
                mtime,
            } => Lstat {
                kind: FileKind::Regular,
                uid: *uid,
                gid: *gid,
                mode: *mode,
                size: bytes.len() as u64,
                mtime: *mtime,
            },
            Entry::Dir {
                mode,
                uid,
                gid,
                mtime,
            } => Lstat {
                kind: FileKind::Directory,
                uid: *uid,
                gid: *gid,
                mode: *mode,
                size: 0,
                mtime: *mtime,
            },
            Entry::Symlink { target, uid, gid } => Lstat {
                kind: FileKind::Symlink,
                uid: *uid,
                gid: *gid,
                mode: 0o777,
                size: target.as_str().len() as u64,
                mtime: 0,
            },
        }
    }
}

impl Default for MemoryFilesystem {
    fn default() -> Self {
        Self::new()
    }
}

struct MemWriter {
    entries: Rc<RefCell<Entries>>,
    path: Utf8PathBuf,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.entries.borrow_mut().get_mut(&self.path) {
            Some(Entry::File { bytes, .. }) => {
                bytes.extend_from_slice(buf);
                Ok(buf.len())
            }
            _ => Err(not_found(&self.path)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileWrite for MemWriter {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Filesystem for MemoryFilesystem {
    fn lstat(&self, path: &Utf8Path) -> io::Result<Lstat> {
        self.entries
            .borrow()
            .get(path)
            .map(Self::lstat_entry)
            .ok_or_else(|| not_found(path))
    }

    fn stat(&self, path: &Utf8Path) -> io::Result<Lstat> {
        let resolved = self.resolve(path)?;
        self.lstat(&resolved)
    }

    fn read_symlink(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        match self.entries.borrow().get(path) {
            Some(Entry::Symlink { target, .. }) => Ok(target.clone()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path} isn't a symlink"),
            )),
            None => Err(not_found(path)),
        }
    }

    fn open_read(&self, path: &Utf8Path) -> io::Result<Box<dyn Read>> {
        let resolved = self.resolve(path)?;
        match self.entries.borrow().get(&resolved) {
            Some(Entry::File { bytes, .. }) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path} isn't a file"),
            )),
            None => Err(not_found(path)),
        }
    }

    fn create_write(&self, path: &Utf8Path) -> io::Result<Box<dyn FileWrite>> {
        let parent = path.parent().ok_or_else(|| not_found(path))?;
        let mut entries = self.entries.borrow_mut();
        match entries.get(parent) {
            Some(Entry::Dir { .. }) => {}
            _ => return Err(not_found(parent)),
        }
        match entries.get_mut(path) {
            Some(Entry::File { bytes, .. }) => bytes.clear(),
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{path} isn't a file"),
                ));
            }
            None => {
                entries.insert(
                    path.to_owned(),
                    Entry::File {
                        bytes: Vec::new(),
                        mode: 0o644,
                        uid: DEFAULT_UID,
                        gid: DEFAULT_GID,
                        mtime: 0,
                    },
                );
            }
        }
        drop(entries);
        Ok(Box::new(MemWriter {
            entries: self.entries.clone(),
            path: path.to_owned(),
        }))
    }

    fn mkdir(&self, path: &Utf8Path) -> io::Result<()> {
        let parent = path.parent().ok_or_else(|| not_found(path))?;
        let mut entries = self.entries.borrow_mut();
        match entries.get(parent) {
            Some(Entry::Dir { .. }) => {}
            _ => return Err(not_found(parent)),
        }
        if entries.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{path} exists"),
            ));
        }
        entries.insert(
            path.to_owned(),
            Entry::Dir {
                mode: 0o755,
                uid: DEFAULT_UID,
                gid: DEFAULT_GID,
                mtime: 0,
            },
        );
        Ok(())
    }

    fn make_symlink(&self, target: &Utf8Path, link: &Utf8Path) -> io::Result<()> {
        let mut entries = self.entries.borrow_mut();
        if entries.contains_key(link) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{link} exists"),
            ));
        }
        entries.insert(
            link.to_owned(),
            Entry::Symlink {
                target: target.to_owned(),
                uid: DEFAULT_UID,
                gid: DEFAULT_GID,
            },
        );
        Ok(())
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.remove(from).ok_or_else(|| not_found(from))?;
        if matches!(entry, Entry::Dir { .. }) {
            let prefix = format!("{from}/");
            let moved: Vec<_> = entries
                .keys()
                .filter(|k| k.as_str().starts_with(&prefix))
                .cloned()
                .collect();
            for key in moved {
                let entry = entries.remove(&key).unwrap();
                let new_key =
                    Utf8PathBuf::from(format!("{to}/{}", &key.as_str()[prefix.len()..]));
                entries.insert(new_key, entry);
            }
        }
        entries.insert(to.to_owned(), entry);
        Ok(())
    }

    fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        let mut entries = self.entries.borrow_mut();
        match entries.get(path) {
            None => return Err(not_found(path)),
            Some(Entry::Dir { .. }) => {
                let prefix = format!("{path}/");
                if entries.keys().any(|k| k.as_str().starts_with(&prefix)) {
                    return Err(io::Error::new(
                        io::ErrorKind::DirectoryNotEmpty,
                        format!("{path} isn't empty"),
                    ));
                }
            }
            Some(_) => {}
        }
        entries.remove(path);
        Ok(())
    }

    fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<String>> {
        let entries = self.entries.borrow();
        match entries.get(path) {
            Some(Entry::Dir { .. }) => {}
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotADirectory,
                    format!("{path} isn't a directory"),
                ));
            }
            None => return Err(not_found(path)),
        }
        // BTreeMap order is lexicographic, which is exactly what callers want.
        Ok(entries
            .keys()
            .filter(|k| k.parent() == Some(path))
            .map(|k| k.file_name().unwrap().to_owned())
            .collect())
    }

    fn set_mtime(&self, path: &Utf8Path, new_mtime: i64) -> io::Result<()> {
        match self
            .entries
            .borrow_mut()
            .get_mut(path)
            .ok_or_else(|| not_found(path))?
        {
            Entry::File { mtime, .. } | Entry::Dir { mtime, .. } => *mtime = new_mtime,
            Entry::Symlink { .. } => {}
        }
        Ok(())
    }

    fn set_mode(&self, path: &Utf8Path, new_mode: u32) -> io::Result<()> {
        match self
            .entries
            .borrow_mut()
            .get_mut(path)
            .ok_or_else(|| not_found(path))?
        {
            Entry::File { mode, .. } | Entry::Dir { mode, .. } => *mode = new_mode & 0o7777,
            Entry::Symlink { .. } => {}
        }
        Ok(())
    }

    fn fsync_dir(&self, path: &Utf8Path) -> io::Result<()> {
        self.lstat(path).map(|_| ())
    }
}
