//! Crash-safe file creation and other small file chores.

use std::io::{self, prelude::*};

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::fs::{FileWrite, Filesystem};

/// The scratch name every [`DirWriter`] uses inside its directory.
///
/// A crash can leave one behind; nothing ever references it, so the next
/// garbage collection sweeps it.
pub const TMP_FILE_NAME: &str = "tmp-file";

/// A scoped, crash-safe write of one file into a directory.
///
/// Bytes land in `<dir>/tmp-file`. [`commit`](Self::commit) flushes,
/// fsyncs, renames onto the final name, and fsyncs the directory so the
/// rename is durable. Dropping the writer without committing leaves only
/// the temp file; the final name either doesn't change or holds the
/// complete new contents, never a torn write.
pub struct DirWriter<'a> {
    fs: &'a dyn Filesystem,
    dir: Utf8PathBuf,
    file: Box<dyn FileWrite>,
}

impl<'a> DirWriter<'a> {
    pub fn create(fs: &'a dyn Filesystem, dir: &Utf8Path) -> Result<Self> {
        let tmp = dir.join(TMP_FILE_NAME);
        let file = fs
            .create_write(&tmp)
            .with_context(|| format!("Couldn't create {tmp}"))?;
        Ok(Self {
            fs,
            dir: dir.to_owned(),
            file,
        })
    }

    pub fn commit(mut self, final_name: &str) -> Result<()> {
        let tmp = self.dir.join(TMP_FILE_NAME);
        let to = self.dir.join(final_name);

        self.file
            .flush()
            .with_context(|| format!("Couldn't write {tmp}"))?;
        self.file
            .sync()
            .with_context(|| format!("Couldn't sync {tmp}"))?;
        // Close before renaming; some platforms insist.
        drop(self.file);

        self.fs
            .rename(&tmp, &to)
            .with_context(|| format!("Couldn't rename {tmp} to {to}"))?;
        self.fs
            .fsync_dir(&self.dir)
            .with_context(|| format!("Couldn't sync {}", self.dir))?;
        trace!("Committed {to}");
        Ok(())
    }
}

impl Write for DirWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Checks for the given magic bytes at the start of the reader
pub fn check_magic<R: Read>(r: &mut R, expected: &[u8]) -> Result<()> {
    let mut magic = vec![0; expected.len()];
    r.read_exact(&mut magic)?;
    ensure!(
        magic == expected,
        "Expected magic bytes {expected:02x?}, found {magic:02x?}"
    );
    Ok(())
}

/// 1234567 → "1.18 MiB"
pub fn nice_size(bytes: u64) -> String {
    let adjusted = byte_unit::Byte::from_u64(bytes).get_appropriate_unit(byte_unit::UnitType::Binary);
    if adjusted.get_unit() == byte_unit::Unit::B {
        format!("{adjusted}")
    } else {
        format!("{adjusted:.2}")
    }
}
