use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::{CacheError, Result};

/// Identity of a cache entry: one logical block of one inode.
pub type EntryKey = (u64, u64);

pub fn scratch_file_name(inode: u64, blockno: u64) -> String {
    format!("{inode}-{blockno}")
}

/// One scratch file backing a single `(inode, blockno)` block.
///
/// Mirrors the surface `std::fs::File` already gives us: reads, writes and
/// seeks on a `CacheEntry` delegate straight through, with bookkeeping
/// (`size`, `dirty`, `last_write`) updated alongside.
pub struct CacheEntry {
    path: PathBuf,
    file: File,
    size: u64,
    dirty: bool,
    last_write: Option<Instant>,
}

impl CacheEntry {
    /// Opens (creating if absent) the scratch file for `(inode, blockno)`
    /// under `cache_dir`.
    pub fn open(cache_dir: &Path, inode: u64, blockno: u64) -> Result<Self> {
        let path = cache_dir.join(scratch_file_name(inode, blockno));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| CacheError::io(&path, e))?;
        let size = file
            .metadata()
            .map_err(|e| CacheError::io(&path, e))?
            .len();
        Ok(CacheEntry {
            path,
            file,
            size,
            dirty: false,
            last_write: None,
        })
    }

    /// Adopts an already-open file whose on-disk size is known, used when
    /// rehydrating the cache map from scratch files left over on disk.
    pub fn from_existing(path: PathBuf, file: File, size: u64) -> Self {
        CacheEntry {
            path,
            file,
            size,
            dirty: false,
            last_write: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn last_write(&self) -> Option<Instant> {
        self.last_write
    }

    /// Truncates to zero length; used for newly created (never-downloaded)
    /// blocks and after a `remove`.
    pub fn truncate(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .map_err(|e| CacheError::io(&self.path, e))?;
        self.size = 0;
        self.dirty = true;
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| CacheError::io(&self.path, e))
    }

    /// Reads the full contents from the start, without disturbing the
    /// entry's own position (used to compute the upload digest).
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        let pos = self.file.stream_position().map_err(|e| CacheError::io(&self.path, e))?;
        self.file.seek(SeekFrom::Start(0)).map_err(|e| CacheError::io(&self.path, e))?;
        let mut buf = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut buf).map_err(|e| CacheError::io(&self.path, e))?;
        self.file.seek(SeekFrom::Start(pos)).map_err(|e| CacheError::io(&self.path, e))?;
        Ok(buf)
    }
}

impl Read for CacheEntry {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for CacheEntry {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        if n > 0 {
            self.dirty = true;
            self.last_write = Some(Instant::now());
            let pos = self.file.stream_position()?;
            self.size = self.size.max(pos);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for CacheEntry {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
