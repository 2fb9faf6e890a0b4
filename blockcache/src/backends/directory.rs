use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::backend::Backend;
use crate::error::{CacheError, Result};

/// Stores each object as one file in a target directory, keyed by its
/// backend object name.
///
/// Grounded on `infinitree`'s own `Directory` backend, simplified: that
/// backend keeps its own read-through LRU cache, which would be redundant
/// here since `BlockCache` already caches at a higher layer, and handles
/// mmap'd reads, which nothing in this crate needs.
pub struct Directory {
    target: PathBuf,
}

impl Directory {
    pub fn new(target: impl Into<PathBuf>) -> Result<Self> {
        let target = target.into();
        fs::create_dir_all(&target).map_err(|e| CacheError::io(&target, e))?;
        Ok(Directory { target })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.target.join(key)
    }
}

impl Backend for Directory {
    fn write(
        &mut self,
        key: &str,
        writer_fn: &mut dyn FnMut(&mut dyn Write) -> std::io::Result<()>,
    ) -> Result<u64> {
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path).map_err(|e| CacheError::io(&tmp_path, e))?;
        writer_fn(&mut file).map_err(|e| CacheError::io(&tmp_path, e))?;
        file.sync_all().map_err(|e| CacheError::io(&tmp_path, e))?;
        let size = file
            .metadata()
            .map_err(|e| CacheError::io(&tmp_path, e))?
            .len();
        drop(file);
        fs::rename(&tmp_path, &path).map_err(|e| CacheError::io(&path, e))?;
        Ok(size)
    }

    fn read(
        &mut self,
        key: &str,
        reader_fn: &mut dyn FnMut(&mut dyn Read) -> std::io::Result<()>,
    ) -> Result<()> {
        let path = self.path_for(key);
        let mut file = fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CacheError::NotFound { key: key.to_string() }
            } else {
                CacheError::io(&path, e)
            }
        })?;
        reader_fn(&mut file).map_err(|e| CacheError::io(&path, e))
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::NotFound { key: key.to_string() })
            }
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    fn delete_multi(&mut self, keys: &mut Vec<String>) -> Result<()> {
        let mut remaining = Vec::new();
        let mut first_error = None;
        for key in keys.drain(..) {
            match self.delete(&key) {
                Ok(()) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    remaining.push(key);
                }
            }
        }
        *keys = remaining;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn has_delete_multi(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let mut backend = Directory::new(dir.path()).unwrap();
        let size = backend
            .write("s3ql_data_1", &mut |w| w.write_all(b"payload"))
            .unwrap();
        assert_eq!(size, 7);

        let mut out = Vec::new();
        backend
            .read("s3ql_data_1", &mut |r| r.read_to_end(&mut out).map(|_| ()))
            .unwrap();
        assert_eq!(out, b"payload");
    }

    #[test]
    fn read_of_missing_key_is_not_found() {
        let dir = tempdir().unwrap();
        let mut backend = Directory::new(dir.path()).unwrap();
        let err = backend.read("s3ql_data_404", &mut |_| Ok(()));
        assert!(matches!(err, Err(CacheError::NotFound { .. })));
    }

    #[test]
    fn delete_of_missing_key_is_not_found() {
        let dir = tempdir().unwrap();
        let mut backend = Directory::new(dir.path()).unwrap();
        assert!(matches!(backend.delete("nope"), Err(CacheError::NotFound { .. })));
    }
}
