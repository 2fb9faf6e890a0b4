use std::collections::HashMap;
use std::io::{Read, Write};

use parking_lot::Mutex;

use crate::backend::Backend;
use crate::error::{CacheError, Result};

/// In-memory backend used by tests, grounded on `infinitree`'s own
/// `InMemoryBackend`/`NullBackend` test helpers.
#[derive(Default)]
pub struct InMemoryBackend {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend::default()
    }

    /// Test hook: forces a subsequent `read`/`delete` of `key` to fail as
    /// though the object were missing, without actually removing it —
    /// used to exercise upload-failure / corrupted-object paths.
    pub fn poison(&self, key: &str) {
        self.objects.lock().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }
}

impl Backend for InMemoryBackend {
    fn write(
        &mut self,
        key: &str,
        writer_fn: &mut dyn FnMut(&mut dyn Write) -> std::io::Result<()>,
    ) -> Result<u64> {
        let mut buf = Vec::new();
        writer_fn(&mut buf).map_err(|e| CacheError::io(key, e))?;
        let size = buf.len() as u64;
        self.objects.lock().insert(key.to_string(), buf);
        Ok(size)
    }

    fn read(
        &mut self,
        key: &str,
        reader_fn: &mut dyn FnMut(&mut dyn Read) -> std::io::Result<()>,
    ) -> Result<()> {
        let objects = self.objects.lock();
        let buf = objects
            .get(key)
            .ok_or_else(|| CacheError::NotFound { key: key.to_string() })?;
        let mut cursor = std::io::Cursor::new(buf.clone());
        drop(objects);
        reader_fn(&mut cursor).map_err(|e| CacheError::io(key, e))
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        if self.objects.lock().remove(key).is_none() {
            return Err(CacheError::NotFound { key: key.to_string() });
        }
        Ok(())
    }

    fn delete_multi(&mut self, keys: &mut Vec<String>) -> Result<()> {
        let mut remaining = Vec::new();
        let mut first_error = None;
        for key in keys.drain(..) {
            if self.objects.lock().remove(&key).is_none() {
                if first_error.is_none() {
                    first_error = Some(CacheError::NotFound { key: key.clone() });
                }
                remaining.push(key);
            }
        }
        *keys = remaining;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn has_delete_multi(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut backend = InMemoryBackend::new();
        backend
            .write("s3ql_data_1", &mut |w| w.write_all(b"hi"))
            .unwrap();
        let mut out = Vec::new();
        backend
            .read("s3ql_data_1", &mut |r| r.read_to_end(&mut out).map(|_| ()))
            .unwrap();
        assert_eq!(out, b"hi");
    }

    #[test]
    fn delete_multi_reports_missing_keys() {
        let mut backend = InMemoryBackend::new();
        backend.write("a", &mut |w| w.write_all(b"x")).unwrap();
        let mut keys = vec!["a".to_string(), "missing".to_string()];
        let result = backend.delete_multi(&mut keys);
        assert!(result.is_err());
        assert_eq!(keys, vec!["missing".to_string()]);
    }
}
