use lru::LruCache;

use crate::cache_entry::{CacheEntry, EntryKey};
use crate::error::Result;

/// Ordered `(inode, blockno) -> CacheEntry` map with size/entry budgets.
///
/// Backed by an *unbounded* `lru::LruCache`, whose `.iter()` walks
/// MRU->LRU and `.iter().rev()` walks LRU->MRU — exactly the two
/// traversal orders the eviction scan needs (oldest-first for eviction
/// candidates, most recent for `get`'s touch-on-access). It must stay
/// unbounded: a capacity-bounded `LruCache::put` silently evicts the LRU
/// entry (without unlinking its scratch file or adjusting `size`) the
/// moment the map is at capacity, which is exactly the window `get`'s
/// take-out/reinsert-on-drop and `upload_if_dirty`/`finish_transit` push
/// the map through transiently. `expire` is the only evictor; budget
/// enforcement lives entirely in `is_full`/the caller, not in the
/// container.
pub struct CacheMap {
    entries: LruCache<EntryKey, CacheEntry>,
    size: u64,
    max_size: u64,
    max_entries: usize,
}

impl CacheMap {
    pub fn new(max_size: u64, max_entries: usize) -> Self {
        CacheMap {
            entries: LruCache::unbounded(),
            size: 0,
            max_size,
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn set_max_entries(&mut self, n: usize) {
        self.max_entries = n;
    }

    /// True once either budget has been reached — `>=` for the entry
    /// count so that a caller checking before inserting one more entry
    /// (as `get` does) triggers eviction with enough headroom, rather
    /// than always admitting one entry over budget first.
    pub fn is_full(&self) -> bool {
        self.size > self.max_size || self.entries.len() >= self.max_entries
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.entries.contains(key)
    }

    /// Inserts a freshly opened entry, promoting it to most-recently-used.
    pub fn insert(&mut self, key: EntryKey, entry: CacheEntry) {
        self.size += entry.size();
        if let Some(old) = self.entries.put(key, entry) {
            self.size -= old.size();
        }
    }

    /// Takes an entry out of the map entirely (used by `get` to hand out a
    /// `CacheHandle`, and by the upload pipeline while an entry is
    /// in-transit). The entry is re-added by the caller, via `insert`,
    /// once it's done with it — this is the "transiently absent from the
    /// map" window the size/entry invariants explicitly allow.
    pub fn take(&mut self, key: &EntryKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key);
        if let Some(ref e) = entry {
            self.size -= e.size();
        }
        entry
    }

    /// Removes and drops an entry, optionally unlinking its scratch file.
    pub fn remove(&mut self, key: &EntryKey, unlink: bool) -> Result<()> {
        if let Some(entry) = self.entries.pop(key) {
            self.size -= entry.size();
            let path = entry.path().to_path_buf();
            drop(entry);
            if unlink {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(crate::error::CacheError::io(path, e)),
                }
            }
        }
        Ok(())
    }

    /// Keys in least-recently-used-first order, i.e. eviction candidate
    /// order. Snapshotted so the caller can release the bookkeeping mutex
    /// and re-acquire it between iterations without invalidating the scan.
    pub fn keys_oldest_first(&self) -> Vec<EntryKey> {
        self.entries.iter().rev().map(|(k, _)| *k).collect()
    }

    pub fn peek(&self, key: &EntryKey) -> Option<&CacheEntry> {
        self.entries.peek(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_and_take_preserve_size_accounting() {
        let dir = tempdir().unwrap();
        let mut map = CacheMap::new(1024, 8);
        let mut entry = CacheEntry::open(dir.path(), 1, 0).unwrap();
        std::io::Write::write_all(&mut entry, b"hello").unwrap();
        map.insert((1, 0), entry);
        assert_eq!(map.size(), 5);
        assert_eq!(map.len(), 1);

        let taken = map.take(&(1, 0)).unwrap();
        assert_eq!(map.size(), 0);
        assert_eq!(map.len(), 0);
        map.insert((1, 0), taken);
        assert_eq!(map.size(), 5);
    }

    #[test]
    fn eviction_order_is_oldest_first() {
        let dir = tempdir().unwrap();
        let mut map = CacheMap::new(1024, 8);
        for i in 0..3u64 {
            let entry = CacheEntry::open(dir.path(), 1, i).unwrap();
            map.insert((1, i), entry);
        }
        assert_eq!(map.keys_oldest_first(), vec![(1, 0), (1, 1), (1, 2)]);
    }
}
