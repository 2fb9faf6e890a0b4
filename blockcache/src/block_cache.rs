use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use sha2::{Digest as _, Sha256};

use crate::backend::{object_key, BackendPool};
use crate::cache_entry::{scratch_file_name, CacheEntry, EntryKey};
use crate::cache_map::CacheMap;
use crate::error::{CacheError, Result};
use crate::lock::MultiLock;
use crate::metadata::Metadata;
use crate::removal_queue::{RemovalItem, RemovalQueue};
use crate::distributor::Distributor;

/// Tunables the cache is constructed with; see SPEC_FULL.md §6.
#[derive(Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub max_size: u64,
    pub max_entries: usize,
    pub upload_threads: usize,
    pub removal_queue_capacity: usize,
    pub upload_put_timeout: Duration,
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        CacheConfig {
            cache_dir: cache_dir.into(),
            max_size: 768 * 1024 * 1024,
            max_entries: 768,
            upload_threads: 1,
            removal_queue_capacity: 1000,
            upload_put_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Handed off to an upload worker; the entry lock is held by the
    /// worker until the transfer completes.
    Uploading,
    /// Identical content already existed; the inode_blocks row was
    /// repointed without touching the backend.
    Deduped,
    NotDirty,
    AlreadyInTransit,
}

pub struct CacheUsage {
    pub entries: usize,
    pub bytes: u64,
    pub dirty_entries: usize,
    pub dirty_bytes: u64,
    pub pending_removals: usize,
}

enum UploadMsg {
    Upload(UploadJobData),
    Quit,
}

struct UploadJobData {
    key: EntryKey,
    obj_id: i64,
    bytes: Vec<u8>,
    entry: CacheEntry,
}

struct CacheState {
    map: CacheMap,
    in_transit: HashSet<EntryKey>,
}

/// The orchestrator: `get`/`remove`/`flush`/`expire`/`destroy`, plus the
/// upload and removal worker loops. See SPEC_FULL.md §4.5 onward for the
/// full behavioral contract, grounded on `original_source/s3ql/block_cache.py`.
pub struct BlockCache {
    cache_dir: PathBuf,
    config: CacheConfig,
    metadata: Arc<Metadata>,
    backend_pool: Arc<BackendPool>,
    state: Mutex<CacheState>,
    transfer_completed: Condvar,
    entry_lock: MultiLock<EntryKey>,
    object_lock: MultiLock<i64>,
    upload_dist: Distributor<UploadMsg>,
    removal_queue: RemovalQueue,
    upload_workers: Mutex<Vec<thread::JoinHandle<()>>>,
    removal_workers: Mutex<Vec<thread::JoinHandle<()>>>,
    failsafe: AtomicBool,
}

impl BlockCache {
    /// Creates the cache, loading any scratch files left over in
    /// `config.cache_dir` from a previous run into the map at their
    /// on-disk sizes. Call [`BlockCache::init`] before any dirty write.
    pub fn new(
        backend_pool: Arc<BackendPool>,
        metadata: Arc<Metadata>,
        config: CacheConfig,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(&config.cache_dir)
            .map_err(|e| CacheError::io(&config.cache_dir, e))?;

        let mut map = CacheMap::new(config.max_size, config.max_entries);
        Self::load_cache(&config.cache_dir, &mut map)?;

        Ok(Arc::new(BlockCache {
            cache_dir: config.cache_dir.clone(),
            removal_queue: RemovalQueue::new(config.removal_queue_capacity),
            upload_dist: Distributor::new(),
            state: Mutex::new(CacheState {
                map,
                in_transit: HashSet::new(),
            }),
            transfer_completed: Condvar::new(),
            entry_lock: MultiLock::new(),
            object_lock: MultiLock::new(),
            backend_pool,
            metadata,
            config,
            upload_workers: Mutex::new(Vec::new()),
            removal_workers: Mutex::new(Vec::new()),
            failsafe: AtomicBool::new(false),
        }))
    }

    fn load_cache(cache_dir: &Path, map: &mut CacheMap) -> Result<()> {
        let dir = fs::read_dir(cache_dir).map_err(|e| CacheError::io(cache_dir, e))?;
        for entry in dir {
            let entry = entry.map_err(|e| CacheError::io(cache_dir, e))?;
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if name.ends_with(".tmp") {
                let _ = fs::remove_file(&path);
                continue;
            }
            let mut parts = name.splitn(2, '-');
            let key = match (parts.next(), parts.next()) {
                (Some(a), Some(b)) => match (a.parse::<u64>(), b.parse::<u64>()) {
                    (Ok(inode), Ok(blockno)) => (inode, blockno),
                    _ => continue,
                },
                _ => continue,
            };
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| CacheError::io(&path, e))?;
            let size = file.metadata().map_err(|e| CacheError::io(&path, e))?.len();
            map.insert(key, CacheEntry::from_existing(path, file, size));
        }
        Ok(())
    }

    /// Spawns the upload and removal worker threads. Must be called
    /// before any write is marked dirty.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        {
            let mut workers = self.upload_workers.lock();
            for _ in 0..self.config.upload_threads.max(1) {
                let cache = Arc::clone(self);
                workers.push(thread::spawn(move || run_upload_worker(cache)));
            }
        }

        let has_multi = self.backend_pool.lease().has_delete_multi();
        let mut removal_workers = self.removal_workers.lock();
        if has_multi {
            let cache = Arc::clone(self);
            removal_workers.push(thread::spawn(move || run_multi_removal_worker(cache)));
        } else {
            for _ in 0..20 {
                let cache = Arc::clone(self);
                removal_workers.push(thread::spawn(move || run_simple_removal_worker(cache)));
            }
        }
        Ok(())
    }

    pub fn is_failsafe(&self) -> bool {
        self.failsafe.load(Ordering::SeqCst)
    }

    // -- public contract: get / remove / flush / expire / destroy -------

    /// Checks out the block for `(inode, blockno)`, downloading it from
    /// the backend on first access. The returned handle implements
    /// `Read`/`Write`/`Seek` and reinserts itself into the cache map
    /// (updating size accounting) when dropped.
    pub fn get(&self, inode: u64, blockno: u64) -> Result<CacheHandle<'_>> {
        if self.state.lock().map.is_full() {
            self.expire()?;
        }

        let key = (inode, blockno);
        self.entry_lock.acquire(&key, None);

        let existing = self.state.lock().map.take(&key);
        let entry = match existing {
            Some(e) => e,
            None => match self.download_or_create(inode, blockno) {
                Ok(e) => e,
                Err(err) => {
                    self.entry_lock.release(&key, false);
                    return Err(err);
                }
            },
        };

        Ok(CacheHandle {
            cache: self,
            key,
            entry: Some(entry),
        })
    }

    fn download_or_create(&self, inode: u64, blockno: u64) -> Result<CacheEntry> {
        let block_id = match self.metadata.block_id_for_position(inode, blockno)? {
            Some(id) => id,
            None => return CacheEntry::open(&self.cache_dir, inode, blockno),
        };
        let lookup = match self.metadata.block_lookup(block_id)? {
            Some(l) => l,
            None => {
                // The inode_blocks row points at a block row that no
                // longer exists: data loss, not a transient miss.
                tracing::error!(block_id, "dangling block reference detected on download");
                self.failsafe.store(true, Ordering::SeqCst);
                return Err(CacheError::NotFound {
                    key: format!("block {block_id}"),
                });
            }
        };
        let obj_id = lookup.obj_id;

        // Upload barrier: wait for any in-flight upload of this object.
        self.object_lock.acquire(&obj_id, None);
        self.object_lock.release(&obj_id, false);

        let key_name = object_key(obj_id);
        let path = self.cache_dir.join(scratch_file_name(inode, blockno));
        let tmp_path = path.with_extension("tmp");

        let read_result = {
            let mut tmp_file =
                fs::File::create(&tmp_path).map_err(|e| CacheError::io(&tmp_path, e))?;
            let mut lease = self.backend_pool.lease();
            lease
                .read(&key_name, &mut |r| std::io::copy(r, &mut tmp_file).map(|_| ()))
                .and_then(|()| tmp_file.sync_all().map_err(|e| CacheError::io(&tmp_path, e)))
        };

        if let Err(e) = read_result {
            // Don't leave this for the next startup's `.tmp` sweep in
            // `load_cache` when we can clean up right here.
            let _ = fs::remove_file(&tmp_path);
            if matches!(e, CacheError::NotFound { .. } | CacheError::CorruptedObject { .. }) {
                tracing::error!(obj_id, error = %e, "data loss detected downloading block");
                self.failsafe.store(true, Ordering::SeqCst);
            }
            return Err(e);
        }

        fs::rename(&tmp_path, &path).map_err(|e| CacheError::io(&path, e))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CacheError::io(&path, e))?;
        let size = file.metadata().map_err(|e| CacheError::io(&path, e))?.len();
        Ok(CacheEntry::from_existing(path, file, size))
    }

    /// Removes the half-open block range `[first_blockno, end_blockno)`
    /// (a single block if `end_blockno` is omitted). Runs a fast
    /// non-blocking pass first so siblings of a block whose first piece
    /// is mid-upload aren't held up by it, then a blocking pass for
    /// whatever the fast pass couldn't take immediately.
    pub fn remove(&self, inode: u64, first_blockno: u64, end_blockno: Option<u64>) -> Result<()> {
        let end = end_blockno.unwrap_or(first_blockno + 1);

        let mut deferred = Vec::new();
        for blockno in first_blockno..end {
            if !self.remove_one(inode, blockno, Some(Duration::ZERO))? {
                deferred.push(blockno);
            }
        }
        for blockno in deferred {
            self.remove_one(inode, blockno, None)?;
        }
        Ok(())
    }

    fn remove_one(&self, inode: u64, blockno: u64, timeout: Option<Duration>) -> Result<bool> {
        let key = (inode, blockno);
        if !self.entry_lock.acquire(&key, timeout) {
            return Ok(false);
        }
        {
            let mut state = self.state.lock();
            state.map.remove(&key, true)?;
        }
        self.entry_lock.release(&key, false);

        let old_block_id = self.metadata.block_id_for_position(inode, blockno)?;
        self.metadata.delete_inode_block(inode, blockno)?;
        if let Some(block_id) = old_block_id {
            self.deref_block(block_id)?;
        }
        Ok(true)
    }

    pub fn flush_local(&self, inode: u64, blockno: u64) -> Result<()> {
        let key = (inode, blockno);
        self.entry_lock.acquire(&key, None);
        let result = {
            let state = self.state.lock();
            match state.map.peek(&key) {
                Some(entry) => entry.sync_all(),
                None => Ok(()),
            }
        };
        self.entry_lock.release(&key, false);
        result
    }

    /// Schedules an upload for every dirty entry and returns as soon as
    /// each has its database row committed — before the bytes have
    /// necessarily finished transferring. Used to take a self-consistent
    /// metadata snapshot.
    pub fn start_flush(&self) -> Result<()> {
        let keys = self.state.lock().map.keys_oldest_first();
        for key in keys {
            let dirty = self
                .state
                .lock()
                .map
                .peek(&key)
                .map(|e| e.dirty())
                .unwrap_or(false);
            if dirty {
                self.upload_if_dirty(key)?;
            }
        }
        Ok(())
    }

    /// Schedules uploads for all dirty blocks and waits until none
    /// remain in transit.
    pub fn flush(&self) -> Result<()> {
        self.start_flush()?;
        loop {
            if self.state.lock().in_transit.is_empty() {
                return Ok(());
            }
            self.wait_for_transfers(Duration::from_secs(5));
        }
    }

    /// Forces a full expiry of the cache by temporarily setting the
    /// entry budget to zero.
    pub fn drop_all(&self) -> Result<()> {
        let prev = {
            let mut state = self.state.lock();
            let prev = state.map.max_entries();
            state.map.set_max_entries(0);
            prev
        };
        let result = self.expire();
        self.state.lock().map.set_max_entries(prev);
        result
    }

    pub fn get_usage(&self) -> CacheUsage {
        let state = self.state.lock();
        let mut dirty_entries = 0;
        let mut dirty_bytes = 0;
        for key in state.map.keys_oldest_first() {
            if let Some(e) = state.map.peek(&key) {
                if e.dirty() {
                    dirty_entries += 1;
                    dirty_bytes += e.size();
                }
            }
        }
        CacheUsage {
            entries: state.map.len(),
            bytes: state.map.size(),
            dirty_entries,
            dirty_bytes,
            pending_removals: self.removal_queue.len(),
        }
    }

    /// Brings the cache back within its size/entry budget. Either
    /// succeeds fully or leaves only in-transit entries over budget.
    pub fn expire(&self) -> Result<()> {
        loop {
            if !self.state.lock().map.is_full() {
                return Ok(());
            }

            let keys = self.state.lock().map.keys_oldest_first();
            let mut scheduled = false;
            let mut progressed = false;

            for key in keys {
                if !self.state.lock().map.is_full() {
                    break;
                }
                if self.state.lock().in_transit.contains(&key) {
                    continue;
                }
                let dirty = self
                    .state
                    .lock()
                    .map
                    .peek(&key)
                    .map(|e| e.dirty())
                    .unwrap_or(false);

                if dirty {
                    if let UploadOutcome::Uploading = self.upload_if_dirty(key)? {
                        scheduled = true;
                        progressed = true;
                    }
                } else if self.entry_lock.acquire(&key, Some(Duration::ZERO)) {
                    let removed = {
                        let mut state = self.state.lock();
                        let still_clean = matches!(state.map.peek(&key), Some(e) if !e.dirty());
                        if still_clean {
                            state.map.remove(&key, true)?;
                        }
                        still_clean
                    };
                    self.entry_lock.release(&key, false);
                    progressed |= removed;
                }
            }

            if scheduled {
                self.wait_for_transfers(Duration::from_secs(5));
            } else if !progressed {
                if self.state.lock().in_transit.is_empty() {
                    return Ok(());
                }
                self.wait_for_transfers(Duration::from_secs(5));
            }
        }
    }

    fn wait_for_transfers(&self, timeout: Duration) {
        let mut state = self.state.lock();
        self.transfer_completed.wait_for(&mut state, timeout);
    }

    /// The upload pipeline: hashes the entry, resolves dedup against
    /// existing blocks, and either repoints `inode_blocks` at an existing
    /// block or reserves a new object/block pair and hands the entry to
    /// an upload worker. See SPEC_FULL.md §4.7.
    pub fn upload_if_dirty(&self, key: EntryKey) -> Result<UploadOutcome> {
        if self.state.lock().in_transit.contains(&key) {
            return Ok(UploadOutcome::AlreadyInTransit);
        }

        self.entry_lock.acquire(&key, None);

        let mut state = self.state.lock();
        if state.in_transit.contains(&key) {
            drop(state);
            self.entry_lock.release(&key, false);
            return Ok(UploadOutcome::AlreadyInTransit);
        }
        let entry = match state.map.take(&key) {
            Some(e) => e,
            None => {
                drop(state);
                self.entry_lock.release(&key, false);
                return Ok(UploadOutcome::NotDirty);
            }
        };
        if !entry.dirty() {
            state.map.insert(key, entry);
            drop(state);
            self.entry_lock.release(&key, false);
            return Ok(UploadOutcome::NotDirty);
        }
        state.in_transit.insert(key);
        drop(state);

        let mut entry = entry;
        let bytes = entry.read_to_vec()?;
        let digest = Sha256::digest(&bytes).to_vec();

        let old_block_id = self.metadata.block_id_for_position(key.0, key.1)?;
        let existing = self.metadata.block_by_hash(&digest)?;

        if let Some(block_id) = existing {
            if Some(block_id) != old_block_id {
                self.metadata.incr_block_refcount(block_id)?;
            }
            self.metadata.upsert_inode_block(key.0, key.1, block_id)?;
            entry.mark_clean();
            self.finish_transit(key, entry);
            self.entry_lock.release(&key, false);

            if let Some(old_id) = old_block_id {
                if old_id != block_id {
                    self.deref_block(old_id)?;
                }
            }
            return Ok(UploadOutcome::Deduped);
        }

        let obj_id = self.metadata.insert_object()?;
        let block_id = self
            .metadata
            .insert_block(obj_id, &digest, bytes.len() as u64)?;
        self.metadata.upsert_inode_block(key.0, key.1, block_id)?;

        self.object_lock.acquire(&obj_id, None);

        let job = UploadMsg::Upload(UploadJobData {
            key,
            obj_id,
            bytes,
            entry,
        });
        if self
            .upload_dist
            .put(job, Some(self.config.upload_put_timeout))
            .is_err()
        {
            self.object_lock.release(&obj_id, false);
            self.finish_transit_failed(key);
            self.entry_lock.release(&key, false);
            return Err(CacheError::NoWorkerThreads);
        }

        if let Some(old_id) = old_block_id {
            self.deref_block(old_id)?;
        }
        Ok(UploadOutcome::Uploading)
    }

    fn finish_transit(&self, key: EntryKey, entry: CacheEntry) {
        let mut state = self.state.lock();
        state.in_transit.remove(&key);
        state.map.insert(key, entry);
    }

    fn finish_transit_failed(&self, key: EntryKey) {
        let mut state = self.state.lock();
        state.in_transit.remove(&key);
    }

    fn do_upload(&self, job: UploadJobData) -> Result<()> {
        let UploadJobData {
            key,
            obj_id,
            bytes,
            mut entry,
        } = job;
        let key_name = object_key(obj_id);

        let write_result = {
            let mut lease = self.backend_pool.lease();
            lease.write(&key_name, &mut |w| w.write_all(&bytes))
        };

        match write_result {
            Ok(size) => {
                self.metadata.set_object_size(obj_id, size)?;
                entry.mark_clean();
                self.finish_transit(key, entry);
                self.object_lock.release(&obj_id, false);
                self.entry_lock.release(&key, false);
                self.transfer_completed.notify_all();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(obj_id, error = %e, "upload failed, invalidating dedup hash");
                let invalidate_result = self.metadata.invalidate_blocks_for_object(obj_id);
                self.finish_transit(key, entry);
                self.object_lock.release(&obj_id, false);
                self.entry_lock.release(&key, false);
                self.transfer_completed.notify_all();
                self.failsafe.store(true, Ordering::SeqCst);
                invalidate_result?;
                Err(e)
            }
        }
    }

    /// Decrements the reference chain `blocks -> objects` for a block
    /// that lost its last reference at the `inode_blocks` level, deleting
    /// rows and scheduling a backend removal once both refcounts hit
    /// zero. See SPEC_FULL.md §4.8.
    fn deref_block(&self, block_id: i64) -> Result<()> {
        let refcount = match self.metadata.block_refcount(block_id)? {
            Some(rc) => rc,
            None => return Ok(()),
        };
        if refcount > 1 {
            self.metadata.decr_block_refcount(block_id)?;
            return Ok(());
        }

        let lookup = match self.metadata.block_lookup(block_id)? {
            Some(l) => l,
            None => return Ok(()),
        };
        self.metadata.delete_block(block_id)?;

        let obj_id = lookup.obj_id;
        let obj_row = match self.metadata.object_row(obj_id)? {
            Some(r) => r,
            None => return Ok(()),
        };
        if obj_row.refcount > 1 {
            self.metadata.decr_object_refcount(obj_id)?;
            return Ok(());
        }
        self.metadata.delete_object(obj_id)?;

        // Barrier: wait for any in-flight upload of this object to finish
        // before we decide whether a backend delete is owed.
        self.object_lock.acquire(&obj_id, None);
        self.object_lock.release(&obj_id, false);

        if obj_row.size < 0 {
            // Upload never completed; nothing was ever stored under this id.
            return Ok(());
        }

        if self
            .removal_queue
            .push(RemovalItem::Object(obj_id), None)
            .is_err()
        {
            tracing::warn!(obj_id, "removal queue closed while scheduling delete");
        }
        Ok(())
    }

    /// Flushes (if `keep_cache`) or discards all cached data, stops every
    /// worker thread, and removes the scratch directory unless told to
    /// keep it.
    pub fn destroy(self: &Arc<Self>, keep_cache: bool) -> Result<()> {
        if keep_cache {
            self.flush()?;
        } else {
            let keys = self.state.lock().map.keys_oldest_first();
            for key in keys {
                self.entry_lock.acquire(&key, None);
                self.state.lock().map.remove(&key, true)?;
                self.entry_lock.release(&key, false);
            }
        }

        let n_upload = self.upload_workers.lock().len();
        for _ in 0..n_upload {
            let _ = self
                .upload_dist
                .put(UploadMsg::Quit, Some(Duration::from_secs(5)));
        }
        for handle in self.upload_workers.lock().drain(..) {
            let _ = handle.join();
        }

        let n_removal = self.removal_workers.lock().len();
        for _ in 0..n_removal {
            let _ = self.removal_queue.push(RemovalItem::Quit, None);
        }
        for handle in self.removal_workers.lock().drain(..) {
            let _ = handle.join();
        }

        if !keep_cache {
            let _ = fs::remove_dir_all(&self.cache_dir);
        }

        debug_assert!(self.state.lock().in_transit.is_empty());
        if self.failsafe.load(Ordering::SeqCst) {
            tracing::warn!("destroy completed with the failsafe flag set; fsck recommended");
        }
        Ok(())
    }
}

/// RAII handle returned by [`BlockCache::get`]. Holds its entry lock and
/// the checked-out [`CacheEntry`] for the duration of the borrow; both are
/// released on drop, with the entry reinserted into the cache map and its
/// size delta applied.
pub struct CacheHandle<'a> {
    cache: &'a BlockCache,
    key: EntryKey,
    entry: Option<CacheEntry>,
}

impl<'a> CacheHandle<'a> {
    pub fn key(&self) -> EntryKey {
        self.key
    }
}

impl<'a> std::ops::Deref for CacheHandle<'a> {
    type Target = CacheEntry;
    fn deref(&self) -> &CacheEntry {
        self.entry.as_ref().expect("entry present for handle lifetime")
    }
}

impl<'a> std::ops::DerefMut for CacheHandle<'a> {
    fn deref_mut(&mut self) -> &mut CacheEntry {
        self.entry.as_mut().expect("entry present for handle lifetime")
    }
}

impl<'a> Drop for CacheHandle<'a> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.cache.state.lock().map.insert(self.key, entry);
        }
        self.cache.entry_lock.release(&self.key, false);
    }
}

fn run_upload_worker(cache: Arc<BlockCache>) {
    loop {
        let msg = match cache.upload_dist.get() {
            Some(m) => m,
            None => break,
        };
        match msg {
            UploadMsg::Quit => break,
            UploadMsg::Upload(job) => {
                if let Err(e) = cache.do_upload(job) {
                    tracing::error!(error = %e, "upload worker exiting after unrecovered failure");
                    break;
                }
            }
        }
    }
}

fn run_simple_removal_worker(cache: Arc<BlockCache>) {
    loop {
        match cache.removal_queue.pop() {
            None | Some(RemovalItem::Quit) => break,
            Some(RemovalItem::Flush) => continue,
            Some(RemovalItem::Object(obj_id)) => {
                let key = object_key(obj_id);
                let mut lease = cache.backend_pool.lease();
                match lease.delete(&key) {
                    Ok(()) => {}
                    Err(CacheError::NotFound { .. }) => {
                        tracing::warn!(obj_id, "object missing on removal");
                        cache.failsafe.store(true, Ordering::SeqCst);
                    }
                    Err(e) => {
                        tracing::error!(obj_id, error = %e, "removal worker exiting after failure");
                        break;
                    }
                }
            }
        }
    }
}

fn run_multi_removal_worker(cache: Arc<BlockCache>) {
    let batch_limit = cache.backend_pool.lease().delete_multi_batch_size();
    let mut batch: Vec<i64> = Vec::new();

    loop {
        let item = if batch.is_empty() {
            cache.removal_queue.pop()
        } else {
            cache.removal_queue.try_pop()
        };

        match item {
            Some(RemovalItem::Object(obj_id)) => {
                batch.push(obj_id);
                if batch.len() >= batch_limit {
                    flush_removal_batch(&cache, &mut batch);
                }
            }
            Some(RemovalItem::Flush) => {
                flush_removal_batch(&cache, &mut batch);
            }
            Some(RemovalItem::Quit) => {
                flush_removal_batch(&cache, &mut batch);
                break;
            }
            None => {
                if batch.is_empty() {
                    break;
                }
                flush_removal_batch(&cache, &mut batch);
            }
        }
    }
}

fn flush_removal_batch(cache: &Arc<BlockCache>, batch: &mut Vec<i64>) {
    if batch.is_empty() {
        return;
    }
    let mut keys: Vec<String> = batch.drain(..).map(object_key).collect();
    let mut lease = cache.backend_pool.lease();
    if let Err(e) = lease.delete_multi(&mut keys) {
        tracing::warn!(error = %e, remaining = keys.len(), "multi-delete reported missing objects");
        cache.failsafe.store(true, Ordering::SeqCst);
    }
}
