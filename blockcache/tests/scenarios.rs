use std::io::{Read, Write};
use std::sync::Arc;

use blockcache::backends::InMemoryBackend;
use blockcache::{BackendPool, BlockCache, CacheConfig, Metadata};

fn harness() -> (Arc<BlockCache>, Arc<Metadata>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(BackendPool::new(vec![Box::new(InMemoryBackend::new())]));
    let metadata = Arc::new(Metadata::in_memory().unwrap());
    let mut config = CacheConfig::new(dir.path());
    config.max_size = 1024 * 1024;
    config.max_entries = 4;
    config.upload_threads = 2;

    let cache = BlockCache::new(pool, Arc::clone(&metadata), config).unwrap();
    cache.init().unwrap();
    (cache, metadata, dir)
}

fn write_block(cache: &BlockCache, inode: u64, blockno: u64, data: &[u8]) {
    let mut handle = cache.get(inode, blockno).unwrap();
    handle.write_all(data).unwrap();
}

fn read_block(cache: &BlockCache, inode: u64, blockno: u64) -> Vec<u8> {
    use std::io::Seek;
    let mut handle = cache.get(inode, blockno).unwrap();
    handle.seek(std::io::SeekFrom::Start(0)).unwrap();
    let mut buf = Vec::new();
    handle.read_to_end(&mut buf).unwrap();
    buf
}

#[test]
fn s3_read_your_writes_per_block() {
    let (cache, _metadata, _dir) = harness();
    write_block(&cache, 1, 0, b"hello world");
    assert_eq!(read_block(&cache, 1, 0), b"hello world");
    cache.destroy(false).unwrap();
}

#[test]
fn s1_dedup_across_two_files_shares_one_block_row() {
    let (cache, metadata, _dir) = harness();
    write_block(&cache, 1, 0, b"shared payload");
    write_block(&cache, 2, 0, b"shared payload");
    cache.flush().unwrap();

    let block_a = metadata.block_id_for_position(1, 0).unwrap().unwrap();
    let block_b = metadata.block_id_for_position(2, 0).unwrap().unwrap();
    assert_eq!(block_a, block_b);
    assert_eq!(metadata.block_refcount(block_a).unwrap(), Some(2));

    cache.destroy(false).unwrap();
}

#[test]
fn s2_overwrite_releases_old_block_refcount() {
    let (cache, metadata, _dir) = harness();
    write_block(&cache, 1, 0, b"version one");
    cache.flush().unwrap();
    let old_block = metadata.block_id_for_position(1, 0).unwrap().unwrap();

    write_block(&cache, 1, 0, b"version two, longer content");
    cache.flush().unwrap();

    // the old block's row should be gone (refcount dropped to zero and no
    // other inode_blocks row references it in this test).
    assert!(metadata.block_lookup(old_block).unwrap().is_none());
    cache.destroy(false).unwrap();
}

#[test]
fn s3_delete_propagates_through_refcounts() {
    let (cache, metadata, _dir) = harness();
    write_block(&cache, 1, 0, b"to be removed");
    cache.flush().unwrap();
    let block_id = metadata.block_id_for_position(1, 0).unwrap().unwrap();
    let obj_id = metadata.block_lookup(block_id).unwrap().unwrap().obj_id;

    cache.remove(1, 0, None).unwrap();

    assert!(metadata.block_lookup(block_id).unwrap().is_none());
    assert!(metadata.object_row(obj_id).unwrap().is_none());
    cache.destroy(false).unwrap();
}

#[test]
fn new_block_created_by_remove_is_zero_length() {
    let (cache, _metadata, _dir) = harness();
    write_block(&cache, 1, 0, b"some content");
    cache.flush().unwrap();

    cache.remove(1, 0, None).unwrap();
    assert_eq!(read_block(&cache, 1, 0), Vec::<u8>::new());
    cache.destroy(false).unwrap();
}

#[test]
fn s6_concurrent_get_of_same_block_serializes() {
    let (cache, _metadata, _dir) = harness();
    write_block(&cache, 1, 0, b"initial");
    cache.flush().unwrap();

    let cache2 = Arc::clone(&cache);
    let handle = std::thread::spawn(move || {
        let mut h = cache2.get(1, 0).unwrap();
        use std::io::Seek;
        h.seek(std::io::SeekFrom::End(0)).unwrap();
        h.write_all(b"-appended").unwrap();
    });
    handle.join().unwrap();

    assert_eq!(read_block(&cache, 1, 0), b"initial-appended");
    cache.destroy(false).unwrap();
}

#[test]
fn destroy_without_keep_cache_removes_scratch_directory() {
    let (cache, _metadata, dir) = harness();
    write_block(&cache, 1, 0, b"data");
    let cache_dir = dir.path().to_path_buf();
    cache.destroy(false).unwrap();
    assert!(!cache_dir.exists());
}

#[test]
fn flush_leaves_nothing_in_transit() {
    let (cache, _metadata, _dir) = harness();
    for blockno in 0..3u64 {
        write_block(&cache, 1, blockno, format!("block-{blockno}").as_bytes());
    }
    cache.flush().unwrap();
    let usage = cache.get_usage();
    assert_eq!(usage.dirty_entries, 0);
    cache.destroy(false).unwrap();
}

#[test]
fn s4_eviction_respects_entry_budget() {
    let (cache, _metadata, _dir) = harness();
    // max_entries = 4; write and flush more than that many distinct blocks.
    for blockno in 0..10u64 {
        write_block(&cache, 1, blockno, b"x");
        cache.flush().unwrap();
    }
    let usage = cache.get_usage();
    assert!(usage.entries <= 4);
    cache.destroy(false).unwrap();
}

#[test]
fn s5_upload_failure_clears_dedup_hash() {
    // A backend that fails every write exercises the NULL-hash-on-failure
    // path without needing to tear down a worker thread mid-test.
    struct AlwaysFailBackend;
    impl blockcache::Backend for AlwaysFailBackend {
        fn write(
            &mut self,
            _key: &str,
            _writer_fn: &mut dyn FnMut(&mut dyn Write) -> std::io::Result<()>,
        ) -> blockcache::Result<u64> {
            Err(blockcache::CacheError::TempFailure {
                key: _key.to_string(),
                message: "simulated outage".into(),
            })
        }
        fn read(
            &mut self,
            key: &str,
            _reader_fn: &mut dyn FnMut(&mut dyn Read) -> std::io::Result<()>,
        ) -> blockcache::Result<()> {
            Err(blockcache::CacheError::NotFound {
                key: key.to_string(),
            })
        }
        fn delete(&mut self, key: &str) -> blockcache::Result<()> {
            Err(blockcache::CacheError::NotFound {
                key: key.to_string(),
            })
        }
        fn delete_multi(&mut self, keys: &mut Vec<String>) -> blockcache::Result<()> {
            keys.clear();
            Ok(())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(BackendPool::new(vec![Box::new(AlwaysFailBackend)]));
    let metadata = Arc::new(Metadata::in_memory().unwrap());
    let mut config = CacheConfig::new(dir.path());
    config.upload_put_timeout = std::time::Duration::from_millis(200);
    let cache = BlockCache::new(pool, Arc::clone(&metadata), config).unwrap();
    cache.init().unwrap();

    write_block(&cache, 1, 0, b"doomed payload");
    // start_flush schedules the upload and commits the metadata rows
    // before the (failing) transfer completes.
    cache.start_flush().unwrap();

    let block_id = metadata.block_id_for_position(1, 0).unwrap().unwrap();
    let obj_id = metadata.block_lookup(block_id).unwrap().unwrap().obj_id;

    // give the worker a moment to run the failing upload and invalidate
    // the hash reservation.
    std::thread::sleep(std::time::Duration::from_millis(300));

    // the object row is never deleted on upload failure (fsck reconciles
    // it later); the block row survives too, but its hash is cleared so
    // no future write can dedup against unrecoverable content.
    assert!(metadata.object_row(obj_id).unwrap().is_some());
    assert!(metadata.block_lookup(block_id).unwrap().is_some());
}
