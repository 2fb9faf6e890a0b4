use std::io::{Read, Write};

use crate::error::Result;

/// An object-store client. Implementations may be leased out of a
/// [`BackendPool`] and used from a single thread at a time.
///
/// Reads and writes are streaming, closure-based, matching the shape of
/// S3QL's own `backend.perform_write(fn, key)` callback rather than the
/// whole-buffer `write_object`/`read_object` a simpler backend trait might
/// expose: the cache never needs to materialize a whole object in memory
/// just to hand it to the backend.
pub trait Backend: Send {
    /// Writes `key`, invoking `writer_fn` with a sink to copy bytes into.
    /// Returns the number of bytes actually written to the backend.
    fn write(
        &mut self,
        key: &str,
        writer_fn: &mut dyn FnMut(&mut dyn Write) -> std::io::Result<()>,
    ) -> Result<u64>;

    /// Reads `key`, invoking `reader_fn` with a source to copy bytes from.
    fn read(
        &mut self,
        key: &str,
        reader_fn: &mut dyn FnMut(&mut dyn Read) -> std::io::Result<()>,
    ) -> Result<()>;

    /// Deletes a single object. Deleting an absent object is not an error
    /// at this layer (S3QL's `NoSuchObject` is tolerated by the caller).
    fn delete(&mut self, key: &str) -> Result<()>;

    /// Deletes many objects in one round trip where the backend supports
    /// it. Implementations remove successfully deleted keys from `keys`
    /// so the caller can retry whatever remains.
    fn delete_multi(&mut self, keys: &mut Vec<String>) -> Result<()>;

    fn has_delete_multi(&self) -> bool {
        false
    }

    /// Upper bound on how many keys a single `delete_multi` call accepts.
    fn delete_multi_batch_size(&self) -> usize {
        1000
    }
}

/// Thread-safe leasing of concrete backend clients, mirroring
/// `infinitree::object::Pool`/`PoolRef`: a flume channel holds the ready
/// instances, `lease()` takes one out, and it's returned automatically
/// when the guard drops.
pub struct BackendPool {
    tx: flume::Sender<Box<dyn Backend>>,
    rx: flume::Receiver<Box<dyn Backend>>,
}

impl BackendPool {
    pub fn new(instances: Vec<Box<dyn Backend>>) -> Self {
        let (tx, rx) = flume::unbounded();
        for inst in instances {
            tx.send(inst).expect("receiver kept alive by self");
        }
        BackendPool { tx, rx }
    }

    pub fn with_constructor<F>(count: usize, mut make: F) -> Self
    where
        F: FnMut() -> Box<dyn Backend>,
    {
        Self::new((0..count).map(|_| make()).collect())
    }

    pub fn count(&self) -> usize {
        self.rx.len()
    }

    /// Blocks until a backend client is available.
    pub fn lease(&self) -> BackendLease<'_> {
        let inner = self
            .rx
            .recv()
            .expect("at least one sender is always kept alive by self");
        BackendLease {
            pool: self,
            inner: Some(inner),
        }
    }
}

pub struct BackendLease<'a> {
    pool: &'a BackendPool,
    inner: Option<Box<dyn Backend>>,
}

impl<'a> std::ops::Deref for BackendLease<'a> {
    type Target = dyn Backend;
    fn deref(&self) -> &Self::Target {
        self.inner.as_deref().unwrap()
    }
}

impl<'a> std::ops::DerefMut for BackendLease<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_deref_mut().unwrap()
    }
}

impl<'a> Drop for BackendLease<'a> {
    fn drop(&mut self) {
        if let Some(inst) = self.inner.take() {
            let _ = self.pool.tx.send(inst);
        }
    }
}

pub fn object_key(obj_id: i64) -> String {
    format!("s3ql_data_{obj_id}")
}
