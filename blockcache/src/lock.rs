use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Keyed mutual exclusion: at most one holder per key, independent keys
/// never contend with each other.
///
/// This is the cache's replacement for S3QL's global-lock-plus-per-key-lock
/// scheme: the global lock belonged to the FUSE operation layer, which is
/// out of scope here, so only the keyed part survives.
pub struct MultiLock<K> {
    state: Mutex<HashMap<K, ()>>,
    released: Condvar,
}

impl<K: Eq + Hash + Clone> Default for MultiLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> MultiLock<K> {
    pub fn new() -> Self {
        MultiLock {
            state: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Blocks until `key` is free, then takes it. Returns `false` on
    /// timeout without acquiring. `timeout = None` waits indefinitely;
    /// `Some(Duration::ZERO)` is a non-blocking probe.
    pub fn acquire(&self, key: &K, timeout: Option<Duration>) -> bool {
        let mut held = self.state.lock();
        let deadline = timeout.map(|d| Instant::now() + d);

        while held.contains_key(key) {
            match deadline {
                None => self.released.wait(&mut held),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let timed_out = self
                        .released
                        .wait_for(&mut held, deadline - now)
                        .timed_out();
                    if timed_out && held.contains_key(key) {
                        return false;
                    }
                }
            }
        }

        held.insert(key.clone(), ());
        true
    }

    /// Releases `key`. Panics if the key was not held, unless `noerror` is
    /// set (used on cleanup paths that may run after a partial failure).
    pub fn release(&self, key: &K, noerror: bool) {
        let mut held = self.state.lock();
        if held.remove(key).is_none() && !noerror {
            panic!("releasing a lock that was not held");
        }
        drop(held);
        self.released.notify_all();
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.state.lock().contains_key(key)
    }
}

/// RAII guard returned by [`MultiLock::acquire_guard`].
pub struct LockGuard<'a, K: Eq + Hash + Clone> {
    lock: &'a MultiLock<K>,
    key: K,
}

impl<'a, K: Eq + Hash + Clone> Drop for LockGuard<'a, K> {
    fn drop(&mut self) {
        self.lock.release(&self.key, false);
    }
}

impl<K: Eq + Hash + Clone> MultiLock<K> {
    pub fn acquire_guard(&self, key: K, timeout: Option<Duration>) -> Option<LockGuard<'_, K>> {
        if self.acquire(&key, timeout) {
            Some(LockGuard { lock: self, key })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn independent_keys_do_not_contend() {
        let lock: MultiLock<u64> = MultiLock::new();
        assert!(lock.acquire(&1, None));
        assert!(lock.acquire(&2, None));
        lock.release(&1, false);
        lock.release(&2, false);
    }

    #[test]
    fn zero_timeout_probe_fails_when_held() {
        let lock: MultiLock<u64> = MultiLock::new();
        assert!(lock.acquire(&1, None));
        assert!(!lock.acquire(&1, Some(Duration::ZERO)));
        lock.release(&1, false);
        assert!(lock.acquire(&1, Some(Duration::ZERO)));
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let lock = Arc::new(MultiLock::<u64>::new());
        assert!(lock.acquire(&7, None));

        let lock2 = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            assert!(lock2.acquire(&7, None));
            lock2.release(&7, false);
        });

        thread::sleep(Duration::from_millis(20));
        lock.release(&7, false);
        handle.join().unwrap();
    }
}
