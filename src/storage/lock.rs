//! Pooled per-blob reader/writer locks.
//!
//! A lock object exists only while some holder references its blob id.
//! Acquisition creates the object on demand (reusing a freelist) and
//! release detaches it from the id map once nobody holds or awaits it.
//! The id map is sharded over [LOCK_SHARDS] mutexes so unrelated blobs
//! do not contend on pool bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
use std::sync::{Arc, Condvar, Mutex};

use crate::storage::LOCK_SHARDS;
use crate::util::LockKind;

/// A blocking reader/writer lock for one blob id.
pub(crate) struct BlobLock {
    state: Mutex<LockState>,
    cond: Condvar,
    /// Holders and waiters referencing this lock through the pool;
    /// maintained under the owning shard's mutex.
    users: AtomicU32,
}

#[derive(Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

impl BlobLock {
    fn new() -> BlobLock {
        BlobLock {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            users: AtomicU32::new(0),
        }
    }

    fn is_unlocked(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.readers == 0 && !state.writer
    }
}

pub(crate) struct LockPool {
    shards: Vec<Mutex<HashMap<i64, Arc<BlobLock>>>>,
    freelist: Mutex<Vec<Arc<BlobLock>>>,
}

impl LockPool {
    pub fn new() -> LockPool {
        let mut shards = vec![];
        (0..LOCK_SHARDS).for_each(|_| shards.push(Mutex::new(HashMap::new())));
        LockPool {
            shards,
            freelist: Mutex::new(vec![]),
        }
    }

    #[inline]
    fn shard(&self, blob_id: i64) -> &Mutex<HashMap<i64, Arc<BlobLock>>> {
        &self.shards[(blob_id as u64 % LOCK_SHARDS as u64) as usize]
    }

    // Fetch (or create) the lock object for `blob_id` and register one
    // more user on it.
    fn checkout(&self, blob_id: i64) -> Arc<BlobLock> {
        let mut shard = self.shard(blob_id).lock().unwrap();
        let lock = match shard.get(&blob_id) {
            Some(lock) => Arc::clone(lock),
            None => {
                let lock = match self.freelist.lock().unwrap().pop() {
                    Some(lock) => lock,
                    None => Arc::new(BlobLock::new()),
                };
                shard.insert(blob_id, Arc::clone(&lock));
                lock
            }
        };
        lock.users.fetch_add(1, SeqCst);
        lock
    }

    // Drop one user; the last one out detaches the lock from the id map
    // and returns it to the freelist.
    fn checkin(&self, blob_id: i64, lock: &Arc<BlobLock>) {
        let mut shard = self.shard(blob_id).lock().unwrap();
        if lock.users.fetch_sub(1, SeqCst) == 1 && lock.is_unlocked() {
            if let Some(pooled) = shard.remove(&blob_id) {
                self.freelist.lock().unwrap().push(pooled);
            }
        }
    }

    /// Acquire `blob_id` for reading, blocking while a writer holds it.
    pub fn read(&self, blob_id: i64) -> Arc<BlobLock> {
        let lock = self.checkout(blob_id);
        {
            let mut state = lock.state.lock().unwrap();
            while state.writer {
                state = lock.cond.wait(state).unwrap();
            }
            state.readers += 1;
        }
        lock
    }

    /// Acquire `blob_id` for writing, blocking while anybody holds it.
    pub fn write(&self, blob_id: i64) -> Arc<BlobLock> {
        let lock = self.checkout(blob_id);
        {
            let mut state = lock.state.lock().unwrap();
            while state.writer || state.readers > 0 {
                state = lock.cond.wait(state).unwrap();
            }
            state.writer = true;
        }
        lock
    }

    /// Non-blocking write acquisition, used by the garbage collector so
    /// it never stalls live traffic. A contended blob returns `None`.
    pub fn try_write(&self, blob_id: i64) -> Option<Arc<BlobLock>> {
        let lock = self.checkout(blob_id);
        let acquired = {
            let mut state = lock.state.lock().unwrap();
            if state.writer || state.readers > 0 {
                false
            } else {
                state.writer = true;
                true
            }
        };
        if acquired {
            Some(lock)
        } else {
            self.checkin(blob_id, &lock);
            None
        }
    }

    /// Release a lock acquired in `kind` mode.
    pub fn release(&self, blob_id: i64, lock: Arc<BlobLock>, kind: LockKind) {
        {
            let mut state = lock.state.lock().unwrap();
            match kind {
                LockKind::Read => state.readers -= 1,
                LockKind::Write => state.writer = false,
            }
        }
        lock.cond.notify_all();
        self.checkin(blob_id, &lock);
    }
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod lock_test;
