//! Background main-loop of the storage: fill the in-memory index from
//! disk at startup, then run garbage-collection cycles.
//!
//! One cycle scans every part, oldest first, for blobs whose dead time
//! fell inside `[last_dead_time, next_dead)`, in batches. Each
//! candidate is taken with a non-blocking write lock: a contended blob
//! is simply skipped and the pass marked incomplete. `last_dead_time`
//! advances only after a fully successful pass, which guarantees that
//! skipped blobs are retried on the next cycle without losing coverage.
//! A non-current part that ends a pass with nothing live is deleted
//! from disk whole. The cycle finishes with the rotation check.

use log::{debug, error, info};

use std::sync::atomic::Ordering::SeqCst;
use std::sync::{mpsc, Arc};
use std::{thread, time};

use crate::cmap::GetKind;
use crate::storage::entry::BlobCoords;
use crate::storage::part::Part;
use crate::storage::storage::Inner;
use crate::storage::unix_now;
use crate::util::{self, LockKind};
use crate::Result;

pub(crate) struct MainLoop {
    pub inner: Arc<Inner>,
    /// Timer tick and shutdown signal, nothing is ever sent on it.
    pub rx: util::thread::Rx,
}

impl MainLoop {
    pub fn run(self) -> Result<()> {
        info!(
            target: "ncache",
            "background thread for {} starting", self.inner.config.name
        );

        if !self.fill_cache() {
            info!(target: "ncache", "caching interrupted by shutdown");
            return Ok(());
        }

        loop {
            if self.is_stopped() {
                break;
            }
            if !self.inner.is_blocked() {
                self.inner.gc_in_work.store(true, SeqCst);
                let res = self.gc_cycle();
                self.inner.gc_in_work.store(false, SeqCst);
                if let Err(err) = res {
                    error!(target: "ncache", "gc cycle: {}", err);
                }
            }
            let delay = time::Duration::from_secs(
                self.inner.config.purge_thread_delay.max(1) as u64,
            );
            match self.rx.recv_timeout(delay) {
                Ok(()) => (),
                Err(mpsc::RecvTimeoutError::Timeout) => (),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(
            target: "ncache",
            "background thread for {} exits normally", self.inner.config.name
        );
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(SeqCst)
    }

    // Populate the cache from every part, newest to oldest, keeping the
    // not-yet-cached sentinel one step ahead so lookups know which
    // parts still need a disk check. Returns false when interrupted.
    fn fill_cache(&self) -> bool {
        if self.inner.not_cached_part_id() == -1 {
            return true;
        }
        let parts = self.inner.parts.read().unwrap().clone();
        for part in parts.iter().rev() {
            self.inner.set_not_cached_part_id(part.part_id());
            if !self.fill_cache_from_part(part) {
                return false;
            }
        }
        self.inner.set_not_cached_part_id(-1);
        info!(
            target: "ncache",
            "initial caching of {} done, {} blobs",
            self.inner.config.name,
            self.inner.cache.count_values()
        );
        true
    }

    fn fill_cache_from_part(&self, part: &Arc<Part>) -> bool {
        let dead_after = self.inner.last_dead_time.load(SeqCst);
        let batch_size = self.inner.config.purge_batch_size.max(1);
        let mut after_id = 0;
        loop {
            let batch = part.blob_batch(after_id, dead_after, batch_size);
            if batch.is_empty() {
                break true;
            }
            for (id, keys) in batch.into_iter() {
                if self.is_stopped() {
                    return false;
                }
                // the read lock serializes against a concurrent delete
                // of the same blob, the same way live traffic does.
                let lock = self.inner.locks.read(id);
                let alive = matches!(
                    part.read_info(id),
                    Some((_, Some(info))) if info.dead_time >= dead_after
                );
                if alive {
                    let coords = BlobCoords::new(part.part_id(), 1, id);
                    self.inner.cache.put_or_get(&keys, &coords, GetKind::OnlyActive);
                }
                self.inner.locks.release(id, lock, LockKind::Read);
                after_id = id;
            }
        }
    }

    fn gc_cycle(&self) -> Result<()> {
        debug!(target: "ncache", "gc: starting next cycle");
        let next_dead = unix_now();
        let mut can_advance = true;

        let parts = self.inner.parts.read().unwrap().clone();
        for part in parts.iter() {
            if self.is_stopped() {
                return Ok(());
            }
            can_advance &= self.clean_part(part, next_dead)?;
        }
        if can_advance {
            self.inner.last_dead_time.store(next_dead, SeqCst);
        }
        if self.is_stopped() {
            return Ok(());
        }
        self.rotate_parts()?;
        debug!(target: "ncache", "gc: cycle ended");
        Ok(())
    }

    // Clean one part of blobs that expired before `dead_before`.
    // Returns whether every candidate was actually handled.
    fn clean_part(&self, part: &Arc<Part>, dead_before: i64) -> Result<bool> {
        let dead_after = self.inner.last_dead_time.load(SeqCst);
        let batch_size = self.inner.config.purge_batch_size.max(1);
        let batch_sleep = self.inner.config.purge_batch_sleep;
        let mut cursor = None;
        let mut complete = true;

        loop {
            if self.is_stopped() {
                return Ok(complete);
            }
            let batch = part.dead_range(cursor, dead_after, dead_before, batch_size);
            if batch.is_empty() {
                break;
            }
            for (_dt, id) in batch.iter() {
                if self.is_stopped() {
                    return Ok(complete);
                }
                complete &= self.delete_expired(part, *id);
            }
            cursor = batch.last().copied();
            if batch_sleep > 0 {
                thread::sleep(time::Duration::from_millis(batch_sleep));
            }
        }

        if complete
            && part.part_id() != self.inner.current_part().part_id()
            && part.is_empty(dead_before)
        {
            self.delete_part(part)?;
        }
        Ok(complete)
    }

    // Erase one expired blob from the cache. Returns false when the
    // blob's lock is contended and the pass must stay incomplete.
    fn delete_expired(&self, part: &Arc<Part>, id: i64) -> bool {
        match self.inner.locks.try_write(id) {
            None => false,
            Some(lock) => {
                if let Some((keys, Some(info))) = part.read_info(id) {
                    if info.dead_time < unix_now() {
                        // erase only while the key still maps here; a
                        // re-created blob lives at fresh coordinates.
                        let coords = BlobCoords::new(part.part_id(), 1, id);
                        if self.inner.cache.get(&keys) == Some(coords) {
                            debug!(target: "ncache", "gc: deleting blob {:?}", keys);
                            self.inner.cache.erase(&keys);
                        }
                    }
                }
                self.inner.locks.release(id, lock, LockKind::Write);
                true
            }
        }
    }

    fn delete_part(&self, part: &Arc<Part>) -> Result<()> {
        info!(
            target: "ncache",
            "gc: part {} of {} ran empty, deleting",
            part.part_id(),
            self.inner.config.name
        );
        {
            let mut parts = self.inner.parts.write().unwrap();
            parts.retain(|p| p.part_id() != part.part_id());
        }
        self.inner.index.lock().unwrap().remove_part(part.part_id())?;
        part.purge();
        Ok(())
    }

    // Retire a current part that grew too old. An empty part gets its
    // creation time bumped in place instead, avoiding a proliferation
    // of empty parts on idle storages.
    fn rotate_parts(&self) -> Result<()> {
        let current = self.inner.current_part();
        if unix_now() - current.created() < self.inner.config.rotate_period() {
            return Ok(());
        }
        if current.data_size() == 0 {
            let now = unix_now();
            current.set_created(now);
            self.inner
                .index
                .lock()
                .unwrap()
                .update_created(current.part_id(), now)?;
        } else {
            self.inner.create_part()?;
        }
        Ok(())
    }
}
