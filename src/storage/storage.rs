//! The blob storage proper: startup and recovery, coordinate
//! resolution, blob access acquisition, admission control and
//! coordination with the background worker.

use fs2::FileExt;
use log::{error, info, warn};

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering::SeqCst};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::{ffi, fs, path, process, thread};

use crate::cmap::{CMap, GetKind};
use crate::storage::access::{AccessKind, BlobAccess};
use crate::storage::config::Config;
use crate::storage::entry::{BlobCoords, BlobKey};
use crate::storage::files::{GuardFileName, IndexFileName};
use crate::storage::gc::MainLoop;
use crate::storage::index::IndexDb;
use crate::storage::lock::{BlobLock, LockPool};
use crate::storage::part::Part;
use crate::storage::{unix_now, CHUNK_SIZE};
use crate::util::{self, LockKind};
use crate::{err_at, Error, Result};

/// Blob storage: a concurrent key index over a sequence of rotating
/// database parts, with a background thread caching the index at
/// startup and collecting garbage afterwards.
pub struct Storage {
    inner: Arc<Inner>,
    bg: Option<util::Thread<Result<()>>>,
    guard: Option<fs::File>,
    guard_loc: Option<ffi::OsString>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

pub(crate) struct Inner {
    pub config: Config,
    /// Key to coordinates. Authoritative once initial caching is done.
    pub cache: CMap<BlobKey, BlobCoords>,
    /// All live parts in creation order; the last one is current.
    pub parts: RwLock<Vec<Arc<Part>>>,
    pub index: Mutex<IndexDb>,
    pub locks: LockPool,
    /// Coordinates of the latest blob created by the storage.
    pub last_blob: Mutex<BlobCoords>,
    /// Parts with id <= this are still being cached; -1 means all
    /// cached. `all_cached` short-circuits the common case without
    /// taking the lock.
    pub not_cached_part_id: RwLock<i64>,
    pub all_cached: AtomicBool,
    /// Minimum expiration time of all blobs remembered by the storage.
    pub last_dead_time: AtomicI64,
    pub stopped: AtomicBool,
    pub gc_in_work: AtomicBool,
    pub admission: Mutex<Admission>,
    pub admission_cond: Condvar,
    pub buf_pool: Mutex<Vec<Vec<u8>>>,
}

pub(crate) struct Admission {
    pub blocked: bool,
    /// Blob locks handed out and not yet released.
    pub active_locks: u64,
}

impl Storage {
    /// Create the blob storage or connect to an existing one under the
    /// configured directory.
    pub fn open(config: Config) -> Result<Storage> {
        config.validate()?;
        let dir = config.path.clone();
        err_at!(IOError, fs::create_dir_all(&dir))?;

        let (guard, guard_loc, unclean) = if config.read_only {
            (None, None, false)
        } else {
            let (file, loc, unclean) = lock_instance_guard(&dir, &config.name)?;
            (Some(file), Some(loc), unclean)
        };

        let mut index = match IndexDb::open(&dir, &config.name) {
            Ok(index) => index,
            Err(err) if !config.read_only => {
                error!(
                    target: "ncache",
                    "index db of {} is broken ({}), starting over", config.name, err
                );
                let loc: path::PathBuf = {
                    let file = IndexFileName::from(config.name.clone()).0;
                    [dir.as_os_str(), &file].iter().collect()
                };
                fs::remove_file(&loc).ok();
                IndexDb::open(&dir, &config.name)?
            }
            Err(err) => return Err(err),
        };

        let rows = index.to_parts();
        let mut parts: Vec<Arc<Part>> = vec![];

        let reinit = unclean && config.drop_if_dirty && !config.read_only;
        if reinit {
            info!(
                target: "ncache",
                "storage {} was closed uncleanly, reinitializing", config.name
            );
            for row in rows.iter() {
                fs::remove_file(&row.met).ok();
                fs::remove_file(&row.dat).ok();
            }
            index.remove_all_parts()?;
        } else {
            if unclean {
                warn!(
                    target: "ncache",
                    "storage {} wasn't finished cleanly in previous run, \
                     will try to work with it as is",
                    config.name
                );
            }
            let mut failed = false;
            for row in rows.iter() {
                match Part::load(row) {
                    Ok(part) => parts.push(Arc::new(part)),
                    Err(err) if config.read_only => return Err(err),
                    Err(err) => {
                        error!(
                            target: "ncache",
                            "part {} of {} cannot be loaded ({}), \
                             dropping all parts",
                            row.id, config.name, err
                        );
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                parts.clear();
                for row in rows.iter() {
                    fs::remove_file(&row.met).ok();
                    fs::remove_file(&row.dat).ok();
                }
                index.remove_all_parts()?;
            }
        }

        // seed the coordinate allocator past everything on disk.
        let mut last_blob = BlobCoords::default();
        for part in parts.iter() {
            last_blob.blob_id = [last_blob.blob_id, part.min_blob_id(), part.max_blob_id()]
                .iter()
                .copied()
                .max()
                .unwrap();
        }
        last_blob.part_id = parts.last().map(|p| p.part_id()).unwrap_or(0);
        last_blob.volume_id = 1;
        let has_blobs = last_blob.blob_id > 0;
        let newest_part_id = last_blob.part_id;

        let inner = Arc::new(Inner {
            config: config.clone(),
            cache: CMap::new(&config.name),
            parts: RwLock::new(parts),
            index: Mutex::new(index),
            locks: LockPool::new(),
            last_blob: Mutex::new(last_blob),
            not_cached_part_id: RwLock::new(-1),
            all_cached: AtomicBool::new(false),
            last_dead_time: AtomicI64::new(unix_now()),
            stopped: AtomicBool::new(false),
            gc_in_work: AtomicBool::new(false),
            admission: Mutex::new(Admission {
                blocked: false,
                active_locks: 0,
            }),
            admission_cond: Condvar::new(),
            buf_pool: Mutex::new(vec![]),
        });

        if inner.parts.read().unwrap().is_empty() {
            if config.read_only {
                return err_at!(
                    ReadOnlyAccess,
                    msg: "read-only storage {} has no parts", config.name
                );
            }
            inner.create_part()?;
        }
        inner.set_not_cached_part_id(if has_blobs { newest_part_id } else { -1 });

        let bg = {
            let inner = Arc::clone(&inner);
            let name = format!("ncache-gc-{}", config.name);
            util::Thread::new(&name, move |rx| move || MainLoop { inner, rx }.run())?
        };

        Ok(Storage {
            inner,
            bg: Some(bg),
            guard,
            guard_loc,
        })
    }

    /// Stop the background worker, release the instance guard and close
    /// the storage cleanly.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.inner.stopped.store(true, SeqCst);
        if let Some(bg) = self.bg.take() {
            bg.join()??;
        }
        if let Some(guard) = self.guard.take() {
            guard.unlock().ok();
            drop(guard);
        }
        if let Some(loc) = self.guard_loc.take() {
            fs::remove_file(&loc).ok();
        }
        Ok(())
    }

    /// Configuration this storage was opened with.
    pub fn to_config(&self) -> Config {
        self.inner.config.clone()
    }

    /// Check if storage is in read-only mode.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.inner.config.read_only
    }

    /// Acquire access to the blob identified by key, subkey and
    /// version. A read access returns a handle that is valid iff the
    /// blob exists; a create access always succeeds, allocating blob
    /// coordinates on first touch.
    pub fn get_blob_access(
        &self,
        key: &str,
        subkey: &str,
        version: i64,
        password: &str,
        kind: AccessKind,
    ) -> Result<BlobAccess> {
        let inner = &self.inner;
        if kind != AccessKind::Read && inner.config.read_only {
            return err_at!(
                ReadOnlyAccess,
                msg: "storage {} is read-only", inner.config.name
            );
        }
        inner.wait_unblocked();

        let keys = BlobKey::new(key, subkey, version);
        loop {
            match inner.read_coords(&keys) {
                Some(coords) => {
                    let lock_kind = match kind {
                        AccessKind::Read => LockKind::Read,
                        AccessKind::Create => LockKind::Write,
                    };
                    let lock = match lock_kind {
                        LockKind::Read => inner.locks.read(coords.blob_id),
                        LockKind::Write => inner.locks.write(coords.blob_id),
                    };
                    // the blob can move or die while we wait for its
                    // lock; the coordinates decide which lock object is
                    // ours, so re-verify and retry on mismatch.
                    match inner.read_coords(&keys) {
                        Some(cur) if cur.blob_id == coords.blob_id => {
                            match self.existing_access(&keys, password, kind, cur, lock) {
                                Some(access) => return access,
                                None => continue,
                            }
                        }
                        _ => {
                            inner.locks.release(coords.blob_id, lock, lock_kind);
                            continue;
                        }
                    }
                }
                None if kind == AccessKind::Read => {
                    return Ok(BlobAccess::missing(
                        Arc::clone(inner),
                        keys,
                        password,
                    ));
                }
                None => {
                    // race other writers through the coordinate
                    // allocator; the loser falls into the
                    // blob-already-exists branch.
                    let coords = inner.next_coords();
                    let (created, _eff) =
                        inner.cache.put_or_get(&keys, &coords, GetKind::OnlyActive);
                    if !created {
                        continue;
                    }
                    let lock = inner.locks.write(coords.blob_id);
                    let part = match inner.part_by_id(coords.part_id) {
                        Some(part) => part,
                        None => {
                            inner.cache.erase(&keys);
                            inner.locks.release(coords.blob_id, lock, LockKind::Write);
                            return err_at!(
                                Fatal,
                                msg: "current part {} vanished", coords.part_id
                            );
                        }
                    };
                    if let Err(err) = part.add_blob(coords.blob_id, keys.clone()) {
                        inner.cache.erase(&keys);
                        inner.locks.release(coords.blob_id, lock, LockKind::Write);
                        return Err(err);
                    }
                    inner.add_active_lock();
                    return Ok(BlobAccess {
                        inner: Arc::clone(inner),
                        kind,
                        keys,
                        password: password.to_string(),
                        coords: Some(coords),
                        part: Some(part),
                        lock: Some(lock),
                        lock_kind: LockKind::Write,
                        info: None,
                        exists: false,
                        new_blob: true,
                        new_ttl: None,
                        need_write: false,
                        finalized: false,
                        new_size: 0,
                        touched: false,
                        delete_on_release: false,
                        released: false,
                    });
                }
            }
        }
    }

    // Build the holder for a locked, existing blob. `None` asks the
    // caller to release nothing and retry (the holder owns the lock
    // either way).
    fn existing_access(
        &self,
        keys: &BlobKey,
        password: &str,
        kind: AccessKind,
        coords: BlobCoords,
        lock: Arc<BlobLock>,
    ) -> Option<Result<BlobAccess>> {
        let inner = &self.inner;
        let lock_kind = match kind {
            AccessKind::Read => LockKind::Read,
            AccessKind::Create => LockKind::Write,
        };

        let part = match inner.part_by_id(coords.part_id) {
            Some(part) => part,
            None => {
                // the part died while we locked; the key mapping must
                // be stale, retry from scratch.
                inner.locks.release(coords.blob_id, lock, lock_kind);
                return None;
            }
        };

        let (exists, info, delete_on_release) = match part.read_info(coords.blob_id) {
            Some((_keys, Some(info))) => (true, Some(info), false),
            _ => {
                error!(
                    target: "ncache",
                    "metadata of blob {:?}/{} is inconsistent, scheduling delete",
                    keys, coords.blob_id
                );
                (false, None, true)
            }
        };

        let mut access = BlobAccess {
            inner: Arc::clone(inner),
            kind,
            keys: keys.clone(),
            password: password.to_string(),
            coords: Some(coords),
            part: Some(part),
            lock: Some(lock),
            lock_kind,
            info,
            exists,
            new_blob: false,
            new_ttl: None,
            need_write: false,
            finalized: false,
            new_size: 0,
            touched: false,
            delete_on_release,
            released: false,
        };
        inner.add_active_lock();

        // definitions of blobs being re-written migrate to the current
        // part, so no part lives forever just because one of its blobs
        // keeps being written over and over again.
        if kind == AccessKind::Create && access.is_blob_exists() {
            if let Err(err) = inner.migrate_if_needed(&mut access) {
                return Some(Err(err));
            }
        }

        Some(Ok(access))
    }

    /// Check if any version of the blob family `(key, subkey)` exists.
    pub fn is_blob_family_exists(&self, key: &str, subkey: &str) -> bool {
        let inner = &self.inner;
        // dead time is read before the caching sentinel, so a sentinel
        // that moved underneath us only widens the disk check.
        let dead_time = inner.last_dead_time.load(SeqCst);
        let check_part_id = inner.not_cached_part_id();

        let probe = BlobKey::family_probe(key, subkey);
        if let Some((found, _)) = inner.cache.get_lower_bound(&probe) {
            if found.is_family(&probe) {
                return true;
            }
        }
        if check_part_id != -1 {
            let parts = inner.parts.read().unwrap().clone();
            for part in parts.iter().rev() {
                if part.part_id() <= check_part_id
                    && part.is_family_exists(key, subkey, dead_time)
                {
                    return true;
                }
            }
        }
        false
    }

    /// Stop admitting new blob accesses. Accesses already under way
    /// finish as usual; use [Storage::can_do_exclusive] to learn when
    /// they have drained.
    pub fn block(&self) {
        let mut adm = self.inner.admission.lock().unwrap();
        adm.blocked = true;
    }

    /// Admit blob accesses again.
    pub fn unblock(&self) {
        let mut adm = self.inner.admission.lock().unwrap();
        adm.blocked = false;
        drop(adm);
        self.inner.admission_cond.notify_all();
    }

    /// Check if blocking of storage is requested.
    pub fn is_blocked(&self) -> bool {
        self.inner.admission.lock().unwrap().blocked
    }

    /// Whether the storage is blocked and every outstanding blob lock
    /// has been released.
    pub fn can_do_exclusive(&self) -> bool {
        let adm = self.inner.admission.lock().unwrap();
        adm.blocked && adm.active_locks == 0
    }

    /// Clear all on-disk state. Valid only while the storage is blocked
    /// and no blob lock is outstanding.
    pub fn reinitialize(&self) -> Result<()> {
        if self.inner.config.read_only {
            return err_at!(
                ReadOnlyAccess,
                msg: "storage {} is read-only", self.inner.config.name
            );
        }
        {
            let adm = self.inner.admission.lock().unwrap();
            if !adm.blocked || adm.active_locks != 0 {
                return err_at!(
                    WrongBlock,
                    msg: "reinitialize needs a blocked, idle storage"
                );
            }
        }
        // the background thread also touches the cache and the parts:
        // let initial caching finish, and wait out the GC cycle that may
        // be in flight (the collector skips new cycles while blocked).
        while !self.is_caching_complete() || self.inner.gc_in_work.load(SeqCst) {
            thread::yield_now();
        }
        info!(target: "ncache", "reinitializing storage {}", self.inner.config.name);

        self.inner.cache.clear();
        {
            let mut parts = self.inner.parts.write().unwrap();
            for part in parts.drain(..) {
                part.purge();
            }
        }
        self.inner.index.lock().unwrap().remove_all_parts()?;
        self.inner.last_dead_time.store(unix_now(), SeqCst);
        self.inner.create_part()?;
        self.inner.set_not_cached_part_id(-1);
        Ok(())
    }

    /// Periodic tick driving the index's deferred reclaimer.
    pub fn heartbeat(&self) {
        self.inner.cache.heartbeat();
    }

    /// Number of blobs currently present in the in-memory index.
    pub fn count_blobs(&self) -> usize {
        self.inner.cache.count_values()
    }

    /// Whether the initial caching phase has completed; until then
    /// lookups may fall back to on-disk scans of the uncached parts.
    pub fn is_caching_complete(&self) -> bool {
        self.inner.not_cached_part_id() == -1
    }

    /// Opaque monotonic counter maintained for upper layers.
    pub fn max_sync_log_rec_no(&self) -> u64 {
        self.inner.index.lock().unwrap().max_sync_log_rec_no()
    }

    /// Persist a new value of the sync-log counter.
    pub fn set_max_sync_log_rec_no(&self, rec_no: u64) -> Result<()> {
        if self.inner.config.read_only {
            return err_at!(
                ReadOnlyAccess,
                msg: "storage {} is read-only", self.inner.config.name
            );
        }
        self.inner.index.lock().unwrap().set_max_sync_log_rec_no(rec_no)
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(target: "ncache", "storage shutdown: {}", err);
        }
    }
}

impl Inner {
    /// Resolve key to coordinates: the cache first, falling back to
    /// reverse-order scans of the parts not yet cached.
    pub fn read_coords(&self, keys: &BlobKey) -> Option<BlobCoords> {
        // dead time is read before the caching sentinel to close the
        // race with a finishing caching phase.
        let dead_time = self.last_dead_time.load(SeqCst);
        let check_part_id = self.not_cached_part_id();

        if let Some(coords) = self.cache.get(keys) {
            return Some(coords);
        }
        if check_part_id != -1 {
            let parts = self.parts.read().unwrap().clone();
            for part in parts.iter().rev() {
                if part.part_id() <= check_part_id {
                    if let Some(id) = part.find_by_keys(keys, dead_time) {
                        return Some(BlobCoords::new(part.part_id(), 1, id));
                    }
                }
            }
        }
        None
    }

    /// Next coordinates usable for creating a new blob.
    pub fn next_coords(&self) -> BlobCoords {
        let mut last = self.last_blob.lock().unwrap();
        last.blob_id += 1;
        if last.blob_id <= 0 {
            last.blob_id = 1;
        }
        last.volume_id = 1; // a single volume per part
        *last
    }

    pub fn current_part(&self) -> Arc<Part> {
        let parts = self.parts.read().unwrap();
        Arc::clone(parts.last().expect("no current part"))
    }

    pub fn part_by_id(&self, part_id: i64) -> Option<Arc<Part>> {
        let parts = self.parts.read().unwrap();
        parts
            .iter()
            .find(|part| part.part_id() == part_id)
            .map(Arc::clone)
    }

    /// Create a new part and make it current.
    pub fn create_part(&self) -> Result<Arc<Part>> {
        let mut parts = self.parts.write().unwrap();
        let part_id = parts.last().map(|p| p.part_id() + 1).unwrap_or(1);
        let min_blob_id = {
            let mut last = self.last_blob.lock().unwrap();
            last.blob_id += 1;
            if last.blob_id <= 0 {
                last.blob_id = 1;
            }
            last.part_id = part_id;
            last.blob_id
        };
        let part = Arc::new(Part::create(
            &self.config.path,
            &self.config.name,
            part_id,
            min_blob_id,
            unix_now(),
        )?);
        self.index.lock().unwrap().add_part(part.to_part_row())?;
        parts.push(Arc::clone(&part));
        info!(
            target: "ncache",
            "storage {} switched to part {}", self.config.name, part_id
        );
        Ok(part)
    }

    /// Best-effort rotation after an I/O error on the current part.
    pub fn rotate_after_io_error(&self) {
        warn!(
            target: "ncache",
            "i/o error on current part of {}, rotating", self.config.name
        );
        if let Err(err) = self.create_part() {
            error!(target: "ncache", "rotation also failed: {}", err);
        }
    }

    // Move the definition of the blob held by `access` into the current
    // part, re-binding the cache entry to fresh coordinates and
    // dead-timing the old record. The key tuple stays stable while the
    // blob id changes.
    pub fn migrate_if_needed(&self, access: &mut BlobAccess) -> Result<()> {
        let old_coords = access.coords.unwrap();
        let current = self.current_part();
        if old_coords.part_id == current.part_id() {
            return Ok(());
        }

        let new_coords = {
            let mut coords = self.next_coords();
            coords.part_id = current.part_id();
            coords
        };
        current.add_blob(new_coords.blob_id, access.keys.clone())?;
        // hold the new id's lock before publishing the new coordinates.
        let new_lock = self.locks.write(new_coords.blob_id);
        if !self.cache.change(&access.keys, new_coords) {
            // the blob was found on disk but is not cached yet (initial
            // caching still in flight); insert instead.
            self.cache.put(&access.keys, new_coords);
        }

        // dead-time the old record so the old part can converge.
        let old_part = access.part.take().unwrap();
        let mut old_info = access.info.clone().unwrap_or_default();
        old_info.dead_time = self.dead_time_past();
        old_info.expired = true;
        if let Err(err) = old_part.write_info(old_coords.blob_id, old_info) {
            // roll the move back; the new record is dead-timed so the
            // current part does not keep a pending orphan.
            self.cache.change(&access.keys, old_coords);
            let mut gone = access.info.clone().unwrap_or_default();
            gone.dead_time = self.dead_time_past();
            gone.expired = true;
            current.write_info(new_coords.blob_id, gone).ok();
            self.locks.release(new_coords.blob_id, new_lock, LockKind::Write);
            access.part = Some(old_part);
            return Err(err);
        }

        let old_lock = access.lock.take().unwrap();
        self.locks.release(old_coords.blob_id, old_lock, LockKind::Write);

        access.coords = Some(new_coords);
        access.part = Some(current);
        access.lock = Some(new_lock);
        Ok(())
    }

    pub fn not_cached_part_id(&self) -> i64 {
        if self.all_cached.load(SeqCst) {
            return -1;
        }
        *self.not_cached_part_id.read().unwrap()
    }

    pub fn set_not_cached_part_id(&self, part_id: i64) {
        let mut val = self.not_cached_part_id.write().unwrap();
        *val = part_id;
        if part_id == -1 {
            self.all_cached.store(true, SeqCst);
        }
    }

    /// A dead time safely in the past: anything below the GC's low
    /// water mark is collected on the next pass.
    pub fn dead_time_past(&self) -> i64 {
        self.last_dead_time.load(SeqCst) - 1
    }

    pub fn is_blocked(&self) -> bool {
        self.admission.lock().unwrap().blocked
    }

    pub fn wait_unblocked(&self) {
        let mut adm = self.admission.lock().unwrap();
        while adm.blocked {
            adm = self.admission_cond.wait(adm).unwrap();
        }
    }

    pub fn add_active_lock(&self) {
        let mut adm = self.admission.lock().unwrap();
        adm.active_locks += 1;
    }

    pub fn drop_active_lock(&self) {
        let mut adm = self.admission.lock().unwrap();
        adm.active_locks -= 1;
        drop(adm);
        self.admission_cond.notify_all();
    }

    pub fn take_buffer(&self) -> Vec<u8> {
        match self.buf_pool.lock().unwrap().pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer
            }
            None => Vec::with_capacity(CHUNK_SIZE),
        }
    }

    pub fn return_buffer(&self, buffer: Vec<u8>) {
        if buffer.capacity() > 0 {
            self.buf_pool.lock().unwrap().push(buffer);
        }
    }
}

// Lock the guard file for this storage instance, creating it when
// missing, and write our pid into it. Returns the file (holding the
// exclusive lock), its location, and whether a previous instance died
// without cleaning up.
fn lock_instance_guard(
    dir: &path::Path,
    name: &str,
) -> Result<(fs::File, ffi::OsString, bool)> {
    let loc = {
        let file: ffi::OsString = GuardFileName::from(name.to_string()).into();
        let loc: path::PathBuf = [dir.as_os_str(), &file].iter().collect();
        loc.into_os_string()
    };
    let existed = path::Path::new(&loc).exists();

    let mut opts = fs::OpenOptions::new();
    let mut file = err_at!(
        IOError,
        opts.read(true).write(true).create(true).open(&loc)
    )?;
    err_at!(
        IOError,
        file.try_lock_exclusive(),
        "storage {} is used by another instance", name
    )?;

    // an empty guard means the previous instance died between creating
    // and stamping it; treat that as a clean slate.
    let unclean = existed && err_at!(IOError, file.metadata())?.len() > 0;

    err_at!(IOError, file.set_len(0))?;
    let pid = process::id().to_string();
    err_at!(IOError, file.write_all(pid.as_bytes()))?;
    err_at!(IOError, file.sync_all())?;

    Ok((file, loc, unclean))
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod storage_test;
