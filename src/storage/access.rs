//! Blob access holder: represents an acquired per-blob lock and carries
//! the blob's metadata for the duration of the access.
//!
//! Releasing the holder is where metadata changes land on disk: a
//! finalized write publishes the new info record, a discarded write
//! deletes the blob, a read updates the access time when the storage is
//! configured to do so. Corrupted metadata flips the delete-on-release
//! flag so the blob is reclassified as non-existent without failing the
//! caller.

use log::error;

use std::{cmp, sync::Arc};

use crate::storage::blob::Blob;
use crate::storage::entry::{BlobCoords, BlobInfo, BlobKey};
use crate::storage::lock::BlobLock;
use crate::storage::part::Part;
use crate::storage::storage::Inner;
use crate::storage::unix_now;
use crate::util::LockKind;
use crate::{err_at, Error, Result};

/// Type of access to a blob.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessKind {
    /// Read metadata and stream data. The handle is valid iff the blob
    /// exists.
    Read,
    /// Create the blob or re-write its contents. Always succeeds and
    /// creates a blob coordinate on first touch.
    Create,
}

/// Handle representing an acquired per-blob lock.
///
/// Dropping the holder releases the lock; [BlobAccess::release] does the
/// same but surfaces errors from the final metadata write.
pub struct BlobAccess {
    pub(crate) inner: Arc<Inner>,
    pub(crate) kind: AccessKind,
    pub(crate) keys: BlobKey,
    pub(crate) password: String,
    pub(crate) coords: Option<BlobCoords>,
    pub(crate) part: Option<Arc<Part>>,
    pub(crate) lock: Option<Arc<BlobLock>>,
    pub(crate) lock_kind: LockKind,
    pub(crate) info: Option<BlobInfo>,
    pub(crate) exists: bool,
    pub(crate) new_blob: bool,
    pub(crate) new_ttl: Option<i64>,
    pub(crate) need_write: bool,
    pub(crate) finalized: bool,
    pub(crate) new_size: u64,
    pub(crate) touched: bool,
    pub(crate) delete_on_release: bool,
    pub(crate) released: bool,
}

impl std::fmt::Debug for BlobAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobAccess").finish_non_exhaustive()
    }
}

impl Drop for BlobAccess {
    fn drop(&mut self) {
        if let Err(err) = self.do_release() {
            error!(target: "ncache", "blob release: {}", err);
        }
    }
}

impl BlobAccess {
    // Holder for a read access that found nothing; no lock is held.
    pub(crate) fn missing(inner: Arc<Inner>, keys: BlobKey, password: &str) -> BlobAccess {
        BlobAccess {
            inner,
            kind: AccessKind::Read,
            keys,
            password: password.to_string(),
            coords: None,
            part: None,
            lock: None,
            lock_kind: LockKind::Read,
            info: None,
            exists: false,
            new_blob: false,
            new_ttl: None,
            need_write: false,
            finalized: false,
            new_size: 0,
            touched: false,
            delete_on_release: false,
            released: false,
        }
    }

    /// Whether the blob exists (and its metadata is trustworthy).
    #[inline]
    pub fn is_blob_exists(&self) -> bool {
        self.exists && !self.delete_on_release
    }

    /// Whether the password used to acquire the access matches the one
    /// stored with the blob. A non-existent blob authorizes anybody.
    pub fn is_authorized(&self) -> bool {
        match &self.info {
            Some(info) if self.is_blob_exists() => info.password == self.password,
            _ => true,
        }
    }

    #[inline]
    pub fn get_blob_key(&self) -> &str {
        &self.keys.key
    }

    #[inline]
    pub fn get_blob_subkey(&self) -> &str {
        &self.keys.subkey
    }

    #[inline]
    pub fn get_blob_version(&self) -> i64 {
        self.keys.version
    }

    /// Size of the blob in bytes. Valid only when the blob exists.
    pub fn get_blob_size(&self) -> u64 {
        match &self.info {
            Some(info) => info.size,
            None => 0,
        }
    }

    /// Whether the blob is past its dead time but not yet collected.
    /// Valid only when the blob exists.
    pub fn is_blob_expired(&self) -> bool {
        match &self.info {
            Some(info) => info.dead_time < unix_now(),
            None => false,
        }
    }

    #[inline]
    pub fn get_access_kind(&self) -> AccessKind {
        self.kind
    }

    /// Set the blob's timeout, seconds. Only meaningful for a create
    /// access; the value lands on disk when the write is finalized.
    /// Out-of-range values are clamped to the configured maximum, zero
    /// or negative select the default.
    pub fn set_blob_ttl(&mut self, ttl: i64) {
        let config = &self.inner.config;
        let ttl = match ttl {
            ttl if ttl <= 0 => config.def_blob_ttl(),
            ttl => cmp::min(ttl, config.max_blob_ttl()),
        };
        self.new_ttl = Some(ttl);
    }

    /// Push the blob's dead time out by its timeout, re-counted from
    /// now. Lands on disk when the lock is released.
    pub fn prolong_life(&mut self) {
        if let Some(info) = self.info.as_mut() {
            info.dead_time = unix_now() + info.ttl;
            self.need_write = true;
        }
    }

    /// Stream handle for the blob's data. Read accesses get a reading
    /// handle and require the blob to exist; create accesses get a
    /// writing handle.
    pub fn get_blob(&mut self) -> Result<Blob<'_>> {
        match self.kind {
            AccessKind::Read if !self.is_blob_exists() => {
                err_at!(Fatal, msg: "blob {:?} does not exist", self.keys)
            }
            AccessKind::Read => Ok(Blob::reader(self)),
            AccessKind::Create => Ok(Blob::writer(self)),
        }
    }

    /// Delete the blob: erase it from the cache and move its dead time
    /// into the past, so its space comes back when the part dies. A
    /// second delete of the same blob is a no-op. Requires a create
    /// access.
    pub fn delete_blob(&mut self) -> Result<()> {
        if self.kind != AccessKind::Create {
            return err_at!(Fatal, msg: "delete needs a create access");
        }
        if !self.exists {
            return Ok(());
        }
        self.exists = false;
        self.delete_record()
    }

    /// Release the lock, surfacing errors from the final metadata
    /// write. No other method can be called afterwards.
    pub fn release(mut self) -> Result<()> {
        self.do_release()
    }

    fn do_release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let res = match self.kind {
            AccessKind::Create => self.release_create(),
            AccessKind::Read => self.release_read(),
        };

        if let (Some(lock), Some(coords)) = (self.lock.take(), self.coords) {
            self.inner.locks.release(coords.blob_id, lock, self.lock_kind);
            self.inner.drop_active_lock();
        }
        res
    }

    fn release_create(&mut self) -> Result<()> {
        if self.delete_on_release {
            self.exists = false;
            return self.delete_record();
        }
        if !self.finalized {
            // discarded writer; the blob never became (or stopped
            // being) valid.
            self.exists = false;
            return self.delete_record();
        }

        let now = unix_now();
        let config = &self.inner.config;
        let base = self.info.take().unwrap_or_default();
        let ttl = match self.new_ttl {
            Some(ttl) => ttl,
            None if base.ttl > 0 => base.ttl,
            None => config.def_blob_ttl(),
        };
        let info = BlobInfo {
            owner: base.owner,
            password: self.password.clone(),
            ttl,
            create_time: if self.new_blob { now } else { base.create_time },
            access_time: now,
            dead_time: now + ttl,
            expired: false,
            size: self.new_size,
            cnt_reads: base.cnt_reads,
        };
        let (part, coords) = (self.part.as_ref().unwrap(), self.coords.unwrap());
        part.write_info(coords.blob_id, info.clone())?;
        self.info = Some(info);
        Ok(())
    }

    fn release_read(&mut self) -> Result<()> {
        if self.delete_on_release {
            self.exists = false;
            return self.delete_record();
        }
        if !self.exists {
            return Ok(());
        }

        let mut write = self.need_write;
        if let Some(info) = self.info.as_mut() {
            if self.touched && self.inner.config.is_change_time_on_read() {
                info.access_time = unix_now();
                info.cnt_reads += 1;
                write = true;
            }
        }
        if write {
            let (part, coords) = (self.part.as_ref().unwrap(), self.coords.unwrap());
            part.write_info(coords.blob_id, self.info.clone().unwrap())?;
        }
        Ok(())
    }

    // Erase the cache entry (unless the key was re-bound to fresh
    // coordinates) and dead-time the on-disk record.
    fn delete_record(&mut self) -> Result<()> {
        let (part, coords) = match (self.part.as_ref(), self.coords) {
            (Some(part), Some(coords)) => (part, coords),
            _ => return Ok(()),
        };
        if self.inner.cache.get(&self.keys) == Some(coords) {
            self.inner.cache.erase(&self.keys);
        }
        let mut info = self.info.take().unwrap_or_default();
        info.dead_time = self.inner.dead_time_past();
        info.expired = true;
        part.write_info(coords.blob_id, info)
    }

    // helpers for the Blob stream handle.

    pub(crate) fn take_buffer(&self) -> Vec<u8> {
        self.inner.take_buffer()
    }

    pub(crate) fn return_buffer(&self, buffer: Vec<u8>) {
        self.inner.return_buffer(buffer)
    }

    #[inline]
    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[inline]
    pub(crate) fn max_blob_size(&self) -> u64 {
        self.inner.config.max_blob_size
    }

    pub(crate) fn mark_touched(&mut self) {
        self.touched = true;
    }

    pub(crate) fn mark_corrupted(&mut self) {
        self.delete_on_release = true;
    }

    pub(crate) fn mark_finalized(&mut self, size: u64) {
        self.new_size = size;
        self.finalized = true;
    }

    pub(crate) fn read_chunk(&self, seq: u64) -> Result<Vec<u8>> {
        let (part, coords) = (self.part.as_ref().unwrap(), self.coords.unwrap());
        part.read_chunk(coords.blob_id, seq)
    }

    pub(crate) fn put_chunk(&self, seq: u64, chunk: &[u8]) -> Result<()> {
        let (part, coords) = (self.part.as_ref().unwrap(), self.coords.unwrap());
        match part.put_chunk(coords.blob_id, seq, chunk) {
            Ok(()) => Ok(()),
            Err(err) => {
                // a failing current part is retired so later writes land
                // on a healthy one; this operation still fails.
                self.inner.rotate_after_io_error();
                Err(err)
            }
        }
    }

    pub(crate) fn trunc_chunks(&self, keep: u64) -> Result<()> {
        let (part, coords) = (self.part.as_ref().unwrap(), self.coords.unwrap());
        part.trunc_chunks(coords.blob_id, keep)
    }
}
