//! Module `storage` implement a sharded, rotating blob store.
//!
//! Blob metadata and chunk data are persisted into a sequence of
//! append-oriented database parts. Exactly one part, the current one,
//! receives writes; every other part is read-only. A background thread
//! reconstructs the in-memory key index from disk on startup, then runs
//! a garbage-collection loop that erases expired blobs from the index
//! and deletes whole part files once they hold nothing live. Rotation
//! periodically retires the current part, bounding the age of any part
//! and guaranteeing that reclamation converges without in-place
//! compaction.
//!
//! Every metadata or chunk access happens under a per-blob reader/writer
//! lock, pooled and sharded by blob id. The GC never blocks on live
//! traffic: a contended blob is skipped and retried on the next cycle.

mod access;
mod blob;
mod config;
mod entry;
mod files;
mod gc;
mod index;
mod lock;
mod part;
#[allow(clippy::module_inception)]
mod storage;

pub use access::{AccessKind, BlobAccess};
pub use blob::Blob;
pub use config::Config;
pub use entry::{BlobCoords, BlobInfo, BlobKey};
pub use storage::Storage;

/// Maximum size of a single blob chunk, in bytes. A blob is stored as a
/// sequence of chunks; the order of chunk numbers is the order of bytes.
pub const CHUNK_SIZE: usize = 2_000_000;

/// Number of shards in the per-blob lock pool.
pub const LOCK_SHARDS: usize = 16;

/// When `db_rotate_period` is left unset, parts rotate every
/// `timeout / DEF_ROTATE_FRACTION` seconds.
pub const DEF_ROTATE_FRACTION: i64 = 10;

/// Unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    use std::time;

    match time::SystemTime::now().duration_since(time::UNIX_EPOCH) {
        Ok(dur) => dur.as_secs() as i64,
        Err(_) => 0,
    }
}
