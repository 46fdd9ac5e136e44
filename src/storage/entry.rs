//! On-disk record types for the part and index databases.
//!
//! The meta file of a part is a stream of [MetaRec] values, the data
//! file a stream of [ChunkRec] values, and the index database a single
//! [IndexRoot] document. Records are CBOR encoded; the in-memory side
//! indexes are rebuilt by replaying the streams at load time.

use cbordata::Cborize;

use std::cmp;

/// These values must change only when the shape of the corresponding
/// record type changes. High 16-bits identify the type, low 16-bits the
/// version.
const BLOB_KEY_VER: u32 = 0x00010001;
const BLOB_COORDS_VER: u32 = 0x00020001;
const BLOB_INFO_VER: u32 = 0x00030001;
const META_REC_VER: u32 = 0x00040001;
const CHUNK_REC_VER: u32 = 0x00050001;
const PART_ROW_VER: u32 = 0x00060001;
const INDEX_ROOT_VER: u32 = 0x00070001;

/// Identity of a blob: key, subkey and version. Two identities are equal
/// iff all three components match; identities sharing key and subkey
/// belong to the same family.
///
/// The ordering compares lengths before content, which is cheaper for
/// the long URL-ish keys caches typically see and keeps versions of one
/// family adjacent, so a lower-bound probe finds the family in one
/// descent.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Cborize)]
pub struct BlobKey {
    pub key: String,
    pub subkey: String,
    pub version: i64,
}

impl BlobKey {
    pub const ID: u32 = BLOB_KEY_VER;

    pub fn new(key: &str, subkey: &str, version: i64) -> BlobKey {
        BlobKey {
            key: key.to_string(),
            subkey: subkey.to_string(),
            version,
        }
    }

    /// Probe value locating the smallest member of a (key, subkey)
    /// family via a lower-bound search.
    pub fn family_probe(key: &str, subkey: &str) -> BlobKey {
        BlobKey::new(key, subkey, 0)
    }

    /// Whether `self` and `other` share key and subkey.
    pub fn is_family(&self, other: &BlobKey) -> bool {
        self.key == other.key && self.subkey == other.subkey
    }
}

impl PartialOrd for BlobKey {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlobKey {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        (self.key.len(), self.subkey.len())
            .cmp(&(other.key.len(), other.subkey.len()))
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.subkey.cmp(&other.subkey))
            .then_with(|| self.version.cmp(&other.version))
    }
}

/// Coordinates of a blob's persistent representation: the rotation
/// generation it lives in, a volume within the part and the blob id
/// itself. Blob ids are monotonically increasing within the process's
/// lifetime. The engine always uses one volume per part, the coordinate
/// layout reserves room for more.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Cborize)]
pub struct BlobCoords {
    pub part_id: i64,
    pub volume_id: u64,
    pub blob_id: i64,
}

impl BlobCoords {
    pub const ID: u32 = BLOB_COORDS_VER;

    pub fn new(part_id: i64, volume_id: u64, blob_id: i64) -> BlobCoords {
        BlobCoords {
            part_id,
            volume_id,
            blob_id,
        }
    }
}

/// Metadata persisted per blob: ownership, timing and size. Also held in
/// memory for the duration of an access.
#[derive(Clone, Debug, Default, Eq, PartialEq, Cborize)]
pub struct BlobInfo {
    pub owner: String,
    pub password: String,
    /// Timeout, in seconds, after the last prolongation.
    pub ttl: i64,
    pub create_time: i64,
    pub access_time: i64,
    /// Moment the blob expires; a dead time in the past marks a deleted
    /// blob whose space comes back when its part dies.
    pub dead_time: i64,
    pub expired: bool,
    pub size: u64,
    pub cnt_reads: u64,
}

impl BlobInfo {
    pub const ID: u32 = BLOB_INFO_VER;
}

/// One record of a part's meta file.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub enum MetaRec {
    /// Blob identity row, written once when the blob is created.
    Key { id: i64, keys: BlobKey },
    /// Blob info row; re-appended on every metadata change, the latest
    /// record wins at replay.
    Info { id: i64, info: BlobInfo },
}

impl MetaRec {
    pub const ID: u32 = META_REC_VER;
}

/// One record of a part's data file.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub enum ChunkRec {
    /// Chunk `seq` of blob `id`; re-appending the same `seq` replaces
    /// the chunk at replay.
    Put { id: i64, seq: u64, data: Vec<u8> },
    /// Drop chunks with `seq >= keep`, written when a finalized rewrite
    /// shrank the blob.
    Trunc { id: i64, keep: u64 },
}

impl ChunkRec {
    pub const ID: u32 = CHUNK_REC_VER;
}

/// One part row of the index database: part id, meta and data file
/// locations, creation time and the minimum blob id assigned to the
/// part. The minimum blob id of a part is strictly greater than every
/// blob id in any older part.
#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
pub struct PartRow {
    pub id: i64,
    pub met: String,
    pub dat: String,
    pub tm: i64,
    pub bid: i64,
}

impl PartRow {
    pub const ID: u32 = PART_ROW_VER;
}

/// The index database document: every live part in creation order, plus
/// an opaque monotonic counter maintained for upper layers.
#[derive(Clone, Debug, Default, Eq, PartialEq, Cborize)]
pub struct IndexRoot {
    pub parts: Vec<PartRow>,
    pub max_sync_log_rec_no: u64,
}

impl IndexRoot {
    pub const ID: u32 = INDEX_ROOT_VER;
}

#[cfg(test)]
#[path = "entry_test.rs"]
mod entry_test;
