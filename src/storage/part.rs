//! One database part: a rotation generation's pair of append-oriented
//! files plus the in-memory indexes rebuilt from them at load time.
//!
//! The meta file is a stream of [MetaRec] and the data file a stream of
//! [ChunkRec]; the latest record for a blob or chunk wins. Loading
//! replays both streams; a torn tail (crash mid-append) is truncated at
//! the last whole record. Old parts never see chunk writes, but they
//! keep taking metadata updates (dead-time moves, access times) until
//! the whole part is deleted from disk.

use cbordata::{Cbor, FromCbor};
use log::{info, warn};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Seek;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering::SeqCst};
use std::sync::Mutex;
use std::{ffi, fs, path};

use crate::storage::entry::{BlobInfo, BlobKey, ChunkRec, MetaRec, PartRow};
use crate::storage::files::{DataFileName, MetaFileName};
use crate::util::into_cbor_bytes;
use crate::{err_at, write_file, Error, Result};

pub(crate) struct Part {
    part_id: i64,
    min_blob_id: i64,
    created: AtomicI64,
    meta: Mutex<MetaFile>,
    data: Mutex<DataFile>,
}

struct BlobEntry {
    keys: BlobKey,
    /// `None` until the first info record: the blob was created but not
    /// yet finalized (or the finalizing record was lost in a crash).
    info: Option<BlobInfo>,
}

struct MetaFile {
    location: ffi::OsString,
    fd: fs::File,
    /// Blob id to identity and latest info, ordered for id-cursor scans.
    blobs: BTreeMap<i64, BlobEntry>,
    /// `(dead_time, blob_id)` index backing the GC's range queries.
    dead: BTreeSet<(i64, i64)>,
    /// Count of blobs without an info record yet.
    n_pending: usize,
}

struct DataFile {
    location: ffi::OsString,
    fd: fs::File,
    /// Blob id to chunk-record file positions, indexed by chunk number.
    chunks: HashMap<i64, Vec<u64>>,
    fpos: u64,
}

/// Sentinel for a chunk slot whose record was never written.
const NO_CHUNK: u64 = u64::MAX;

fn file_create_rw(loc: &ffi::OsStr) -> Result<fs::File> {
    fs::remove_file(loc).ok(); // NOTE: ignore remove errors.
    let mut opts = fs::OpenOptions::new();
    Ok(err_at!(
        IOError,
        opts.read(true).append(true).create_new(true).open(loc)
    )?)
}

fn file_open_rw(loc: &ffi::OsStr) -> Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    Ok(err_at!(IOError, opts.read(true).append(true).open(loc))?)
}

impl Part {
    /// Create a fresh part under `dir`, removing any leftover files of
    /// the same name from previous runs.
    pub fn create(
        dir: &path::Path,
        name: &str,
        part_id: i64,
        min_blob_id: i64,
        created: i64,
    ) -> Result<Part> {
        let meta_loc = part_file_loc(dir, MetaFileName::from((name.to_string(), part_id)));
        let data_loc = part_file_loc(dir, DataFileName::from((name.to_string(), part_id)));

        let meta_fd = file_create_rw(&meta_loc)?;
        let data_fd = file_create_rw(&data_loc)?;

        Ok(Part {
            part_id,
            min_blob_id,
            created: AtomicI64::new(created),
            meta: Mutex::new(MetaFile {
                location: meta_loc,
                fd: meta_fd,
                blobs: BTreeMap::new(),
                dead: BTreeSet::new(),
                n_pending: 0,
            }),
            data: Mutex::new(DataFile {
                location: data_loc,
                fd: data_fd,
                chunks: HashMap::new(),
                fpos: 0,
            }),
        })
    }

    /// Load an existing part from its index row, replaying both files.
    pub fn load(row: &PartRow) -> Result<Part> {
        let meta_loc: ffi::OsString = AsRef::<ffi::OsStr>::as_ref(&row.met).to_os_string();
        let data_loc: ffi::OsString = AsRef::<ffi::OsStr>::as_ref(&row.dat).to_os_string();

        let mut meta_fd = file_open_rw(&meta_loc)?;
        let mut data_fd = file_open_rw(&data_loc)?;

        let (blobs, dead, n_pending) = replay_meta(&mut meta_fd, &meta_loc)?;
        let meta = MetaFile {
            location: meta_loc,
            fd: meta_fd,
            blobs,
            dead,
            n_pending,
        };

        let (chunks, fpos) = replay_data(&mut data_fd, &data_loc)?;
        let data = DataFile {
            location: data_loc,
            fd: data_fd,
            chunks,
            fpos,
        };

        Ok(Part {
            part_id: row.id,
            min_blob_id: row.bid,
            created: AtomicI64::new(row.tm),
            meta: Mutex::new(meta),
            data: Mutex::new(data),
        })
    }

    #[inline]
    pub fn part_id(&self) -> i64 {
        self.part_id
    }

    #[inline]
    pub fn min_blob_id(&self) -> i64 {
        self.min_blob_id
    }

    #[inline]
    pub fn created(&self) -> i64 {
        self.created.load(SeqCst)
    }

    #[inline]
    pub fn set_created(&self, tm: i64) {
        self.created.store(tm, SeqCst)
    }

    pub fn meta_location(&self) -> ffi::OsString {
        self.meta.lock().unwrap().location.clone()
    }

    pub fn data_location(&self) -> ffi::OsString {
        self.data.lock().unwrap().location.clone()
    }

    /// Largest blob id recorded in this part, 0 when empty.
    pub fn max_blob_id(&self) -> i64 {
        let meta = self.meta.lock().unwrap();
        meta.blobs.keys().next_back().copied().unwrap_or(0)
    }

    /// Record a blob identity (its key row). Info follows later, when
    /// the writer finalizes.
    pub fn add_blob(&self, id: i64, keys: BlobKey) -> Result<()> {
        let mut meta = self.meta.lock().unwrap();
        let buf = into_cbor_bytes(MetaRec::Key {
            id,
            keys: keys.clone(),
        })?;
        write_file!(meta.fd, &buf, &meta.location, "part-meta")?;
        meta.blobs.insert(id, BlobEntry { keys, info: None });
        meta.n_pending += 1;
        Ok(())
    }

    /// Upsert a blob's info record.
    pub fn write_info(&self, id: i64, info: BlobInfo) -> Result<()> {
        let mut meta = self.meta.lock().unwrap();
        let buf = into_cbor_bytes(MetaRec::Info {
            id,
            info: info.clone(),
        })?;
        write_file!(meta.fd, &buf, &meta.location, "part-meta")?;

        let meta = &mut *meta;
        match meta.blobs.get_mut(&id) {
            Some(entry) => {
                match &entry.info {
                    Some(old) => {
                        meta.dead.remove(&(old.dead_time, id));
                    }
                    None => meta.n_pending -= 1,
                }
                meta.dead.insert((info.dead_time, id));
                entry.info = Some(info);
                Ok(())
            }
            None => err_at!(Fatal, msg: "info for unknown blob {}", id),
        }
    }

    /// Latest identity and info recorded for `id`.
    pub fn read_info(&self, id: i64) -> Option<(BlobKey, Option<BlobInfo>)> {
        let meta = self.meta.lock().unwrap();
        meta.blobs
            .get(&id)
            .map(|entry| (entry.keys.clone(), entry.info.clone()))
    }

    /// Find a blob by identity, alive at `dead_after`. Linear scan; only
    /// the not-yet-cached fallback path uses this.
    pub fn find_by_keys(&self, keys: &BlobKey, dead_after: i64) -> Option<i64> {
        let meta = self.meta.lock().unwrap();
        for (id, entry) in meta.blobs.iter() {
            if entry.keys == *keys {
                if let Some(info) = &entry.info {
                    if info.dead_time >= dead_after {
                        return Some(*id);
                    }
                }
            }
        }
        None
    }

    /// Whether any version of `(key, subkey)` is alive at `dead_after`.
    pub fn is_family_exists(&self, key: &str, subkey: &str, dead_after: i64) -> bool {
        let meta = self.meta.lock().unwrap();
        meta.blobs.values().any(|entry| {
            entry.keys.key == key
                && entry.keys.subkey == subkey
                && matches!(&entry.info, Some(info) if info.dead_time >= dead_after)
        })
    }

    /// Page through blobs with `dead_time` in `[dead_after, dead_before)`
    /// ordered by `(dead_time, id)`, resuming after `cursor`.
    pub fn dead_range(
        &self,
        cursor: Option<(i64, i64)>,
        dead_after: i64,
        dead_before: i64,
        batch: usize,
    ) -> Vec<(i64, i64)> {
        let meta = self.meta.lock().unwrap();
        let start = match cursor {
            Some(cursor) => Bound::Excluded(cursor),
            None => Bound::Included((dead_after, i64::MIN)),
        };
        let end = Bound::Excluded((dead_before, i64::MIN));
        meta.dead.range((start, end)).take(batch).cloned().collect()
    }

    /// Page through live blobs by ascending id, resuming after
    /// `after_id`. Used to fill the cache at startup.
    pub fn blob_batch(
        &self,
        after_id: i64,
        dead_after: i64,
        batch: usize,
    ) -> Vec<(i64, BlobKey)> {
        let meta = self.meta.lock().unwrap();
        meta.blobs
            .range((Bound::Excluded(after_id), Bound::Unbounded))
            .filter(|(_, entry)| {
                matches!(&entry.info, Some(info) if info.dead_time >= dead_after)
            })
            .take(batch)
            .map(|(id, entry)| (*id, entry.keys.clone()))
            .collect()
    }

    /// Whether the part holds nothing alive at or after `dead_before`
    /// and no blob is pending finalization.
    pub fn is_empty(&self, dead_before: i64) -> bool {
        let meta = self.meta.lock().unwrap();
        meta.n_pending == 0
            && meta
                .dead
                .range((Bound::Included((dead_before, i64::MIN)), Bound::Unbounded))
                .next()
                .is_none()
    }

    /// Append chunk `seq` of blob `id`.
    pub fn put_chunk(&self, id: i64, seq: u64, chunk: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let rec_fpos = data.fpos;
        let buf = into_cbor_bytes(ChunkRec::Put {
            id,
            seq,
            data: chunk.to_vec(),
        })?;
        write_file!(data.fd, &buf, &data.location, "part-data")?;
        data.fpos += buf.len() as u64;

        let chunks = data.chunks.entry(id).or_insert_with(Vec::new);
        if (seq as usize) >= chunks.len() {
            chunks.resize(seq as usize + 1, NO_CHUNK);
        }
        chunks[seq as usize] = rec_fpos;
        Ok(())
    }

    /// Read back chunk `seq` of blob `id`.
    pub fn read_chunk(&self, id: i64, seq: u64) -> Result<Vec<u8>> {
        let mut data = self.data.lock().unwrap();
        let fpos = data
            .chunks
            .get(&id)
            .and_then(|chunks| chunks.get(seq as usize))
            .copied();
        match fpos {
            Some(fpos) if fpos != NO_CHUNK => {
                err_at!(IOError, data.fd.seek(std::io::SeekFrom::Start(fpos)))?;
                let (val, _n) = err_at!(CorruptedDB, Cbor::decode(&mut data.fd))?;
                match err_at!(CorruptedDB, ChunkRec::from_cbor(val))? {
                    ChunkRec::Put { data: bytes, .. } => Ok(bytes),
                    ChunkRec::Trunc { .. } => {
                        err_at!(CorruptedDB, msg: "chunk {}/{} bad record", id, seq)
                    }
                }
            }
            _ => err_at!(CorruptedDB, msg: "chunk {}/{} missing", id, seq),
        }
    }

    /// Drop chunks of `id` with `seq >= keep`.
    pub fn trunc_chunks(&self, id: i64, keep: u64) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let buf = into_cbor_bytes(ChunkRec::Trunc { id, keep })?;
        write_file!(data.fd, &buf, &data.location, "part-data")?;
        data.fpos += buf.len() as u64;
        if let Some(chunks) = data.chunks.get_mut(&id) {
            chunks.truncate(keep as usize);
        }
        Ok(())
    }

    /// Number of chunks recorded for `id`.
    pub fn chunk_count(&self, id: i64) -> usize {
        let data = self.data.lock().unwrap();
        data.chunks.get(&id).map_or(0, |chunks| chunks.len())
    }

    /// Bytes appended to the data file so far; 0 means the part never
    /// saw a chunk and can be rejuvenated instead of rotated.
    pub fn data_size(&self) -> u64 {
        self.data.lock().unwrap().fpos
    }

    /// Compose this part's index row.
    pub fn to_part_row(&self) -> PartRow {
        PartRow {
            id: self.part_id,
            met: self.meta_location().to_string_lossy().to_string(),
            dat: self.data_location().to_string_lossy().to_string(),
            tm: self.created(),
            bid: self.min_blob_id,
        }
    }

    /// Physically delete both files. The part must already be detached
    /// from the parts list and index database.
    pub fn purge(&self) {
        let meta_loc = self.meta_location();
        let data_loc = self.data_location();
        info!(target: "ncache", "purging part {} files", self.part_id);
        fs::remove_file(&meta_loc).ok();
        fs::remove_file(&data_loc).ok();
    }
}

fn part_file_loc<F>(dir: &path::Path, fname: F) -> ffi::OsString
where
    F: Into<ffi::OsString>,
{
    let file: ffi::OsString = fname.into();
    let loc: path::PathBuf = [dir.as_os_str(), &file].iter().collect();
    loc.into_os_string()
}

type MetaState = (BTreeMap<i64, BlobEntry>, BTreeSet<(i64, i64)>, usize);

fn replay_meta(fd: &mut fs::File, location: &ffi::OsStr) -> Result<MetaState> {
    let mut blobs: BTreeMap<i64, BlobEntry> = BTreeMap::new();
    let mut dead: BTreeSet<(i64, i64)> = BTreeSet::new();
    let mut n_pending = 0_usize;

    let len = err_at!(IOError, fd.metadata())?.len();
    err_at!(IOError, fd.seek(std::io::SeekFrom::Start(0)))?;

    let mut fpos = 0_u64;
    while fpos < len {
        let rec = match Cbor::decode(fd) {
            Ok((val, n)) => match MetaRec::from_cbor(val) {
                Ok(rec) => {
                    fpos += n as u64;
                    rec
                }
                Err(_) => break,
            },
            Err(_) => break,
        };
        match rec {
            MetaRec::Key { id, keys } => {
                blobs.insert(id, BlobEntry { keys, info: None });
                n_pending += 1;
            }
            MetaRec::Info { id, info } => match blobs.get_mut(&id) {
                Some(entry) => {
                    match &entry.info {
                        Some(old) => {
                            dead.remove(&(old.dead_time, id));
                        }
                        None => n_pending -= 1,
                    }
                    dead.insert((info.dead_time, id));
                    entry.info = Some(info);
                }
                None => warn!(target: "ncache", "info for unknown blob {}", id),
            },
        }
    }
    if fpos < len {
        // torn tail from an unclean shutdown; drop it so appends resume
        // on a whole-record boundary.
        warn!(
            target: "ncache",
            "meta file {:?} truncated {} -> {}", location, len, fpos
        );
        err_at!(IOError, fd.set_len(fpos))?;
    }
    Ok((blobs, dead, n_pending))
}

fn replay_data(fd: &mut fs::File, location: &ffi::OsStr) -> Result<(HashMap<i64, Vec<u64>>, u64)> {
    let mut chunks: HashMap<i64, Vec<u64>> = HashMap::new();

    let len = err_at!(IOError, fd.metadata())?.len();
    err_at!(IOError, fd.seek(std::io::SeekFrom::Start(0)))?;

    let mut fpos = 0_u64;
    while fpos < len {
        let rec_fpos = fpos;
        let rec = match Cbor::decode(fd) {
            Ok((val, n)) => match ChunkRec::from_cbor(val) {
                Ok(rec) => {
                    fpos += n as u64;
                    rec
                }
                Err(_) => break,
            },
            Err(_) => break,
        };
        match rec {
            ChunkRec::Put { id, seq, .. } => {
                let slots = chunks.entry(id).or_insert_with(Vec::new);
                if (seq as usize) >= slots.len() {
                    slots.resize(seq as usize + 1, NO_CHUNK);
                }
                slots[seq as usize] = rec_fpos;
            }
            ChunkRec::Trunc { id, keep } => {
                if let Some(slots) = chunks.get_mut(&id) {
                    slots.truncate(keep as usize);
                }
            }
        }
    }
    if fpos < len {
        warn!(
            target: "ncache",
            "data file {:?} truncated {} -> {}", location, len, fpos
        );
        err_at!(IOError, fd.set_len(fpos))?;
    }
    Ok((chunks, fpos))
}

#[cfg(test)]
#[path = "part_test.rs"]
mod part_test;
