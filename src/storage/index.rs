//! The index database: a single small document listing every live part
//! in creation order, plus the `max_sync_log_rec_no` counter kept for
//! upper layers.
//!
//! The document is tiny, so every change rewrites it in full through a
//! temporary file followed by a rename, which keeps a crash from ever
//! leaving a torn index on disk.

use std::{ffi, fs, path};

use crate::storage::entry::{IndexRoot, PartRow};
use crate::storage::files::IndexFileName;
use crate::util::{from_cbor_bytes, into_cbor_bytes};
use crate::{err_at, write_file, Error, Result};

pub(crate) struct IndexDb {
    location: ffi::OsString,
    root: IndexRoot,
}

impl IndexDb {
    /// Open the index database under `dir` for storage `name`, creating
    /// an empty one when the file does not exist.
    pub fn open(dir: &path::Path, name: &str) -> Result<IndexDb> {
        let location = {
            let file: ffi::OsString = IndexFileName::from(name.to_string()).into();
            let loc: path::PathBuf = [dir.as_os_str(), &file].iter().collect();
            loc.into_os_string()
        };

        let root = match fs::read(&location) {
            Ok(data) => {
                let (root, _n) = from_cbor_bytes::<IndexRoot>(&data)?;
                root
            }
            Err(_) => IndexRoot::default(),
        };

        Ok(IndexDb { location, root })
    }

    fn save(&self) -> Result<()> {
        let data = into_cbor_bytes(self.root.clone())?;
        let tmp_loc = {
            let mut loc = self.location.clone();
            loc.push(".tmp");
            loc
        };
        {
            let mut opts = fs::OpenOptions::new();
            let mut fd = err_at!(
                IOError,
                opts.create(true).write(true).truncate(true).open(&tmp_loc)
            )?;
            write_file!(fd, &data, &tmp_loc, "index-db")?;
            err_at!(IOError, fd.sync_all())?;
        }
        err_at!(IOError, fs::rename(&tmp_loc, &self.location))
    }

    pub fn to_parts(&self) -> Vec<PartRow> {
        self.root.parts.clone()
    }

    pub fn add_part(&mut self, row: PartRow) -> Result<()> {
        self.root.parts.push(row);
        self.save()
    }

    pub fn remove_part(&mut self, part_id: i64) -> Result<()> {
        self.root.parts.retain(|row| row.id != part_id);
        self.save()
    }

    pub fn remove_all_parts(&mut self) -> Result<()> {
        self.root.parts.clear();
        self.save()
    }

    pub fn update_created(&mut self, part_id: i64, tm: i64) -> Result<()> {
        for row in self.root.parts.iter_mut() {
            if row.id == part_id {
                row.tm = tm;
            }
        }
        self.save()
    }

    #[inline]
    pub fn max_sync_log_rec_no(&self) -> u64 {
        self.root.max_sync_log_rec_no
    }

    pub fn set_max_sync_log_rec_no(&mut self, rec_no: u64) -> Result<()> {
        self.root.max_sync_log_rec_no = rec_no;
        self.save()
    }
}
