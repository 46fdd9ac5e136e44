//! File naming for the storage directory.
//!
//! A part is a pair of files `{name}.meta.{part_id}.db` and
//! `{name}.data.{part_id}.db`; the index database is `{name}.index.db`;
//! the instance guard is `__ncbi_netcache_started__{name}`, kept
//! exclusively locked for the process's lifetime.

use std::{convert::TryFrom, ffi, fmt, path, result};

use crate::{err_at, Error, Result};

fn parse_part_file(loc: &ffi::OsStr, infix: &str) -> Option<(String, i64)> {
    let full = path::Path::new(loc).file_name()?.to_str()?;
    let stem = full.strip_suffix(".db")?;
    let pos = stem.rfind(infix)?;
    let name = &stem[..pos];
    let part_id: i64 = stem[pos + infix.len()..].parse().ok()?;
    if name.is_empty() {
        None
    } else {
        Some((name.to_string(), part_id))
    }
}

/// A part's meta file is uniquely located by the storage `name` and the
/// part id: `format!("{}.meta.{}.db", name, part_id)`.
#[derive(Clone)]
pub struct MetaFileName(pub ffi::OsString);

impl From<(String, i64)> for MetaFileName {
    fn from((name, part_id): (String, i64)) -> MetaFileName {
        let file_name = format!("{}.meta.{}.db", name, part_id);
        MetaFileName(AsRef::<ffi::OsStr>::as_ref(&file_name).to_os_string())
    }
}

impl TryFrom<MetaFileName> for (String, i64) {
    type Error = Error;

    fn try_from(fname: MetaFileName) -> Result<(String, i64)> {
        match parse_part_file(&fname.0, ".meta.") {
            Some(val) => Ok(val),
            None => err_at!(InvalidFile, msg: "{:?}", fname.0),
        }
    }
}

impl From<MetaFileName> for ffi::OsString {
    fn from(val: MetaFileName) -> ffi::OsString {
        val.0
    }
}

impl fmt::Display for MetaFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        match self.0.to_str() {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "{:?}", self.0),
        }
    }
}

/// A part's data file is uniquely located by the storage `name` and the
/// part id: `format!("{}.data.{}.db", name, part_id)`.
#[derive(Clone)]
pub struct DataFileName(pub ffi::OsString);

impl From<(String, i64)> for DataFileName {
    fn from((name, part_id): (String, i64)) -> DataFileName {
        let file_name = format!("{}.data.{}.db", name, part_id);
        DataFileName(AsRef::<ffi::OsStr>::as_ref(&file_name).to_os_string())
    }
}

impl TryFrom<DataFileName> for (String, i64) {
    type Error = Error;

    fn try_from(fname: DataFileName) -> Result<(String, i64)> {
        match parse_part_file(&fname.0, ".data.") {
            Some(val) => Ok(val),
            None => err_at!(InvalidFile, msg: "{:?}", fname.0),
        }
    }
}

impl From<DataFileName> for ffi::OsString {
    fn from(val: DataFileName) -> ffi::OsString {
        val.0
    }
}

impl fmt::Display for DataFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        match self.0.to_str() {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "{:?}", self.0),
        }
    }
}

/// The index database file: `format!("{}.index.db", name)`.
#[derive(Clone)]
pub struct IndexFileName(pub ffi::OsString);

impl From<String> for IndexFileName {
    fn from(name: String) -> IndexFileName {
        let file_name = format!("{}.index.db", name);
        IndexFileName(AsRef::<ffi::OsStr>::as_ref(&file_name).to_os_string())
    }
}

impl TryFrom<IndexFileName> for String {
    type Error = Error;

    fn try_from(fname: IndexFileName) -> Result<String> {
        let name = || -> Option<&str> {
            let full = path::Path::new(&fname.0).file_name()?.to_str()?;
            full.strip_suffix(".index.db").filter(|nm| !nm.is_empty())
        }();

        match name {
            Some(name) => Ok(name.to_string()),
            None => err_at!(InvalidFile, msg: "{:?}", fname.0),
        }
    }
}

impl From<IndexFileName> for ffi::OsString {
    fn from(val: IndexFileName) -> ffi::OsString {
        val.0
    }
}

impl fmt::Display for IndexFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        match self.0.to_str() {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "{:?}", self.0),
        }
    }
}

/// The guard file marking a storage directory as in use:
/// `format!("__ncbi_netcache_started__{}", name)`. Its presence without
/// a held lock at startup signals an unclean shutdown.
#[derive(Clone)]
pub struct GuardFileName(pub ffi::OsString);

impl From<String> for GuardFileName {
    fn from(name: String) -> GuardFileName {
        let file_name = format!("__ncbi_netcache_started__{}", name);
        GuardFileName(AsRef::<ffi::OsStr>::as_ref(&file_name).to_os_string())
    }
}

impl From<GuardFileName> for ffi::OsString {
    fn from(val: GuardFileName) -> ffi::OsString {
        val.0
    }
}

impl fmt::Display for GuardFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        match self.0.to_str() {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "{:?}", self.0),
        }
    }
}

#[cfg(test)]
#[path = "files_test.rs"]
mod files_test;
