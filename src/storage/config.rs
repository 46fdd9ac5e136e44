//! Storage configuration, read from a registry section.

use log::warn;
use serde::Deserialize;

use std::{cmp, ffi, path};

use crate::storage::DEF_ROTATE_FRACTION;
use crate::util::files::load_toml;
use crate::{err_at, Error, Result};

/// Default blob time-to-live, in seconds.
pub const DEF_BLOB_TTL: i64 = 3600;
/// Default garbage-collector cycle period, in seconds.
pub const DEF_GC_RUN_DELAY: i64 = 30;
/// Default number of blobs handled per GC (and caching) batch.
pub const DEF_GC_BATCH_SIZE: usize = 500;

/// Timestamp policy token enabling access-time updates on reads.
const TS_ONREAD: &str = "onread";

/// Configuration for [Storage][crate::storage::Storage] instances.
///
/// All fields map one-to-one onto the registry section keys of the same
/// name. `path` and `name` are required; everything else has a usable
/// default.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory in which all database files of the storage live.
    pub path: path::PathBuf,
    /// Uniquely name storage instances sharing a directory.
    pub name: String,
    /// Disable all writes.
    pub read_only: bool,
    /// Default blob time-to-live, in seconds.
    pub timeout: i64,
    /// Maximum blob time-to-live, in seconds. Raised to `timeout` when
    /// configured smaller.
    pub max_timeout: i64,
    /// Space separated timestamp policy tokens; `onread` makes reads
    /// update the blob's access time.
    pub timestamp: String,
    /// Reinitialize the storage when an unclean shutdown is detected.
    pub drop_if_dirty: bool,
    /// Upper limit on blob size in bytes; 0 means unlimited.
    pub max_blob_size: u64,
    /// Part rotation interval in seconds; 0 derives it from `timeout`.
    pub db_rotate_period: i64,
    /// GC cycle period, in seconds.
    pub purge_thread_delay: i64,
    /// Number of blobs per GC batch.
    pub purge_batch_size: usize,
    /// Sleep between GC batches, in milliseconds.
    pub purge_batch_sleep: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: path::PathBuf::new(),
            name: String::new(),
            read_only: false,
            timeout: DEF_BLOB_TTL,
            max_timeout: 0,
            timestamp: String::new(),
            drop_if_dirty: false,
            max_blob_size: 0,
            db_rotate_period: 0,
            purge_thread_delay: DEF_GC_RUN_DELAY,
            purge_batch_size: DEF_GC_BATCH_SIZE,
            purge_batch_sleep: 0,
        }
    }
}

impl<'a> arbitrary::Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        use std::env;

        let name: String = u.arbitrary()?;
        let mut config = Config::new(env::temp_dir().as_os_str(), &name);
        config.timeout = *u.choose(&[1, 10, 600, 3600, 86400])?;
        config.max_timeout = *u.choose(&[0, 10, 7200])?;
        config.db_rotate_period = *u.choose(&[0, 1, 60])?;
        config.purge_thread_delay = *u.choose(&[1, 5, 30])?;
        config.purge_batch_size = *u.choose(&[1, 10, 500])?;
        config.purge_batch_sleep = *u.choose(&[0, 1, 10])?;
        Ok(config)
    }
}

impl Config {
    pub fn new(dir: &ffi::OsStr, name: &str) -> Config {
        Config {
            path: dir.to_os_string().into(),
            name: name.to_string(),
            ..Config::default()
        }
    }

    /// Load the section named `section` from the toml file at `loc`.
    pub fn from_file<P>(loc: P, section: &str) -> Result<Config>
    where
        P: AsRef<path::Path>,
    {
        let value: toml::Value = load_toml(&loc)?;
        match value.get(section) {
            Some(section) => {
                err_at!(FailConvert, section.clone().try_into::<Config>())
            }
            None => err_at!(
                InvalidFile,
                msg: "section [{}] missing in {:?}", section, loc.as_ref()
            ),
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }

    pub fn set_timeout(&mut self, timeout: i64) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn set_drop_if_dirty(&mut self, drop_if_dirty: bool) -> &mut Self {
        self.drop_if_dirty = drop_if_dirty;
        self
    }

    pub fn set_max_blob_size(&mut self, max_blob_size: u64) -> &mut Self {
        self.max_blob_size = max_blob_size;
        self
    }

    pub fn set_rotate_period(&mut self, period: i64) -> &mut Self {
        self.db_rotate_period = period;
        self
    }

    pub fn set_gc(&mut self, delay: i64, batch_size: usize, batch_sleep: u64) -> &mut Self {
        self.purge_thread_delay = delay;
        self.purge_batch_size = batch_size;
        self.purge_batch_sleep = batch_sleep;
        self
    }

    pub fn set_timestamp(&mut self, timestamp: &str) -> &mut Self {
        self.timestamp = timestamp.to_string();
        self
    }

    /// Fail unless `path` and `name` are both non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() || self.name.is_empty() {
            err_at!(
                WrongFileName,
                msg: "incorrect file name parameters path={:?} name={:?}",
                self.path, self.name
            )
        } else {
            Ok(())
        }
    }

    /// Default time-to-live for blobs, seconds.
    #[inline]
    pub fn def_blob_ttl(&self) -> i64 {
        self.timeout
    }

    /// Maximum time-to-live for blobs, seconds.
    #[inline]
    pub fn max_blob_ttl(&self) -> i64 {
        cmp::max(self.timeout, self.max_timeout)
    }

    /// Effective part rotation period, seconds.
    #[inline]
    pub fn rotate_period(&self) -> i64 {
        match self.db_rotate_period {
            0 => cmp::max(1, self.timeout / DEF_ROTATE_FRACTION),
            period => period,
        }
    }

    /// Whether reads update the blob's access time.
    pub fn is_change_time_on_read(&self) -> bool {
        let mut on_read = false;
        for token in self.timestamp.split_whitespace() {
            if token.eq_ignore_ascii_case(TS_ONREAD) {
                on_read = true;
            } else {
                warn!(target: "ncache", "unknown timestamp policy token {:?}", token);
            }
        }
        on_read
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
