//! Ncache provide the core building blocks for a multi-threaded,
//! high-throughput binary blob cache.
//!
//! Two sub-systems make up the core. [cmap] implement a concurrent,
//! latched B+ tree that indexes live blobs by key, designed so that no
//! operation blocks a reader of the index and no reader pins a node long
//! enough to stop reclamation from making progress. [storage] implement a
//! sharded, rotating blob store that persists blob metadata and chunk data
//! into a sequence of append-oriented database parts, reconstructs its
//! in-memory index from disk on startup and reclaims expired data by
//! whole-file deletion instead of in-place compaction.
//!
//! Synchronisation is built from latches, reader/writer locks, atomics and
//! condition yielding. There is no async runtime anywhere in the core.

use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use crate::Error;
/// err_at!(ReadOnlyAccess, msg: "storage {} is read-only", name)
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, fs::read(file_path))
/// ```
///
/// ```ignore
/// use crate::Error;
/// err_at!(IOError, fs::read(file_path), "reading {:?}", file_path)
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

pub mod cmap;
pub mod storage;
pub mod util;

pub use crate::cmap::CMap;
pub use crate::storage::{Config, Storage};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the error
/// location, and a message describing the error.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    Fatal(String, String),
    FailConvert(String, String),
    FailCbor(String, String),
    IOError(String, String),
    IPCFail(String, String),
    ThreadFail(String, String),
    InvalidFile(String, String),
    /// Write operation attempted on read-only storage.
    ReadOnlyAccess(String, String),
    /// Configured path or storage name is empty.
    WrongFileName(String, String),
    /// Persisted metadata for a blob is inconsistent.
    CorruptedDB(String, String),
    /// Writer exceeded the configured maximum blob size.
    TooBigBlob(String, String),
    /// Reinitialize called while the storage is not exclusively blocked.
    WrongBlock(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, msg) => write!(f, "{} Fatal: {}", p, msg),
            FailConvert(p, msg) => write!(f, "{} FailConvert: {}", p, msg),
            FailCbor(p, msg) => write!(f, "{} FailCbor: {}", p, msg),
            IOError(p, msg) => write!(f, "{} IOError: {}", p, msg),
            IPCFail(p, msg) => write!(f, "{} IPCFail: {}", p, msg),
            ThreadFail(p, msg) => write!(f, "{} ThreadFail: {}", p, msg),
            InvalidFile(p, msg) => write!(f, "{} InvalidFile: {}", p, msg),
            ReadOnlyAccess(p, msg) => write!(f, "{} ReadOnlyAccess: {}", p, msg),
            WrongFileName(p, msg) => write!(f, "{} WrongFileName: {}", p, msg),
            CorruptedDB(p, msg) => write!(f, "{} CorruptedDB: {}", p, msg),
            TooBigBlob(p, msg) => write!(f, "{} TooBigBlob: {}", p, msg),
            WrongBlock(p, msg) => write!(f, "{} WrongBlock: {}", p, msg),
        }
    }
}

impl error::Error for Error {}
