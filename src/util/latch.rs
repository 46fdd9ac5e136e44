//! Module `latch` implement a reader/writer latch-and-spin primitive.
//!
//! Tree traversals take and release a latch at every step, holding each
//! one only for the few instructions needed to inspect or mutate a node.
//! For such short critical sections, parking the thread costs more than
//! the wait itself, so acquisition spins.
//!
//! Unlike a scoped guard, [Latch] exposes explicit lock/unlock pairs.
//! Hand-over-hand traversal acquires the next node's latch before
//! releasing the current one, and the two calls do not nest lexically.
//! Callers are responsible for pairing every `lock_*` with the matching
//! `unlock_*`.

use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
use std::{fmt, hint, result};

/// Kind of latch to acquire on a node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LockKind {
    Read,
    Write,
}

/// Latch implements the latch-and-spin mechanism for non-blocking
/// reader/writer exclusion.
///
/// State lives in a single AtomicU32:
/// * reader-count, bits [0-29].
/// * latch flag, bit 30, set by a writer to stop new readers and writers.
/// * lock flag, bit 31, set once all readers have drained.
pub struct Latch {
    latchlock: AtomicU32,
    read_locks: AtomicU32,
    write_locks: AtomicU32,
    conflicts: AtomicU32,
}

impl Default for Latch {
    fn default() -> Latch {
        Latch::new()
    }
}

impl Latch {
    const LATCH_FLAG: u32 = 0x4000_0000;
    const LOCK_FLAG: u32 = 0x8000_0000;
    const LATCH_LOCK_FLAG: u32 = 0xC000_0000;
    const READERS_FLAG: u32 = 0x3FFF_FFFF;

    pub fn new() -> Latch {
        Latch {
            latchlock: AtomicU32::new(0),
            read_locks: AtomicU32::new(0),
            write_locks: AtomicU32::new(0),
            conflicts: AtomicU32::new(0),
        }
    }

    /// Acquire latch for read permission. Shall block until granted.
    pub fn lock_read(&self) {
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::LATCH_LOCK_FLAG) == 0 {
                // no writer has latched this node
                if self
                    .latchlock
                    .compare_exchange(old, old + 1, SeqCst, SeqCst)
                    .is_ok()
                {
                    if cfg!(feature = "debug") {
                        self.read_locks.fetch_add(1, SeqCst);
                    }
                    break;
                }
            }
            if cfg!(feature = "debug") {
                self.conflicts.fetch_add(1, SeqCst);
            }
            hint::spin_loop();
        }
    }

    /// Release read permission acquired via [Latch::lock_read].
    pub fn unlock_read(&self) {
        self.latchlock.fetch_sub(1, SeqCst);
    }

    /// Acquire latch for write permission. Shall block until all
    /// readers have drained.
    pub fn lock_write(&self) {
        // latch the door, stopping new readers and writers
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::LATCH_FLAG) == 0 {
                if (old & Self::LOCK_FLAG) != 0 {
                    panic!(concat!(
                        "if latch is flipped-off, lock can't be flipped-on! ",
                        "call the programmer"
                    ));
                }
                let new = old | Self::LATCH_FLAG;
                if self
                    .latchlock
                    .compare_exchange(old, new, SeqCst, SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
            if cfg!(feature = "debug") {
                self.conflicts.fetch_add(1, SeqCst);
            }
            hint::spin_loop();
        }
        // wait for readers already inside, then lock
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::READERS_FLAG) == 0 {
                let new = old | Self::LOCK_FLAG;
                if self
                    .latchlock
                    .compare_exchange(old, new, SeqCst, SeqCst)
                    .is_ok()
                {
                    if cfg!(feature = "debug") {
                        self.write_locks.fetch_add(1, SeqCst);
                    }
                    break;
                }
                panic!(concat!(
                    "latch is acquired, ZERO readers, but unable to lock! ",
                    "call the programmer"
                ));
            }
            if cfg!(feature = "debug") {
                self.conflicts.fetch_add(1, SeqCst);
            }
            hint::spin_loop();
        }
    }

    /// Release write permission acquired via [Latch::lock_write].
    pub fn unlock_write(&self) {
        let old = self.latchlock.load(SeqCst);
        if (old & Self::READERS_FLAG) > 0 {
            panic!(concat!(
                "can't have active readers, when lock is held! ",
                "call the programmer"
            ));
        }
        if self
            .latchlock
            .compare_exchange(old, 0, SeqCst, SeqCst)
            .is_err()
        {
            panic!(concat!(
                "can't have readers/writers to modify when locked! ",
                "call the programmer"
            ))
        }
    }

    /// Acquire latch for `kind` permission.
    #[inline]
    pub fn lock(&self, kind: LockKind) {
        match kind {
            LockKind::Read => self.lock_read(),
            LockKind::Write => self.lock_write(),
        }
    }

    /// Release `kind` permission.
    #[inline]
    pub fn unlock(&self, kind: LockKind) {
        match kind {
            LockKind::Read => self.unlock_read(),
            LockKind::Write => self.unlock_write(),
        }
    }

    pub fn to_stats(&self) -> Stats {
        Stats {
            latchlock: self.latchlock.load(SeqCst),
            read_locks: self.read_locks.load(SeqCst) as usize,
            write_locks: self.write_locks.load(SeqCst) as usize,
            conflicts: self.conflicts.load(SeqCst) as usize,
        }
    }
}

/// Statistic type, to capture [Latch] metrics.
///
/// Count of read-locks, write-locks and conflicts are gathered only when
/// the `debug` feature is enabled.
#[derive(Default)]
pub struct Stats {
    pub latchlock: u32,
    pub read_locks: usize,
    pub write_locks: usize,
    pub conflicts: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> result::Result<(), fmt::Error> {
        write!(
            f,
            concat!(
                "{{ latchlock = {:X}, read_locks = {}, ",
                "write_locks = {}, conflicts = {} }}",
            ),
            self.latchlock, self.read_locks, self.write_locks, self.conflicts,
        )
    }
}

#[cfg(test)]
#[path = "latch_test.rs"]
mod latch_test;
