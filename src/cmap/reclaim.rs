//! Deferred node reclamation.
//!
//! A node unlinked from the tree may still be referenced by a concurrent
//! traversal that read its pointer just before the unlink. Freeing is
//! therefore deferred by [DELETION_DELAY] heartbeat generations: any
//! operation that could dereference a just-unlinked node completes within
//! one heartbeat interval.

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Mutex;

use crate::cmap::{node::Node, DELETION_DELAY, DEL_STORE_CAPACITY};

pub(crate) struct Reclaimer<K, V> {
    gens: [Mutex<Vec<*mut Node<K, V>>>; DELETION_DELAY],
    cur: AtomicUsize,
}

impl<K, V> Reclaimer<K, V> {
    pub fn new() -> Reclaimer<K, V> {
        Reclaimer {
            gens: [(); DELETION_DELAY]
                .map(|_| Mutex::new(Vec::with_capacity(DEL_STORE_CAPACITY))),
            cur: AtomicUsize::new(0),
        }
    }

    /// Park an unlinked node in the current generation.
    pub fn add(&self, node: *mut Node<K, V>) {
        let gen = self.cur.load(SeqCst) % DELETION_DELAY;
        self.gens[gen].lock().unwrap().push(node);
    }

    /// Advance the reclaimer by one generation, synchronously freeing
    /// every node parked [DELETION_DELAY] generations ago. Expected to be
    /// driven by a single heartbeat thread.
    pub fn heartbeat(&self) {
        let next = self.cur.fetch_add(1, SeqCst) + 1;
        let nodes = {
            let mut gen = self.gens[next % DELETION_DELAY].lock().unwrap();
            gen.split_off(0)
        };
        for node in nodes.into_iter() {
            unsafe { drop(Box::from_raw(node)) };
        }
    }

    /// Free every parked node immediately. Caller must guarantee that no
    /// other thread is touching the tree, the same contract as clear.
    pub fn drain(&self) {
        for gen in self.gens.iter() {
            let nodes = gen.lock().unwrap().split_off(0);
            for node in nodes.into_iter() {
                unsafe { drop(Box::from_raw(node)) };
            }
        }
    }
}

impl<K, V> Drop for Reclaimer<K, V> {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
#[path = "reclaim_test.rs"]
mod reclaim_test;
