use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

use crate::cmap::node::{Node, Payload};
use crate::cmap::{LEAF_LEVEL, DELETION_DELAY};

use super::*;

struct DropTick(Arc<AtomicUsize>);

impl Drop for DropTick {
    fn drop(&mut self) {
        self.0.fetch_add(1, SeqCst);
    }
}

fn parked_node(drops: &Arc<AtomicUsize>) -> *mut Node<u32, DropTick> {
    let node = Node::<u32, DropTick>::alloc(None, LEAF_LEVEL);
    unsafe {
        (*node).as_inner_mut().slots[0].payload = Payload::Value(DropTick(Arc::clone(drops)));
    }
    node
}

#[test]
fn test_reclaim_hysteresis() {
    let drops = Arc::new(AtomicUsize::new(0));
    let reclaim: Reclaimer<u32, DropTick> = Reclaimer::new();

    reclaim.add(parked_node(&drops));

    // a node survives DELETION_DELAY - 1 heartbeats past its unlink.
    for _i in 0..DELETION_DELAY - 1 {
        reclaim.heartbeat();
        assert_eq!(drops.load(SeqCst), 0);
    }
    reclaim.heartbeat();
    assert_eq!(drops.load(SeqCst), 1);
}

#[test]
fn test_reclaim_generations() {
    let drops = Arc::new(AtomicUsize::new(0));
    let reclaim: Reclaimer<u32, DropTick> = Reclaimer::new();

    // one node parked per generation; they free one per heartbeat, in
    // parking order, once the pipeline is full.
    for _i in 0..DELETION_DELAY {
        reclaim.add(parked_node(&drops));
        reclaim.heartbeat();
    }
    assert_eq!(drops.load(SeqCst), 1);
    reclaim.heartbeat();
    assert_eq!(drops.load(SeqCst), 2);
    reclaim.heartbeat();
    assert_eq!(drops.load(SeqCst), 3);
}

#[test]
fn test_reclaim_drain() {
    let drops = Arc::new(AtomicUsize::new(0));
    let reclaim: Reclaimer<u32, DropTick> = Reclaimer::new();

    for _i in 0..10 {
        reclaim.add(parked_node(&drops));
    }
    reclaim.drain();
    assert_eq!(drops.load(SeqCst), 10);

    // drop after drain is a no-op.
    std::mem::drop(reclaim);
    assert_eq!(drops.load(SeqCst), 10);
}
