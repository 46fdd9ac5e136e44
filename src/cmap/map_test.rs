use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::{thread, time};

use crate::cmap::{GetKind, Status, MAX_TREE_HEIGHT};

use super::*;

#[test]
fn test_cmap_write_read_delete() {
    let map: CMap<String, String> = CMap::new("test-cmap-wrd");
    assert_eq!(map.to_name(), "test-cmap-wrd");

    map.put(&"k".to_string(), "hello".to_string());
    assert_eq!(map.get(&"k".to_string()), Some("hello".to_string()));
    assert!(map.erase(&"k".to_string()));
    assert_eq!(map.get(&"k".to_string()), None);
    assert!(!map.erase(&"k".to_string()));
    assert_eq!(map.count_values(), 0);
}

#[test]
fn test_cmap_overwrite() {
    let map: CMap<String, String> = CMap::new("test-cmap-overwrite");

    map.put(&"k".to_string(), "v1".to_string());
    map.put(&"k".to_string(), "v2".to_string());
    assert_eq!(map.get(&"k".to_string()), Some("v2".to_string()));
    assert_eq!(map.count_values(), 1);
}

#[test]
fn test_cmap_passive_lifecycle() {
    let map: CMap<String, String> = CMap::new("test-cmap-passive");
    let key = "k".to_string();

    map.put(&key, "v".to_string());
    assert!(map.passivate(&key));
    // passive slots stay visible to plain reads.
    assert_eq!(map.get(&key), Some("v".to_string()));
    // but erase only removes active slots.
    assert!(!map.erase(&key));
    assert!(map.erase_if_passive(&key));
    assert!(!map.activate(&key));
    assert_eq!(map.get(&key), None);

    // put on a passive slot forces it back to active.
    map.put(&key, "v1".to_string());
    assert!(map.passivate(&key));
    map.put(&key, "v2".to_string());
    assert!(map.erase(&key));
}

#[test]
fn test_cmap_put_or_get() {
    let map: CMap<u32, u64> = CMap::new("test-cmap-put-or-get");

    // absent: put happens.
    let (put, eff) = map.put_or_get(&1, &100, GetKind::OnlyActive);
    assert!(put);
    assert_eq!(eff, 100);

    // active: read side wins.
    let (put, eff) = map.put_or_get(&1, &200, GetKind::OnlyActive);
    assert!(!put);
    assert_eq!(eff, 100);

    // passive + OnlyActive: treated as absent, value overwritten and
    // slot re-activated.
    assert!(map.passivate(&1));
    let (put, eff) = map.put_or_get(&1, &300, GetKind::OnlyActive);
    assert!(put);
    assert_eq!(eff, 300);
    assert!(map.erase(&1));

    // passive + ActiveAndPassive: read side wins, slot re-activated.
    map.put(&2, 400);
    assert!(map.passivate(&2));
    let (put, eff) = map.put_or_get(&2, &500, GetKind::ActiveAndPassive);
    assert!(!put);
    assert_eq!(eff, 400);
    assert!(map.erase(&2));
}

#[test]
fn test_cmap_split_induction() {
    let map: CMap<u32, u64> = CMap::new("test-cmap-split");

    for key in 1..=9_u32 {
        map.put(&key, u64::from(key) * 10);
    }
    assert!(map.count_nodes() >= 3, "{}", map.count_nodes());
    assert_eq!(map.tree_height(), 2);
    assert_eq!(map.count_values(), 9);
    for key in 1..=9_u32 {
        assert_eq!(map.get(&key), Some(u64::from(key) * 10), "key {}", key);
    }
}

#[test]
fn test_cmap_change_and_lower_bound() {
    let map: CMap<u32, u64> = CMap::new("test-cmap-lb");

    assert_eq!(map.get_lower_bound(&0), None);
    assert!(!map.change(&10, 1));

    for key in [10_u32, 20, 30, 40].iter() {
        map.put(key, u64::from(*key));
    }

    assert_eq!(map.get_lower_bound(&5), Some((10, 10)));
    assert_eq!(map.get_lower_bound(&10), Some((10, 10)));
    assert_eq!(map.get_lower_bound(&11), Some((20, 20)));
    assert_eq!(map.get_lower_bound(&40), Some((40, 40)));
    assert_eq!(map.get_lower_bound(&41), None);

    assert!(map.erase(&20));
    assert_eq!(map.get_lower_bound(&11), Some((30, 30)));

    assert!(map.change(&30, 33));
    assert_eq!(map.get(&30), Some(33));
    assert_eq!(map.count_values(), 3);
}

#[test]
fn test_cmap_clear() {
    let map: CMap<u32, u64> = CMap::new("test-cmap-clear");

    for key in 0..100_u32 {
        map.put(&key, u64::from(key));
    }
    assert_eq!(map.count_values(), 100);
    assert!(map.tree_height() > 1);

    map.clear();
    assert_eq!(map.count_values(), 0);
    assert_eq!(map.count_nodes(), 1);
    assert_eq!(map.count_leaf_nodes(), 1);
    assert_eq!(map.tree_height(), 1);
    for key in 0..100_u32 {
        assert_eq!(map.get(&key), None);
    }

    // the map is fully usable after clear.
    map.put(&1, 10);
    assert_eq!(map.get(&1), Some(10));
}

#[test]
fn test_cmap_grow_shrink() {
    let map: CMap<u32, u64> = CMap::new("test-cmap-grow-shrink");

    let n = 10_000_u32;
    for key in 0..n {
        map.put(&key, u64::from(key));
        map.heartbeat();
    }
    assert_eq!(map.count_values(), n as usize);
    assert!(map.tree_height() as usize <= MAX_TREE_HEIGHT);

    for key in 0..n {
        assert_eq!(map.get(&key), Some(u64::from(key)), "key {}", key);
    }

    for key in 0..n {
        assert!(map.erase(&key), "key {}", key);
        map.heartbeat();
    }
    assert_eq!(map.count_values(), 0);
    for key in 0..n {
        assert_eq!(map.get(&key), None, "key {}", key);
    }
}

// single-threaded reference check against a std BTreeMap.
#[test]
fn test_cmap_reference_model() {
    let seed: u64 = random();
    println!("test_cmap_reference_model {}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let map: CMap<u32, u64> = CMap::new("test-cmap-model");
    let mut model: BTreeMap<u32, (u64, Status)> = BTreeMap::new();

    let key_space = 512_u32;
    for i in 0..50_000 {
        let key = rng.gen::<u32>() % key_space;
        match rng.gen::<u8>() % 8 {
            0 | 1 | 2 => {
                let value = rng.gen::<u64>();
                map.put(&key, value);
                model.insert(key, (value, Status::Active));
            }
            3 => {
                let expected = match model.get(&key) {
                    Some((_, Status::Active)) => {
                        model.remove(&key);
                        true
                    }
                    _ => false,
                };
                assert_eq!(map.erase(&key), expected, "erase {}", key);
            }
            4 => {
                let expected = model.contains_key(&key);
                assert_eq!(map.passivate(&key), expected, "passivate {}", key);
                if let Some(entry) = model.get_mut(&key) {
                    entry.1 = Status::Passive;
                }
            }
            5 => {
                let expected = match model.get(&key) {
                    Some((_, Status::Passive)) => {
                        model.remove(&key);
                        true
                    }
                    _ => false,
                };
                assert_eq!(map.erase_if_passive(&key), expected, "erase-passive {}", key);
            }
            6 => {
                let value = rng.gen::<u64>();
                let (put, eff) = map.put_or_get(&key, &value, GetKind::OnlyActive);
                match model.get_mut(&key) {
                    Some(entry) if entry.1 == Status::Active => {
                        assert!(!put, "put_or_get {}", key);
                        assert_eq!(eff, entry.0, "put_or_get {}", key);
                    }
                    Some(entry) => {
                        assert!(put, "put_or_get {}", key);
                        assert_eq!(eff, value);
                        *entry = (value, Status::Active);
                    }
                    None => {
                        assert!(put, "put_or_get {}", key);
                        assert_eq!(eff, value);
                        model.insert(key, (value, Status::Active));
                    }
                }
            }
            7 => {
                let expected = model.get(&key).map(|(value, _)| *value);
                assert_eq!(map.get(&key), expected, "get {}", key);
            }
            _ => unreachable!(),
        }
        if i % 1000 == 0 {
            map.heartbeat();
            assert_eq!(map.count_values(), model.len());
            assert!(map.tree_height() as usize <= MAX_TREE_HEIGHT);
        }
    }

    for (key, (value, _)) in model.iter() {
        assert_eq!(map.get(key), Some(*value), "final {}", key);
    }
    assert_eq!(map.count_values(), model.len());
}

// every thread owns a slice of the key space and checks sequential
// semantics on it, while neighbouring threads keep splitting and
// unlinking the same nodes underneath.
#[test]
fn test_cmap_concurrent() {
    let seed: u64 = random();
    println!("test_cmap_concurrent {}", seed);

    let n_threads = 8_u32;
    let n_ops = 20_000;
    let key_space = 64_u32;

    let map: Arc<CMap<u32, u64>> = Arc::new(CMap::new("test-cmap-concurrent"));
    let done = Arc::new(AtomicBool::new(false));

    let ticker = {
        let (map, done) = (Arc::clone(&map), Arc::clone(&done));
        thread::spawn(move || {
            while !done.load(SeqCst) {
                map.heartbeat();
                thread::sleep(time::Duration::from_millis(1));
            }
        })
    };

    let mut handles = vec![];
    for id in 0..n_threads {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed + u64::from(id));
            let mut model: BTreeMap<u32, u64> = BTreeMap::new();
            for _i in 0..n_ops {
                let key = rng.gen::<u32>() % key_space;
                if key % n_threads == id {
                    // own key: full sequential checking.
                    match rng.gen::<u8>() % 4 {
                        0 | 1 => {
                            let value = rng.gen::<u64>();
                            map.put(&key, value);
                            model.insert(key, value);
                        }
                        2 => {
                            let expected = model.remove(&key).is_some();
                            assert_eq!(map.erase(&key), expected, "erase {}", key);
                        }
                        3 => {
                            let expected = model.get(&key).copied();
                            assert_eq!(map.get(&key), expected, "get {}", key);
                        }
                        _ => unreachable!(),
                    }
                } else {
                    // neighbour's key: exercise the read path only.
                    map.get(&key);
                }
            }
            model
        }));
    }

    let mut n_live = 0;
    for handle in handles.into_iter() {
        let model = handle.join().unwrap();
        for (key, value) in model.iter() {
            assert_eq!(map.get(key), Some(*value), "final {}", key);
        }
        n_live += model.len();
    }
    done.store(true, SeqCst);
    ticker.join().unwrap();

    assert_eq!(map.count_values(), n_live);
    assert!(map.tree_height() as usize <= MAX_TREE_HEIGHT);
}
