use std::{env, fs, path};

use crate::storage::entry::{BlobInfo, BlobKey};

use super::*;

fn scratch_dir(name: &str) -> path::PathBuf {
    let mut dir = env::temp_dir();
    dir.push(format!("rust.ncache.part_test.{}.{}", name, std::process::id()));
    fs::remove_dir_all(&dir).ok();
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn info_with_dead_time(dead_time: i64) -> BlobInfo {
    BlobInfo {
        ttl: 100,
        create_time: 1000,
        access_time: 1000,
        dead_time,
        size: 3,
        ..BlobInfo::default()
    }
}

#[test]
fn test_part_meta_roundtrip() {
    let dir = scratch_dir("meta");
    let part = Part::create(&dir, "nctest", 1, 1, 1000).unwrap();
    assert_eq!(part.part_id(), 1);
    assert_eq!(part.min_blob_id(), 1);
    assert_eq!(part.created(), 1000);
    assert_eq!(part.max_blob_id(), 0);
    assert!(part.is_empty(0));

    part.add_blob(2, BlobKey::new("k1", "", 0)).unwrap();
    part.add_blob(3, BlobKey::new("k2", "", 0)).unwrap();
    // pending blobs hold the part alive even with nothing finalized.
    assert!(!part.is_empty(0));

    part.write_info(2, info_with_dead_time(5000)).unwrap();
    part.write_info(3, info_with_dead_time(6000)).unwrap();
    assert_eq!(part.max_blob_id(), 3);

    let (keys, info) = part.read_info(2).unwrap();
    assert_eq!(keys, BlobKey::new("k1", "", 0));
    assert_eq!(info.unwrap().dead_time, 5000);

    assert_eq!(part.find_by_keys(&BlobKey::new("k2", "", 0), 0), Some(3));
    assert_eq!(part.find_by_keys(&BlobKey::new("k2", "", 0), 7000), None);
    assert!(part.is_family_exists("k1", "", 0));
    assert!(!part.is_family_exists("k3", "", 0));

    // reload from disk and observe the same state.
    let row = part.to_part_row();
    drop(part);
    let part = Part::load(&row).unwrap();
    assert_eq!(part.max_blob_id(), 3);
    assert_eq!(part.find_by_keys(&BlobKey::new("k1", "", 0), 0), Some(2));
    let (_, info) = part.read_info(3).unwrap();
    assert_eq!(info.unwrap().dead_time, 6000);
    assert!(!part.is_empty(6000));
    assert!(part.is_empty(6001));

    part.purge();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_part_dead_index() {
    let dir = scratch_dir("dead");
    let part = Part::create(&dir, "nctest", 1, 1, 1000).unwrap();

    for id in 1..=10_i64 {
        part.add_blob(id, BlobKey::new(&format!("k{}", id), "", 0)).unwrap();
        part.write_info(id, info_with_dead_time(1000 + id)).unwrap();
    }

    // range query pages in (dead_time, id) order.
    let batch = part.dead_range(None, 1003, 1008, 3);
    assert_eq!(batch, vec![(1003, 3), (1004, 4), (1005, 5)]);
    let batch = part.dead_range(Some((1005, 5)), 1003, 1008, 10);
    assert_eq!(batch, vec![(1006, 6), (1007, 7)]);

    // a dead-time update re-indexes the blob.
    part.write_info(4, info_with_dead_time(2000)).unwrap();
    let batch = part.dead_range(None, 1003, 1008, 10);
    assert_eq!(batch, vec![(1003, 3), (1005, 5), (1006, 6), (1007, 7)]);

    // caching batches page by id and skip the dead.
    let batch = part.blob_batch(0, 1006, 4);
    let ids: Vec<i64> = batch.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![4, 6, 7, 8]);
    let batch = part.blob_batch(8, 1006, 4);
    let ids: Vec<i64> = batch.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![9, 10]);

    part.purge();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_part_chunks() {
    let dir = scratch_dir("chunks");
    let part = Part::create(&dir, "nctest", 1, 1, 1000).unwrap();
    assert_eq!(part.data_size(), 0);

    part.put_chunk(5, 0, b"hello").unwrap();
    part.put_chunk(5, 1, b"world").unwrap();
    part.put_chunk(6, 0, b"other").unwrap();
    assert!(part.data_size() > 0);
    assert_eq!(part.chunk_count(5), 2);

    assert_eq!(part.read_chunk(5, 0).unwrap(), b"hello".to_vec());
    assert_eq!(part.read_chunk(5, 1).unwrap(), b"world".to_vec());
    assert_eq!(part.read_chunk(6, 0).unwrap(), b"other".to_vec());
    assert!(part.read_chunk(5, 2).is_err());

    // a rewrite replaces chunks in place and truncation drops the tail.
    part.put_chunk(5, 0, b"HELLO").unwrap();
    part.trunc_chunks(5, 1).unwrap();
    assert_eq!(part.chunk_count(5), 1);
    assert_eq!(part.read_chunk(5, 0).unwrap(), b"HELLO".to_vec());
    assert!(part.read_chunk(5, 1).is_err());

    // chunk state survives a reload.
    let row = part.to_part_row();
    drop(part);
    let part = Part::load(&row).unwrap();
    assert_eq!(part.chunk_count(5), 1);
    assert_eq!(part.read_chunk(5, 0).unwrap(), b"HELLO".to_vec());
    assert_eq!(part.read_chunk(6, 0).unwrap(), b"other".to_vec());

    part.purge();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_part_torn_tail() {
    let dir = scratch_dir("torn");
    let part = Part::create(&dir, "nctest", 1, 1, 1000).unwrap();
    part.add_blob(2, BlobKey::new("k1", "", 0)).unwrap();
    part.write_info(2, info_with_dead_time(5000)).unwrap();
    let row = part.to_part_row();
    drop(part);

    // simulate a crash mid-append: garbage at the end of the meta file.
    let mut opts = fs::OpenOptions::new();
    use std::io::Write;
    let mut fd = opts.append(true).open(&row.met).unwrap();
    fd.write_all(&[0xde, 0xad, 0xbe]).unwrap();
    drop(fd);

    let part = Part::load(&row).unwrap();
    assert_eq!(part.find_by_keys(&BlobKey::new("k1", "", 0), 0), Some(2));

    // the tail was truncated; appends keep working and reload again.
    part.write_info(2, info_with_dead_time(9000)).unwrap();
    let row = part.to_part_row();
    drop(part);
    let part = Part::load(&row).unwrap();
    let (_, info) = part.read_info(2).unwrap();
    assert_eq!(info.unwrap().dead_time, 9000);

    part.purge();
    fs::remove_dir_all(&dir).ok();
}
