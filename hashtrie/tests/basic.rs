mod common;

use hashtrie::{
    Blake3KeyHasher, Error, IndexStats, LeBytesHasher, ReconstructKey, SectorIndex, SECTOR_SIZE,
};
use std::sync::Arc;

fn bytes_index(hash_length: usize) -> (hashtrie::HashTrieIndex<[u8]>, Arc<hashtrie::MemChannel>) {
    common::in_memory::<[u8]>(
        common::opts("unused"),
        Arc::new(Blake3KeyHasher::new(hash_length).unwrap()),
    )
}

fn u16_index(o: hashtrie::Options) -> hashtrie::HashTrieIndex<u16> {
    common::in_memory::<u16>(o, Arc::new(LeBytesHasher::<u16>::new())).0
}

#[test]
fn round_trip_and_absence() {
    let dir = tempfile::tempdir().unwrap();
    let index = common::open_bytes(dir.path(), 4);

    for id in 0..500 {
        index.set(&common::key(id), id as i64 * 10).unwrap();
    }
    for id in 0..500 {
        assert_eq!(index.get(&common::key(id)).unwrap(), Some(id as i64 * 10));
        assert!(index.contains(&common::key(id)).unwrap());
    }
    for id in 500..600 {
        assert_eq!(index.get(&common::key(id)).unwrap(), None);
        assert!(!index.contains(&common::key(id)).unwrap());
    }
    assert_eq!(index.len().unwrap(), 500);

    // overwrite.
    index.set(&common::key(7), 12345).unwrap();
    assert_eq!(index.get(&common::key(7)).unwrap(), Some(12345));
    assert_eq!(index.len().unwrap(), 500);
}

#[test]
fn remove_keeps_nodes() {
    let (index, _) = bytes_index(3);
    index.set(b"alpha", 5).unwrap();
    let before = index.stats().unwrap();

    assert_eq!(index.remove(b"alpha").unwrap(), Some(5));
    assert_eq!(index.get(b"alpha").unwrap(), None);
    assert!(!index.contains(b"alpha").unwrap());
    assert_eq!(index.remove(b"alpha").unwrap(), None);
    assert_eq!(index.remove(b"never written").unwrap(), None);

    let after = index.stats().unwrap();
    assert_eq!(after.entries, 0);
    assert_eq!(after.nodes, before.nodes);
    assert_eq!(after.allocated_sectors, before.allocated_sectors);
    assert_eq!(after.file_len, before.file_len);
}

#[test]
fn path_depth_equals_hash_length() {
    for hash_length in [1, 2, 5] {
        let (index, _) = bytes_index(hash_length);
        // with a single byte, the root alone is the leaf and the path always exists.
        let expected = (hash_length == 1).then(|| vec![SectorIndex::ROOT]);
        assert_eq!(index.lookup_path(b"key").unwrap(), expected);

        index.set(b"key", 1).unwrap();
        let path = index.lookup_path(b"key").unwrap().unwrap();
        assert_eq!(path.len(), hash_length);
        assert_eq!(path[0], SectorIndex::ROOT);

        let mut unique = path.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), hash_length);

        assert_eq!(index.stats().unwrap().nodes, hash_length as u64);
    }
}

#[test]
fn repeated_set_is_idempotent_on_disk() {
    let (index, channel) = bytes_index(3);
    index.set(b"alpha", 7).unwrap();
    let once = channel.contents();
    let writes = index.metrics().snapshot().unwrap().sector_writes;

    index.set(b"alpha", 7).unwrap();
    assert_eq!(channel.contents(), once);
    assert_eq!(index.metrics().snapshot().unwrap().sector_writes, writes);

    let (fresh, fresh_channel) = bytes_index(3);
    fresh.set(b"alpha", 7).unwrap();
    assert_eq!(fresh_channel.contents(), once);
}

#[test]
fn fresh_index_is_one_empty_sector() {
    let (index, channel) = bytes_index(2);
    assert_eq!(channel.contents().len(), SECTOR_SIZE);
    assert!(channel.contents().iter().all(|b| *b == 0xff));
    assert!(index.is_empty().unwrap());
    assert_eq!(
        index.stats().unwrap(),
        IndexStats {
            hash_length: 2,
            nodes: 1,
            allocated_sectors: 1,
            entries: 0,
            file_len: SECTOR_SIZE as u64,
        }
    );
}

#[test]
fn sentinel_value_is_rejected() {
    let (index, _) = bytes_index(3);
    assert!(matches!(
        index.set(b"k", -1),
        Err(Error::ReservedValue(-1))
    ));
    assert_eq!(index.get(b"k").unwrap(), None);
    // nothing was allocated for the rejected write.
    assert_eq!(index.stats().unwrap().allocated_sectors, 1);

    index.set(b"k", 1).unwrap();
    assert!(matches!(
        index.change(b"k", |_| -1),
        Err(Error::ReservedValue(-1))
    ));
    assert_eq!(index.get(b"k").unwrap(), Some(1));
}

#[test]
fn conditional_changes() {
    let (index, _) = bytes_index(3);
    let k = b"counter";

    assert!(!index.change_if_contains(k, |v| v + 1).unwrap());
    assert!(!index.run_if_contains(k, |_| unreachable!()).unwrap());

    assert_eq!(index.change(k, |v| v.map_or(1, |v| v + 1)).unwrap(), 1);
    assert_eq!(index.change(k, |v| v.map_or(1, |v| v + 1)).unwrap(), 2);
    assert!(index.change_if_contains(k, |v| v * 10).unwrap());

    let mut seen = None;
    assert!(index.run_if_contains(k, |v| seen = Some(v)).unwrap());
    assert_eq!(seen, Some(20));

    // the path exists now, but the slot is empty.
    index.remove(k).unwrap();
    assert!(!index.change_if_contains(k, |v| v + 1).unwrap());
    assert_eq!(index.get(k).unwrap(), None);
}

#[test]
fn entries_are_walked_in_hash_order() {
    let index = u16_index(common::opts("unused"));
    for key in [0x0102u16, 0x0201, 0x0001, 0xffff] {
        index.set(&key, key as i64).unwrap();
    }

    let hasher = LeBytesHasher::<u16>::new();
    let mut entries = Vec::new();
    index
        .for_each_entry(|hash, value| entries.push((hasher.reconstruct(hash), value)))
        .unwrap();

    // hashes are the little-endian bytes: [01 00] < [01 02] < [02 01] < [ff ff].
    assert_eq!(
        entries,
        vec![
            (0x0001, 0x0001),
            (0x0201, 0x0201),
            (0x0102, 0x0102),
            (0xffff, 0xffff)
        ]
    );

    assert_eq!(
        index.stats().unwrap(),
        IndexStats {
            hash_length: 2,
            nodes: 4,
            allocated_sectors: 4,
            entries: 4,
            file_len: 4 * SECTOR_SIZE as u64,
        }
    );
}

#[test]
fn capacity_is_enforced() {
    let mut o = common::opts("unused");
    o.max_sectors(3);
    let index = u16_index(o);

    index.set(&0x0000, 1).unwrap();
    index.set(&0x0001, 2).unwrap();
    assert!(matches!(
        index.set(&0x0002, 3),
        Err(Error::Capacity { limit: 3 })
    ));

    // keys below existing nodes still fit.
    index.set(&0x0100, 4).unwrap();
    assert_eq!(index.get(&0x0000).unwrap(), Some(1));
    assert_eq!(index.get(&0x0100).unwrap(), Some(4));
    assert_eq!(index.get(&0x0002).unwrap(), None);
}

#[test]
fn works_without_a_node_cache() {
    let mut o = common::opts("unused");
    o.node_cache_size(0);
    let index = u16_index(o);

    for key in 0..2000u16 {
        index.set(&key, key as i64 + 1).unwrap();
    }
    for key in 0..2000u16 {
        assert_eq!(index.get(&key).unwrap(), Some(key as i64 + 1));
    }

    let snapshot = index.metrics().snapshot().unwrap();
    assert!(snapshot.node_cache_misses > 0);
    // the root plus one node per low byte.
    assert_eq!(snapshot.sector_allocations, 257);
}

#[test]
fn clear_resets_to_an_empty_root() {
    let (index, channel) = bytes_index(3);
    for id in 0..50 {
        index.set(&common::key(id), id as i64).unwrap();
    }
    assert!(channel.contents().len() > SECTOR_SIZE);

    index.clear().unwrap();
    assert_eq!(channel.contents().len(), SECTOR_SIZE);
    assert!(index.is_empty().unwrap());
    assert_eq!(index.get(&common::key(3)).unwrap(), None);
    assert_eq!(index.stats().unwrap().allocated_sectors, 1);

    index.set(&common::key(3), 33).unwrap();
    assert_eq!(index.get(&common::key(3)).unwrap(), Some(33));
    assert_eq!(index.stats().unwrap().nodes, 3);
}
