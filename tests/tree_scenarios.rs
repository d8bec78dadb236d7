use std::sync::Arc;

use rand::prelude::*;
use tempfile::TempDir;

use bramble::buffer::BufferPool;
use bramble::recovery::{AtomicOperationsManager, WalManager};
use bramble::storage::DiskManager;
use bramble::{
    BrambleError, BufferPoolConfig, IndexKey, KeyItem, MultiValueTree, Rid, TreeConfig,
    TreeCursor, TreeOptions,
};

struct Fixture {
    _dir: TempDir,
    pool: Arc<BufferPool>,
    atomic_ops: Arc<AtomicOperationsManager>,
}

fn fixture(pool_size: usize) -> Fixture {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(DiskManager::try_new(dir.path()).unwrap());
    let pool = Arc::new(BufferPool::new(BufferPoolConfig { pool_size }, disk));
    let wal = Arc::new(WalManager::open(dir.path().join("tree.wal")).unwrap());
    let atomic_ops = Arc::new(AtomicOperationsManager::new(wal, Arc::clone(&pool)));
    Fixture {
        _dir: dir,
        pool,
        atomic_ops,
    }
}

fn create_tree(fixture: &Fixture, name: &str, options: TreeOptions) -> MultiValueTree {
    MultiValueTree::create(
        name,
        Arc::clone(&fixture.pool),
        Arc::clone(&fixture.atomic_ops),
        TreeConfig::default(),
        options,
    )
    .unwrap()
}

fn drain(cursor: &mut TreeCursor<'_>, prefetch: usize) -> Vec<(IndexKey, Rid)> {
    let mut out = Vec::new();
    while let Some(entry) = cursor.next(prefetch).unwrap() {
        out.push(entry);
    }
    out
}

#[test]
fn five_keys_smoke() {
    let fixture = fixture(64);
    let tree = create_tree(&fixture, "smoke", TreeOptions::default());

    let rids: Vec<Rid> = (1..=5).map(|i| Rid::new(1, i)).collect();
    for (i, value) in [10i64, 20, 30, 40, 50].iter().enumerate() {
        tree.put(Some(&IndexKey::int(*value)), rids[i]).unwrap();
    }

    assert_eq!(tree.size().unwrap(), 5);
    assert_eq!(tree.first_key().unwrap(), Some(IndexKey::int(10)));
    assert_eq!(tree.last_key().unwrap(), Some(IndexKey::int(50)));

    let mut cursor = tree
        .iterate_entries_between(&IndexKey::int(10), true, &IndexKey::int(40), false, true)
        .unwrap();
    let entries = drain(&mut cursor, 100);
    assert_eq!(
        entries,
        vec![
            (IndexKey::int(10), rids[0]),
            (IndexKey::int(20), rids[1]),
            (IndexKey::int(30), rids[2]),
        ]
    );
}

#[test]
fn multiset_preserves_order_and_multiplicity() {
    let fixture = fixture(64);
    let tree = create_tree(&fixture, "multiset", TreeOptions::default());
    let key = IndexKey::str("A");
    let (ra1, ra2, ra3) = (Rid::new(1, 1), Rid::new(1, 2), Rid::new(1, 3));

    tree.put(Some(&key), ra1).unwrap();
    tree.put(Some(&key), ra2).unwrap();
    tree.put(Some(&key), ra3).unwrap();
    assert_eq!(tree.get(Some(&key)).unwrap(), vec![ra1, ra2, ra3]);

    assert!(tree.remove(Some(&key), ra2).unwrap());
    assert_eq!(tree.get(Some(&key)).unwrap(), vec![ra1, ra3]);
    assert_eq!(tree.size().unwrap(), 2);

    // Removing an absent pair is a no-op and reports false.
    assert!(!tree.remove(Some(&key), ra2).unwrap());
    assert_eq!(tree.size().unwrap(), 2);

    // The same pair put twice is stored twice.
    tree.put(Some(&key), ra1).unwrap();
    assert_eq!(tree.get(Some(&key)).unwrap(), vec![ra1, ra3, ra1]);
}

#[test]
fn ten_thousand_keys_scan_both_ways() {
    let fixture = fixture(256);
    let tree = create_tree(&fixture, "bulk", TreeOptions::default());
    const N: i64 = 10_000;

    for value in 0..N {
        tree.put(Some(&IndexKey::int(value)), Rid::new(0, value as u64))
            .unwrap();
    }
    assert_eq!(tree.size().unwrap(), N as u64);
    assert_eq!(tree.last_key().unwrap(), Some(IndexKey::int(N - 1)));

    let mut backward = tree
        .iterate_entries_between(&IndexKey::int(0), true, &IndexKey::int(N - 1), true, false)
        .unwrap();
    let mut expected = N - 1;
    while let Some((key, rid)) = backward.next(500).unwrap() {
        assert_eq!(key, IndexKey::int(expected));
        assert_eq!(rid, Rid::new(0, expected as u64));
        expected -= 1;
    }
    assert_eq!(expected, -1);
}

#[test]
fn null_key_multiset() {
    let fixture = fixture(64);
    let tree = create_tree(
        &fixture,
        "nulls",
        TreeOptions {
            null_keys_supported: true,
            ..Default::default()
        },
    );
    let (r1, r2) = (Rid::new(4, 1), Rid::new(4, 2));

    tree.put(None, r1).unwrap();
    tree.put(None, r2).unwrap();
    assert_eq!(tree.get(None).unwrap(), vec![r1, r2]);

    assert!(tree.remove(None, r1).unwrap());
    assert_eq!(tree.size().unwrap(), 1);
    assert_eq!(tree.get(None).unwrap(), vec![r2]);
}

#[test]
fn too_big_key_fails_without_side_effects() {
    let fixture = fixture(64);
    let tree = create_tree(&fixture, "limits", TreeOptions::default());
    tree.put(Some(&IndexKey::int(1)), Rid::new(0, 1)).unwrap();

    let huge = IndexKey::str("k".repeat(2048));
    let err = tree.put(Some(&huge), Rid::new(0, 2)).unwrap_err();
    let BrambleError::Tree { source, .. } = err else {
        panic!("expected a tree-wrapped error");
    };
    assert!(matches!(*source, BrambleError::KeyTooBig { .. }));
    assert_eq!(tree.size().unwrap(), 1);
}

#[test]
fn root_split_keeps_traversal_order() {
    let fixture = fixture(256);
    let tree = create_tree(&fixture, "splits", TreeOptions::default());
    const N: i64 = 3000;

    let mut values: Vec<i64> = (0..N).collect();
    values.shuffle(&mut rand::rng());
    for value in &values {
        tree.put(Some(&IndexKey::int(*value)), Rid::new(0, *value as u64))
            .unwrap();
    }
    assert_eq!(tree.size().unwrap(), N as u64);

    // 3000 distinct keys span dozens of 4 KiB pages, so the root split at
    // least once; the ordered traversal proves the structure held up.
    let mut keys = tree.key_cursor().unwrap();
    let mut expected = 0i64;
    while let Some(key) = keys.next(500).unwrap() {
        assert_eq!(key, IndexKey::int(expected));
        expected += 1;
    }
    assert_eq!(expected, N);
}

#[test]
fn size_tracks_successful_mutations() {
    let fixture = fixture(128);
    let tree = create_tree(&fixture, "accounting", TreeOptions::default());
    let mut rng = rand::rng();
    let mut live: Vec<(i64, Rid)> = Vec::new();
    let mut expected_size = 0i64;

    for step in 0..2000 {
        if live.is_empty() || rng.random_range(0..100) < 60 {
            let key = rng.random_range(0..500i64);
            let rid = Rid::new(7, step as u64);
            tree.put(Some(&IndexKey::int(key)), rid).unwrap();
            live.push((key, rid));
            expected_size += 1;
        } else {
            let pick = rng.random_range(0..live.len());
            let (key, rid) = live.swap_remove(pick);
            assert!(tree.remove(Some(&IndexKey::int(key)), rid).unwrap());
            expected_size -= 1;
        }
    }
    assert_eq!(tree.size().unwrap(), expected_size as u64);

    // Absent removals never change the counter.
    assert!(!tree
        .remove(Some(&IndexKey::int(10_000)), Rid::new(0, 0))
        .unwrap());
    assert_eq!(tree.size().unwrap(), expected_size as u64);
}

#[test]
fn forward_scan_is_strictly_ordered_over_sibling_chain() {
    let fixture = fixture(128);
    let tree = create_tree(&fixture, "ordered", TreeOptions::default());
    let mut values: Vec<i64> = (0..4000).collect();
    values.shuffle(&mut rand::rng());
    for value in &values {
        tree.put(Some(&IndexKey::int(*value)), Rid::new(0, *value as u64))
            .unwrap();
    }

    let mut forward = tree
        .iterate_entries_major(&IndexKey::int(i64::MIN), true, true)
        .unwrap();
    let mut previous: Option<IndexKey> = None;
    let mut count = 0usize;
    while let Some((key, _)) = forward.next(333).unwrap() {
        if let Some(previous) = &previous {
            assert!(*previous < key);
        }
        previous = Some(key);
        count += 1;
    }
    assert_eq!(count, values.len());

    let mut backward = tree
        .iterate_entries_minor(&IndexKey::int(i64::MAX), true, false)
        .unwrap();
    let mut previous: Option<IndexKey> = None;
    let mut count = 0usize;
    while let Some((key, _)) = backward.next(333).unwrap() {
        if let Some(previous) = &previous {
            assert!(*previous > key);
        }
        previous = Some(key);
        count += 1;
    }
    assert_eq!(count, values.len());
}

#[test]
fn point_range_equals_multiset() {
    let fixture = fixture(64);
    let tree = create_tree(&fixture, "point", TreeOptions::default());
    let key = IndexKey::int(77);
    for position in 0..5u64 {
        tree.put(Some(&key), Rid::new(2, position)).unwrap();
    }
    tree.put(Some(&IndexKey::int(76)), Rid::new(2, 100)).unwrap();
    tree.put(Some(&IndexKey::int(78)), Rid::new(2, 101)).unwrap();

    let mut cursor = tree
        .iterate_entries_between(&key, true, &key, true, true)
        .unwrap();
    let entries = drain(&mut cursor, 100);
    let rids: Vec<Rid> = entries.iter().map(|(_, rid)| *rid).collect();
    assert!(entries.iter().all(|(k, _)| *k == key));
    assert_eq!(rids, tree.get(Some(&key)).unwrap());
}

#[test]
fn composite_prefix_query_matches_whole_prefix_group() {
    let fixture = fixture(64);
    let tree = create_tree(
        &fixture,
        "composite",
        TreeOptions {
            key_size: 3,
            ..Default::default()
        },
    );

    let full_key = |a: i64, b: i64, c: i64| {
        IndexKey::new(vec![KeyItem::Int(a), KeyItem::Int(b), KeyItem::Int(c)])
    };
    let mut position = 0u64;
    for a in 0..4i64 {
        for b in 0..3i64 {
            for c in 0..3i64 {
                tree.put(Some(&full_key(a, b, c)), Rid::new(5, position))
                    .unwrap();
                position += 1;
            }
        }
    }

    // A one-part key bounds the whole group sharing that first part.
    let partial = IndexKey::int(2);
    let mut cursor = tree
        .iterate_entries_between(&partial, true, &partial, true, true)
        .unwrap();
    let entries = drain(&mut cursor, 100);
    assert_eq!(entries.len(), 9);
    assert!(entries
        .iter()
        .all(|(key, _)| key.items()[0] == KeyItem::Int(2)));

    // Exclusive bounds with partial keys cut the group out entirely.
    let mut cursor = tree
        .iterate_entries_between(&IndexKey::int(1), false, &IndexKey::int(3), false, true)
        .unwrap();
    let entries = drain(&mut cursor, 100);
    assert_eq!(entries.len(), 9);
    assert!(entries
        .iter()
        .all(|(key, _)| key.items()[0] == KeyItem::Int(2)));
}

#[test]
fn clear_and_reuse() {
    let fixture = fixture(64);
    let tree = create_tree(&fixture, "reuse", TreeOptions::default());
    for value in 0..500i64 {
        tree.put(Some(&IndexKey::int(value)), Rid::new(0, value as u64))
            .unwrap();
    }
    tree.clear().unwrap();
    assert_eq!(tree.size().unwrap(), 0);
    assert_eq!(tree.first_key().unwrap(), None);
    assert_eq!(tree.last_key().unwrap(), None);

    tree.put(Some(&IndexKey::int(3)), Rid::new(0, 3)).unwrap();
    assert_eq!(tree.size().unwrap(), 1);
    assert_eq!(tree.first_key().unwrap(), Some(IndexKey::int(3)));
}

#[test]
fn delete_without_load_removes_files() {
    let fixture = fixture(64);
    let tree = create_tree(
        &fixture,
        "doomed",
        TreeOptions {
            null_keys_supported: true,
            ..Default::default()
        },
    );
    tree.put(Some(&IndexKey::int(1)), Rid::new(0, 1)).unwrap();
    tree.close(true).unwrap();

    assert!(fixture.pool.file_exists("doomed.mvb"));
    assert!(fixture.pool.file_exists("doomed.mvn"));
    MultiValueTree::delete_without_load("doomed", &fixture.pool, &fixture.atomic_ops).unwrap();
    assert!(!fixture.pool.file_exists("doomed.mvb"));
    assert!(!fixture.pool.file_exists("doomed.mvn"));
}
