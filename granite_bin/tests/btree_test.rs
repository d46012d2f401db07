//! Structural tests for the B+ tree: split shapes, delete rebalancing and
//! iterator reachability.

use std::sync::Arc;

use strata::disk::DiskManager;
use strata::index::{BPlusTree, KeyManager};
use strata::record::{Column, Field, Row, Schema, TypeId};
use strata::{BufferPoolManager, PageId, RowId, INVALID_PAGE_ID};
use tempfile::tempdir;

fn setup(dir: &tempfile::TempDir) -> (Arc<BufferPoolManager>, KeyManager) {
    let disk = DiskManager::open(dir.path().join("btree.db")).unwrap();
    let bpm = Arc::new(BufferPoolManager::with_capacity(disk, 64));
    // Pages 0 and 1 are reserved for catalog meta and index roots.
    bpm.new_page().unwrap();
    bpm.new_page().unwrap();
    let km = KeyManager::new(Arc::new(Schema::new(vec![Column::new(
        "k",
        TypeId::Int,
        0,
        false,
        false,
    )])));
    (bpm, km)
}

fn int_key(value: i32) -> Row {
    Row::new(vec![Field::from_int(value)])
}

fn decode(km: &KeyManager, raw: &[u8]) -> i32 {
    km.deserialize_key(raw).field(0).as_int().unwrap()
}

/// Leaf contents in chain order, starting from the leftmost leaf.
fn collect_leaves(bpm: &BufferPoolManager, km: &KeyManager, root: PageId) -> Vec<Vec<i32>> {
    let mut current = root;
    loop {
        let guard = bpm.fetch_page(current).unwrap();
        let page = guard.read();
        if page.tree_is_leaf() {
            break;
        }
        current = page.internal_value_at(0);
    }

    let mut leaves = Vec::new();
    while current != INVALID_PAGE_ID {
        let guard = bpm.fetch_page(current).unwrap();
        let page = guard.read();
        leaves.push(
            (0..page.tree_size())
                .map(|i| decode(km, page.tree_key_at(i)))
                .collect(),
        );
        current = page.leaf_next_page_id();
    }
    leaves
}

/// Walks the whole tree checking child/parent agreement and key ordering.
fn check_tree(bpm: &BufferPoolManager, km: &KeyManager, page_id: PageId, is_root: bool) {
    let guard = bpm.fetch_page(page_id).unwrap();
    let page = guard.read();
    let size = page.tree_size();

    if !is_root {
        assert!(
            size >= page.tree_min_size(),
            "page {page_id} under-full: {size} < {}",
            page.tree_min_size()
        );
    }

    if page.tree_is_leaf() {
        for i in 1..size {
            assert!(
                decode(km, page.tree_key_at(i - 1)) < decode(km, page.tree_key_at(i)),
                "leaf {page_id} keys out of order"
            );
        }
        return;
    }

    // Separators are strictly increasing past the slot-0 dummy.
    for i in 2..size {
        assert!(
            decode(km, page.tree_key_at(i - 1)) < decode(km, page.tree_key_at(i)),
            "internal {page_id} separators out of order"
        );
    }
    let children: Vec<PageId> = (0..size).map(|i| page.internal_value_at(i)).collect();
    drop(page);
    drop(guard);
    for child in children {
        let child_guard = bpm.fetch_page(child).unwrap();
        assert_eq!(
            child_guard.read().tree_parent_page_id(),
            page_id,
            "child {child} lost its parent link"
        );
        drop(child_guard);
        check_tree(bpm, km, child, false);
    }
}

#[test]
fn sequential_inserts_build_the_expected_shape() {
    let dir = tempdir().unwrap();
    let (bpm, km) = setup(&dir);
    let mut tree = BPlusTree::new(1, Arc::clone(&bpm), km.clone(), 4, 4).unwrap();

    for i in 1..=10 {
        assert!(tree.insert(&int_key(i), RowId::new(1, i as u32)).unwrap());
    }

    let leaves = collect_leaves(&bpm, &km, tree.root_page_id());
    assert_eq!(
        leaves,
        vec![vec![1, 2], vec![3, 4], vec![5, 6], vec![7, 8], vec![9, 10]]
    );

    // A single root spans all five leaves; its separators are the first
    // keys of leaves 2..5.
    let root_guard = bpm.fetch_page(tree.root_page_id()).unwrap();
    let root = root_guard.read();
    assert!(!root.tree_is_leaf());
    assert_eq!(root.tree_size(), 5);
    let separators: Vec<i32> = (1..root.tree_size())
        .map(|i| decode(&km, root.tree_key_at(i)))
        .collect();
    assert_eq!(separators, vec![3, 5, 7, 9]);
    drop(root);
    drop(root_guard);

    check_tree(&bpm, &km, tree.root_page_id(), true);
}

#[test]
fn deletes_rebalance_and_keep_survivors_reachable() {
    let dir = tempdir().unwrap();
    let (bpm, km) = setup(&dir);
    let mut tree = BPlusTree::new(1, Arc::clone(&bpm), km.clone(), 4, 4).unwrap();
    for i in 1..=10 {
        tree.insert(&int_key(i), RowId::new(1, i as u32)).unwrap();
    }

    for victim in [5, 4, 3, 2, 1] {
        assert!(tree.remove(&int_key(victim)).unwrap(), "remove {victim}");
        check_tree(&bpm, &km, tree.root_page_id(), true);
    }

    let survivors: Vec<i32> = tree
        .begin()
        .unwrap()
        .map(|pair| decode(&km, &pair.unwrap().0))
        .collect();
    assert_eq!(survivors, vec![6, 7, 8, 9, 10]);
    for i in 6..=10 {
        assert_eq!(
            tree.get_value(&int_key(i)).unwrap(),
            Some(RowId::new(1, i as u32))
        );
    }
    for i in 1..=5 {
        assert_eq!(tree.get_value(&int_key(i)).unwrap(), None);
    }
}

#[test]
fn random_churn_preserves_the_tree_invariants() {
    use rand::prelude::*;

    let dir = tempdir().unwrap();
    let (bpm, km) = setup(&dir);
    let mut tree = BPlusTree::new(1, Arc::clone(&bpm), km.clone(), 4, 4).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut keys: Vec<i32> = (0..200).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        assert!(tree.insert(&int_key(k), RowId::new(2, k as u32)).unwrap());
    }
    check_tree(&bpm, &km, tree.root_page_id(), true);

    keys.shuffle(&mut rng);
    let (gone, kept) = keys.split_at(120);
    for &k in gone {
        assert!(tree.remove(&int_key(k)).unwrap(), "remove {k}");
    }
    check_tree(&bpm, &km, tree.root_page_id(), true);

    let mut expected: Vec<i32> = kept.to_vec();
    expected.sort_unstable();
    let seen: Vec<i32> = tree
        .begin()
        .unwrap()
        .map(|pair| decode(&km, &pair.unwrap().0))
        .collect();
    assert_eq!(seen, expected);
}

#[test]
fn composite_keys_order_by_column_sequence() {
    let dir = tempdir().unwrap();
    let disk = DiskManager::open(dir.path().join("composite.db")).unwrap();
    let bpm = Arc::new(BufferPoolManager::with_capacity(disk, 64));
    bpm.new_page().unwrap();
    bpm.new_page().unwrap();
    let km = KeyManager::new(Arc::new(Schema::new(vec![
        Column::new_char("name", 8, 0, false, false),
        Column::new("seq", TypeId::Int, 1, false, false),
    ])));
    let mut tree = BPlusTree::new(2, Arc::clone(&bpm), km.clone(), 4, 4).unwrap();

    let rows = [
        ("carol", 1),
        ("alice", 2),
        ("bob", 1),
        ("alice", 1),
        ("bob", 3),
    ];
    for (i, (name, seq)) in rows.iter().enumerate() {
        let key = Row::new(vec![Field::from_chars(*name), Field::from_int(*seq)]);
        assert!(tree.insert(&key, RowId::new(1, i as u32)).unwrap());
    }

    let seen: Vec<(String, i32)> = tree
        .begin()
        .unwrap()
        .map(|pair| {
            let row = km.deserialize_key(&pair.unwrap().0);
            (
                row.field(0).as_chars().unwrap().to_string(),
                row.field(1).as_int().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            ("alice".to_string(), 1),
            ("alice".to_string(), 2),
            ("bob".to_string(), 1),
            ("bob".to_string(), 3),
            ("carol".to_string(), 1),
        ]
    );
}
