//! Traversal order: first_key/next_key enumerate keys in byte order,
//! regardless of insertion order, footprint limit, or deletions.

use std::io::Cursor;

use bplustree::{BPlusTree, IndexTree};

fn memory_tree(node_capacity: usize) -> BPlusTree<Cursor<Vec<u8>>> {
    BPlusTree::create(Cursor::new(Vec::new()), 24, node_capacity).unwrap()
}

fn scan(tree: &mut BPlusTree<Cursor<Vec<u8>>>) -> Vec<String> {
    let mut keys = Vec::new();
    let mut cursor = tree.first_key().unwrap();
    while let Some(key) = cursor {
        cursor = tree.next_key(&key).unwrap();
        keys.push(key);
    }
    keys
}

#[test]
fn shuffled_inserts_enumerate_sorted() {
    let mut tree = memory_tree(4);
    // A fixed permutation of 0..200 via a multiplicative step.
    let mut expected = Vec::new();
    for i in 0..200u64 {
        let j = (i * 73) % 200;
        let key = format!("item-{j:03}");
        tree.set(&key, j as i64).unwrap();
        expected.push(format!("item-{i:03}"));
    }
    assert_eq!(scan(&mut tree), expected);
}

#[test]
fn byte_order_not_numeric_order() {
    let mut tree = memory_tree(4);
    for key in ["10", "9", "100", "2"] {
        tree.set(key, 0).unwrap();
    }
    assert_eq!(scan(&mut tree), vec!["10", "100", "2", "9"]);
    assert_eq!(
        tree.compare("10", "9"),
        std::cmp::Ordering::Less,
        "byte-wise comparison puts \"10\" before \"9\""
    );
}

#[test]
fn next_key_from_arbitrary_probes() {
    let mut tree = memory_tree(3);
    for i in (0..100).step_by(4) {
        tree.set(&format!("k{i:03}"), i).unwrap();
    }
    // Probes landing between, on, before, and after stored keys.
    assert_eq!(tree.next_key("k001").unwrap().as_deref(), Some("k004"));
    assert_eq!(tree.next_key("k004").unwrap().as_deref(), Some("k008"));
    assert_eq!(tree.next_key("").unwrap().as_deref(), Some("k000"));
    assert_eq!(tree.next_key("k096").unwrap(), None);
    assert_eq!(tree.next_key("zzz").unwrap(), None);
}

#[test]
fn traversal_unaffected_by_footprint_limit() {
    let mut tree = memory_tree(4);
    for i in 0..150 {
        tree.set(&format!("key-{i:03}"), i).unwrap();
    }
    tree.commit().unwrap();
    let reference = scan(&mut tree);

    for limit in [0, 1, 3] {
        tree.set_footprint_limit(limit);
        assert_eq!(scan(&mut tree), reference, "limit {limit} changed the scan");
    }
}

#[test]
fn order_holds_through_heavy_deletion() {
    let mut tree = memory_tree(3);
    for i in 0..120 {
        tree.set(&format!("key-{i:03}"), i).unwrap();
    }
    // Remove two of every three keys.
    for i in 0..120 {
        if i % 3 != 0 {
            tree.remove_key(&format!("key-{i:03}")).unwrap();
        }
    }
    let expected: Vec<String> = (0..120)
        .filter(|i| i % 3 == 0)
        .map(|i| format!("key-{i:03}"))
        .collect();
    assert_eq!(scan(&mut tree), expected);
}

#[test]
fn trait_object_style_access() {
    // The facade trait is usable generically over any stream.
    fn exercise<T: IndexTree<Value = i64>>(tree: &mut T) {
        tree.set("one", 1).unwrap();
        tree.set("two", 2).unwrap();
        assert_eq!(tree.get("one").unwrap(), 1);
        assert_eq!(tree.first_key().unwrap().as_deref(), Some("one"));
        assert_eq!(tree.next_key("one").unwrap().as_deref(), Some("two"));
    }
    let mut tree = memory_tree(4);
    exercise(&mut tree);
}
