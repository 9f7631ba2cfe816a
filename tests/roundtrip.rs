//! Durability round-trips: committed state must reopen identically from
//! the backing file for every tree flavor.

use bplustree::{BPlusTree, BytesTree, StringTree, TreeError};

#[test]
fn long_tree_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("longs.tree");

    let mut tree = BPlusTree::create_file(&path, 12, 6).unwrap();
    for i in 0..500 {
        tree.set(&format!("entry-{i:04}"), i * 7).unwrap();
    }
    tree.commit().unwrap();
    tree.shutdown().unwrap();

    let mut tree = BPlusTree::open_file(&path).unwrap();
    assert_eq!(tree.key_length(), 12);
    assert_eq!(tree.node_capacity(), 6);
    for i in 0..500 {
        assert_eq!(tree.get(&format!("entry-{i:04}")).unwrap(), i * 7);
    }
}

#[test]
fn bytes_tree_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bytes.tree");

    let big: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
    let mut tree = BytesTree::create_file(&path, 10, 4).unwrap();
    tree.set("big", &big).unwrap();
    tree.set("small", b"abc").unwrap();
    tree.set("empty", b"").unwrap();
    tree.commit().unwrap();
    tree.shutdown().unwrap();

    let mut tree = BytesTree::open_file(&path).unwrap();
    assert_eq!(tree.get("big").unwrap(), big);
    assert_eq!(tree.get("small").unwrap(), b"abc");
    assert_eq!(tree.get("empty").unwrap(), Vec::<u8>::new());
}

#[test]
fn string_tree_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strings.tree");

    let mut tree = StringTree::create_file(&path, 10, 4).unwrap();
    tree.set("motto", "per aspera ad astra").unwrap();
    tree.commit().unwrap();
    tree.shutdown().unwrap();

    let mut tree = StringTree::open_file(&path).unwrap();
    assert_eq!(tree.get("motto").unwrap(), "per aspera ad astra");
}

#[test]
fn garbage_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.tree");
    std::fs::write(&path, b"this is not a tree file at all, not even close").unwrap();
    assert!(matches!(
        BPlusTree::open_file(&path),
        Err(TreeError::BlockFile(_))
    ));
}

#[test]
fn bad_parameters_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        BPlusTree::create_file(dir.path().join("a.tree"), 8, 1),
        Err(TreeError::Config(_))
    ));
    assert!(matches!(
        BPlusTree::create_file(dir.path().join("b.tree"), 0, 4),
        Err(TreeError::Config(_))
    ));
}
