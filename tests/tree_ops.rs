//! Single-threaded volume tests: splits across multiple levels, mass
//! deletion, and range iteration through the public API.

use blinktree::{BLinkTree, BufMgr, MemHostPool};

fn open_tree(bits: u8, node_max: usize) -> BLinkTree {
    let host = MemHostPool::new(1 << bits);
    BLinkTree::new(BufMgr::open(bits, node_max, host, None).unwrap())
}

#[test]
fn insert_and_find_160k_keys() {
    let tree = open_tree(12, 16 * 7);
    let total = 160_000u64;

    for i in 0..total {
        tree.insert_key(&i.to_be_bytes(), 0, &[0u8; 8], true).unwrap();
    }

    for i in 0..total {
        let (found, key, _) = tree.find_key(&i.to_be_bytes(), 8).unwrap();
        assert_eq!(found, 8, "key {i} not found");
        assert_eq!(key, i.to_be_bytes());
    }

    assert_eq!(tree.pool().pool_audit(), 0);
}

#[test]
fn delete_every_even_key_of_160k() {
    let tree = open_tree(12, 16 * 7);
    let total = 160_000u64;

    for i in 0..total {
        tree.insert_key(&i.to_le_bytes(), 0, &[0u8; 8], true).unwrap();
        if i % 2 == 0 {
            tree.delete_key(&i.to_le_bytes(), 0).unwrap();
        }
    }

    for i in 0..total {
        let (found, _, _) = tree.find_key(&i.to_le_bytes(), 8).unwrap();
        if i % 2 == 0 {
            assert_eq!(found, -1, "deleted key {i} still found");
        } else {
            assert_eq!(found, 8, "key {i} lost");
        }
    }

    assert_eq!(tree.pool().pool_audit(), 0);
}

#[test]
fn delete_all_keys_leaves_empty_tree() {
    let tree = open_tree(12, 16 * 7);
    let total = 20_000u64;

    for i in 0..total {
        tree.insert_key(&i.to_le_bytes(), 0, &[0u8; 8], true).unwrap();
    }
    for i in 0..total {
        tree.delete_key(&i.to_le_bytes(), 0).unwrap();
        let (found, _, _) = tree.find_key(&i.to_le_bytes(), 8).unwrap();
        assert_eq!(found, -1, "key {i} survived its deletion");
    }

    let remaining = tree.range_scan(None, None).unwrap().count();
    assert_eq!(remaining, 0);
}

#[test]
fn range_scan_walks_the_leaf_chain() {
    let tree = open_tree(12, 48);
    let total = 5_000u64;

    for i in 0..total {
        tree.insert_key(&i.to_be_bytes(), 0, &i.to_le_bytes(), true).unwrap();
    }

    let entries: Vec<_> = tree.range_scan(None, None).unwrap().collect();
    assert_eq!(entries.len(), total as usize);
    assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));

    let lower = 1_000u64.to_be_bytes();
    let upper = 1_999u64.to_be_bytes();
    let slice = tree.range_scan(Some(&lower), Some(&upper)).unwrap();
    assert_eq!(slice.len(), 1_000);
}

#[test]
fn values_are_returned_up_to_val_max() {
    let tree = open_tree(12, 20);
    tree.insert_key(b"k", 0, b"0123456789", true).unwrap();

    let (found, _, value) = tree.find_key(b"k", 4).unwrap();
    assert_eq!(found, 4);
    assert_eq!(value, b"0123");

    let (found, _, value) = tree.find_key(b"k", 64).unwrap();
    assert_eq!(found, 10);
    assert_eq!(value, b"0123456789");
}
