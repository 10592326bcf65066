//! Multi-threaded workloads: the key space is partitioned mod N across
//! threads, each driving its own tree handle against one shared buffer
//! manager. After every thread joins, each key's final state must match
//! its partition's script and the pool must be fully unpinned.

use std::sync::Arc;
use std::thread;

use blinktree::{BLinkTree, BufMgr, MemHostPool};

const THREADS: usize = 7;

fn make_keys(total: usize, big_endian: bool) -> Vec<[u8; 8]> {
    (0..total as u64)
        .map(|i| {
            if big_endian {
                i.to_be_bytes()
            } else {
                i.to_le_bytes()
            }
        })
        .collect()
}

fn insert_and_find_concurrently(mgr: &Arc<BufMgr>, keys: &[[u8; 8]]) {
    thread::scope(|scope| {
        for n in 0..THREADS {
            let mgr = Arc::clone(mgr);
            scope.spawn(move || {
                let tree = BLinkTree::new(mgr);
                for (i, key) in keys.iter().enumerate() {
                    if i % THREADS != n {
                        continue;
                    }
                    tree.insert_key(key, 0, &[0u8; 8], true).unwrap();

                    let (found, found_key, _) = tree.find_key(key, 8).unwrap();
                    assert_eq!(found, 8, "thread {n}: key {i} vanished after insert");
                    assert_eq!(&found_key, key);
                }
            });
        }
    });

    // a second full pass over every partition, reads only
    thread::scope(|scope| {
        for n in 0..THREADS {
            let mgr = Arc::clone(mgr);
            scope.spawn(move || {
                let tree = BLinkTree::new(mgr);
                for (i, key) in keys.iter().enumerate() {
                    if i % THREADS != n {
                        continue;
                    }
                    let (found, found_key, _) = tree.find_key(key, 8).unwrap();
                    assert_eq!(found, 8, "thread {n}: key {i} missing");
                    assert_eq!(&found_key, key);
                }
            });
        }
    });

    assert_eq!(mgr.pool_audit(), 0);
}

#[test]
fn concurrent_insert_and_find_big_endian() {
    let host = MemHostPool::new(1 << 12);
    let mgr = BufMgr::open(12, 16 * THREADS, host, None).unwrap();
    let keys = make_keys(70_000, true);
    insert_and_find_concurrently(&mgr, &keys);
}

#[test]
fn concurrent_insert_and_find_little_endian() {
    let host = MemHostPool::new(1 << 12);
    let mgr = BufMgr::open(12, 16 * THREADS * 2, host, None).unwrap();
    let keys = make_keys(70_000, false);
    insert_and_find_concurrently(&mgr, &keys);
}

#[test]
fn concurrent_insert_and_delete_alternating() {
    let host = MemHostPool::new(1 << 12);
    let mgr = BufMgr::open(12, 16 * THREADS * 2, host, None).unwrap();
    let keys = Arc::new(make_keys(70_000, false));

    thread::scope(|scope| {
        for n in 0..THREADS {
            let mgr = Arc::clone(&mgr);
            let keys = Arc::clone(&keys);
            scope.spawn(move || {
                let tree = BLinkTree::new(mgr);
                for (i, key) in keys.iter().enumerate() {
                    if i % THREADS != n {
                        continue;
                    }
                    tree.insert_key(key, 0, &[0u8; 8], true).unwrap();

                    if i % 2 == n % 2 {
                        tree.delete_key(key, 0).unwrap();
                        let (found, _, _) = tree.find_key(key, 8).unwrap();
                        assert_eq!(found, -1, "thread {n}: deleted key {i} still found");
                    } else {
                        let (found, _, _) = tree.find_key(key, 8).unwrap();
                        assert_eq!(found, 8, "thread {n}: key {i} vanished");
                    }
                }
            });
        }
    });

    // every key's final state matches its partition's script
    let tree = BLinkTree::new(Arc::clone(&mgr));
    for (i, key) in keys.iter().enumerate() {
        let n = i % THREADS;
        let (found, _, _) = tree.find_key(key, 8).unwrap();
        if i % 2 == n % 2 {
            assert_eq!(found, -1, "key {i} should have stayed deleted");
        } else {
            assert_eq!(found, 8, "key {i} should have survived");
        }
    }

    assert_eq!(mgr.pool_audit(), 0);
}
