//! Restart tests: close checkpoints the id map into PageZero, and a new
//! manager built over the same host with the saved host id resumes the
//! tree without touching its structure.

use std::sync::Arc;

use blinktree::{BLinkTree, BltError, BufMgr, MemHostPool};

#[test]
fn reopen_preserves_and_extends_the_tree() {
    let host = MemHostPool::new(1 << 12);

    let mgr = BufMgr::open(12, 48, Arc::clone(&host) as Arc<dyn blinktree::HostPool>, None)
        .unwrap();
    let tree = BLinkTree::new(Arc::clone(&mgr));
    for i in 0..=1000u64 {
        tree.insert_key(&i.to_be_bytes(), 0, &[0u8; 8], true).unwrap();
    }
    mgr.close().unwrap();
    let saved = mgr.page_zero_host_id().unwrap();
    drop(tree);
    drop(mgr);

    let mgr = BufMgr::open(12, 48, host, Some(saved)).unwrap();
    let tree = BLinkTree::new(Arc::clone(&mgr));
    for i in 1000..=2000u64 {
        tree.insert_key(&i.to_be_bytes(), 0, &[0u8; 8], true).unwrap();
    }

    for i in 0..=2000u64 {
        let (found, key, _) = tree.find_key(&i.to_be_bytes(), 8).unwrap();
        assert_eq!(found, 8, "key {i} lost across restart");
        assert_eq!(key, i.to_be_bytes());
    }
}

#[test]
fn reopen_after_deletions_sees_final_state() {
    let host = MemHostPool::new(1 << 12);

    let mgr = BufMgr::open(12, 48, Arc::clone(&host) as Arc<dyn blinktree::HostPool>, None)
        .unwrap();
    let tree = BLinkTree::new(Arc::clone(&mgr));
    for i in 0..2000u64 {
        tree.insert_key(&i.to_le_bytes(), 0, &[0u8; 8], true).unwrap();
    }
    for i in (0..2000u64).step_by(2) {
        tree.delete_key(&i.to_le_bytes(), 0).unwrap();
    }
    mgr.close().unwrap();
    let saved = mgr.page_zero_host_id().unwrap();
    drop(tree);
    drop(mgr);

    let mgr = BufMgr::open(12, 48, host, Some(saved)).unwrap();
    let tree = BLinkTree::new(Arc::clone(&mgr));
    for i in 0..2000u64 {
        let (found, _, _) = tree.find_key(&i.to_le_bytes(), 8).unwrap();
        if i % 2 == 0 {
            assert_eq!(found, -1, "deleted key {i} resurrected by restart");
        } else {
            assert_eq!(found, 8, "key {i} lost across restart");
        }
    }
}

#[test]
fn reopen_with_mismatched_page_bits_fails() {
    let host = MemHostPool::new(1 << 12);

    let mgr = BufMgr::open(12, 48, Arc::clone(&host) as Arc<dyn blinktree::HostPool>, None)
        .unwrap();
    mgr.close().unwrap();
    let saved = mgr.page_zero_host_id().unwrap();
    drop(mgr);

    let err = BufMgr::open(13, 48, host, Some(saved)).unwrap_err();
    assert!(matches!(err, BltError::Config(_)));
}

#[test]
fn reopen_with_unknown_host_page_fails() {
    let host = MemHostPool::new(1 << 12);
    let err = BufMgr::open(12, 48, host, Some(9999)).unwrap_err();
    assert!(matches!(err, BltError::Host(_)));
}
