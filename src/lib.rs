//! # blinktree — Embeddable Concurrent B-link-tree
//!
//! A B-link-tree index engine whose pages live inside a buffer pool
//! supplied by the embedding application. The engine treats that host as
//! an opaque page-granular persistence layer and interposes its own
//! fixed-size pool that manages index-specific latches, eviction, and
//! page-identifier translation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Tree Operations (BLinkTree)       │  insert / delete / find / scan
//! ├─────────────────────────────────────┤
//! │   Internal Buffer Manager (BufMgr)  │  hash lookup, pin, clock evict
//! ├─────────────────────────────────────┤
//! │   Latch Sets │ Slotted Pages        │  3 rwlocks per frame │ layout
//! ├─────────────────────────────────────┤
//! │   Host Translation                  │  logical page no <-> host id
//! ├─────────────────────────────────────┤
//! │   Host Buffer Pool (trait)          │  supplied by the application
//! └─────────────────────────────────────┘
//! ```
//!
//! The tree layer never sees a host page id; the buffer manager never
//! touches tree semantics. Pages reference each other by logical page
//! number only, so any unpinned page can be evicted regardless of who
//! points at it.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use blinktree::{BLinkTree, BufMgr, MemHostPool};
//!
//! let host = MemHostPool::new(1 << 12);
//! let mgr = BufMgr::open(12, 64, host, None)?;
//! let tree = BLinkTree::new(Arc::clone(&mgr));
//!
//! tree.insert_key(b"a-key", 0, b"a-value", true)?;
//! let (found, key, value) = tree.find_key(b"a-key", 64)?;
//!
//! mgr.close()?;
//! let saved = mgr.page_zero_host_id()?;   // reopen later with Some(saved)
//! ```
//!
//! ## Concurrency
//!
//! All operations run to completion on their calling thread; the only
//! suspension points are latch acquisitions. Point reads, inserts and
//! deletes are linearizable per key at the leaf's data lock. Range scans
//! are weakly consistent: they copy pages under short read latches and are
//! equivalent to interleaved point reads. Tree handles are cheap — take
//! one per thread over a shared `Arc<BufMgr>`.

pub mod config;
pub mod error;
pub mod host;
pub mod latch;
pub mod page;
pub mod pool;
pub mod tree;

pub use config::{HostPageId, PageNo};
pub use error::{BltError, BltResult};
pub use host::mem::MemHostPool;
pub use host::{HostPage, HostPool};
pub use pool::BufMgr;
pub use tree::{BLinkTree, RangeIter};
