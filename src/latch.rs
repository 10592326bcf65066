//! # Per-Frame Latch Sets
//!
//! Every buffer pool frame owns a latch set: three independent
//! reader/writer locks, a pin counter with a clock bit, and the links that
//! thread the latch into its hash bucket chain.
//!
//! The three locks carry different protocol roles (see the lock coupling
//! notes in `tree.rs`):
//!
//! - **Access**: taken shared for the brief window in which any operation
//!   first touches a page, and exclusive only while a page is being
//!   unlinked. This is what keeps readers off a page mid-deletion.
//! - **ReadWrite**: the data lock. Shared for search, exclusive for any
//!   mutation.
//! - **Parent**: serialises fence-key propagation into the parent level.
//!
//! Lock acquisitions and releases do not nest lexically — a descent
//! releases the parent's lock from a different stack frame than acquired
//! it — so the locks are `parking_lot` raw locks rather than RAII guards.
//!
//! The pin counter's high bit is the clock bit: set on unpin, cleared by
//! the eviction sweep, giving every frame one grace sweep before it
//! becomes a victim.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;

use crate::config::{PageNo, CLOCK_BIT};

/// Which lock, and in which direction, a page operation wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    /// Access shared.
    Access,
    /// Access exclusive; held only while a page is unlinked.
    Delete,
    /// ReadWrite shared.
    Read,
    /// ReadWrite exclusive.
    Write,
    /// Parent exclusive.
    Parent,
}

pub struct LatchSet {
    access: RawRwLock,
    read_write: RawRwLock,
    parent: RawRwLock,

    /// Pin count; the high [`CLOCK_BIT`] is the second-chance marker.
    pin: AtomicU32,
    /// Logical page this frame currently holds.
    page_no: AtomicU64,
    /// Hash chain links (pool slot indices, 0 = none).
    next: AtomicU32,
    prev: AtomicU32,
    /// Frame content diverges from the host copy.
    dirty: AtomicBool,
    /// This latch's own pool slot index.
    entry: u32,
}

impl LatchSet {
    pub fn new(entry: u32) -> Self {
        Self {
            access: RawRwLock::INIT,
            read_write: RawRwLock::INIT,
            parent: RawRwLock::INIT,
            pin: AtomicU32::new(0),
            page_no: AtomicU64::new(0),
            next: AtomicU32::new(0),
            prev: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            entry,
        }
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn page_no(&self) -> PageNo {
        self.page_no.load(Ordering::Acquire)
    }

    pub fn set_page_no(&self, no: PageNo) {
        self.page_no.store(no, Ordering::Release);
    }

    pub fn next(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    pub fn set_next(&self, slot: u32) {
        self.next.store(slot, Ordering::Release);
    }

    pub fn prev(&self) -> u32 {
        self.prev.load(Ordering::Acquire)
    }

    pub fn set_prev(&self, slot: u32) {
        self.prev.store(slot, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Raw pin word, clock bit included.
    pub fn pin_word(&self) -> u32 {
        self.pin.load(Ordering::Acquire)
    }

    pub fn pin(&self) {
        self.pin.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one pin and arm the clock bit so the eviction sweep grants
    /// this frame a second chance.
    pub fn unpin(&self) {
        self.pin.fetch_or(CLOCK_BIT, Ordering::AcqRel);
        self.pin.fetch_sub(1, Ordering::AcqRel);
    }

    /// Take the frame's second chance away. Returns the previous pin word.
    pub fn clear_clock_bit(&self) -> u32 {
        self.pin.fetch_and(!CLOCK_BIT, Ordering::AcqRel)
    }

    /// Reset pin state when the frame is relinked to a new page.
    pub fn reset_pin(&self) {
        self.pin.store(1, Ordering::Release);
    }

    pub fn lock(&self, mode: LockMode) {
        match mode {
            LockMode::None => {}
            LockMode::Access => self.access.lock_shared(),
            LockMode::Delete => self.access.lock_exclusive(),
            LockMode::Read => self.read_write.lock_shared(),
            LockMode::Write => self.read_write.lock_exclusive(),
            LockMode::Parent => self.parent.lock_exclusive(),
        }
    }

    /// Release a lock taken with [`LatchSet::lock`] in the same mode.
    pub fn unlock(&self, mode: LockMode) {
        // SAFETY: the engine's lock protocol pairs every unlock with a lock
        // of the same mode on the same latch; modes map one-to-one onto the
        // underlying shared/exclusive acquisitions.
        unsafe {
            match mode {
                LockMode::None => {}
                LockMode::Access => self.access.unlock_shared(),
                LockMode::Delete => self.access.unlock_exclusive(),
                LockMode::Read => self.read_write.unlock_shared(),
                LockMode::Write => self.read_write.unlock_exclusive(),
                LockMode::Parent => self.parent.unlock_exclusive(),
            }
        }
    }

    /// Whether every lock of this latch is currently free. Used by the
    /// post-quiescence pool audit; not meaningful under concurrency.
    pub fn is_unlocked(&self) -> bool {
        let mut free = true;
        if self.access.try_lock_exclusive() {
            // SAFETY: paired with the try_lock_exclusive just above.
            unsafe { self.access.unlock_exclusive() };
        } else {
            free = false;
        }
        if self.read_write.try_lock_exclusive() {
            // SAFETY: paired with the try_lock_exclusive just above.
            unsafe { self.read_write.unlock_exclusive() };
        } else {
            free = false;
        }
        if self.parent.try_lock_exclusive() {
            // SAFETY: paired with the try_lock_exclusive just above.
            unsafe { self.parent.unlock_exclusive() };
        } else {
            free = false;
        }
        free
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CLOCK_BIT;
    use parking_lot::lock_api::RawRwLock as _;

    #[test]
    fn unpin_arms_clock_bit() {
        let latch = LatchSet::new(1);
        latch.pin();
        assert_eq!(latch.pin_word(), 1);

        latch.unpin();
        assert_eq!(latch.pin_word(), CLOCK_BIT);

        latch.clear_clock_bit();
        assert_eq!(latch.pin_word(), 0);
    }

    #[test]
    fn pins_nest() {
        let latch = LatchSet::new(1);
        latch.pin();
        latch.pin();
        assert_eq!(latch.pin_word(), 2);

        latch.unpin();
        assert_eq!(latch.pin_word(), CLOCK_BIT | 1);
    }

    #[test]
    fn lock_modes_map_to_independent_locks() {
        let latch = LatchSet::new(1);

        latch.lock(LockMode::Read);
        latch.lock(LockMode::Access);
        latch.lock(LockMode::Parent);
        assert!(!latch.is_unlocked());

        latch.unlock(LockMode::Read);
        latch.unlock(LockMode::Access);
        latch.unlock(LockMode::Parent);
        assert!(latch.is_unlocked());
    }

    #[test]
    fn delete_mode_is_access_exclusive() {
        let latch = LatchSet::new(1);
        latch.lock(LockMode::Delete);

        // a reader's Access acquisition must block, a data lock must not
        assert!(!latch.access.try_lock_shared());
        latch.lock(LockMode::Write);
        latch.unlock(LockMode::Write);

        latch.unlock(LockMode::Delete);
        assert!(latch.is_unlocked());
    }
}
