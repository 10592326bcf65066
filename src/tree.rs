//! # B-link-tree Operations
//!
//! The tree layer implements search, insert, delete and range iteration
//! over slotted pages held by the internal buffer manager. It never sees a
//! host page id; every reference between pages is a logical page number
//! resolved through the pool.
//!
//! ## Lock coupling
//!
//! A descent pins a page, takes its Access lock shared, acquires the data
//! lock (Read above the target level, the caller's mode at it), then
//! releases the parent. Structure changes chain locks the other way:
//!
//! ```text
//! split:   hold Write(left)
//!          lock Parent(right), Parent(left), drop Write(left)
//!          insert both fences one level up, drop Parents
//! delete:  hold Write(empty page)
//!          lock Write(right sibling), absorb it, mark it Kill
//!          lock Parents, drop Writes, swap fences one level up
//!          free the right sibling under Delete+Write
//! ```
//!
//! A concurrent reader either sees the pre-split page in full or follows
//! its right pointer to the new sibling; the Kill tombstone keeps readers
//! off a page that is mid-unlink and redirects them left.
//!
//! ## Insertion amortisation
//!
//! Page cleanup re-lays a dead librarian slot in front of every live slot.
//! An insert that lands between two live keys consumes the librarian ahead
//! of it instead of shifting the slot array, so random-order insertion
//! stays cheap until the next cleanup. Splits re-lay librarians in both
//! halves.
//!
//! ## What a split does
//!
//! ```text
//! 1. copy the upper half of live slots into a scratch frame
//! 2. materialise it as a new page (free chain first, else alloc-right)
//! 3. rebuild the lower half in place, right pointer -> new page
//! 4. insert (left fence -> left id) and (right fence -> right id) into
//!    the parent level; inserting the old fence key over the parent's
//!    existing entry retargets it in place
//! 5. a root split instead moves the root's contents into a fresh child
//!    and rewrites the root as a two-entry node one level higher
//! ```
//!
//! Deletes mark slots dead and squeeze trailing dead slots under the
//! fence. A page that loses its fence pushes the new smaller fence up; a
//! page that empties absorbs its right sibling (keeping its own id stable
//! for the parent) and frees the sibling; a root left with one live child
//! pulls that child's contents up a level at a time.

use std::sync::Arc;

use log::debug;
use smallvec::SmallVec;

use crate::config::{ID_SIZE, KEY_MAX, ROOT_PAGE, SLOT_SIZE, VALUE_MAX};
use crate::error::{BltError, BltResult};
use crate::latch::{LatchSet, LockMode};
use crate::page::{get_id, put_id, SlotKind, SlottedPage, SlottedPageMut, STOPPER_KEY};
use crate::pool::BufMgr;

/// A handle over one buffer manager. Handles are cheap; concurrent callers
/// each take their own against a shared [`BufMgr`].
pub struct BLinkTree {
    mgr: Arc<BufMgr>,
}

/// Owned result of a range scan; weakly consistent with concurrent
/// mutations, equivalent to a sequence of interleaved point reads.
pub struct RangeIter {
    entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for RangeIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for RangeIter {}

fn check_user_key(key: &[u8]) -> BltResult<()> {
    if key.is_empty() || key.len() > KEY_MAX {
        return Err(BltError::Config(format!(
            "key length {} outside [1, {KEY_MAX}]",
            key.len()
        )));
    }
    if key.len() >= 2 && key[0] == 0xFF && key[1] == 0xFF {
        return Err(BltError::Config(
            "keys may not begin with the reserved bytes ff ff".into(),
        ));
    }
    Ok(())
}

impl BLinkTree {
    pub fn new(mgr: Arc<BufMgr>) -> Self {
        Self { mgr }
    }

    pub fn pool(&self) -> &Arc<BufMgr> {
        &self.mgr
    }

    /// Insert or update `key` at `lvl` (0 for user inserts). A live exact
    /// match is overwritten in place, a dead one revived. With `unique`
    /// false the key is suffixed with a fresh 6-byte sequence so equal keys
    /// coexist in insertion order.
    pub fn insert_key(&self, key: &[u8], lvl: u8, value: &[u8], unique: bool) -> BltResult<()> {
        if lvl == 0 {
            check_user_key(key)?;
        }
        if value.len() > VALUE_MAX {
            return Err(BltError::Config(format!(
                "value length {} exceeds {VALUE_MAX}",
                value.len()
            )));
        }

        let mut ins: SmallVec<[u8; 64]> = SmallVec::from_slice(key);
        let kind = if unique {
            SlotKind::Unique
        } else {
            let mut seq = [0u8; ID_SIZE];
            put_id(&mut seq, self.mgr.next_dup());
            ins.extend_from_slice(&seq);
            SlotKind::Duplicate
        };

        loop {
            let (latch, found_slot) = self.mgr.page_fetch(key, lvl, LockMode::Write)?;
            let page = SlottedPage::new(self.mgr.frame(latch));

            // a librarian holding this exact key fronts for the real slot
            let mut slot = found_slot;
            if page.kind(slot) == SlotKind::Librarian && page.key(slot) == key {
                slot += 1;
            }

            let exact =
                unique && page.kind(slot) != SlotKind::Duplicate && page.key(slot) == &ins[..];

            if exact {
                let was_dead = page.is_dead(slot);
                let mut page = SlottedPageMut::new(self.mgr.frame_mut(latch));

                if let Some(freed) = page.try_set_value(slot, value) {
                    if was_dead {
                        let act = page.view().act();
                        page.set_act(act + 1);
                    }
                    page.set_dead(slot, false);
                    let garbage = page.view().garbage();
                    page.set_garbage(garbage + freed);
                    latch.set_dirty(true);

                    debug_assert!(page.view().validate(), "insert overwrite broke the page");
                    latch.unlock(LockMode::Write);
                    self.mgr.unpin_latch(latch);
                    return Ok(());
                }

                // replacement does not fit the record: retire the slot and
                // fall through to a fresh insert on this page
                let view = page.view();
                let dead_bytes = (view.key(slot).len() + 1 + view.value(slot).len() + 1) as u32;
                if !was_dead {
                    let act = view.act();
                    page.set_act(act - 1);
                }
                page.set_dead(slot, true);
                let garbage = page.view().garbage();
                page.set_garbage(garbage + dead_bytes);
                latch.set_dirty(true);
            }

            let new_slot = self.clean_page(latch, ins.len() as u32, slot, value.len() as u32);
            if new_slot == 0 {
                let right = match self.split_page(latch) {
                    Ok(right) => right,
                    Err(err) => {
                        latch.unlock(LockMode::Write);
                        self.mgr.unpin_latch(latch);
                        return Err(err);
                    }
                };
                self.split_keys(latch, right)?;
                continue;
            }

            return self.insert_slot(latch, new_slot, &ins, value, kind);
        }
    }

    /// Install a key and value at `slot`, reusing a preceding librarian
    /// when one is there. The page must have been checked for space.
    /// Releases the write lock and pin.
    fn insert_slot(
        &self,
        latch: &LatchSet,
        mut slot: u32,
        key: &[u8],
        value: &[u8],
        kind: SlotKind,
    ) -> BltResult<()> {
        let mut page = SlottedPageMut::new(self.mgr.frame_mut(latch));

        if slot > 1 && page.view().kind(slot - 1) == SlotKind::Librarian {
            slot -= 1;
        }

        let off = page.push_record(key, value);

        // shift from the first reusable dead slot, or grow past the fence
        let cnt = page.view().cnt();
        let mut idx = slot;
        while idx < cnt {
            if page.view().is_dead(idx) {
                break;
            }
            idx += 1;
        }

        let librarian;
        if idx == cnt {
            idx += 2;
            page.set_cnt(cnt + 2);
            librarian = 2;
        } else {
            librarian = 1;
        }
        latch.set_dirty(true);
        let act = page.view().act();
        page.set_act(act + 1);

        while idx > slot + librarian - 1 {
            page.copy_slot(idx, idx - librarian);
            idx -= 1;
        }

        if librarian > 1 {
            page.set_key_offset(slot, off);
            page.set_kind(slot, SlotKind::Librarian);
            page.set_dead(slot, true);
            slot += 1;
        }

        page.set_key_offset(slot, off);
        page.set_kind(slot, kind);
        page.set_dead(slot, false);

        debug_assert!(page.view().validate(), "insert_slot broke the page");

        latch.unlock(LockMode::Write);
        self.mgr.unpin_latch(latch);
        Ok(())
    }

    /// Make room for an insert of `key_len`/`val_len` at `slot`.
    ///
    /// Returns 0 when the page must split. Otherwise compacts the page if
    /// needed — dropping dead records and re-laying a librarian ahead of
    /// every live slot — and returns the slot the key now belongs in.
    fn clean_page(&self, latch: &LatchSet, key_len: u32, slot: u32, val_len: u32) -> u32 {
        let frame = self.mgr.frame_mut(latch);
        let data_size = SlottedPage::new(frame).data_size();
        let view = SlottedPage::new(frame);
        let max = view.cnt();
        let act = view.act();

        debug_assert!(view.validate(), "clean_page entered with a broken page");

        // project the fully cleaned footprint; under 20% headroom means a
        // split is cheaper than churning cleanups
        let records = (1 + key_len + 1 + val_len) * (act + 1);
        let projected = records + (act * 2 + 1) * SLOT_SIZE;
        if (data_size as i64 - projected as i64) < (data_size / 5) as i64 {
            return 0;
        }

        if view.min() >= (max + 2) * SLOT_SIZE + key_len + 1 + val_len + 1 {
            return slot;
        }

        let snapshot = frame.to_vec();
        let src = SlottedPage::new(&snapshot);

        let mut page = SlottedPageMut::new(frame);
        page.zero_data();
        page.set_min(data_size);
        page.set_garbage(0);
        latch.set_dirty(true);

        let mut new_slot = max;
        let mut idx = 0u32;
        let mut act = 0u32;
        for cnt in 1..=max {
            if cnt == slot {
                // the first live slot gets no librarian in front of it
                new_slot = if idx == 0 { 1 } else { idx + 2 };
            }
            if cnt < max && src.is_dead(cnt) {
                continue;
            }

            let off = page.push_record(src.key(cnt), src.value(cnt));

            if idx > 0 {
                idx += 1;
                page.set_key_offset(idx, off);
                page.set_kind(idx, SlotKind::Librarian);
                page.set_dead(idx, true);
            }

            idx += 1;
            page.set_key_offset(idx, off);
            page.set_kind(idx, src.kind(cnt));
            page.set_dead(idx, src.is_dead(cnt));
            if !src.is_dead(cnt) {
                act += 1;
            }
        }
        page.set_cnt(idx);
        page.set_act(act);

        debug_assert!(page.view().validate(), "clean_page broke the page");

        let min = page.view().min();
        if min < data_size / 5 {
            return 0;
        }
        if min > (idx + 2) * SLOT_SIZE + key_len + 1 + val_len + 1 {
            new_slot
        } else {
            // compaction freed less than the projection promised
            0
        }
    }

    /// Split a write-locked full page. The upper half of live slots moves
    /// to a freshly allocated right sibling; the original is rebuilt from
    /// its lower half and left write-locked. Returns the sibling's latch,
    /// pinned and unlocked.
    fn split_page(&self, latch: &LatchSet) -> BltResult<&LatchSet> {
        let frame = self.mgr.frame_mut(latch);
        let src = SlottedPage::new(frame);
        let data_size = src.data_size();
        let lvl = src.lvl();
        let max = src.cnt();
        debug_assert!(max > 1, "splitting a page with a single slot");

        // lay the upper half into a scratch frame
        let mut scratch = vec![0u8; frame.len()];
        {
            let mut right = SlottedPageMut::new(&mut scratch);
            right.set_bits(src.bits());
            right.set_lvl(lvl);
            right.set_min(data_size);

            let mut idx = 0u32;
            let mut act = 0u32;
            let mut cnt = max / 2;
            while cnt < max {
                cnt += 1;
                // the leaf fence travels even when dead
                if (cnt < max || lvl > 0) && src.is_dead(cnt) {
                    continue;
                }

                let off = right.push_record(src.key(cnt), src.value(cnt));

                if idx > 0 {
                    idx += 1;
                    right.set_key_offset(idx, off);
                    right.set_kind(idx, SlotKind::Librarian);
                    right.set_dead(idx, true);
                }

                idx += 1;
                right.set_key_offset(idx, off);
                right.set_kind(idx, src.kind(cnt));
                right.set_dead(idx, src.is_dead(cnt));
                if !src.is_dead(cnt) {
                    act += 1;
                }
            }
            right.set_cnt(idx);
            right.set_act(act);

            if latch.page_no() > ROOT_PAGE {
                right.set_right_no(src.right_no());
            }

            debug_assert!(right.view().validate(), "split built a broken right page");
        }

        let right_latch = self.mgr.new_page(&scratch)?;
        debug!(
            "split page {} at level {lvl} -> {}",
            latch.page_no(),
            right_latch.page_no()
        );

        // rebuild the lower half in place
        let snapshot = frame.to_vec();
        let src = SlottedPage::new(&snapshot);
        let mut page = SlottedPageMut::new(frame);
        page.zero_data();
        page.set_min(data_size);
        page.set_garbage(0);
        page.set_act(0);
        latch.set_dirty(true);

        let mut max = max / 2;
        if src.kind(max) == SlotKind::Librarian {
            max -= 1;
        }

        let mut idx = 0u32;
        let mut act = 0u32;
        for cnt in 1..=max {
            if src.is_dead(cnt) {
                continue;
            }

            let off = page.push_record(src.key(cnt), src.value(cnt));

            if idx > 0 {
                idx += 1;
                page.set_key_offset(idx, off);
                page.set_kind(idx, SlotKind::Librarian);
                page.set_dead(idx, true);
            }

            idx += 1;
            page.set_key_offset(idx, off);
            page.set_kind(idx, src.kind(cnt));
            act += 1;
        }
        page.set_right_no(right_latch.page_no());
        page.set_cnt(idx);
        page.set_act(act);

        debug_assert!(idx > 0, "split left an empty lower half");
        debug_assert!(page.view().validate(), "split broke the lower half");

        Ok(right_latch)
    }

    /// Post both fences of a freshly split pair into the parent level.
    /// Called with the left page write-locked and the right pinned;
    /// everything is released on return.
    fn split_keys(&self, latch: &LatchSet, right: &LatchSet) -> BltResult<()> {
        if latch.page_no() == ROOT_PAGE {
            return self.split_root(latch, right);
        }

        let left_page = SlottedPage::new(self.mgr.frame(latch));
        let lvl = left_page.lvl();
        let left_key = left_page.key(left_page.cnt()).to_vec();

        let right_page = SlottedPage::new(self.mgr.frame(right));
        let right_key = right_page.key(right_page.cnt()).to_vec();

        right.lock(LockMode::Parent);
        latch.lock(LockMode::Parent);
        latch.unlock(LockMode::Write);

        // the left block shrank: post its new fence
        let mut value = [0u8; ID_SIZE];
        put_id(&mut value, latch.page_no());
        self.insert_key(&left_key, lvl + 1, &value, true)?;

        // the old fence moves over to the new right block
        put_id(&mut value, right.page_no());
        self.insert_key(&right_key, lvl + 1, &value, true)?;

        latch.unlock(LockMode::Parent);
        self.mgr.unpin_latch(latch);
        right.unlock(LockMode::Parent);
        self.mgr.unpin_latch(right);
        Ok(())
    }

    /// Split the root: move its contents into a fresh left child and
    /// rewrite the root as a two-entry node one level up.
    fn split_root(&self, root: &LatchSet, right: &LatchSet) -> BltResult<()> {
        let frame = self.mgr.frame_mut(root);
        let view = SlottedPage::new(frame);
        let data_size = view.data_size();
        let lvl = view.lvl();
        let left_key = view.key(view.cnt()).to_vec();

        let left_latch = self.mgr.new_page(frame)?;
        let left_no = left_latch.page_no();
        self.mgr.unpin_latch(left_latch);
        debug!("root split: level {} -> {}, left child {left_no}", lvl, lvl + 1);

        let mut page = SlottedPageMut::new(frame);
        page.zero_data();
        page.set_min(data_size);
        page.set_garbage(0);

        // stopper -> the upper half the split just produced
        let mut value = [0u8; ID_SIZE];
        put_id(&mut value, right.page_no());
        let off = page.push_record(&STOPPER_KEY, &value);
        page.set_key_offset(2, off);

        // left fence -> the child that inherited the old contents
        put_id(&mut value, left_no);
        let off = page.push_record(&left_key, &value);
        page.set_key_offset(1, off);

        page.set_right_no(0);
        page.set_cnt(2);
        page.set_act(2);
        page.set_lvl(lvl + 1);
        root.set_dirty(true);

        debug_assert!(page.view().validate(), "root split broke the root");

        root.unlock(LockMode::Write);
        self.mgr.unpin_latch(root);
        self.mgr.unpin_latch(right);
        Ok(())
    }

    /// Find and delete `key` at `lvl`, marking its slot dead. Deleting an
    /// absent or already-dead key succeeds. Handles fence replacement,
    /// root collapse and empty-page absorption.
    pub fn delete_key(&self, key: &[u8], lvl: u8) -> BltResult<()> {
        if lvl == 0 {
            check_user_key(key)?;
        }

        let (latch, found_slot) = self.mgr.page_fetch(key, lvl, LockMode::Write)?;
        let page = SlottedPage::new(self.mgr.frame(latch));

        let mut slot = found_slot;
        if page.kind(slot) == SlotKind::Librarian {
            slot += 1;
        }

        let fence = slot == page.cnt();
        let mut found = page.key(slot) == key;
        if found {
            found = !page.is_dead(slot);
        }

        if found {
            let dead_bytes = (page.key(slot).len() + 1 + page.value(slot).len() + 1) as u32;
            let mut page = SlottedPageMut::new(self.mgr.frame_mut(latch));
            page.set_dead(slot, true);
            let garbage = page.view().garbage();
            page.set_garbage(garbage + dead_bytes);
            let act = page.view().act();
            page.set_act(act - 1);

            // squeeze trailing dead slots up under the fence
            loop {
                let cnt = page.view().cnt();
                if cnt <= 1 || !page.view().is_dead(cnt - 1) {
                    break;
                }
                page.copy_slot(cnt - 1, cnt);
                page.clear_slot(cnt);
                page.set_cnt(cnt - 1);
            }

            debug_assert!(page.view().validate(), "delete broke the page");
        }

        let page = SlottedPage::new(self.mgr.frame(latch));

        // a fence key left an upper page: replace it in the parent
        if found && lvl > 0 && page.act() > 0 && fence {
            return self.fix_fence(latch, lvl);
        }

        // the root is down to one live child
        if lvl > 1 && latch.page_no() == ROOT_PAGE && page.act() == 1 {
            return self.collapse_root(latch);
        }

        // nothing live left: absorb the right sibling
        if page.act() == 0 {
            return self.delete_page(latch);
        }

        latch.set_dirty(true);
        latch.unlock(LockMode::Write);
        self.mgr.unpin_latch(latch);
        Ok(())
    }

    /// A fence key was deleted; push the page's new (smaller) fence into
    /// the parent and retire the old one. Called write-locked, returns
    /// with everything released.
    fn fix_fence(&self, latch: &LatchSet, lvl: u8) -> BltResult<()> {
        let mut page = SlottedPageMut::new(self.mgr.frame_mut(latch));
        let cnt = page.view().cnt();
        let old_fence = page.view().key(cnt).to_vec();
        page.clear_slot(cnt);
        page.set_cnt(cnt - 1);
        latch.set_dirty(true);

        let new_fence = page.view().key(cnt - 1).to_vec();

        debug_assert!(page.view().validate(), "fix_fence broke the page");

        let mut value = [0u8; ID_SIZE];
        put_id(&mut value, latch.page_no());

        latch.lock(LockMode::Parent);
        latch.unlock(LockMode::Write);

        self.insert_key(&new_fence, lvl + 1, &value, true)?;
        self.delete_key(&old_fence, lvl + 1)?;

        latch.unlock(LockMode::Parent);
        self.mgr.unpin_latch(latch);
        Ok(())
    }

    /// The root has a single live child: pull the child's contents up,
    /// repeating until the root holds more than one entry or reaches the
    /// leaf level. Called with the root write-locked.
    fn collapse_root(&self, root: &LatchSet) -> BltResult<()> {
        loop {
            let page = SlottedPage::new(self.mgr.frame(root));
            let mut idx = 1;
            while idx <= page.cnt() && page.is_dead(idx) {
                idx += 1;
            }
            if idx > page.cnt() {
                root.unlock(LockMode::Write);
                self.mgr.unpin_latch(root);
                return Err(BltError::Struct("root has no live child entry"));
            }
            let child_no = get_id(page.value(idx));
            debug!("collapsing root: promoting child {child_no}");

            let child = self.mgr.pin_latch(child_no, true)?;
            child.lock(LockMode::Delete);
            child.lock(LockMode::Write);

            self.mgr
                .frame_mut(root)
                .copy_from_slice(self.mgr.frame(child));
            root.set_dirty(true);
            self.mgr.page_free(child);

            let page = SlottedPage::new(self.mgr.frame(root));
            if !(page.lvl() > 1 && page.act() == 1) {
                break;
            }
        }

        debug_assert!(
            SlottedPage::new(self.mgr.frame(root)).validate(),
            "root collapse broke the root"
        );

        root.unlock(LockMode::Write);
        self.mgr.unpin_latch(root);
        Ok(())
    }

    /// An upper-level page ran out of live keys: pull the right sibling's
    /// contents into it (keeping this page's id stable for its parent),
    /// mark the sibling Kill, swap the fences in the parent, then free the
    /// sibling. Called write-locked, returns with everything released.
    fn delete_page(&self, latch: &LatchSet) -> BltResult<()> {
        let page = SlottedPage::new(self.mgr.frame(latch));
        let lvl = page.lvl();
        let lower_fence = page.key(page.cnt()).to_vec();
        let right_no = page.right_no();
        if right_no == 0 {
            latch.unlock(LockMode::Write);
            self.mgr.unpin_latch(latch);
            return Err(BltError::Struct("rightmost page emptied"));
        }

        let right = self.mgr.pin_latch(right_no, true)?;
        right.lock(LockMode::Write);

        let right_page = SlottedPage::new(self.mgr.frame(right));
        let higher_fence = right_page.key(right_page.cnt()).to_vec();
        if right_page.is_kill() {
            right.unlock(LockMode::Write);
            self.mgr.unpin_latch(right);
            latch.unlock(LockMode::Write);
            self.mgr.unpin_latch(latch);
            return Err(BltError::Struct("right sibling is mid-deletion"));
        }

        debug!(
            "absorbing page {} into empty page {}",
            right_no,
            latch.page_no()
        );

        self.mgr
            .frame_mut(latch)
            .copy_from_slice(self.mgr.frame(right));
        latch.set_dirty(true);

        // tombstone the absorbed page, pointing back left, until the
        // parent stops referencing it
        {
            let mut right_mut = SlottedPageMut::new(self.mgr.frame_mut(right));
            right_mut.set_right_no(latch.page_no());
            right_mut.set_kill(true);
        }
        right.set_dirty(true);

        let mut value = [0u8; ID_SIZE];
        put_id(&mut value, latch.page_no());

        right.lock(LockMode::Parent);
        right.unlock(LockMode::Write);
        latch.lock(LockMode::Parent);
        latch.unlock(LockMode::Write);

        self.insert_key(&higher_fence, lvl + 1, &value, true)?;
        self.delete_key(&lower_fence, lvl + 1)?;

        right.unlock(LockMode::Parent);
        right.lock(LockMode::Delete);
        right.lock(LockMode::Write);
        self.mgr.page_free(right);

        latch.unlock(LockMode::Parent);
        self.mgr.unpin_latch(latch);
        Ok(())
    }

    /// Look up `key` at the leaf level.
    ///
    /// Returns the number of value bytes copied (capped at `val_max`), or
    /// -1 when the key is absent, along with the nearest key actually
    /// found and the value bytes. Duplicate-typed slots compare with their
    /// 6-byte sequence suffix truncated.
    pub fn find_key(&self, key: &[u8], val_max: usize) -> BltResult<(i32, Vec<u8>, Vec<u8>)> {
        let mut found = -1i32;
        let mut found_key = Vec::new();
        let mut found_value = Vec::new();

        let (mut latch, mut slot) = self.mgr.page_fetch(key, 0, LockMode::Read)?;

        while slot > 0 {
            let page = SlottedPage::new(self.mgr.frame(latch));

            if page.kind(slot) == SlotKind::Librarian {
                slot += 1;
            }

            let ptr = page.key(slot);
            found_key = ptr.to_vec();

            let mut key_len = ptr.len();
            if page.kind(slot) == SlotKind::Duplicate {
                key_len -= ID_SIZE;
            }

            // the stopper on the rightmost page means we ran out of keys
            if slot == page.cnt() && page.right_no() == 0 {
                break;
            }

            if page.is_dead(slot) {
                match self.find_next(&mut latch, slot) {
                    Ok(0) => break,
                    Ok(next) => {
                        slot = next;
                        continue;
                    }
                    Err(err) => {
                        latch.unlock(LockMode::Read);
                        self.mgr.unpin_latch(latch);
                        return Err(err);
                    }
                }
            }

            if key_len == key.len() && &ptr[..key_len] == key {
                let value = page.value(slot);
                let n = val_max.min(value.len());
                found_value = value[..n].to_vec();
                found = n as i32;
            }
            break;
        }

        latch.unlock(LockMode::Read);
        self.mgr.unpin_latch(latch);
        Ok((found, found_key, found_value))
    }

    /// Advance a read cursor one slot, sliding into the right sibling when
    /// the current page is exhausted. Returns the next slot, or 0 at the
    /// end of the level. Swaps the held read latch on a slide.
    fn find_next<'m>(&'m self, latch: &mut &'m LatchSet, slot: u32) -> BltResult<u32> {
        let page = SlottedPage::new(self.mgr.frame(latch));
        if slot < page.cnt() {
            return Ok(slot + 1);
        }

        let right_no = page.right_no();
        if right_no == 0 {
            return Ok(0);
        }

        let right = self.mgr.pin_latch(right_no, true)?;

        // lock chaining: Access on the new page before dropping the old read
        right.lock(LockMode::Access);
        latch.unlock(LockMode::Read);
        self.mgr.unpin_latch(latch);
        right.lock(LockMode::Read);
        right.unlock(LockMode::Access);

        *latch = right;
        Ok(1)
    }

    /// Enumerate live unique keys in `[lower, upper]` (either bound
    /// optional). Each page is copied under a brief read latch and walked
    /// from the copy; concurrent mutations may be missed or seen twice,
    /// equivalent to interleaved point reads.
    pub fn range_scan(
        &self,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> BltResult<RangeIter> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

        let mut cur = vec![0u8; self.mgr.page_size()];
        let mut slot = {
            let (latch, slot) = self
                .mgr
                .page_fetch(lower.unwrap_or(&[]), 0, LockMode::Read)?;
            cur.copy_from_slice(self.mgr.frame(latch));
            latch.unlock(LockMode::Read);
            self.mgr.unpin_latch(latch);
            slot
        };

        loop {
            let mut done = false;
            let right_no;
            {
                let page = SlottedPage::new(&cur);
                right_no = page.right_no();

                while slot <= page.cnt() {
                    if page.is_dead(slot) || page.kind(slot) != SlotKind::Unique {
                        slot += 1;
                        continue;
                    }
                    let key = page.key(slot);
                    if key == STOPPER_KEY {
                        done = true;
                        break;
                    }
                    if upper.is_some_and(|upper| key > upper) {
                        done = true;
                        break;
                    }
                    if lower.is_some_and(|lower| key < lower) {
                        slot += 1;
                        continue;
                    }
                    entries.push((key.to_vec(), page.value(slot).to_vec()));
                    slot += 1;
                }
            }

            if done || right_no == 0 {
                break;
            }

            let latch = self.mgr.pin_latch(right_no, true)?;
            latch.lock(LockMode::Read);
            cur.copy_from_slice(self.mgr.frame(latch));
            latch.unlock(LockMode::Read);
            self.mgr.unpin_latch(latch);
            slot = 1;
        }

        Ok(RangeIter {
            entries: entries.into_iter(),
        })
    }
}
