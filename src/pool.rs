//! # Internal Buffer Manager
//!
//! The engine interposes its own fixed-size buffer pool between the tree
//! algorithms and the host pool. Frames are found through a chained hash
//! table keyed by logical page number, pinned with a counter whose high bit
//! implements second-chance eviction, and written back through the host on
//! eviction and close.
//!
//! ```text
//! BufMgr
//! ├── hash_table[b]: Mutex<u32>      bucket head -> latch chain
//! ├── latches[s]:    LatchSet        locks + pin + chain links
//! ├── frames[s]:     Box<[u8]>       one full page image per latch
//! ├── page_zero:     Mutex           alloc high water + free chain head
//! ├── dups:          AtomicU64       duplicate-key sequence source
//! └── page_map:      Mutex<HashMap>  logical page no -> host page id
//! ```
//!
//! ## Lookup and eviction
//!
//! `pin_latch` locks the target bucket for the whole operation. A chain hit
//! just bumps the pin. A miss first claims a virgin slot via the
//! `latch_deployed` counter; once the pool is exhausted the clock sweep
//! advances `latch_victim`, try-locking each candidate's bucket (candidates
//! hashing into the target bucket are skipped — its lock is already held).
//! A pinned candidate is passed over; a candidate holding only its clock
//! bit loses the bit and survives one more sweep; anything else is written
//! back to the host, unlinked, and relinked under the new page number.
//!
//! ## Page identity
//!
//! Tree pages reference each other exclusively by logical page number, and
//! the hash table is the single point of resolution. The logical-to-host
//! mapping lives in `page_map` and is checkpointed on close into PageZero's
//! data region, spilling into a chain of extra host pages when it outgrows
//! one (see [`BufMgr::close`]). Reopening a tree replays that chain and
//! resumes without touching any tree structure.
//!
//! ## Frame access
//!
//! Frames are handed out as plain byte slices. The latch protocol is what
//! makes this sound: a frame is only read under its ReadWrite lock (or by
//! the single thread that just claimed it) and only written under the
//! exclusive side, and a pinned frame cannot be evicted from under its
//! users.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::config::{
    HostPageId, PageNo, ALLOC_PAGE, CLOCK_BIT, HASH_CHAIN_MIN, ID_SIZE, MAP_CHAIN_END,
    MAP_ENTRY_SIZE, MAP_HEADER_SIZE, MAX_BITS, MIN_BITS, MIN_LEVEL, PAGE_HEADER_SIZE,
    PAGE_ZERO_CHAIN, PAGE_ZERO_DUPS, PAGE_ZERO_MAP, ROOT_PAGE,
};
use crate::error::{BltError, BltResult};
use crate::host::HostPool;
use crate::latch::{LatchSet, LockMode};
use crate::page::{get_id, put_id, SlottedPage, SlottedPageMut, STOPPER_KEY};

/// Allocation state kept in PageZero: the high-water mark for fresh page
/// numbers and the head of the free page chain.
struct PageZero {
    alloc_right: PageNo,
    chain: PageNo,
}

struct FramePool {
    frames: Vec<UnsafeCell<Box<[u8]>>>,
}

// SAFETY: concurrent access to individual frames is mediated by the latch
// protocol (ReadWrite lock per frame, pins against eviction); the Vec
// itself is never resized after construction.
unsafe impl Sync for FramePool {}

impl std::fmt::Debug for BufMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufMgr")
            .field("page_size", &self.page_size)
            .field("page_bits", &self.page_bits)
            .finish_non_exhaustive()
    }
}

pub struct BufMgr {
    page_size: usize,
    page_bits: u8,
    page_data_size: u32,

    host: Arc<dyn HostPool>,
    page_zero: Mutex<PageZero>,
    dups: AtomicU64,

    latch_total: u32,
    latch_hash: u64,
    latch_deployed: AtomicU32,
    latch_victim: AtomicU32,
    hash_table: Vec<Mutex<u32>>,
    latches: Vec<LatchSet>,
    frames: FramePool,
    page_map: Mutex<HashMap<PageNo, HostPageId>>,

    reads: AtomicU64,
    writes: AtomicU64,
}

impl BufMgr {
    /// Construct a buffer manager over `host`, creating a fresh tree, or —
    /// when `last_page_zero` carries the host id saved from a previous
    /// [`BufMgr::close`] — reopening the existing one.
    pub fn open(
        bits: u8,
        node_max: usize,
        host: Arc<dyn HostPool>,
        last_page_zero: Option<HostPageId>,
    ) -> BltResult<Arc<BufMgr>> {
        if !(MIN_BITS..=MAX_BITS).contains(&bits) {
            return Err(BltError::Config(format!(
                "page bits {bits} outside [{MIN_BITS}, {MAX_BITS}]"
            )));
        }
        if node_max < HASH_CHAIN_MIN {
            return Err(BltError::Config(format!(
                "buffer pool of {node_max} pages is below the minimum of {HASH_CHAIN_MIN}"
            )));
        }

        let page_size = 1usize << bits;
        let latch_total = node_max as u32;
        let latch_hash = (node_max / HASH_CHAIN_MIN) as u64;

        let mgr = BufMgr {
            page_size,
            page_bits: bits,
            page_data_size: (page_size - PAGE_HEADER_SIZE) as u32,
            host,
            page_zero: Mutex::new(PageZero {
                alloc_right: (MIN_LEVEL + 1) as PageNo,
                chain: 0,
            }),
            dups: AtomicU64::new(0),
            latch_total,
            latch_hash,
            latch_deployed: AtomicU32::new(0),
            latch_victim: AtomicU32::new(0),
            hash_table: (0..latch_hash).map(|_| Mutex::new(0)).collect(),
            latches: (0..latch_total).map(LatchSet::new).collect(),
            frames: FramePool {
                frames: (0..latch_total)
                    .map(|_| UnsafeCell::new(vec![0u8; page_size].into_boxed_slice()))
                    .collect(),
            },
            page_map: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        };

        match last_page_zero {
            Some(host_id) => mgr.reopen(host_id)?,
            None => mgr.create_tree()?,
        }

        Ok(Arc::new(mgr))
    }

    /// Write PageZero, the initial root and the first leaf through the host.
    fn create_tree(&self) -> BltResult<()> {
        let mut frame = vec![0u8; self.page_size];
        {
            let mut page = SlottedPageMut::new(&mut frame);
            page.set_bits(self.page_bits);
            page.set_right_no((MIN_LEVEL + 1) as PageNo);
        }
        self.page_out(&frame, ALLOC_PAGE, true)?;

        // each level gets a stopper; above the leaf it points one page down
        for lvl in (0..MIN_LEVEL).rev() {
            let page_no = (MIN_LEVEL - lvl) as PageNo;
            frame.fill(0);
            let mut page = SlottedPageMut::new(&mut frame);
            page.set_bits(self.page_bits);
            page.set_lvl(lvl);
            page.set_min(self.page_data_size);

            let mut value = [0u8; ID_SIZE];
            let value: &[u8] = if lvl > 0 {
                put_id(&mut value, page_no + 1);
                &value
            } else {
                &[]
            };
            let off = page.push_record(&STOPPER_KEY, value);
            page.set_key_offset(1, off);
            page.set_cnt(1);
            page.set_act(1);

            self.page_out(&frame, page_no, true)?;
        }

        Ok(())
    }

    /// Restore allocation state and the id map from a checkpointed PageZero.
    fn reopen(&self, page_zero_id: HostPageId) -> BltResult<()> {
        let hpage = self.host.fetch_page(page_zero_id)?;
        let mut frame = vec![0u8; self.page_size];
        hpage.read_into(&mut frame)?;
        self.host.unpin_page(page_zero_id, false)?;

        let page = SlottedPage::new(&frame);
        if page.bits() != self.page_bits {
            return Err(BltError::Config(format!(
                "tree was created with page bits {}, reopened with {}",
                page.bits(),
                self.page_bits
            )));
        }

        let data = page.data();
        {
            let mut zero = self.page_zero.lock();
            zero.alloc_right = page.right_no();
            zero.chain = get_id(&data[PAGE_ZERO_CHAIN..PAGE_ZERO_CHAIN + ID_SIZE]);
        }
        let dups = u64::from_le_bytes(data[PAGE_ZERO_DUPS..PAGE_ZERO_DUPS + 8].try_into().unwrap());
        self.dups.store(dups, Ordering::Release);

        self.load_id_map(&frame)?;
        trace!(
            "reopened from host page {page_zero_id}: {} mapped pages",
            self.page_map.lock().len()
        );
        Ok(())
    }

    /// Walk the id-map chain starting inside the given PageZero image.
    /// Continuation pages are consumed: read, unpinned, and handed back to
    /// the host for reuse.
    fn load_id_map(&self, page_zero_frame: &[u8]) -> BltResult<()> {
        let mut frame = page_zero_frame.to_vec();
        let mut record_start = PAGE_HEADER_SIZE + PAGE_ZERO_MAP;

        loop {
            let record = &frame[record_start..];
            let next = u32::from_le_bytes(record[..4].try_into().unwrap());
            let count = u32::from_le_bytes(record[4..8].try_into().unwrap()) as usize;

            let mut map = self.page_map.lock();
            for i in 0..count {
                let entry = &record[MAP_HEADER_SIZE + i * MAP_ENTRY_SIZE..];
                let page_no = u64::from_le_bytes(entry[..8].try_into().unwrap());
                let host_id = u32::from_le_bytes(entry[8..12].try_into().unwrap()) as HostPageId;
                map.insert(page_no, host_id);
            }
            drop(map);

            if next == MAP_CHAIN_END {
                return Ok(());
            }

            let next_id = next as HostPageId;
            let hpage = self.host.fetch_page(next_id)?;
            hpage.read_into(&mut frame)?;
            self.host.unpin_page(next_id, false)?;
            self.host.deallocate_page(next_id, true)?;
            record_start = PAGE_HEADER_SIZE;
        }
    }

    pub fn page_bits(&self) -> u8 {
        self.page_bits
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages read in from the host.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Pages written out to the host.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Next value of the duplicate-key sequence.
    pub(crate) fn next_dup(&self) -> u64 {
        self.dups.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The host page holding PageZero; the caller keeps this to reopen the
    /// tree after [`BufMgr::close`].
    pub fn page_zero_host_id(&self) -> BltResult<HostPageId> {
        self.page_map
            .lock()
            .get(&ALLOC_PAGE)
            .copied()
            .ok_or(BltError::Host("page zero has no host mapping"))
    }

    /// Shared view of the frame owned by `latch`.
    ///
    /// The caller must hold the latch's ReadWrite lock (either side) or
    /// otherwise be the frame's only user per the latch protocol.
    pub(crate) fn frame(&self, latch: &LatchSet) -> &[u8] {
        // SAFETY: the latch pin keeps this frame from being evicted and
        // repurposed; the lock protocol keeps writers exclusive.
        unsafe { &*self.frames.frames[latch.entry() as usize].get() }
    }

    /// Exclusive view of the frame owned by `latch`.
    ///
    /// The caller must hold the latch's ReadWrite lock exclusively or be
    /// the thread that just claimed or created the frame.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn frame_mut(&self, latch: &LatchSet) -> &mut [u8] {
        // SAFETY: as for `frame`, with exclusivity supplied by the caller's
        // Write lock (or sole ownership of a just-claimed frame).
        unsafe { &mut *self.frames.frames[latch.entry() as usize].get() }
    }

    /// Copy a page from the host into `frame`.
    fn page_in(&self, frame: &mut [u8], page_no: PageNo) -> BltResult<()> {
        trace!("page-in {page_no}");
        let host_id = self
            .page_map
            .lock()
            .get(&page_no)
            .copied()
            .ok_or(BltError::Read("page has no host mapping"))?;

        let hpage = self.host.fetch_page(host_id)?;
        hpage.read_into(frame)?;
        self.host.unpin_page(host_id, false)
    }

    /// Write a page image through to the host, allocating and recording a
    /// host page the first time a logical page goes out.
    fn page_out(&self, frame: &[u8], page_no: PageNo, is_dirty: bool) -> BltResult<()> {
        trace!("page-out {page_no} dirty={is_dirty}");
        let existing = self.page_map.lock().get(&page_no).copied();

        match existing {
            None => {
                let hpage = self.host.new_page().map_err(|_| BltError::Overflow)?;
                if is_dirty {
                    hpage.write_from(frame)?;
                }
                self.page_map.lock().insert(page_no, hpage.id());
                self.host.unpin_page(hpage.id(), is_dirty)
            }
            Some(host_id) => {
                let hpage = self.host.fetch_page(host_id)?;
                if is_dirty {
                    hpage.write_from(frame)?;
                }
                self.host.unpin_page(host_id, is_dirty)
            }
        }
    }

    /// Thread a claimed slot into its bucket chain and take ownership of
    /// `page_no`, loading the page image from the host when asked.
    fn latch_link(&self, bucket: &mut u32, slot: u32, page_no: PageNo, load: bool) -> BltResult<()> {
        let latch = &self.latches[slot as usize];

        latch.set_next(*bucket);
        if *bucket != 0 {
            self.latches[*bucket as usize].set_prev(slot);
        }
        *bucket = slot;

        latch.set_page_no(page_no);
        latch.set_prev(0);
        latch.reset_pin();

        if load {
            self.page_in(self.frame_mut(latch), page_no)?;
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Find or establish the frame for `page_no` and pin it.
    ///
    /// With `load` set, a newly claimed frame is filled from the host;
    /// without it, the caller takes the frame as-is and overwrites it.
    pub(crate) fn pin_latch(&self, page_no: PageNo, load: bool) -> BltResult<&LatchSet> {
        let hash_idx = (page_no % self.latch_hash) as usize;
        let mut bucket = self.hash_table[hash_idx].lock();

        // chain hit: just another pin
        let mut slot = *bucket;
        while slot != 0 {
            let latch = &self.latches[slot as usize];
            if latch.page_no() == page_no {
                latch.pin();
                return Ok(latch);
            }
            slot = latch.next();
        }

        // virgin pool slots first
        let slot = self.latch_deployed.fetch_add(1, Ordering::AcqRel) + 1;
        if slot < self.latch_total {
            self.latch_link(&mut *bucket, slot, page_no, load)?;
            return Ok(&self.latches[slot as usize]);
        }
        self.latch_deployed.fetch_sub(1, Ordering::AcqRel);

        // pool is full: run the clock over the other buckets
        loop {
            let slot = self.latch_victim.fetch_add(1, Ordering::AcqRel) % self.latch_total;
            if slot == 0 {
                continue;
            }
            let latch = &self.latches[slot as usize];
            let victim_idx = (latch.page_no() % self.latch_hash) as usize;
            if victim_idx == hash_idx {
                continue;
            }
            let Some(mut victim_bucket) = self.hash_table[victim_idx].try_lock() else {
                continue;
            };

            let pin = latch.pin_word();
            if pin > 0 {
                if pin & CLOCK_BIT != 0 {
                    latch.clear_clock_bit();
                }
                continue;
            }

            trace!("evict page {} from slot {slot}", latch.page_no());
            self.page_out(self.frame(latch), latch.page_no(), latch.is_dirty())?;
            latch.set_dirty(false);
            self.writes.fetch_add(1, Ordering::Relaxed);

            // unlink from the old chain; the old bucket stays locked until
            // the slot is fully repurposed, so no one else can claim it
            if latch.prev() != 0 {
                self.latches[latch.prev() as usize].set_next(latch.next());
            } else {
                *victim_bucket = latch.next();
            }
            if latch.next() != 0 {
                self.latches[latch.next() as usize].set_prev(latch.prev());
            }

            self.latch_link(&mut *bucket, slot, page_no, load)?;
            drop(victim_bucket);
            return Ok(latch);
        }
    }

    /// Drop one pin, arming the frame's second chance.
    pub(crate) fn unpin_latch(&self, latch: &LatchSet) {
        latch.unpin();
    }

    /// Allocate a page: reuse the free chain head when there is one, else
    /// take the next page number. Returns the latch pinned but unlocked,
    /// its frame holding a copy of `contents`.
    pub(crate) fn new_page(&self, contents: &[u8]) -> BltResult<&LatchSet> {
        let mut zero = self.page_zero.lock();

        let chain_head = zero.chain;
        if chain_head > 0 {
            let latch = self.pin_latch(chain_head, true)?;
            let frame = self.frame_mut(latch);
            zero.chain = SlottedPage::new(frame).right_no();
            drop(zero);

            frame.copy_from_slice(contents);
            latch.set_dirty(true);
            return Ok(latch);
        }

        let page_no = zero.alloc_right;
        zero.alloc_right += 1;
        drop(zero);

        // a fresh number was never written out, so the frame is not loaded
        let latch = self.pin_latch(page_no, false)?;
        self.frame_mut(latch).copy_from_slice(contents);
        latch.set_dirty(true);
        Ok(latch)
    }

    /// Return a page to the free chain. Called with the page Delete- and
    /// Write-locked; both locks and the pin are released here.
    pub(crate) fn page_free(&self, latch: &LatchSet) {
        let mut zero = self.page_zero.lock();

        let mut page = SlottedPageMut::new(self.frame_mut(latch));
        page.set_right_no(zero.chain);
        page.set_free(true);
        zero.chain = latch.page_no();
        latch.set_dirty(true);
        trace!("freed page {}", latch.page_no());

        latch.unlock(LockMode::Delete);
        latch.unlock(LockMode::Write);
        self.unpin_latch(latch);
    }

    /// Lock-coupled descent to the page responsible for `key` at `lvl`.
    ///
    /// Returns the slot found by [`SlottedPage::find_slot`] with the page
    /// pinned and locked in the requested mode; pages above the target
    /// level are only ever read-locked, and each level is released once the
    /// next one is latched. Killed pages and fence misses slide right along
    /// the sibling chain instead of restarting from the root.
    pub(crate) fn page_fetch(
        &self,
        key: &[u8],
        lvl: u8,
        lock: LockMode,
    ) -> BltResult<(&LatchSet, u32)> {
        fn release_prev<'m>(mgr: &'m BufMgr, prev: &mut Option<(&'m LatchSet, LockMode)>) {
            if let Some((latch, mode)) = prev.take() {
                latch.unlock(mode);
                mgr.unpin_latch(latch);
            }
        }

        let mut page_no = ROOT_PAGE;
        let mut drill = 0xffu8;
        let mut prev: Option<(&LatchSet, LockMode)> = None;

        while page_no > 0 {
            let mode = if drill == lvl { lock } else { LockMode::Read };

            let latch = match self.pin_latch(page_no, true) {
                Ok(latch) => latch,
                Err(err) => {
                    release_prev(self, &mut prev);
                    return Err(err);
                }
            };

            // serialise with delete_page before touching the frame
            if page_no > ROOT_PAGE {
                latch.lock(LockMode::Access);
            }

            release_prev(self, &mut prev);

            latch.lock(mode);

            let page = SlottedPage::new(self.frame(latch));

            if page.is_free() {
                latch.unlock(mode);
                if page_no > ROOT_PAGE {
                    latch.unlock(LockMode::Access);
                }
                self.unpin_latch(latch);
                return Err(BltError::Struct("descent reached a free page"));
            }

            if page_no > ROOT_PAGE {
                latch.unlock(LockMode::Access);
            }

            // the root may have grown since the drill level was assumed
            if page.lvl() != drill {
                if latch.page_no() != ROOT_PAGE {
                    latch.unlock(mode);
                    self.unpin_latch(latch);
                    return Err(BltError::Struct("level mismatch below the root"));
                }

                drill = page.lvl();
                if lock != LockMode::Read && drill == lvl {
                    latch.unlock(mode);
                    self.unpin_latch(latch);
                    continue;
                }
            }

            prev = Some((latch, mode));

            if page.is_kill() {
                page_no = page.right_no();
                continue;
            }

            let mut slot = page.find_slot(key);
            if slot == 0 {
                page_no = page.right_no();
                continue;
            }

            if drill == lvl {
                return Ok((latch, slot));
            }

            // descend through the first live slot at or after the match
            let mut slide = false;
            while page.is_dead(slot) {
                if slot < page.cnt() {
                    slot += 1;
                } else {
                    slide = true;
                    break;
                }
            }
            if slide {
                page_no = page.right_no();
                continue;
            }

            page_no = get_id(page.value(slot));
            drill -= 1;
        }

        release_prev(self, &mut prev);
        Err(BltError::Struct("descent fell off the right sibling chain"))
    }

    /// Flush, checkpoint, and destroy freed pages. The tree must be
    /// quiescent; afterwards the manager holds no host pins and the host id
    /// from [`BufMgr::page_zero_host_id`] is enough to reopen.
    pub fn close(&self) -> BltResult<()> {
        let deployed = self
            .latch_deployed
            .load(Ordering::Acquire)
            .min(self.latch_total - 1);

        let mut flushed = 0usize;
        for slot in 1..=deployed {
            let latch = &self.latches[slot as usize];
            if latch.is_dirty() {
                self.page_out(self.frame(latch), latch.page_no(), true)?;
                latch.set_dirty(false);
                flushed += 1;
            }
        }
        debug!("{flushed} dirty pages flushed");

        self.drop_free_pages()?;
        self.checkpoint()
    }

    /// Enumerate the free chain and hand every page on it back to the host.
    /// Their numbers are never reused after a restart.
    fn drop_free_pages(&self) -> BltResult<()> {
        let mut zero = self.page_zero.lock();

        let mut free_pages = Vec::new();
        let mut next = zero.chain;
        while next > 0 {
            let latch = self.pin_latch(next, true)?;
            let page = SlottedPage::new(self.frame(latch));
            let is_free = page.is_free();
            let right = page.right_no();
            self.unpin_latch(latch);

            if !is_free {
                break;
            }
            free_pages.push(next);
            next = right;
        }
        zero.chain = 0;
        drop(zero);

        let mut map = self.page_map.lock();
        for page_no in free_pages {
            if let Some(host_id) = map.remove(&page_no) {
                self.host.deallocate_page(host_id, true)?;
                trace!("deallocated host page {host_id} for freed page {page_no}");
            }
        }
        Ok(())
    }

    /// Serialise PageZero: allocation state, duplicate sequence, free chain
    /// head, and the id map — spilling into a chain of host pages linked by
    /// next-host-id fields when one page is not enough.
    fn checkpoint(&self) -> BltResult<()> {
        let zero = self.page_zero.lock();
        let entries: Vec<(PageNo, HostPageId)> = {
            let map = self.page_map.lock();
            map.iter().map(|(&k, &v)| (k, v)).collect()
        };

        let mut frame = vec![0u8; self.page_size];
        {
            let mut page = SlottedPageMut::new(&mut frame);
            page.set_bits(self.page_bits);
            page.set_right_no(zero.alloc_right);
        }
        let data = &mut frame[PAGE_HEADER_SIZE..];
        data[PAGE_ZERO_DUPS..PAGE_ZERO_DUPS + 8]
            .copy_from_slice(&self.dups.load(Ordering::Acquire).to_le_bytes());
        put_id(&mut data[PAGE_ZERO_CHAIN..PAGE_ZERO_CHAIN + ID_SIZE], zero.chain);
        drop(zero);

        let data_size = self.page_data_size as usize;
        let first_cap = (data_size - PAGE_ZERO_MAP - MAP_HEADER_SIZE) / MAP_ENTRY_SIZE;
        let cont_cap = (data_size - MAP_HEADER_SIZE) / MAP_ENTRY_SIZE;

        let (first, rest) = entries.split_at(first_cap.min(entries.len()));
        let chunks: Vec<&[(PageNo, HostPageId)]> = rest.chunks(cont_cap).collect();

        // continuation pages are allocated up front so every record can
        // name its successor before it is written
        let mut cont_pages = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            cont_pages.push(self.host.new_page()?);
        }

        let next_of = |i: usize| -> u32 {
            cont_pages
                .get(i)
                .map(|p| p.id() as u32)
                .unwrap_or(MAP_CHAIN_END)
        };

        write_map_record(
            &mut frame[PAGE_HEADER_SIZE + PAGE_ZERO_MAP..],
            next_of(0),
            first,
        );

        let mut cont_frame = vec![0u8; self.page_size];
        for (i, chunk) in chunks.iter().enumerate() {
            cont_frame.fill(0);
            write_map_record(&mut cont_frame[PAGE_HEADER_SIZE..], next_of(i + 1), chunk);
            cont_pages[i].write_from(&cont_frame)?;
            self.host.unpin_page(cont_pages[i].id(), true)?;
        }

        debug!(
            "checkpointed {} id mappings across {} host pages",
            entries.len(),
            1 + chunks.len()
        );
        self.page_out(&frame, ALLOC_PAGE, true)
    }

    /// Post-quiescence consistency sweep: every deployed latch must be
    /// unpinned and fully unlocked. Returns the number of offenders.
    pub fn pool_audit(&self) -> usize {
        let deployed = self
            .latch_deployed
            .load(Ordering::Acquire)
            .min(self.latch_total - 1);

        let mut violations = 0;
        for slot in 1..=deployed {
            let latch = &self.latches[slot as usize];
            if latch.pin_word() & !CLOCK_BIT != 0 {
                warn!("latch {slot} still pinned for page {}", latch.page_no());
                violations += 1;
            }
            if !latch.is_unlocked() {
                warn!("latch {slot} still locked for page {}", latch.page_no());
                violations += 1;
            }
        }
        violations
    }

    #[cfg(test)]
    pub(crate) fn alloc_right(&self) -> PageNo {
        self.page_zero.lock().alloc_right
    }
}

/// Lay down one id-map chain record: next host id, entry count, entries.
fn write_map_record(buf: &mut [u8], next: u32, entries: &[(PageNo, HostPageId)]) {
    buf[..4].copy_from_slice(&next.to_le_bytes());
    buf[4..8].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    for (i, &(page_no, host_id)) in entries.iter().enumerate() {
        let at = MAP_HEADER_SIZE + i * MAP_ENTRY_SIZE;
        buf[at..at + 8].copy_from_slice(&page_no.to_le_bytes());
        buf[at + 8..at + 12].copy_from_slice(&(host_id as u32).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CLOCK_BIT;
    use crate::host::mem::MemHostPool;

    fn mgr(bits: u8, node_max: usize) -> Arc<BufMgr> {
        let host = MemHostPool::new(1 << bits);
        BufMgr::open(bits, node_max, host, None).unwrap()
    }

    #[test]
    fn open_rejects_bad_config() {
        let host = MemHostPool::new(4096);
        assert!(matches!(
            BufMgr::open(4, 20, Arc::clone(&host) as Arc<dyn HostPool>, None),
            Err(BltError::Config(_))
        ));
        assert!(matches!(
            BufMgr::open(12, 8, host, None),
            Err(BltError::Config(_))
        ));
    }

    #[test]
    fn fresh_tree_allocates_three_pages() {
        let mgr = mgr(12, 20);
        assert_eq!(mgr.alloc_right(), (MIN_LEVEL + 1) as PageNo);
        assert_eq!(mgr.page_map.lock().len(), 3);
    }

    #[test]
    fn fresh_root_points_at_first_leaf() {
        let mgr = mgr(12, 20);

        let latch = mgr.pin_latch(ROOT_PAGE, true).unwrap();
        let page = SlottedPage::new(mgr.frame(latch));
        assert_eq!(page.lvl(), 1);
        assert_eq!(page.cnt(), 1);
        assert_eq!(page.key(1), STOPPER_KEY);
        assert_eq!(get_id(page.value(1)), 2);
        mgr.unpin_latch(latch);

        let latch = mgr.pin_latch(2, true).unwrap();
        let page = SlottedPage::new(mgr.frame(latch));
        assert_eq!(page.lvl(), 0);
        assert!(page.value(1).is_empty());
        mgr.unpin_latch(latch);
    }

    #[test]
    fn new_page_increments_alloc_right() {
        let mgr = mgr(12, 20);
        let before = mgr.alloc_right();

        let contents = vec![0u8; mgr.page_size()];
        let latch = mgr.new_page(&contents).unwrap();
        assert_eq!(mgr.alloc_right(), before + 1);
        assert_eq!(latch.page_no(), before);
        mgr.unpin_latch(latch);
    }

    #[test]
    fn pin_latch_twice_nests_pins() {
        let mgr = mgr(12, 20);

        let contents = vec![0u8; mgr.page_size()];
        let latch = mgr.new_page(&contents).unwrap();
        let page_no = latch.page_no();

        let again = mgr.pin_latch(page_no, false).unwrap();
        assert_eq!(again.page_no(), page_no);
        assert_eq!(again.pin_word(), 2);

        mgr.unpin_latch(latch);
        mgr.unpin_latch(again);
    }

    #[test]
    fn unpin_sets_clock_bit() {
        let mgr = mgr(12, 20);
        let latch = mgr.pin_latch(2, true).unwrap();
        assert_eq!(latch.pin_word(), 1);

        mgr.unpin_latch(latch);
        assert_eq!(latch.pin_word(), CLOCK_BIT);
    }

    #[test]
    fn clock_sweep_reclaims_unpinned_slot() {
        let node_max = 32usize;
        let mgr = mgr(12, node_max);

        // fill every pool slot; pages 3.. are taken as raw frames
        let mut unpinned = None;
        for page_no in 3..(node_max as PageNo + 2) {
            let latch = mgr.pin_latch(page_no, false).unwrap();
            if page_no == 9 {
                unpinned = Some(latch);
            }
        }
        let victim = unpinned.unwrap();
        let victim_entry = victim.entry();
        mgr.unpin_latch(victim);

        let latch = mgr.pin_latch(34, false).unwrap();
        assert_eq!(latch.page_no(), 34);
        assert_eq!(latch.entry(), victim_entry);
        assert_eq!(latch.pin_word(), 1);
    }

    #[test]
    fn page_out_then_in_round_trips() {
        let mgr = mgr(12, 20);

        let mut frame = vec![0u8; mgr.page_size()];
        frame[100] = 0xAB;
        mgr.page_out(&frame, 9, true).unwrap();

        let mut back = vec![0u8; mgr.page_size()];
        mgr.page_in(&mut back, 9).unwrap();
        assert_eq!(back[100], 0xAB);
    }

    #[test]
    fn page_fetch_read_locks_leaf() {
        let mgr = mgr(12, 20);

        let (latch, slot) = mgr.page_fetch(&[1, 2, 3], 0, LockMode::Read).unwrap();
        let page = SlottedPage::new(mgr.frame(latch));
        assert_eq!(page.lvl(), 0);
        assert_eq!(page.key(slot), STOPPER_KEY);
        latch.unlock(LockMode::Read);
        mgr.unpin_latch(latch);

        assert_eq!(mgr.pool_audit(), 0);
    }

    #[test]
    fn close_checkpoints_id_map() {
        let bits = 12u8;
        let host = MemHostPool::new(1 << bits);
        let mgr = BufMgr::open(bits, 20, Arc::clone(&host) as Arc<dyn HostPool>, None).unwrap();
        mgr.close().unwrap();
        let page_zero_id = mgr.page_zero_host_id().unwrap();
        let alloc_right = mgr.alloc_right();
        drop(mgr);

        let mgr = BufMgr::open(bits, 20, host, Some(page_zero_id)).unwrap();
        assert_eq!(mgr.page_map.lock().len(), 3);
        assert_eq!(mgr.alloc_right(), alloc_right);
    }

    #[test]
    fn free_chain_reuses_page_numbers() {
        let mgr = mgr(12, 20);
        let contents = vec![0u8; mgr.page_size()];

        let latch = mgr.new_page(&contents).unwrap();
        let freed_no = latch.page_no();
        latch.lock(LockMode::Delete);
        latch.lock(LockMode::Write);
        mgr.page_free(latch);

        let latch = mgr.new_page(&contents).unwrap();
        assert_eq!(latch.page_no(), freed_no);
        assert!(!SlottedPage::new(mgr.frame(latch)).is_free());
        mgr.unpin_latch(latch);
    }
}
