//! In-memory host pool.
//!
//! Stores every page in a hash table and never evicts. Pin counts are
//! tracked so contract violations (unpinning an unknown page, deallocating
//! a page twice) surface in tests the same way a real host would surface
//! them. A single `MemHostPool` can outlive any number of engine instances,
//! which is how restart tests hand the "storage" of a closed tree to a
//! freshly opened one.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::HostPageId;
use crate::error::{BltError, BltResult};
use crate::host::{HostPage, HostPool};

pub struct MemHostPage {
    id: HostPageId,
    pin: AtomicI32,
    data: Mutex<Box<[u8]>>,
}

impl HostPage for MemHostPage {
    fn id(&self) -> HostPageId {
        self.id
    }

    fn pin_count(&self) -> i32 {
        self.pin.load(Ordering::Acquire)
    }

    fn dec_pin_count(&self) {
        self.pin.fetch_sub(1, Ordering::AcqRel);
    }

    fn read_into(&self, buf: &mut [u8]) -> BltResult<()> {
        let data = self.data.lock();
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn write_from(&self, buf: &[u8]) -> BltResult<()> {
        let mut data = self.data.lock();
        let n = buf.len().min(data.len());
        data[..n].copy_from_slice(&buf[..n]);
        Ok(())
    }
}

pub struct MemHostPool {
    page_size: usize,
    next_id: AtomicI32,
    pages: Mutex<HashMap<HostPageId, Arc<MemHostPage>>>,
}

impl MemHostPool {
    pub fn new(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            next_id: AtomicI32::new(0),
            pages: Mutex::new(HashMap::new()),
        })
    }

    /// Number of pages currently allocated.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl HostPool for MemHostPool {
    fn new_page(&self) -> BltResult<Arc<dyn HostPage>> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let page = Arc::new(MemHostPage {
            id,
            pin: AtomicI32::new(1),
            data: Mutex::new(vec![0u8; self.page_size].into_boxed_slice()),
        });
        self.pages.lock().insert(id, Arc::clone(&page));
        Ok(page)
    }

    fn fetch_page(&self, id: HostPageId) -> BltResult<Arc<dyn HostPage>> {
        let pages = self.pages.lock();
        let page = pages
            .get(&id)
            .ok_or(BltError::Host("fetch of unknown page id"))?;
        page.pin.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::clone(page) as Arc<dyn HostPage>)
    }

    fn unpin_page(&self, id: HostPageId, _is_dirty: bool) -> BltResult<()> {
        let pages = self.pages.lock();
        let page = pages
            .get(&id)
            .ok_or(BltError::Host("unpin of unknown page id"))?;
        page.dec_pin_count();
        Ok(())
    }

    fn deallocate_page(&self, id: HostPageId, _no_wait: bool) -> BltResult<()> {
        self.pages
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(BltError::Host("deallocate of unknown page id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_starts_pinned() {
        let pool = MemHostPool::new(4096);
        let page = pool.new_page().unwrap();

        assert_eq!(page.pin_count(), 1);
        pool.unpin_page(page.id(), false).unwrap();
        assert_eq!(page.pin_count(), 0);
    }

    #[test]
    fn fetch_increments_pin() {
        let pool = MemHostPool::new(4096);
        let page = pool.new_page().unwrap();
        let id = page.id();

        let again = pool.fetch_page(id).unwrap();
        assert_eq!(again.pin_count(), 2);
    }

    #[test]
    fn data_round_trips() {
        let pool = MemHostPool::new(4096);
        let page = pool.new_page().unwrap();

        page.write_from(&[7u8; 16]).unwrap();

        let mut buf = [0u8; 16];
        page.read_into(&mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);
    }

    #[test]
    fn fetch_unknown_id_is_host_error() {
        let pool = MemHostPool::new(4096);
        assert!(matches!(pool.fetch_page(99), Err(BltError::Host(_))));
    }

    #[test]
    fn deallocate_removes_page() {
        let pool = MemHostPool::new(4096);
        let page = pool.new_page().unwrap();
        let id = page.id();

        pool.deallocate_page(id, true).unwrap();
        assert!(pool.fetch_page(id).is_err());
        assert!(pool.deallocate_page(id, true).is_err());
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let pool = MemHostPool::new(4096);
        let a = pool.new_page().unwrap();
        let b = pool.new_page().unwrap();

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
    }
}
