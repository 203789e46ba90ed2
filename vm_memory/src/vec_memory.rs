// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Heap backed guest memory, used by tests and by hosts that hand the device
//! an in-process copy of guest RAM.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::guest_memory::Error;
use crate::guest_memory::GuestPhysMemory;
use crate::guest_memory::PageMapping;
use crate::guest_memory::Result;
use crate::GuestAddress;
use crate::GUEST_PAGE_OFFSET_MASK;
use crate::GUEST_PAGE_SHIFT;
use crate::GUEST_PAGE_SIZE;

struct Region {
    start: GuestAddress,
    data: Mutex<Vec<u8>>,
}

impl Region {
    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn contains(&self, addr: GuestAddress, len: u64) -> bool {
        let size = self.len();
        addr >= self.start
            && addr
                .offset_from(self.start)
                .checked_add(len)
                .is_some_and(|end| end <= size)
    }
}

struct Inner {
    regions: Vec<Region>,
    // linear page number -> physical page
    linear: Mutex<BTreeMap<u64, GuestAddress>>,
    reserved: Mutex<Vec<(GuestAddress, u64)>>,
    locks: Mutex<HashMap<GuestAddress, usize>>,
}

impl Inner {
    fn region_for(&self, addr: GuestAddress, len: u64) -> Result<&Region> {
        self.regions
            .iter()
            .find(|r| r.contains(addr, len))
            .ok_or(Error::InvalidGuestAddress(addr))
    }

    fn is_reserved(&self, page: GuestAddress) -> bool {
        self.reserved
            .lock()
            .iter()
            .any(|&(start, len)| page >= start && page.offset_from(start) < len)
    }

    fn unlock(&self, pages: &[GuestAddress]) {
        let mut locks = self.locks.lock();
        for page in pages {
            if let Some(count) = locks.get_mut(page) {
                *count -= 1;
                if *count == 0 {
                    locks.remove(page);
                }
            }
        }
    }
}

/// Guest memory made of one or more `Vec<u8>` regions.
///
/// Clones share the same backing storage.
#[derive(Clone)]
pub struct VecGuestMemory {
    inner: Arc<Inner>,
}

impl VecGuestMemory {
    /// Creates a memory with zero filled regions given as `(start, size)` pairs.
    pub fn new(ranges: &[(GuestAddress, u64)]) -> VecGuestMemory {
        let regions = ranges
            .iter()
            .map(|&(start, size)| Region {
                start,
                data: Mutex::new(vec![0u8; size as usize]),
            })
            .collect();
        VecGuestMemory {
            inner: Arc::new(Inner {
                regions,
                linear: Mutex::new(BTreeMap::new()),
                reserved: Mutex::new(Vec::new()),
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Maps `len` bytes of linear address space starting at `linear` onto
    /// physical memory starting at `phys`. Both must be page aligned.
    pub fn map_linear(&self, linear: u64, phys: GuestAddress, len: u64) {
        let mut map = self.inner.linear.lock();
        let pages = len.div_ceil(GUEST_PAGE_SIZE);
        for i in 0..pages {
            map.insert(
                (linear >> GUEST_PAGE_SHIFT) + i,
                phys.unchecked_add(i << GUEST_PAGE_SHIFT),
            );
        }
    }

    /// Removes the linear mapping of the page containing `linear`.
    pub fn unmap_linear(&self, linear: u64) {
        self.inner.linear.lock().remove(&(linear >> GUEST_PAGE_SHIFT));
    }

    /// Marks a physical range as non-RAM. Plain reads and writes still work
    /// but pages in the range can not be locked.
    pub fn add_reserved_range(&self, start: GuestAddress, len: u64) {
        self.inner.reserved.lock().push((start, len));
    }

    /// Number of distinct pages currently held by a mapping.
    pub fn locked_page_count(&self) -> usize {
        self.inner.locks.lock().len()
    }
}

impl GuestPhysMemory for VecGuestMemory {
    fn read_exact_at_addr(&self, buf: &mut [u8], guest_addr: GuestAddress) -> Result<()> {
        let region = self.inner.region_for(guest_addr, buf.len() as u64)?;
        let off = guest_addr.offset_from(region.start) as usize;
        buf.copy_from_slice(&region.data.lock()[off..off + buf.len()]);
        Ok(())
    }

    fn write_all_at_addr(&self, buf: &[u8], guest_addr: GuestAddress) -> Result<()> {
        let region = self.inner.region_for(guest_addr, buf.len() as u64)?;
        let off = guest_addr.offset_from(region.start) as usize;
        region.data.lock()[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn linear_to_phys(&self, linear: u64) -> Result<GuestAddress> {
        self.inner
            .linear
            .lock()
            .get(&(linear >> GUEST_PAGE_SHIFT))
            .map(|page| page.unchecked_add(linear & GUEST_PAGE_OFFSET_MASK))
            .ok_or(Error::InvalidLinearAddress(linear))
    }

    fn lock_pages(&self, pages: &[GuestAddress], writable: bool) -> Result<Box<dyn PageMapping>> {
        for &page in pages {
            if page.page_offset() != 0 {
                return Err(Error::PageNotAligned(page));
            }
            self.inner.region_for(page, GUEST_PAGE_SIZE)?;
            if self.inner.is_reserved(page) {
                return Err(Error::PageReserved(page));
            }
        }
        {
            let mut locks = self.inner.locks.lock();
            for &page in pages {
                *locks.entry(page).or_insert(0) += 1;
            }
        }
        debug!("locked {} guest pages (writable {})", pages.len(), writable);
        Ok(Box::new(VecPageMapping {
            inner: self.inner.clone(),
            pages: pages.to_vec(),
            writable,
        }))
    }
}

struct VecPageMapping {
    inner: Arc<Inner>,
    pages: Vec<GuestAddress>,
    writable: bool,
}

impl VecPageMapping {
    fn locate(&self, index: usize, offset: usize, len: usize) -> Result<(&Region, usize)> {
        let page = *self.pages.get(index).ok_or(Error::InvalidPageIndex {
            index,
            count: self.pages.len(),
        })?;
        let addr = page.unchecked_add(offset as u64);
        if offset + len > GUEST_PAGE_SIZE as usize {
            return Err(Error::InvalidGuestAddress(addr));
        }
        let region = self.inner.region_for(addr, len as u64)?;
        Ok((region, addr.offset_from(region.start) as usize))
    }
}

impl PageMapping for VecPageMapping {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn read_page(&self, index: usize, offset: usize, buf: &mut [u8]) -> Result<()> {
        let (region, off) = self.locate(index, offset, buf.len())?;
        buf.copy_from_slice(&region.data.lock()[off..off + buf.len()]);
        Ok(())
    }

    fn write_page(&mut self, index: usize, offset: usize, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnlyMapping);
        }
        let (region, off) = self.locate(index, offset, buf.len())?;
        region.data.lock()[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

impl Drop for VecPageMapping {
    fn drop(&mut self) {
        self.inner.unlock(&self.pages);
    }
}
