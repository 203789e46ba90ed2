// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest buffers described by a list of physical pages.

use smallvec::SmallVec;
use vm_memory::GuestAddress;
use vm_memory::GuestPhysMemory;
use vm_memory::GUEST_PAGE_OFFSET_MASK;
use vm_memory::GUEST_PAGE_SIZE;
use vm_memory::NIL_GUEST_ADDRESS;

use crate::error::Result;
use crate::heap::PAGE_ADDRESS_COST;

pub type PageList = SmallVec<[GuestAddress; 1]>;

/// A guest buffer of `size` bytes starting `off_first_page` bytes into the
/// first of `pages`. Pages that could not be resolved are
/// [`NIL_GUEST_ADDRESS`] and are skipped by the copy helpers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuestBuffer {
    pub size: u32,
    pub off_first_page: u32,
    pub direction: u32,
    pub pages: PageList,
}

impl GuestBuffer {
    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Heap cost of the page array. Single page buffers keep the address inline.
    pub fn page_array_cost(&self) -> u32 {
        page_array_cost(self.page_count())
    }

    /// True when every page directly follows the previous one.
    pub fn is_contiguous(&self) -> bool {
        self.pages
            .windows(2)
            .all(|w| !w[0].is_nil() && w[0].checked_add(GUEST_PAGE_SIZE) == Some(w[1]))
    }

    /// Physical address of the first byte of the buffer.
    pub fn start(&self) -> Option<GuestAddress> {
        self.pages
            .first()
            .map(|&page| page | self.off_first_page as u64)
    }
}

pub fn page_array_cost(page_count: u32) -> u32 {
    if page_count == 1 {
        0
    } else {
        page_count.saturating_mul(PAGE_ADDRESS_COST)
    }
}

/// Offset into the first page and number of pages spanned by `size` bytes
/// at `addr`. An empty buffer spans no pages.
pub fn page_span(addr: u64, size: u32) -> (u32, u32) {
    if size == 0 {
        return (0, 0);
    }
    let off = (addr & GUEST_PAGE_OFFSET_MASK) as u32;
    let pages = (off as u64 + size as u64).div_ceil(GUEST_PAGE_SIZE);
    (off, pages as u32)
}

/// Resolves the guest linear range `[linear, linear + size)` page by page.
pub fn resolve_linear(
    mem: &dyn GuestPhysMemory,
    linear: u64,
    size: u32,
    direction: u32,
) -> GuestBuffer {
    let (off_first_page, page_count) = page_span(linear, size);
    let base = linear & !GUEST_PAGE_OFFSET_MASK;
    let pages = (0..page_count as u64)
        .map(|i| {
            base.checked_add(i * GUEST_PAGE_SIZE)
                .and_then(|l| mem.linear_to_phys(l).ok())
                .unwrap_or(NIL_GUEST_ADDRESS)
        })
        .collect();
    GuestBuffer {
        size,
        off_first_page,
        direction,
        pages,
    }
}

/// Fills `dst` from the guest buffer.
pub fn read_from_guest(mem: &dyn GuestPhysMemory, dst: &mut [u8], buf: &GuestBuffer) -> Result<()> {
    if dst.is_empty() {
        return Ok(());
    }
    if buf.is_contiguous() {
        if let Some(start) = buf.start().filter(|s| !s.is_nil()) {
            mem.read_exact_at_addr(dst, start)?;
            return Ok(());
        }
    }
    let mut offset = buf.off_first_page as usize;
    let mut done = 0;
    for &page in &buf.pages {
        if done == dst.len() {
            break;
        }
        let len = (GUEST_PAGE_SIZE as usize - offset).min(dst.len() - done);
        if !page.is_nil() {
            mem.read_exact_at_addr(&mut dst[done..done + len], page | offset as u64)?;
        }
        done += len;
        offset = 0;
    }
    Ok(())
}

/// Copies at most `buf.size` bytes of `src` into the guest buffer.
pub fn write_to_guest(mem: &dyn GuestPhysMemory, buf: &GuestBuffer, src: &[u8]) -> Result<()> {
    let total = src.len().min(buf.size as usize);
    let mut offset = buf.off_first_page as usize;
    let mut done = 0;
    for &page in &buf.pages {
        if done == total {
            break;
        }
        let len = (GUEST_PAGE_SIZE as usize - offset).min(total - done);
        if !page.is_nil() {
            mem.write_all_at_addr(&src[done..done + len], page | offset as u64)?;
        }
        done += len;
        offset = 0;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;
    use vm_memory::VecGuestMemory;

    use super::*;
    use crate::protocol::VBOX_HGCM_F_PARM_DIRECTION_BOTH;

    fn mem() -> VecGuestMemory {
        VecGuestMemory::new(&[(GuestAddress(0), 0x40000)])
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn spans() {
        assert_eq!(page_span(0x1234, 0), (0, 0));
        assert_eq!(page_span(0x1234, 1), (0x234, 1));
        assert_eq!(page_span(0x1000, 0x1000), (0, 1));
        assert_eq!(page_span(0x1fff, 2), (0xfff, 2));
        assert_eq!(page_span(0x1800, 0x2001), (0x800, 3));
    }

    #[test]
    fn linear_resolution_matches_source() {
        let m = mem();
        // Map the linear range backwards so the physical pages are scattered.
        let linear = 0x7fff_0000u64;
        for i in 0..4u64 {
            m.map_linear(linear + i * 0x1000, GuestAddress(0x10000 - i * 0x2000), 0x1000);
        }
        let addr = linear + 0x321;
        let len = 0x2ff0u32;
        let buf = resolve_linear(&m, addr, len, VBOX_HGCM_F_PARM_DIRECTION_BOTH);
        assert_eq!(buf.off_first_page, 0x321);
        assert_eq!(buf.page_count(), (0x321 + len).div_ceil(0x1000));
        assert!(!buf.is_contiguous());

        let src = pattern(len as usize);
        write_to_guest(&m, &buf, &src).unwrap();
        // Every byte lands at its translated physical address.
        for (i, &b) in src.iter().enumerate() {
            let lin = addr + i as u64;
            let phys = m.linear_to_phys(lin).unwrap();
            let mut got = [0u8];
            m.read_exact_at_addr(&mut got, phys).unwrap();
            assert_eq!(got[0], b);
        }
        let mut back = vec![0u8; len as usize];
        read_from_guest(&m, &mut back, &buf).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn unresolved_pages_are_skipped() {
        let m = mem();
        m.map_linear(0x10_0000, GuestAddress(0x5000), 0x1000);
        m.map_linear(0x10_2000, GuestAddress(0x9000), 0x1000);
        let buf = resolve_linear(&m, 0x10_0800, 0x2000, VBOX_HGCM_F_PARM_DIRECTION_BOTH);
        assert_eq!(
            buf.pages.as_slice(),
            &[GuestAddress(0x5000), NIL_GUEST_ADDRESS, GuestAddress(0x9000)]
        );
        let src = pattern(0x2000);
        write_to_guest(&m, &buf, &src).unwrap();
        let mut dst = vec![0u8; 0x2000];
        read_from_guest(&m, &mut dst, &buf).unwrap();
        assert_eq!(dst[..0x800], src[..0x800]);
        assert!(dst[0x800..0x1800].iter().all(|&b| b == 0));
        assert_eq!(dst[0x1800..], src[0x1800..]);
    }

    #[test]
    fn contiguous_and_scattered_paths_agree() {
        let m = mem();
        let src = pattern(0x3000);
        m.write_all_at_addr(&src, GuestAddress(0x20000)).unwrap();
        let contiguous = GuestBuffer {
            size: 0x2400,
            off_first_page: 0x300,
            direction: VBOX_HGCM_F_PARM_DIRECTION_BOTH,
            pages: smallvec![GuestAddress(0x20000), GuestAddress(0x21000), GuestAddress(0x22000)],
        };
        assert!(contiguous.is_contiguous());

        // The same bytes copied to scattered pages.
        let scattered_pages = [GuestAddress(0x30000), GuestAddress(0x2c000), GuestAddress(0x34000)];
        for (i, page) in scattered_pages.iter().enumerate() {
            m.write_all_at_addr(&src[i * 0x1000..(i + 1) * 0x1000], *page)
                .unwrap();
        }
        let scattered = GuestBuffer {
            pages: scattered_pages.iter().copied().collect(),
            ..contiguous.clone()
        };
        assert!(!scattered.is_contiguous());

        let mut a = vec![0u8; 0x2400];
        let mut b = vec![0u8; 0x2400];
        read_from_guest(&m, &mut a, &contiguous).unwrap();
        read_from_guest(&m, &mut b, &scattered).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[..], src[0x300..0x2700]);

        let new = pattern(0x2400).iter().map(|b| !b).collect::<Vec<_>>();
        write_to_guest(&m, &contiguous, &new).unwrap();
        write_to_guest(&m, &scattered, &new).unwrap();
        read_from_guest(&m, &mut a, &contiguous).unwrap();
        read_from_guest(&m, &mut b, &scattered).unwrap();
        assert_eq!(a, new);
        assert_eq!(b, new);
    }

    #[test]
    fn write_is_bounded_by_buffer_size() {
        let m = mem();
        let buf = GuestBuffer {
            size: 4,
            off_first_page: 0xffe,
            direction: VBOX_HGCM_F_PARM_DIRECTION_BOTH,
            pages: smallvec![GuestAddress(0x1000), GuestAddress(0x2000)],
        };
        write_to_guest(&m, &buf, &[1, 2, 3, 4, 5, 6]).unwrap();
        let mut got = [0u8; 8];
        m.read_exact_at_addr(&mut got, GuestAddress(0x1ffe)).unwrap();
        assert_eq!(got, [1, 2, 3, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn array_cost() {
        assert_eq!(page_array_cost(0), 0);
        assert_eq!(page_array_cost(1), 0);
        assert_eq!(page_array_cost(3), 24);
    }
}
