// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The guest memory services a device model is allowed to use.

use std::result;

use remain::sorted;
use thiserror::Error;

use crate::guest_address::GuestAddress;

#[sorted]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid guest address {0}")]
    InvalidGuestAddress(GuestAddress),
    #[error("linear address {0:#x} has no physical mapping")]
    InvalidLinearAddress(u64),
    #[error("page index {index} out of range for a mapping of {count} pages")]
    InvalidPageIndex { index: usize, count: usize },
    #[error("page {0} is not page aligned")]
    PageNotAligned(GuestAddress),
    #[error("page {0} is reserved and cannot be mapped")]
    PageReserved(GuestAddress),
    #[error("mapping is read-only")]
    ReadOnlyMapping,
    #[error("incomplete read of {completed} instead of {expected} bytes")]
    ShortRead { expected: usize, completed: usize },
    #[error("incomplete write of {completed} instead of {expected} bytes")]
    ShortWrite { expected: usize, completed: usize },
}

pub type Result<T> = result::Result<T, Error>;

/// Physical memory of the guest as seen by a device.
///
/// Implementations must be safe to call from any thread; the caller does not
/// serialize accesses on their behalf.
pub trait GuestPhysMemory: Send + Sync {
    /// Reads from guest memory at `guest_addr` to fill the entire buffer.
    fn read_exact_at_addr(&self, buf: &mut [u8], guest_addr: GuestAddress) -> Result<()>;

    /// Writes the entire contents of `buf` to guest memory at `guest_addr`.
    fn write_all_at_addr(&self, buf: &[u8], guest_addr: GuestAddress) -> Result<()>;

    /// Translates a guest linear (virtual) address to a guest physical address
    /// using the current guest paging state.
    fn linear_to_phys(&self, linear: u64) -> Result<GuestAddress>;

    /// Maps every page in `pages` into host memory and keeps them locked until
    /// the returned mapping is dropped.
    ///
    /// Either all pages are locked or none. A page backed by something other
    /// than RAM fails with [`Error::PageReserved`].
    fn lock_pages(&self, pages: &[GuestAddress], writable: bool) -> Result<Box<dyn PageMapping>>;
}

/// A set of guest pages locked into host memory. Dropping it releases the
/// locks.
pub trait PageMapping: Send {
    /// Number of pages held by this mapping.
    fn page_count(&self) -> usize;

    /// Whether `write_page` is permitted.
    fn writable(&self) -> bool;

    /// Copies out of page `index` starting at `offset` within that page.
    fn read_page(&self, index: usize, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Copies into page `index` starting at `offset` within that page.
    fn write_page(&mut self, index: usize, offset: usize, buf: &[u8]) -> Result<()>;
}
