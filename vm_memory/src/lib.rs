// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest physical memory access for devices that only see the guest through a
//! narrow set of primitives: bulk read/write by physical address, linear to
//! physical translation and page mapping locks.

mod guest_address;
pub mod guest_memory;
mod vec_memory;

pub use guest_address::*;
pub use guest_memory::Error as GuestMemoryError;
pub use guest_memory::*;
pub use vec_memory::VecGuestMemory;

/// Size of a guest page in bytes.
pub const GUEST_PAGE_SIZE: u64 = 4096;
/// log2 of [`GUEST_PAGE_SIZE`].
pub const GUEST_PAGE_SHIFT: u32 = 12;
/// Mask selecting the offset within a guest page.
pub const GUEST_PAGE_OFFSET_MASK: u64 = GUEST_PAGE_SIZE - 1;
