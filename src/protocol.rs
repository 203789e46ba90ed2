// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest visible request layouts of the VMMDev request port.
//!
//! All structures are little endian and packed to 4 bytes, exactly as the guest
//! additions lay them out in guest physical memory.

use std::mem::size_of;

use enumn::N;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const VMMDEV_REQUEST_HEADER_VERSION: u32 = 0x10001;

/// Largest request the device is willing to copy in.
pub const VMMDEV_MAX_VMMDEVREQ_SIZE: u32 = 1024 * 1024;
pub const VMMDEV_MAX_HGCM_PARMS: u32 = 1024;
/// Largest buffer a single parameter may describe, and the largest heap cost
/// a single command may accumulate.
pub const VMMDEV_MAX_HGCM_DATA_SIZE: u32 = 128 * 1024 * 1024;

/* Event bits */
pub const VMMDEV_EVENT_MOUSE_CAPABILITIES_CHANGED: u32 = 1 << 0;
pub const VMMDEV_EVENT_HGCM: u32 = 1 << 1;
pub const VMMDEV_EVENT_DISPLAY_CHANGE_REQUEST: u32 = 1 << 2;

/* HGCM request header flags */
pub const VBOX_HGCM_REQ_DONE: u32 = 1 << 0;
pub const VBOX_HGCM_REQ_CANCELLED: u32 = 1 << 1;

/* Parameter buffer direction flags */
pub const VBOX_HGCM_F_PARM_DIRECTION_NONE: u32 = 0;
pub const VBOX_HGCM_F_PARM_DIRECTION_TO_HOST: u32 = 1;
pub const VBOX_HGCM_F_PARM_DIRECTION_FROM_HOST: u32 = 2;
pub const VBOX_HGCM_F_PARM_DIRECTION_BOTH: u32 = 3;
pub const VBOX_HGCM_F_PARM_DIRECTION_MASK: u32 = 3;

/// A direction mask is valid when it names at least one direction and no
/// unknown bits.
pub fn parm_flags_are_valid(flags: u32) -> bool {
    flags & !VBOX_HGCM_F_PARM_DIRECTION_MASK == 0 && flags != VBOX_HGCM_F_PARM_DIRECTION_NONE
}

/* Requestor information */
pub const VMMDEV_REQUESTOR_LEGACY: u32 = 0;
pub const VMMDEV_REQUESTOR_USR_MASK: u32 = 0x7;
pub const VMMDEV_REQUESTOR_USR_NOT_GIVEN: u32 = 0;
pub const VMMDEV_REQUESTOR_USR_DRV: u32 = 1;
pub const VMMDEV_REQUESTOR_USR_DRV_OTHER: u32 = 2;
pub const VMMDEV_REQUESTOR_USR_ROOT: u32 = 3;
pub const VMMDEV_REQUESTOR_USR_SYSTEM: u32 = 4;
pub const VMMDEV_REQUESTOR_USR_RESERVED1: u32 = 5;
pub const VMMDEV_REQUESTOR_USR_USER: u32 = 6;
pub const VMMDEV_REQUESTOR_USR_GUEST: u32 = 7;

/* Service location types */
pub const VMMDEV_HGCM_LOC_INVALID: u32 = 0;
pub const VMMDEV_HGCM_LOC_LOCALHOST: u32 = 1;
pub const VMMDEV_HGCM_LOC_LOCALHOST_EXISTING: u32 = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum RequestType {
    AcknowledgeEvents = 41,
    CtlGuestFilterMask = 42,
    HgcmConnect = 60,
    HgcmDisconnect = 61,
    HgcmCall32 = 62,
    HgcmCall64 = 63,
    HgcmCancel = 64,
    HgcmCancel2 = 65,
}

impl RequestType {
    pub fn is_hgcm_call(self) -> bool {
        matches!(self, RequestType::HgcmCall32 | RequestType::HgcmCall64)
    }

    /// Size of one parameter record for a call request of this type.
    pub fn parm_struct_size(self) -> u32 {
        if self == RequestType::HgcmCall64 {
            size_of::<HgcmFunctionParameter64>() as u32
        } else {
            size_of::<HgcmFunctionParameter32>() as u32
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ParmType {
    Invalid = 0,
    Value32 = 1,
    Value64 = 2,
    PhysAddr = 3,
    LinAddr = 4,
    LinAddrIn = 5,
    LinAddrOut = 6,
    LinAddrLocked = 7,
    LinAddrLockedIn = 8,
    LinAddrLockedOut = 9,
    PageList = 10,
    Embedded = 11,
    ContiguousPageList = 12,
    NoBouncePageList = 13,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RequestHeader {
    pub size: u32,
    pub version: u32,
    pub request_type: u32,
    pub rc: i32,
    pub reserved1: u32,
    pub requestor: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HgcmRequestHeader {
    pub header: RequestHeader,
    pub flags: u32,
    pub result: i32,
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ServiceLocation {
    pub location_type: u32,
    pub name: [u8; 128],
}

impl ServiceLocation {
    /// The service name up to the first NUL.
    pub fn service_name(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..end]
    }
}

#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HgcmConnect {
    pub header: HgcmRequestHeader,
    pub loc: ServiceLocation,
    pub client_id: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HgcmDisconnect {
    pub header: HgcmRequestHeader,
    pub client_id: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HgcmCall {
    pub header: HgcmRequestHeader,
    pub client_id: u32,
    pub function: u32,
    pub parm_count: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HgcmCancel {
    pub header: HgcmRequestHeader,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HgcmCancel2 {
    pub header: RequestHeader,
    pub phys_req_to_cancel: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Events {
    pub header: RequestHeader,
    pub events: u32,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CtlGuestFilterMask {
    pub header: RequestHeader,
    pub or_mask: u32,
    pub not_mask: u32,
}

/// Parameter record of a 32-bit call. The union is decoded by `ParmRecord`.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HgcmFunctionParameter32 {
    pub parm_type: u32,
    pub u: [u8; 8],
}

/// Parameter record of a 64-bit call.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HgcmFunctionParameter64 {
    pub parm_type: u32,
    pub u: [u8; 12],
}

/// Fixed part of the out-of-line page list description. `page_count` 64-bit
/// page addresses follow directly.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct PageListInfo {
    pub flags: u32,
    pub first_page_offset: u16,
    pub page_count: u16,
}

/// Size used for bounds checks: the fixed part plus the first page entry.
pub const PAGE_LIST_INFO_SIZE: u32 = (size_of::<PageListInfo>() + size_of::<u64>()) as u32;

const_assert_eq!(size_of::<RequestHeader>(), 24);
const_assert_eq!(size_of::<HgcmRequestHeader>(), 32);
const_assert_eq!(size_of::<ServiceLocation>(), 132);
const_assert_eq!(size_of::<HgcmConnect>(), 168);
const_assert_eq!(size_of::<HgcmDisconnect>(), 36);
const_assert_eq!(size_of::<HgcmCall>(), 44);
const_assert_eq!(size_of::<HgcmCancel>(), 32);
const_assert_eq!(size_of::<HgcmCancel2>(), 28);
const_assert_eq!(size_of::<Events>(), 28);
const_assert_eq!(size_of::<CtlGuestFilterMask>(), 32);
const_assert_eq!(size_of::<HgcmFunctionParameter32>(), 12);
const_assert_eq!(size_of::<HgcmFunctionParameter64>(), 16);
const_assert_eq!(size_of::<PageListInfo>(), 8);

/* Field offsets used for partial writes into guest requests. */
pub const REQUEST_HEADER_RC_OFFSET: u64 = 12;
pub const HGCM_HEADER_FLAGS_OFFSET: u64 = 24;
pub const HGCM_HEADER_RESULT_OFFSET: u64 = 28;
pub const HGCM_CONNECT_CLIENT_ID_OFFSET: usize = 164;
pub const HGCM_CALL_PARMS_OFFSET: u32 = size_of::<HgcmCall>() as u32;
/// Offset of the union within a parameter record.
pub const PARM_UNION_OFFSET: u32 = 4;

/// Reads a `T` at `offset` of `buf`, or `None` if it does not fit.
pub fn read_obj<T: FromBytes>(buf: &[u8], offset: usize) -> Option<T> {
    let bytes = buf.get(offset..)?;
    T::read_from_prefix(bytes).ok().map(|(v, _)| v)
}

/// Writes `val` at `offset` of `buf`. Returns false if it does not fit.
pub fn write_obj<T: IntoBytes + Immutable>(buf: &mut [u8], offset: usize, val: &T) -> bool {
    let bytes = val.as_bytes();
    match buf.get_mut(offset..offset.saturating_add(bytes.len())) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}

/// A parameter record decoded from either the 32-bit or the 64-bit layout.
#[derive(Copy, Clone, Debug)]
pub struct ParmRecord {
    pub parm_type: u32,
    raw: [u8; 12],
    is_64: bool,
}

impl ParmRecord {
    /// Decodes the record at `offset` of `req`.
    pub fn read(req: &[u8], offset: usize, is_64: bool) -> Option<ParmRecord> {
        let mut raw = [0u8; 12];
        let parm_type = if is_64 {
            let p: HgcmFunctionParameter64 = read_obj(req, offset)?;
            raw.copy_from_slice(&p.u);
            p.parm_type
        } else {
            let p: HgcmFunctionParameter32 = read_obj(req, offset)?;
            raw[..8].copy_from_slice(&p.u);
            p.parm_type
        };
        Some(ParmRecord {
            parm_type,
            raw,
            is_64,
        })
    }

    fn u32_at(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.raw[off..off + 4]);
        u32::from_le_bytes(b)
    }

    fn u64_at(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.raw[off..off + 8]);
        u64::from_le_bytes(b)
    }

    pub fn value32(&self) -> u32 {
        self.u32_at(0)
    }

    pub fn value64(&self) -> u64 {
        self.u64_at(0)
    }

    /// `(size, linear address)` of a LinAddr parameter.
    pub fn pointer(&self) -> (u32, u64) {
        let addr = if self.is_64 {
            self.u64_at(4)
        } else {
            self.u32_at(4) as u64
        };
        (self.u32_at(0), addr)
    }

    /// `(size, page list info offset)` of a page list parameter.
    pub fn page_list(&self) -> (u32, u32) {
        (self.u32_at(0), self.u32_at(4))
    }

    /// `(flags, data offset, size)` of an embedded buffer parameter.
    pub fn embedded(&self) -> (u32, u32, u32) {
        let bits = self.u32_at(0);
        (bits & 0xff, bits >> 8, self.u32_at(4))
    }
}

/// Offset of the size field of a page list parameter relative to the record.
pub const PAGE_LIST_SIZE_FIELD: u32 = PARM_UNION_OFFSET;
/// Offset of the size field of an embedded parameter relative to the record.
pub const EMBEDDED_SIZE_FIELD: u32 = PARM_UNION_OFFSET + 4;
