// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conversion of HGCM call parameters between the guest request, the command
//! and the service.
//!
//! Everything read from the request is guest controlled and validated before
//! use. Bounce buffers and page arrays are charged to the command's heap
//! category so that `free_command` can credit them back.

use log::debug;
use log::warn;
use smallvec::smallvec;
use vm_memory::GuestAddress;
use vm_memory::GuestMemoryError;
use vm_memory::GuestPhysMemory;
use vm_memory::GUEST_PAGE_SIZE;

use crate::buffer::page_array_cost;
use crate::buffer::page_span;
use crate::buffer::read_from_guest;
use crate::buffer::resolve_linear;
use crate::buffer::write_to_guest;
use crate::buffer::GuestBuffer;
use crate::buffer::PageList;
use crate::command::CommandState;
use crate::command::GuestParm;
use crate::command::HgcmCommand;
use crate::command::HostBuffer;
use crate::command::HostPages;
use crate::command::HostParm;
use crate::command::PageLock;
use crate::command::Payload;
use crate::error::HgcmError;
use crate::error::Result;
use crate::heap::HeapBudgets;
use crate::heap::HeapCategory;
use crate::heap::PAGE_LOCK_COST;
use crate::protocol::parm_flags_are_valid;
use crate::protocol::read_obj;
use crate::protocol::write_obj;
use crate::protocol::HgcmCall;
use crate::protocol::PageListInfo;
use crate::protocol::ParmRecord;
use crate::protocol::ParmType;
use crate::protocol::RequestType;
use crate::protocol::EMBEDDED_SIZE_FIELD;
use crate::protocol::HGCM_CALL_PARMS_OFFSET;
use crate::protocol::PAGE_LIST_INFO_SIZE;
use crate::protocol::PAGE_LIST_SIZE_FIELD;
use crate::protocol::PARM_UNION_OFFSET;
use crate::protocol::VBOX_HGCM_F_PARM_DIRECTION_BOTH;
use crate::protocol::VBOX_HGCM_F_PARM_DIRECTION_FROM_HOST;
use crate::protocol::VBOX_HGCM_F_PARM_DIRECTION_TO_HOST;
use crate::protocol::VMMDEV_MAX_HGCM_DATA_SIZE;
use crate::protocol::VMMDEV_MAX_HGCM_PARMS;

/// Checks that `parm_count` records of `parm_size` bytes fit in a call request
/// of `cb_request` bytes.
pub fn check_parm_count(cb_request: u32, parm_count: u32, parm_size: u32) -> Result<()> {
    let room = cb_request.saturating_sub(HGCM_CALL_PARMS_OFFSET) / parm_size;
    if parm_count > room || parm_count > VMMDEV_MAX_HGCM_PARMS {
        debug!("HGCM call with {} parameters does not fit {} bytes", parm_count, cb_request);
        return Err(HgcmError::InvalidParameter("too many parameters"));
    }
    Ok(())
}

fn linaddr_direction(parm_type: ParmType) -> u32 {
    match parm_type {
        ParmType::LinAddrIn => VBOX_HGCM_F_PARM_DIRECTION_TO_HOST,
        ParmType::LinAddrOut => VBOX_HGCM_F_PARM_DIRECTION_FROM_HOST,
        _ => VBOX_HGCM_F_PARM_DIRECTION_BOTH,
    }
}

/// Failed no-bounce locks are reported through this.
pub trait LockFailureCounter {
    fn page_list_lock_failed(&self);
}

struct Fetch<'a> {
    mem: &'a dyn GuestPhysMemory,
    heap: &'a mut HeapBudgets,
    category: HeapCategory,
    heap_cost: &'a mut u32,
    gcphys: GuestAddress,
    req: &'a [u8],
    off_extra: u32,
    lock_failures: &'a dyn LockFailureCounter,
}

impl Fetch<'_> {
    fn charge(&mut self, size: u32) -> Result<()> {
        self.heap
            .charge_for_command(self.category, self.heap_cost, size)
    }

    fn cb(&self) -> u32 {
        self.req.len() as u32
    }

    fn linaddr(&mut self, parm_type: ParmType, rec: &ParmRecord) -> Result<GuestParm> {
        let (size, linear) = rec.pointer();
        if size > VMMDEV_MAX_HGCM_DATA_SIZE {
            return Err(HgcmError::InvalidParameter("linear buffer too large"));
        }
        let (_, page_count) = page_span(linear, size);
        self.charge(page_array_cost(page_count))?;
        let buf = resolve_linear(self.mem, linear, size, linaddr_direction(parm_type));
        Ok(GuestParm::LinAddr { parm_type, buf })
    }

    fn page_list(&mut self, parm_type: ParmType, rec: &ParmRecord) -> Result<GuestParm> {
        let (size, info_off) = rec.page_list();
        if size > VMMDEV_MAX_HGCM_DATA_SIZE {
            return Err(HgcmError::InvalidParameter("page list too large"));
        }
        let cb = self.cb();
        if info_off < self.off_extra
            || cb < PAGE_LIST_INFO_SIZE
            || info_off > cb - PAGE_LIST_INFO_SIZE
        {
            return Err(HgcmError::InvalidParameter("page list info outside the request"));
        }
        let info: PageListInfo = read_obj(self.req, info_off as usize)
            .ok_or(HgcmError::InvalidParameter("page list info outside the request"))?;
        let page_count = info.page_count as u32;
        let max_pages = 1 + (cb - info_off - PAGE_LIST_INFO_SIZE) / 8;
        if page_count == 0 || page_count > max_pages {
            return Err(HgcmError::InvalidParameter("bad page count"));
        }
        if !parm_flags_are_valid(info.flags) {
            return Err(HgcmError::InvalidFlags(info.flags));
        }
        let off_first_page = info.first_page_offset as u32;
        if off_first_page as u64 >= GUEST_PAGE_SIZE {
            return Err(HgcmError::InvalidParameter("first page offset beyond the page"));
        }
        let expected = if parm_type == ParmType::ContiguousPageList {
            1
        } else {
            (off_first_page as u64 + size as u64).div_ceil(GUEST_PAGE_SIZE) as u32
        };
        if parm_type != ParmType::PageList && page_count != expected {
            return Err(HgcmError::InvalidParameter("page count does not match the size"));
        }

        let pages_off = info_off as usize + std::mem::size_of::<PageListInfo>();
        let pages = (0..page_count as usize)
            .map(|i| read_obj::<u64>(self.req, pages_off + i * 8).map(GuestAddress))
            .collect::<Option<PageList>>()
            .ok_or(HgcmError::InvalidParameter("page list outside the request"))?;
        let buf = GuestBuffer {
            size,
            off_first_page,
            direction: info.flags,
            pages,
        };

        if parm_type == ParmType::NoBouncePageList {
            let first = buf.pages[0].page_offset();
            if (first != 0 && first != off_first_page as u64)
                || buf.pages[1..].iter().any(|p| p.page_offset() != 0)
            {
                return Err(HgcmError::InvalidPointer);
            }
            self.charge(PAGE_LOCK_COST * page_count)?;
            let bases: Vec<GuestAddress> = buf.pages.iter().map(|p| p.page_base()).collect();
            let writable = info.flags & VBOX_HGCM_F_PARM_DIRECTION_FROM_HOST != 0;
            match self.mem.lock_pages(&bases, writable) {
                Ok(lock) => {
                    return Ok(GuestParm::NoBouncePageList {
                        buf,
                        lock: Some(PageLock(lock)),
                    })
                }
                Err(GuestMemoryError::PageReserved(page)) => {
                    self.lock_failures.page_list_lock_failed();
                    debug!("no-bounce page {} is not RAM, using a bounce buffer", page);
                }
                Err(e) => {
                    self.lock_failures.page_list_lock_failed();
                    return Err(e.into());
                }
            }
        }

        self.charge(buf.page_array_cost())?;
        Ok(if parm_type == ParmType::ContiguousPageList {
            GuestParm::ContiguousPageList(buf)
        } else {
            GuestParm::PageList(buf)
        })
    }

    fn embedded(&mut self, rec: &ParmRecord) -> Result<GuestParm> {
        let (flags, off_data, size) = rec.embedded();
        if size > VMMDEV_MAX_HGCM_DATA_SIZE {
            return Err(HgcmError::InvalidParameter("embedded buffer too large"));
        }
        if !parm_flags_are_valid(flags) {
            return Err(HgcmError::InvalidFlags(flags));
        }
        let cb = self.cb();
        if off_data < self.off_extra || off_data > cb || size > cb - off_data {
            return Err(HgcmError::InvalidParameter("embedded buffer outside the request"));
        }
        Ok(GuestParm::Embedded(GuestBuffer {
            size,
            off_first_page: off_data,
            direction: flags,
            pages: smallvec![self.gcphys.unchecked_add(off_data as u64)],
        }))
    }
}

/// Reads and validates the parameters of the call request `req` into `cmd`.
///
/// On failure the command keeps whatever it charged and locked so far; freeing
/// it releases everything.
pub fn fetch_call_parms(
    mem: &dyn GuestPhysMemory,
    heap: &mut HeapBudgets,
    cmd: &mut HgcmCommand,
    req: &[u8],
    request_type: RequestType,
    lock_failures: &dyn LockFailureCounter,
) -> Result<()> {
    let call_hdr: HgcmCall =
        read_obj(req, 0).ok_or(HgcmError::InvalidParameter("call request too small"))?;
    let parm_size = request_type.parm_struct_size();
    let is_64 = request_type == RequestType::HgcmCall64;
    check_parm_count(req.len() as u32, call_hdr.parm_count, parm_size)?;

    let category = cmd.category;
    let gcphys = cmd.gcphys;
    let CommandState {
        heap_cost, payload, ..
    } = cmd.state_mut();
    let call = match payload {
        Payload::Call(call) => call,
        _ => return Err(HgcmError::Internal("parameters fetched for a non-call command")),
    };
    call.client_id = call_hdr.client_id;
    call.function = call_hdr.function;
    call.parms.clear();

    let mut fetch = Fetch {
        mem,
        heap,
        category,
        heap_cost,
        gcphys,
        req,
        off_extra: HGCM_CALL_PARMS_OFFSET + call_hdr.parm_count * parm_size,
        lock_failures,
    };
    for i in 0..call_hdr.parm_count {
        let parm_off = HGCM_CALL_PARMS_OFFSET + i * parm_size;
        let rec = ParmRecord::read(req, parm_off as usize, is_64)
            .ok_or(HgcmError::InvalidParameter("parameter outside the request"))?;
        let parm = match ParmType::n(rec.parm_type) {
            Some(ParmType::Value32) => GuestParm::Value32 {
                value: rec.value32(),
                offset: parm_off + PARM_UNION_OFFSET,
            },
            Some(ParmType::Value64) => GuestParm::Value64 {
                value: rec.value64(),
                offset: parm_off + PARM_UNION_OFFSET,
            },
            Some(t @ (ParmType::LinAddr | ParmType::LinAddrIn | ParmType::LinAddrOut)) => {
                fetch.linaddr(t, &rec)?
            }
            Some(
                t @ (ParmType::PageList
                | ParmType::ContiguousPageList
                | ParmType::NoBouncePageList),
            ) => fetch.page_list(t, &rec)?,
            Some(ParmType::Embedded) => fetch.embedded(&rec)?,
            _ => {
                debug!("HGCM call parameter {} has unsupported type {}", i, rec.parm_type);
                return Err(HgcmError::InvalidParameter("unsupported parameter type"));
            }
        };
        call.parms.push(parm);
    }
    Ok(())
}

enum CopyIn {
    Request,
    Contiguous,
    Pages,
}

/// Builds the service side parameters of a call, copying in the data the guest
/// sends to the host. `req` is the current request contents.
pub fn init_host_parms(
    mem: &dyn GuestPhysMemory,
    heap: &mut HeapBudgets,
    category: HeapCategory,
    state: &mut CommandState,
    req: &[u8],
) -> Result<()> {
    let CommandState {
        heap_cost, payload, ..
    } = state;
    let call = match payload {
        Payload::Call(call) => call,
        _ => return Err(HgcmError::Internal("host parameters for a non-call command")),
    };
    call.host.clear();
    for parm in call.parms.iter_mut() {
        let (buf, copy_in) = match parm {
            GuestParm::Value32 { value, .. } => {
                call.host.push(HostParm::U32(*value));
                continue;
            }
            GuestParm::Value64 { value, .. } => {
                call.host.push(HostParm::U64(*value));
                continue;
            }
            GuestParm::NoBouncePageList { buf, lock } => {
                call.host.push(HostParm::Pages(HostPages::new(
                    buf.size,
                    buf.off_first_page,
                    buf.page_count(),
                    lock.take(),
                )));
                continue;
            }
            GuestParm::LinAddr { buf, .. } | GuestParm::PageList(buf) => (&*buf, CopyIn::Pages),
            GuestParm::ContiguousPageList(buf) => (&*buf, CopyIn::Contiguous),
            GuestParm::Embedded(buf) => (&*buf, CopyIn::Request),
        };

        let mut data = Vec::new();
        if buf.size > 0 {
            heap.charge_for_command(category, heap_cost, buf.size)?;
            data = vec![0u8; buf.size as usize];
            if buf.direction & VBOX_HGCM_F_PARM_DIRECTION_TO_HOST != 0 {
                match copy_in {
                    CopyIn::Request => {
                        let start = buf.off_first_page as usize;
                        let src = req.get(start..start + data.len()).ok_or(
                            HgcmError::InvalidParameter("embedded buffer outside the request"),
                        )?;
                        data.copy_from_slice(src);
                    }
                    CopyIn::Contiguous => {
                        let start = buf
                            .start()
                            .ok_or(HgcmError::Internal("contiguous page list without a page"))?;
                        mem.read_exact_at_addr(&mut data, start)?;
                    }
                    CopyIn::Pages => read_from_guest(mem, &mut data, buf)?,
                }
            }
        }
        call.host.push(HostParm::Buffer(HostBuffer {
            data,
            size: buf.size,
        }));
    }
    Ok(())
}

fn host_bytes(host: &HostBuffer) -> &[u8] {
    let len = (host.size as usize).min(host.data.len());
    &host.data[..len]
}

/// Copies the results of a completed call into the request copy `req` and the
/// guest buffers. Failures only affect the parameter concerned.
pub fn write_back_call(
    mem: &dyn GuestPhysMemory,
    state: &mut CommandState,
    request_type: RequestType,
    req: &mut [u8],
) {
    let call = match state.call_mut() {
        Some(call) => call,
        None => return,
    };
    let parm_size = request_type.parm_struct_size() as usize;
    for (i, (parm, host)) in call.parms.iter().zip(call.host.iter_mut()).enumerate() {
        let parm_off = HGCM_CALL_PARMS_OFFSET as usize + i * parm_size;
        let from_host = |buf: &GuestBuffer| {
            buf.size > 0 && buf.direction & VBOX_HGCM_F_PARM_DIRECTION_FROM_HOST != 0
        };
        let res = match (parm, host) {
            (GuestParm::Value32 { offset, .. }, HostParm::U32(v)) => {
                write_obj(req, *offset as usize, &*v);
                Ok(())
            }
            (GuestParm::Value64 { offset, .. }, HostParm::U64(v)) => {
                write_obj(req, *offset as usize, &*v);
                Ok(())
            }
            (
                GuestParm::LinAddr { buf, .. } | GuestParm::PageList(buf),
                HostParm::Buffer(host),
            ) => {
                if from_host(buf) {
                    write_to_guest(mem, buf, host_bytes(host))
                } else {
                    Ok(())
                }
            }
            (GuestParm::Embedded(buf), HostParm::Buffer(host)) => {
                write_obj(req, parm_off + EMBEDDED_SIZE_FIELD as usize, &host.size);
                if from_host(buf) {
                    let src = host_bytes(host);
                    let len = src.len().min(buf.size as usize);
                    let start = buf.off_first_page as usize;
                    if let Some(dst) = req.get_mut(start..start + len) {
                        dst.copy_from_slice(&src[..len]);
                    }
                }
                Ok(())
            }
            (GuestParm::ContiguousPageList(buf), HostParm::Buffer(host)) => {
                write_obj(req, parm_off + PAGE_LIST_SIZE_FIELD as usize, &host.size);
                match buf.start() {
                    Some(start) if from_host(buf) => {
                        let src = host_bytes(host);
                        let len = src.len().min(buf.size as usize);
                        mem.write_all_at_addr(&src[..len], start).map_err(HgcmError::from)
                    }
                    _ => Ok(()),
                }
            }
            (GuestParm::NoBouncePageList { .. }, HostParm::Pages(pages)) => {
                write_obj(req, parm_off + PAGE_LIST_SIZE_FIELD as usize, &pages.size);
                pages.release();
                Ok(())
            }
            (parm, host) => {
                warn!("HGCM parameter {} changed kind: {:?} vs {:?}", i, parm.parm_type(), host);
                Ok(())
            }
        };
        if let Err(e) = res {
            warn!("failed to write back HGCM parameter {}: {}", i, e);
        }
    }
}
