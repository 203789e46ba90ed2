// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The in-flight representation of an HGCM request.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use enumn::N;
use log::warn;
use parking_lot::MappedMutexGuard;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use vm_memory::GuestAddress;
use vm_memory::GuestMemoryError;
use vm_memory::PageMapping;
use vm_memory::GUEST_PAGE_SIZE;
use zerocopy::FromZeros;

use crate::buffer::GuestBuffer;
use crate::buffer::PageList;
use crate::error::Result;
use crate::heap::HeapBudgets;
use crate::heap::HeapCategory;
use crate::protocol::ParmType;
use crate::protocol::ServiceLocation;

#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum CommandKind {
    /// Loaded from an old saved state, to be rebuilt from guest memory.
    LoadState = 0,
    Connect = 1,
    Disconnect = 2,
    Call = 3,
}

/// A set of locked guest pages owned by a parameter.
pub struct PageLock(pub Box<dyn PageMapping>);

impl fmt::Debug for PageLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageLock")
            .field("pages", &self.0.page_count())
            .field("writable", &self.0.writable())
            .finish()
    }
}

/// A call parameter as described by the guest.
#[derive(Debug)]
pub enum GuestParm {
    /// `offset` locates the value within the request.
    Value32 { value: u32, offset: u32 },
    Value64 { value: u64, offset: u32 },
    /// `LinAddr`, `LinAddrIn` or `LinAddrOut`.
    LinAddr { parm_type: ParmType, buf: GuestBuffer },
    PageList(GuestBuffer),
    ContiguousPageList(GuestBuffer),
    /// Data inside the request itself. `buf.off_first_page` is the offset of
    /// the data within the request.
    Embedded(GuestBuffer),
    /// Pages mapped directly for the service. The lock moves to the host
    /// parameter once the call is submitted.
    NoBouncePageList { buf: GuestBuffer, lock: Option<PageLock> },
}

impl GuestParm {
    pub fn parm_type(&self) -> ParmType {
        match self {
            GuestParm::Value32 { .. } => ParmType::Value32,
            GuestParm::Value64 { .. } => ParmType::Value64,
            GuestParm::LinAddr { parm_type, .. } => *parm_type,
            GuestParm::PageList(_) => ParmType::PageList,
            GuestParm::ContiguousPageList(_) => ParmType::ContiguousPageList,
            GuestParm::Embedded(_) => ParmType::Embedded,
            GuestParm::NoBouncePageList { .. } => ParmType::NoBouncePageList,
        }
    }

    pub fn buffer(&self) -> Option<&GuestBuffer> {
        match self {
            GuestParm::Value32 { .. } | GuestParm::Value64 { .. } => None,
            GuestParm::LinAddr { buf, .. }
            | GuestParm::PageList(buf)
            | GuestParm::ContiguousPageList(buf)
            | GuestParm::Embedded(buf)
            | GuestParm::NoBouncePageList { buf, .. } => Some(buf),
        }
    }
}

/// A host owned bounce buffer. A service that produces less data than the
/// buffer holds lowers `size`.
#[derive(Debug, Default)]
pub struct HostBuffer {
    pub data: Vec<u8>,
    pub size: u32,
}

/// Guest pages mapped for a no-bounce parameter.
#[derive(Debug)]
pub struct HostPages {
    pub size: u32,
    pub off_first_page: u32,
    pub page_count: u32,
    lock: Option<PageLock>,
}

impl HostPages {
    pub fn new(size: u32, off_first_page: u32, page_count: u32, lock: Option<PageLock>) -> Self {
        HostPages {
            size,
            off_first_page,
            page_count,
            lock,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.lock.is_some()
    }

    fn chunks(
        &self,
        offset: u32,
        len: usize,
    ) -> impl Iterator<Item = (usize, usize, usize, usize)> {
        // (page index, offset in page, offset in caller buffer, length)
        let mut pos = self.off_first_page as usize + offset as usize;
        let mut done = 0;
        std::iter::from_fn(move || {
            if done == len {
                return None;
            }
            let page = pos / GUEST_PAGE_SIZE as usize;
            let in_page = pos % GUEST_PAGE_SIZE as usize;
            let n = (GUEST_PAGE_SIZE as usize - in_page).min(len - done);
            let chunk = (page, in_page, done, n);
            pos += n;
            done += n;
            Some(chunk)
        })
    }

    fn check_range(&self, offset: u32, len: usize) -> std::result::Result<(), GuestMemoryError> {
        if (offset as usize).saturating_add(len) > self.size as usize {
            return Err(GuestMemoryError::ShortRead {
                expected: len,
                completed: (self.size as usize).saturating_sub(offset as usize),
            });
        }
        Ok(())
    }

    /// Reads from the mapped pages starting `offset` bytes into the buffer.
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> std::result::Result<(), GuestMemoryError> {
        self.check_range(offset, buf.len())?;
        let lock = self.lock.as_ref().ok_or(GuestMemoryError::ShortRead {
            expected: buf.len(),
            completed: 0,
        })?;
        for (page, in_page, at, n) in self.chunks(offset, buf.len()) {
            lock.0.read_page(page, in_page, &mut buf[at..at + n])?;
        }
        Ok(())
    }

    /// Writes to the mapped pages starting `offset` bytes into the buffer.
    pub fn write(&mut self, offset: u32, buf: &[u8]) -> std::result::Result<(), GuestMemoryError> {
        self.check_range(offset, buf.len())
            .map_err(|_| GuestMemoryError::ShortWrite {
                expected: buf.len(),
                completed: 0,
            })?;
        let chunks: Vec<_> = self.chunks(offset, buf.len()).collect();
        let lock = self.lock.as_mut().ok_or(GuestMemoryError::ShortWrite {
            expected: buf.len(),
            completed: 0,
        })?;
        for (page, in_page, at, n) in chunks {
            lock.0.write_page(page, in_page, &buf[at..at + n])?;
        }
        Ok(())
    }

    /// Drops the page locks.
    pub fn release(&mut self) {
        self.lock = None;
    }
}

/// A call parameter as handed to the service.
#[derive(Debug)]
pub enum HostParm {
    U32(u32),
    U64(u64),
    Buffer(HostBuffer),
    Pages(HostPages),
}

/// Pages of a LinAddr parameter stored by the page array saved state format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyLinAddr {
    pub index: u32,
    pub off_first_page: u32,
    pub pages: PageList,
}

#[derive(Debug, Default)]
pub struct CallData {
    pub client_id: u32,
    pub function: u32,
    pub parms: Vec<GuestParm>,
    pub host: Vec<HostParm>,
}

#[derive(Debug)]
pub enum Payload {
    Connect { client_id: u32, loc: ServiceLocation },
    Disconnect { client_id: u32 },
    Call(CallData),
    /// Loaded in an old saved state format, awaiting reconstruction.
    Legacy { lin_addrs: Vec<LegacyLinAddr> },
}

pub struct CommandState {
    /// Bytes charged against the command's heap category.
    pub heap_cost: u32,
    pub payload: Payload,
    /// Mapping of the guest request while the command is in flight.
    pub req_lock: Option<Box<dyn PageMapping>>,
}

impl CommandState {
    pub fn call(&self) -> Option<&CallData> {
        match &self.payload {
            Payload::Call(call) => Some(call),
            _ => None,
        }
    }

    pub fn call_mut(&mut self) -> Option<&mut CallData> {
        match &mut self.payload {
            Payload::Call(call) => Some(call),
            _ => None,
        }
    }

    /// Releases every resource held by the parameters, newest first.
    fn release(&mut self) {
        if let Payload::Call(call) = &mut self.payload {
            while let Some(mut host) = call.host.pop() {
                match &mut host {
                    HostParm::Buffer(b) => b.data.fill(0),
                    HostParm::Pages(p) => p.release(),
                    HostParm::U32(_) | HostParm::U64(_) => {}
                }
            }
            while call.parms.pop().is_some() {}
        }
        self.req_lock = None;
    }
}

/// One outstanding HGCM request.
pub struct HgcmCommand {
    pub(crate) kind: CommandKind,
    pub(crate) gcphys: GuestAddress,
    pub(crate) cb_request: u32,
    pub(crate) request_type: u32,
    pub(crate) requestor: u32,
    pub(crate) category: HeapCategory,
    pub(crate) restored: bool,
    /// Saved without parameters; rebuild from guest memory on load.
    pub(crate) restore_from_guest_mem: bool,
    pub(crate) arrival: Instant,
    cancelled: AtomicBool,
    pub(crate) state: Mutex<CommandState>,
}

impl HgcmCommand {
    /// Creates a command for the request at `gcphys` and charges its object
    /// cost to the requestor's category.
    pub fn alloc(
        heap: &mut HeapBudgets,
        kind: CommandKind,
        gcphys: GuestAddress,
        cb_request: u32,
        parm_count: u32,
        requestor: u32,
    ) -> Result<HgcmCommand> {
        let category = HeapCategory::from_requestor(requestor);
        let heap_cost = heap.charge_command(category, kind == CommandKind::Connect, parm_count)?;
        let payload = match kind {
            CommandKind::Connect => Payload::Connect {
                client_id: 0,
                loc: ServiceLocation::new_zeroed(),
            },
            CommandKind::Disconnect => Payload::Disconnect { client_id: 0 },
            CommandKind::Call => Payload::Call(CallData {
                parms: Vec::with_capacity(parm_count as usize),
                host: Vec::with_capacity(parm_count as usize),
                ..Default::default()
            }),
            CommandKind::LoadState => Payload::Legacy {
                lin_addrs: Vec::new(),
            },
        };
        Ok(HgcmCommand {
            kind,
            gcphys,
            cb_request,
            request_type: 0,
            requestor,
            category,
            restored: false,
            restore_from_guest_mem: false,
            arrival: Instant::now(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(CommandState {
                heap_cost,
                payload,
                req_lock: None,
            }),
        })
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Guest physical address of the originating request.
    pub fn gcphys(&self) -> GuestAddress {
        self.gcphys
    }

    pub fn request_size(&self) -> u32 {
        self.cb_request
    }

    pub fn request_type(&self) -> u32 {
        self.request_type
    }

    /// The requestor tag, or the legacy tag if the guest does not report one.
    pub fn requestor(&self) -> u32 {
        self.requestor
    }

    pub fn heap_category(&self) -> HeapCategory {
        self.category
    }

    /// Whether the command was resubmitted after a restore.
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn heap_cost(&self) -> u32 {
        self.state.lock().heap_cost
    }

    pub fn client_id(&self) -> u32 {
        match &self.state.lock().payload {
            Payload::Connect { client_id, .. } | Payload::Disconnect { client_id } => *client_id,
            Payload::Call(call) => call.client_id,
            Payload::Legacy { .. } => 0,
        }
    }

    /// Records the client id a connect request was assigned.
    pub fn set_client_id(&self, id: u32) {
        if let Payload::Connect { client_id, .. } = &mut self.state.lock().payload {
            *client_id = id;
        }
    }

    pub fn function(&self) -> Option<u32> {
        self.state.lock().call().map(|c| c.function)
    }

    pub fn service_location(&self) -> Option<ServiceLocation> {
        match &self.state.lock().payload {
            Payload::Connect { loc, .. } => Some(*loc),
            _ => None,
        }
    }

    /// The service side parameters of a call. Empty for other commands.
    pub fn host_parms(&self) -> MappedMutexGuard<'_, [HostParm]> {
        MutexGuard::map(self.state.lock(), |s| match &mut s.payload {
            Payload::Call(call) => call.host.as_mut_slice(),
            _ => &mut [],
        })
    }

    /// Number of guest parameters of a call.
    pub fn parm_count(&self) -> usize {
        self.state.lock().call().map_or(0, |c| c.parms.len())
    }

    pub(crate) fn state_mut(&mut self) -> &mut CommandState {
        self.state.get_mut()
    }
}

impl fmt::Debug for HgcmCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HgcmCommand")
            .field("kind", &self.kind)
            .field("gcphys", &self.gcphys)
            .field("cb_request", &self.cb_request)
            .field("request_type", &self.request_type)
            .field("cancelled", &self.is_cancelled())
            .field("restored", &self.restored)
            .finish()
    }
}

/// Releases the command's resources and credits its heap cost.
pub fn free_command(heap: &mut HeapBudgets, cmd: &HgcmCommand) {
    let mut state = cmd.state.lock();
    state.release();
    if state.heap_cost == 0 {
        warn!("HGCM command at {} freed twice", cmd.gcphys);
        return;
    }
    heap.credit(cmd.category, state.heap_cost as u64);
    state.heap_cost = 0;
}
