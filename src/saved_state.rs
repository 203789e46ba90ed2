// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Saved state of in-flight HGCM commands.
//!
//! Commands are stored as a little endian record stream. Three layouts are
//! understood when loading:
//!
//! * version 17 and later: every parameter with its type specific data,
//! * versions 9 to 16: only the page arrays of LinAddr parameters,
//! * versions 6 to 8: only the request address and size.
//!
//! The two older layouts do not carry enough to resubmit a command, so those
//! commands are rebuilt from the request still in guest memory by
//! [`Hgcm::load_done`].

use std::mem::size_of;
use std::result;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;
use remain::sorted;
use smallvec::SmallVec;
use thiserror::Error;
use vm_memory::GuestAddress;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::buffer::page_array_cost;
use crate::buffer::GuestBuffer;
use crate::buffer::PageList;
use crate::command::free_command;
use crate::command::CallData;
use crate::command::CommandKind;
use crate::command::GuestParm;
use crate::command::HgcmCommand;
use crate::command::LegacyLinAddr;
use crate::command::Payload;
use crate::device::DeviceState;
use crate::error::HgcmError;
use crate::hgcm::requestor_of;
use crate::hgcm::Hgcm;
use crate::params::fetch_call_parms;
use crate::params::init_host_parms;
use crate::params::LockFailureCounter;
use crate::protocol::read_obj;
use crate::protocol::HgcmCall;
use crate::protocol::HgcmConnect;
use crate::protocol::HgcmDisconnect;
use crate::protocol::HgcmRequestHeader;
use crate::protocol::ParmType;
use crate::protocol::RequestHeader;
use crate::protocol::RequestType;
use crate::protocol::ServiceLocation;
use crate::protocol::VBOX_HGCM_REQ_DONE;
use crate::protocol::VMMDEV_EVENT_HGCM;
use crate::protocol::VMMDEV_MAX_HGCM_PARMS;
use crate::protocol::VMMDEV_REQUESTOR_LEGACY;
use crate::status::Status;

/// Version written by [`Hgcm::save`].
pub const SAVED_STATE_VERSION: u32 = 19;
/// First version storing complete call parameters.
pub const SAVED_STATE_VERSION_HGCM_PARAMS: u32 = 17;
/// First version storing the command kind and LinAddr page arrays.
pub const SAVED_STATE_VERSION_PAGE_ARRAYS: u32 = 9;
/// Last version with an extra word after the request size.
const SAVED_STATE_VERSION_EXTRA_WORD: u32 = 12;
/// Oldest version that can be loaded.
pub const SAVED_STATE_VERSION_MIN: u32 = 6;

#[sorted]
#[derive(Error, Debug)]
pub enum SavedStateError {
    #[error("invalid saved command: {0}")]
    Invalid(&'static str),
    #[error("failed to allocate a restored command: {0}")]
    NoMemory(HgcmError),
    #[error("saved state truncated at byte {0}")]
    Truncated(usize),
    #[error("unknown saved command kind {0}")]
    UnknownCommandKind(u32),
    #[error("unknown saved parameter type {0}")]
    UnknownParmType(u32),
    #[error("unsupported saved state version {0}")]
    UnsupportedVersion(u32),
}

pub type SavedStateResult<T> = result::Result<T, SavedStateError>;

struct Writer<'a> {
    out: &'a mut Vec<u8>,
}

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.out.extend_from_slice(v);
    }

    fn buffer(&mut self, buf: &GuestBuffer) {
        self.u32(buf.size);
        self.u32(buf.off_first_page);
        self.u32(buf.page_count());
        self.u32(buf.direction);
        for page in &buf.pages {
            self.u64(page.offset());
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> SavedStateResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(SavedStateError::Truncated(self.pos))?;
        let data = self.data;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> SavedStateResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> SavedStateResult<u32> {
        let mut v = [0u8; 4];
        v.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(v))
    }

    fn u64(&mut self) -> SavedStateResult<u64> {
        let mut v = [0u8; 8];
        v.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(v))
    }

    fn skip_u32(&mut self) -> SavedStateResult<()> {
        self.take(4).map(|_| ())
    }

    /// Fails unless `count` records of `record_size` bytes can still follow.
    fn check_records(&self, count: u32, record_size: usize) -> SavedStateResult<usize> {
        let count = count as usize;
        count
            .checked_mul(record_size)
            .filter(|&len| len <= self.data.len() - self.pos)
            .map(|_| count)
            .ok_or(SavedStateError::Truncated(self.pos))
    }

    fn pages(&mut self, count: u32) -> SavedStateResult<PageList> {
        let mut pages = SmallVec::with_capacity(self.check_records(count, 8)?);
        for _ in 0..count {
            pages.push(GuestAddress(self.u64()?));
        }
        Ok(pages)
    }
}

/// Nothing is locked while loading.
struct NoLockFailures;

impl LockFailureCounter for NoLockFailures {
    fn page_list_lock_failed(&self) {}
}

impl Hgcm {
    /// Appends the registered commands to `out` in the current format.
    pub fn save(&self, out: &mut Vec<u8>) {
        // Oldest first, so loading them newest first restores the order.
        let mut commands = self.registry.commands();
        commands.reverse();
        let mut w = Writer { out };
        w.u32(commands.len() as u32);
        for cmd in &commands {
            let state = cmd.state.lock();
            let parm_count = state.call().map_or(0, |c| c.parms.len() as u32);
            w.u32(cmd.kind as u32);
            w.u8(cmd.is_cancelled() as u8);
            w.u64(cmd.gcphys.offset());
            w.u32(cmd.cb_request);
            w.u32(cmd.request_type);
            w.u32(parm_count);
            match &state.payload {
                Payload::Call(call) => {
                    w.u32(call.client_id);
                    w.u32(call.function);
                    for parm in &call.parms {
                        w.u32(parm.parm_type() as u32);
                        match parm {
                            GuestParm::Value32 { value, offset } => {
                                w.u64(u64::from(*value));
                                w.u32(*offset);
                                w.u32(4);
                            }
                            GuestParm::Value64 { value, offset } => {
                                w.u64(*value);
                                w.u32(*offset);
                                w.u32(8);
                            }
                            GuestParm::LinAddr { buf, .. }
                            | GuestParm::PageList(buf)
                            | GuestParm::ContiguousPageList(buf)
                            | GuestParm::Embedded(buf) => w.buffer(buf),
                            // Only used by services that do not survive a
                            // restore; rebuilt from guest memory if needed.
                            GuestParm::NoBouncePageList { .. } => {}
                        }
                    }
                }
                Payload::Connect { client_id, loc } => {
                    w.u32(*client_id);
                    w.bytes(loc.as_bytes());
                }
                Payload::Disconnect { client_id } => w.u32(*client_id),
                Payload::Legacy { .. } => {}
            }
            w.u32(0);
        }
        w.u32(0);
        debug!("saved {} HGCM commands", commands.len());
    }

    /// Loads commands saved in format `version` and holds them in the
    /// registry until [`load_done`](Self::load_done). On failure nothing
    /// stays registered.
    pub fn load(
        &self,
        dev: &mut DeviceState,
        version: u32,
        data: &[u8],
    ) -> SavedStateResult<()> {
        if !(SAVED_STATE_VERSION_MIN..=SAVED_STATE_VERSION).contains(&version) {
            return Err(SavedStateError::UnsupportedVersion(version));
        }
        let mut r = Reader { data, pos: 0 };
        let res = if version >= SAVED_STATE_VERSION_HGCM_PARAMS {
            self.load_current(dev, &mut r)
        } else if version >= SAVED_STATE_VERSION_PAGE_ARRAYS {
            self.load_page_arrays(dev, version, &mut r)
        } else {
            self.load_ancient(dev, &mut r)
        };
        match res {
            Ok(count) => {
                info!("loaded {} HGCM commands from version {}", count, version);
                Ok(())
            }
            Err(e) => {
                for cmd in self.registry.take_all() {
                    free_command(&mut dev.heap, &cmd);
                }
                Err(e)
            }
        }
    }

    fn hold_loaded(&self, dev: &mut DeviceState, cmd: HgcmCommand, cancelled: bool) {
        if cancelled {
            // The guest may already have reused the request memory.
            debug!("dropping cancelled saved command at {}", cmd.gcphys);
            free_command(&mut dev.heap, &cmd);
            return;
        }
        self.add_command(dev, Arc::new(cmd));
    }

    fn load_current(&self, dev: &mut DeviceState, r: &mut Reader) -> SavedStateResult<u32> {
        let count = r.u32()?;
        for _ in 0..count {
            let raw_kind = r.u32()?;
            let kind =
                CommandKind::n(raw_kind).ok_or(SavedStateError::UnknownCommandKind(raw_kind))?;
            let cancelled = r.u8()? != 0;
            let gcphys = GuestAddress(r.u64()?);
            let cb_request = r.u32()?;
            let request_type = r.u32()?;
            let parm_count = r.u32()?;
            if parm_count > VMMDEV_MAX_HGCM_PARMS {
                return Err(SavedStateError::Invalid("too many parameters"));
            }

            let mut cmd = HgcmCommand::alloc(
                &mut dev.heap,
                kind,
                gcphys,
                cb_request,
                parm_count,
                VMMDEV_REQUESTOR_LEGACY,
            )
            .map_err(SavedStateError::NoMemory)?;
            cmd.request_type = request_type;
            cmd.restored = true;
            let res = self
                .load_payload(dev, r, &mut cmd, parm_count)
                .and_then(|_| r.skip_u32());
            if let Err(e) = res {
                free_command(&mut dev.heap, &cmd);
                return Err(e);
            }
            self.hold_loaded(dev, cmd, cancelled);
        }
        r.skip_u32()?;
        Ok(count)
    }

    fn load_payload(
        &self,
        dev: &mut DeviceState,
        r: &mut Reader,
        cmd: &mut HgcmCommand,
        parm_count: u32,
    ) -> SavedStateResult<()> {
        let category = cmd.category;
        let mut from_guest_mem = false;
        let state = cmd.state_mut();
        match &mut state.payload {
            Payload::Call(call) => {
                call.client_id = r.u32()?;
                call.function = r.u32()?;
                for _ in 0..parm_count {
                    let raw_type = r.u32()?;
                    let parm_type =
                        ParmType::n(raw_type).ok_or(SavedStateError::UnknownParmType(raw_type))?;
                    let parm = match parm_type {
                        ParmType::Value32 => {
                            let value = r.u64()? as u32;
                            let offset = r.u32()?;
                            r.skip_u32()?;
                            GuestParm::Value32 { value, offset }
                        }
                        ParmType::Value64 => {
                            let value = r.u64()?;
                            let offset = r.u32()?;
                            r.skip_u32()?;
                            GuestParm::Value64 { value, offset }
                        }
                        ParmType::LinAddr
                        | ParmType::LinAddrIn
                        | ParmType::LinAddrOut
                        | ParmType::PageList
                        | ParmType::ContiguousPageList
                        | ParmType::Embedded => {
                            let size = r.u32()?;
                            let off_first_page = r.u32()?;
                            let page_count = r.u32()?;
                            let direction = r.u32()?;
                            if page_count != 1 {
                                if matches!(
                                    parm_type,
                                    ParmType::ContiguousPageList | ParmType::Embedded
                                ) {
                                    return Err(SavedStateError::Invalid(
                                        "single page buffer with several pages",
                                    ));
                                }
                                dev.heap
                                    .charge_for_command(
                                        category,
                                        &mut state.heap_cost,
                                        page_array_cost(page_count),
                                    )
                                    .map_err(SavedStateError::NoMemory)?;
                            }
                            let buf = GuestBuffer {
                                size,
                                off_first_page,
                                direction,
                                pages: r.pages(page_count)?,
                            };
                            match parm_type {
                                ParmType::PageList => GuestParm::PageList(buf),
                                ParmType::ContiguousPageList => GuestParm::ContiguousPageList(buf),
                                ParmType::Embedded => GuestParm::Embedded(buf),
                                t => GuestParm::LinAddr { parm_type: t, buf },
                            }
                        }
                        ParmType::NoBouncePageList => {
                            from_guest_mem = true;
                            GuestParm::NoBouncePageList {
                                buf: GuestBuffer::default(),
                                lock: None,
                            }
                        }
                        _ => return Err(SavedStateError::UnknownParmType(raw_type)),
                    };
                    call.parms.push(parm);
                }
            }
            Payload::Connect { client_id, loc } => {
                *client_id = r.u32()?;
                *loc = ServiceLocation::read_from_bytes(r.take(size_of::<ServiceLocation>())?)
                    .map_err(|_| SavedStateError::Invalid("service location"))?;
            }
            Payload::Disconnect { client_id } => *client_id = r.u32()?,
            Payload::Legacy { .. } => {}
        }
        cmd.restore_from_guest_mem = from_guest_mem;
        Ok(())
    }

    fn load_page_arrays(
        &self,
        dev: &mut DeviceState,
        version: u32,
        r: &mut Reader,
    ) -> SavedStateResult<u32> {
        let count = r.u32()?;
        for _ in 0..count {
            let gcphys = GuestAddress(r.u64()?);
            let cb_request = r.u32()?;
            if version <= SAVED_STATE_VERSION_EXTRA_WORD {
                r.skip_u32()?;
            }
            let raw_kind = r.u32()?;
            let kind =
                CommandKind::n(raw_kind).ok_or(SavedStateError::UnknownCommandKind(raw_kind))?;
            let cancelled = r.u8()? != 0;
            let lin_addr_count = r.u32()?;

            let mut cmd = HgcmCommand::alloc(
                &mut dev.heap,
                CommandKind::LoadState,
                gcphys,
                cb_request,
                0,
                VMMDEV_REQUESTOR_LEGACY,
            )
            .map_err(SavedStateError::NoMemory)?;
            cmd.kind = kind;
            cmd.restored = true;
            let res = if lin_addr_count > 0 {
                self.load_lin_addrs(dev, r, &mut cmd, lin_addr_count)
            } else {
                Ok(())
            };
            if let Err(e) = res.and_then(|_| r.skip_u32()) {
                free_command(&mut dev.heap, &cmd);
                return Err(e);
            }
            self.hold_loaded(dev, cmd, cancelled);
        }
        r.skip_u32()?;
        Ok(count)
    }

    fn load_lin_addrs(
        &self,
        dev: &mut DeviceState,
        r: &mut Reader,
        cmd: &mut HgcmCommand,
        count: u32,
    ) -> SavedStateResult<()> {
        let category = cmd.category;
        let state = cmd.state_mut();
        // Total page count, recomputed from the entries.
        r.skip_u32()?;
        let mut lin_addrs = Vec::with_capacity(r.check_records(count, 12)?);
        for _ in 0..count {
            let index = r.u32()?;
            let off_first_page = r.u32()?;
            let page_count = r.u32()?;
            dev.heap
                .charge_for_command(category, &mut state.heap_cost, page_array_cost(page_count))
                .map_err(SavedStateError::NoMemory)?;
            lin_addrs.push(LegacyLinAddr {
                index,
                off_first_page,
                pages: r.pages(page_count)?,
            });
        }
        state.payload = Payload::Legacy { lin_addrs };
        Ok(())
    }

    fn load_ancient(&self, dev: &mut DeviceState, r: &mut Reader) -> SavedStateResult<u32> {
        let count = r.u32()?;
        for _ in 0..count {
            let gcphys = GuestAddress(r.u64()?);
            let cb_request = r.u32()?;
            let mut cmd = HgcmCommand::alloc(
                &mut dev.heap,
                CommandKind::LoadState,
                gcphys,
                cb_request,
                0,
                VMMDEV_REQUESTOR_LEGACY,
            )
            .map_err(SavedStateError::NoMemory)?;
            cmd.restored = true;
            self.hold_loaded(dev, cmd, false);
        }
        Ok(count)
    }

    /// Resubmits every loaded command, rebuilding it from guest memory first
    /// when the saved state did not describe it completely. Commands that
    /// can not be resubmitted are failed in the guest request. Returns the
    /// number of commands the service accepted.
    pub fn load_done(&self, dev: &mut DeviceState, version: u32) -> usize {
        let mut resubmitted = 0;
        for old in self.registry.take_all() {
            let gcphys = old.gcphys;
            let cb_request = old.cb_request;
            let cmd = if version < SAVED_STATE_VERSION_HGCM_PARAMS || old.restore_from_guest_mem {
                let rebuilt = self.rebuild(dev, &old, version);
                free_command(&mut dev.heap, &old);
                match rebuilt {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        warn!("failed to rebuild saved HGCM request at {}: {}", gcphys, e);
                        self.fail_restored(dev, gcphys, cb_request, e.status());
                        continue;
                    }
                }
            } else {
                old
            };
            match self.resubmit(dev, &cmd) {
                Ok(()) => resubmitted += 1,
                Err(e) => {
                    warn!("failed to resubmit HGCM request at {}: {}", gcphys, e);
                    free_command(&mut dev.heap, &cmd);
                    self.fail_restored(dev, gcphys, cb_request, e.status());
                }
            }
        }
        resubmitted
    }

    /// Builds a complete command from the request at the address of `old`.
    fn rebuild(
        &self,
        dev: &mut DeviceState,
        old: &HgcmCommand,
        version: u32,
    ) -> Result<Arc<HgcmCommand>, HgcmError> {
        let cb = old.cb_request;
        if (cb as usize) < size_of::<HgcmRequestHeader>() {
            return Err(HgcmError::Mismatch("request smaller than an HGCM header"));
        }
        let mut req = vec![0u8; cb as usize];
        self.mem.read_exact_at_addr(&mut req, old.gcphys)?;
        let hdr: RequestHeader =
            read_obj(&req, 0).ok_or(HgcmError::Mismatch("request header"))?;
        if hdr.size != cb {
            return Err(HgcmError::Mismatch("request size changed"));
        }
        let (kind, request_type) = match RequestType::n(hdr.request_type) {
            Some(RequestType::HgcmConnect) => (CommandKind::Connect, RequestType::HgcmConnect),
            Some(RequestType::HgcmDisconnect) => {
                (CommandKind::Disconnect, RequestType::HgcmDisconnect)
            }
            Some(t @ (RequestType::HgcmCall32 | RequestType::HgcmCall64)) => (CommandKind::Call, t),
            _ => return Err(HgcmError::Mismatch("not an HGCM request")),
        };
        if version >= SAVED_STATE_VERSION_PAGE_ARRAYS && old.kind != kind {
            return Err(HgcmError::Mismatch("request kind changed"));
        }
        let requestor = requestor_of(dev, &hdr);

        let mut cmd = match kind {
            CommandKind::Connect => {
                let connect: HgcmConnect =
                    read_obj(&req, 0).ok_or(HgcmError::Mismatch("connect request too small"))?;
                let mut cmd =
                    HgcmCommand::alloc(&mut dev.heap, kind, old.gcphys, cb, 0, requestor)?;
                cmd.state_mut().payload = Payload::Connect {
                    client_id: connect.client_id,
                    loc: connect.loc,
                };
                cmd
            }
            CommandKind::Disconnect => {
                let disconnect: HgcmDisconnect = read_obj(&req, 0)
                    .ok_or(HgcmError::Mismatch("disconnect request too small"))?;
                let mut cmd =
                    HgcmCommand::alloc(&mut dev.heap, kind, old.gcphys, cb, 0, requestor)?;
                cmd.state_mut().payload = Payload::Disconnect {
                    client_id: disconnect.client_id,
                };
                cmd
            }
            _ => self.rebuild_call(dev, old, &req, request_type, requestor)?,
        };
        cmd.request_type = hdr.request_type;
        cmd.restored = true;
        Ok(Arc::new(cmd))
    }

    fn rebuild_call(
        &self,
        dev: &mut DeviceState,
        old: &HgcmCommand,
        req: &[u8],
        request_type: RequestType,
        requestor: u32,
    ) -> Result<HgcmCommand, HgcmError> {
        let parm_count = read_obj::<HgcmCall>(req, 0)
            .ok_or(HgcmError::Mismatch("call request too small"))?
            .parm_count;
        let mut cmd = HgcmCommand::alloc(
            &mut dev.heap,
            CommandKind::Call,
            old.gcphys,
            old.cb_request,
            parm_count,
            requestor,
        )?;
        let res = fetch_call_parms(
            &*self.mem,
            &mut dev.heap,
            &mut cmd,
            req,
            request_type,
            &NoLockFailures,
        )
        .and_then(|_| {
            let lin_addrs = match &old.state.lock().payload {
                Payload::Legacy { lin_addrs } => lin_addrs.clone(),
                _ => Vec::new(),
            };
            match cmd.state_mut().call_mut() {
                Some(call) => apply_legacy_pages(call, &lin_addrs),
                None => Err(HgcmError::Internal("rebuilt call without call data")),
            }
        });
        if let Err(e) = res {
            free_command(&mut dev.heap, &cmd);
            return Err(e);
        }
        Ok(cmd)
    }

    /// Hands a loaded command to the service again. On failure the command is
    /// no longer registered.
    fn resubmit(&self, dev: &mut DeviceState, cmd: &Arc<HgcmCommand>) -> Result<(), HgcmError> {
        let connector = self.connector()?;
        if cmd.kind == CommandKind::Call {
            let mut req = vec![0u8; cmd.cb_request as usize];
            self.mem.read_exact_at_addr(&mut req, cmd.gcphys)?;
            let mut state = cmd.state.lock();
            init_host_parms(&*self.mem, &mut dev.heap, cmd.category, &mut state, &req)?;
        }
        let status = self.dispatch(dev, &*connector, cmd);
        let accepted = match cmd.kind {
            CommandKind::Call => status == Status::HGCM_ASYNC_EXECUTE,
            _ => status.is_success(),
        };
        if !accepted {
            self.registry.remove(cmd);
            return Err(HgcmError::Service(status));
        }
        Ok(())
    }

    /// Completes the request at `gcphys` with `status` without a command.
    fn fail_restored(&self, dev: &mut DeviceState, gcphys: GuestAddress, cb: u32, status: Status) {
        if (cb as usize) < size_of::<HgcmRequestHeader>() {
            return;
        }
        let mut hdr = HgcmRequestHeader::default();
        if let Err(e) = self.mem.read_exact_at_addr(hdr.as_mut_bytes(), gcphys) {
            warn!("failed to read restored HGCM request at {}: {}", gcphys, e);
            return;
        }
        hdr.header.rc = status.0;
        hdr.result = status.0;
        hdr.flags |= VBOX_HGCM_REQ_DONE;
        if let Err(e) = self.mem.write_all_at_addr(hdr.as_bytes(), gcphys) {
            warn!("failed to fail restored HGCM request at {}: {}", gcphys, e);
            return;
        }
        dev.events.notify(VMMDEV_EVENT_HGCM);
    }
}

/// Puts the page arrays of an old saved state back into the rebuilt
/// parameters they were saved for.
fn apply_legacy_pages(call: &mut CallData, lin_addrs: &[LegacyLinAddr]) -> Result<(), HgcmError> {
    for la in lin_addrs {
        let parm = call
            .parms
            .get_mut(la.index as usize)
            .ok_or(HgcmError::Mismatch("saved parameter index"))?;
        match parm {
            GuestParm::LinAddr { buf, .. } => {
                if buf.off_first_page != la.off_first_page
                    || buf.page_count() as usize != la.pages.len()
                {
                    return Err(HgcmError::Mismatch("saved page array does not fit"));
                }
                buf.pages = la.pages.clone();
            }
            _ => return Err(HgcmError::Mismatch("saved pages for a non LinAddr parameter")),
        }
    }
    Ok(())
}
