// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The HGCM engine: turns guest requests into commands, hands them to the
//! service connector and writes the results back when the service is done.
//!
//! Every entry point runs with the device lock held, which is what the
//! `&mut DeviceState` argument stands for. Services complete commands from
//! their own threads through [`HgcmPort`]; those completions are only applied
//! to guest memory by [`Hgcm::process_completions`], which the device's
//! completion worker runs whenever the port wakes it.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use log::debug;
use log::trace;
use log::warn;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use vm_memory::GuestAddress;
use vm_memory::GuestPhysMemory;
use vm_memory::PageMapping;

use crate::command::free_command;
use crate::command::CommandKind;
use crate::command::HgcmCommand;
use crate::command::Payload;
use crate::connector::Completion;
use crate::connector::HgcmConnector;
use crate::connector::HgcmPort;
use crate::device::DeviceState;
use crate::error::HgcmError;
use crate::error::Result;
use crate::params::check_parm_count;
use crate::params::fetch_call_parms;
use crate::params::init_host_parms;
use crate::params::write_back_call;
use crate::params::LockFailureCounter;
use crate::protocol::read_obj;
use crate::protocol::write_obj;
use crate::protocol::HgcmCall;
use crate::protocol::HgcmConnect;
use crate::protocol::HgcmDisconnect;
use crate::protocol::HgcmRequestHeader;
use crate::protocol::RequestHeader;
use crate::protocol::RequestType;
use crate::protocol::HGCM_CONNECT_CLIENT_ID_OFFSET;
use crate::protocol::HGCM_HEADER_FLAGS_OFFSET;
use crate::protocol::HGCM_HEADER_RESULT_OFFSET;
use crate::protocol::VBOX_HGCM_REQ_DONE;
use crate::protocol::VMMDEV_EVENT_HGCM;
use crate::protocol::VMMDEV_HGCM_LOC_LOCALHOST_EXISTING;
use crate::protocol::VMMDEV_REQUESTOR_LEGACY;
use crate::registry::find_locked;
use crate::registry::Registry;
use crate::status::Status;

#[derive(Default)]
struct HgcmStats {
    failed_page_list_locks: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
}

impl LockFailureCounter for HgcmStats {
    fn page_list_lock_failed(&self) {
        self.failed_page_list_locks.fetch_add(1, Ordering::Relaxed);
    }
}

/// Engine wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HgcmCounters {
    /// No-bounce page lists that could not be locked.
    pub failed_page_list_locks: u64,
    /// Completions written back to the guest.
    pub completed: u64,
    /// Completions dropped because the guest cancelled the command.
    pub cancelled: u64,
}

/// The requestor tag recorded for a request with header `hdr`.
pub(crate) fn requestor_of(dev: &DeviceState, hdr: &RequestHeader) -> u32 {
    if dev.requestor_info {
        hdr.requestor
    } else {
        VMMDEV_REQUESTOR_LEGACY
    }
}

fn service_result(status: Status) -> Result<Status> {
    if status.is_failure() {
        Err(HgcmError::Service(status))
    } else {
        Ok(status)
    }
}

pub struct Hgcm {
    pub(crate) mem: Arc<dyn GuestPhysMemory>,
    pub(crate) registry: Registry,
    connector: RwLock<Option<Arc<dyn HgcmConnector>>>,
    port: Arc<HgcmPort>,
    completions: Mutex<Receiver<Completion>>,
    /// Set once the HGCM event has been enabled in the guest filter.
    event_enabled: AtomicBool,
    stats: HgcmStats,
}

impl Hgcm {
    pub fn new(mem: Arc<dyn GuestPhysMemory>) -> Hgcm {
        let (port, completions) = HgcmPort::new();
        Hgcm {
            mem,
            registry: Registry::default(),
            connector: RwLock::new(None),
            port,
            completions: Mutex::new(completions),
            event_enabled: AtomicBool::new(false),
            stats: HgcmStats::default(),
        }
    }

    /// The handle services use to report completions.
    pub fn port(&self) -> Arc<HgcmPort> {
        self.port.clone()
    }

    pub fn attach_connector(&self, connector: Arc<dyn HgcmConnector>) {
        *self.connector.write() = Some(connector);
    }

    pub fn has_connector(&self) -> bool {
        self.connector.read().is_some()
    }

    pub(crate) fn connector(&self) -> Result<Arc<dyn HgcmConnector>> {
        self.connector.read().clone().ok_or(HgcmError::NotSupported)
    }

    /// Number of commands handed to the service and not yet completed.
    pub fn pending_commands(&self) -> usize {
        self.registry.len()
    }

    pub fn counters(&self) -> HgcmCounters {
        HgcmCounters {
            failed_page_list_locks: self.stats.failed_page_list_locks.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_command(&self, dev: &mut DeviceState, cmd: Arc<HgcmCommand>) {
        let kind = cmd.kind;
        self.registry.add(cmd);
        if kind != CommandKind::LoadState && !self.event_enabled.swap(true, Ordering::AcqRel) {
            debug!("enabling HGCM event notification");
            dev.events.set_filter_mask(VMMDEV_EVENT_HGCM, 0);
        }
    }

    /// Registers `cmd` and passes it to the service. Returns what the service
    /// said; the caller decides whether the command stays registered.
    pub(crate) fn dispatch(
        &self,
        dev: &mut DeviceState,
        connector: &dyn HgcmConnector,
        cmd: &Arc<HgcmCommand>,
    ) -> Status {
        self.add_command(dev, cmd.clone());
        match cmd.kind {
            CommandKind::Connect => match cmd.service_location() {
                Some(loc) => connector.connect(cmd, &loc),
                None => Status::INTERNAL_ERROR,
            },
            CommandKind::Disconnect => connector.disconnect(cmd, cmd.client_id()),
            CommandKind::Call => {
                let (client_id, function) = cmd
                    .state
                    .lock()
                    .call()
                    .map_or((0, 0), |c| (c.client_id, c.function));
                connector.call(cmd, client_id, function, cmd.arrival)
            }
            CommandKind::LoadState => Status::INTERNAL_ERROR,
        }
    }

    /// Handles an HGCMConnect request. Only already existing services may be
    /// connected to.
    pub fn connect(
        &self,
        dev: &mut DeviceState,
        gcphys: GuestAddress,
        req: &[u8],
    ) -> Result<Status> {
        let connect: HgcmConnect =
            read_obj(req, 0).ok_or(HgcmError::InvalidParameter("connect request too small"))?;
        if connect.loc.location_type != VMMDEV_HGCM_LOC_LOCALHOST_EXISTING {
            debug!("HGCM connect to location type {} refused", connect.loc.location_type);
            return Err(HgcmError::InvalidParameter("service location type"));
        }
        let connector = self.connector()?;
        let hdr = connect.header.header;
        let requestor = requestor_of(dev, &hdr);
        let mut cmd = HgcmCommand::alloc(
            &mut dev.heap,
            CommandKind::Connect,
            gcphys,
            hdr.size,
            0,
            requestor,
        )?;
        cmd.request_type = hdr.request_type;
        if let Payload::Connect { loc, .. } = &mut cmd.state_mut().payload {
            *loc = connect.loc;
        }
        let cmd = Arc::new(cmd);
        let status = self.dispatch(dev, &*connector, &cmd);
        if status.is_failure() {
            self.registry.remove(&cmd);
            free_command(&mut dev.heap, &cmd);
        }
        service_result(status)
    }

    pub fn disconnect(
        &self,
        dev: &mut DeviceState,
        gcphys: GuestAddress,
        req: &[u8],
    ) -> Result<Status> {
        let disconnect: HgcmDisconnect =
            read_obj(req, 0).ok_or(HgcmError::InvalidParameter("disconnect request too small"))?;
        let connector = self.connector()?;
        let hdr = disconnect.header.header;
        let requestor = requestor_of(dev, &hdr);
        let mut cmd = HgcmCommand::alloc(
            &mut dev.heap,
            CommandKind::Disconnect,
            gcphys,
            hdr.size,
            0,
            requestor,
        )?;
        cmd.request_type = hdr.request_type;
        if let Payload::Disconnect { client_id } = &mut cmd.state_mut().payload {
            *client_id = disconnect.client_id;
        }
        let cmd = Arc::new(cmd);
        let status = self.dispatch(dev, &*connector, &cmd);
        if status.is_failure() {
            self.registry.remove(&cmd);
            free_command(&mut dev.heap, &cmd);
        }
        service_result(status)
    }

    /// Handles an HGCMCall32/64 request whose contents are `req`.
    ///
    /// If the call is accepted for asynchronous execution the command takes
    /// `req_lock`; otherwise the lock is left with the caller so it can write
    /// the result back through it.
    pub fn call(
        &self,
        dev: &mut DeviceState,
        gcphys: GuestAddress,
        req: &[u8],
        request_type: RequestType,
        req_lock: &mut Option<Box<dyn PageMapping>>,
    ) -> Result<Status> {
        let call: HgcmCall =
            read_obj(req, 0).ok_or(HgcmError::InvalidParameter("call request too small"))?;
        check_parm_count(
            req.len() as u32,
            call.parm_count,
            request_type.parm_struct_size(),
        )?;
        let connector = self.connector()?;
        let hdr = call.header.header;
        let requestor = requestor_of(dev, &hdr);
        let mut cmd = HgcmCommand::alloc(
            &mut dev.heap,
            CommandKind::Call,
            gcphys,
            req.len() as u32,
            call.parm_count,
            requestor,
        )?;
        cmd.request_type = request_type as u32;

        let fetched = fetch_call_parms(
            &*self.mem,
            &mut dev.heap,
            &mut cmd,
            req,
            request_type,
            &self.stats,
        )
        .and_then(|_| {
            let category = cmd.category;
            init_host_parms(&*self.mem, &mut dev.heap, category, cmd.state_mut(), req)
        });
        if let Err(e) = fetched {
            free_command(&mut dev.heap, &cmd);
            return Err(e);
        }

        cmd.state_mut().req_lock = req_lock.take();
        let cmd = Arc::new(cmd);
        let status = self.dispatch(dev, &*connector, &cmd);
        if status == Status::HGCM_ASYNC_EXECUTE {
            return Ok(status);
        }
        trace!("HGCM call at {} finished synchronously: {}", gcphys, status);
        self.registry.remove(&cmd);
        *req_lock = cmd.state.lock().req_lock.take();
        free_command(&mut dev.heap, &cmd);
        service_result(status)
    }

    /// Cancels the command of the request at `gcphys`.
    ///
    /// The flag is set and the service told with the registry lock held, so a
    /// completion either sees the flag or has already unregistered the
    /// command, in which case this reports `NotFound`.
    pub fn cancel(&self, gcphys: GuestAddress) -> Result<()> {
        let connector = self.connector()?;
        let addr = gcphys.offset();
        if addr == 0 || addr == u64::MAX || addr == u64::from(u32::MAX) {
            return Err(HgcmError::InvalidParameter("no request address to cancel"));
        }
        let list = self.registry.lock();
        let cmd = find_locked(&list, gcphys).ok_or(HgcmError::NotFound(gcphys))?;
        debug!("cancelling HGCM command at {}", gcphys);
        cmd.set_cancelled();
        connector.cancelled(cmd, cmd.client_id());
        Ok(())
    }

    /// Applies every queued completion. Returns how many were processed.
    pub fn process_completions(&self, dev: &mut DeviceState) -> usize {
        let completions = self.completions.lock();
        let mut count = 0;
        while let Ok(Completion { cmd, result }) = completions.try_recv() {
            self.complete(dev, &cmd, result);
            count += 1;
        }
        count
    }

    fn complete(&self, dev: &mut DeviceState, cmd: &Arc<HgcmCommand>, result: Status) {
        if result == Status::HGCM_SAVE_STATE {
            // Stays registered, so it is saved and resubmitted after restore.
            trace!("HGCM command at {} parked for saved state", cmd.gcphys);
            return;
        }
        if !self.registry.remove(cmd) {
            warn!("completion for unregistered HGCM command at {}", cmd.gcphys);
            return;
        }
        if cmd.is_cancelled() {
            debug!("dropping completion of cancelled HGCM command at {}", cmd.gcphys);
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            free_command(&mut dev.heap, cmd);
            return;
        }
        match self.write_completion(cmd, result) {
            Ok(()) => {
                dev.events.notify(VMMDEV_EVENT_HGCM);
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("failed to complete HGCM request at {}: {}", cmd.gcphys, e),
        }
        free_command(&mut dev.heap, cmd);
    }

    /// Writes the outcome of `cmd` into the guest request: parameters and
    /// result first, then the DONE flag.
    fn write_completion(&self, cmd: &HgcmCommand, result: Status) -> Result<()> {
        let mut state = cmd.state.lock();
        let page_off = cmd.gcphys.page_offset() as usize;
        let mut req = vec![0u8; cmd.cb_request as usize];
        match &state.req_lock {
            Some(lock) => lock.read_page(0, page_off, &mut req)?,
            None => self.mem.read_exact_at_addr(&mut req, cmd.gcphys)?,
        }
        let hdr: HgcmRequestHeader =
            read_obj(&req, 0).ok_or(HgcmError::Internal("request shorter than its header"))?;

        let guest_type = hdr.header.request_type;
        let mut rc = Status::SUCCESS;
        if guest_type == cmd.request_type || guest_type == RequestType::HgcmCancel as u32 {
            match RequestType::n(guest_type) {
                Some(t @ (RequestType::HgcmCall32 | RequestType::HgcmCall64)) => {
                    write_back_call(&*self.mem, &mut state, t, &mut req)
                }
                Some(RequestType::HgcmConnect) => {
                    if let Payload::Connect { client_id, .. } = &state.payload {
                        write_obj(&mut req, HGCM_CONNECT_CLIENT_ID_OFFSET, client_id);
                    }
                }
                _ => {}
            }
        } else {
            warn!(
                "HGCM request at {} changed type from {} to {} while in flight",
                cmd.gcphys, cmd.request_type, guest_type
            );
            rc = Status::INVALID_PARAMETER;
        }

        let result = if rc.is_success() { result } else { rc };
        write_obj(&mut req, HGCM_HEADER_RESULT_OFFSET as usize, &result.0);
        let flags = (hdr.flags | VBOX_HGCM_REQ_DONE).to_le_bytes();
        match state.req_lock.as_mut() {
            Some(lock) => {
                lock.write_page(0, page_off, &req)?;
                lock.write_page(0, page_off + HGCM_HEADER_FLAGS_OFFSET as usize, &flags)?;
            }
            None => {
                self.mem.write_all_at_addr(&req, cmd.gcphys)?;
                self.mem
                    .write_all_at_addr(&flags, cmd.gcphys.unchecked_add(HGCM_HEADER_FLAGS_OFFSET))?;
            }
        }
        Ok(())
    }

    /// Drops every command without completing it.
    pub fn reset(&self, dev: &mut DeviceState) {
        let commands = self.registry.take_all();
        if !commands.is_empty() {
            debug!("dropping {} HGCM commands on reset", commands.len());
        }
        for cmd in commands {
            free_command(&mut dev.heap, &cmd);
        }
        // Anything still queued refers to the commands freed above.
        let completions = self.completions.lock();
        while completions.try_recv().is_ok() {}
        self.event_enabled.store(false, Ordering::Release);
    }
}
