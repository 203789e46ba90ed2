// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The VMMDev request front end.
//!
//! The guest hands the device the physical address of a request; the device
//! validates the common header, dispatches on the request type and writes the
//! request back with its status. HGCM requests accepted for asynchronous
//! execution are written back later, when the service completes them.

use std::mem::size_of;
use std::sync::mpsc::channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::error;
use log::trace;
use log::warn;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use vm_memory::GuestAddress;
use vm_memory::GuestPhysMemory;
use vm_memory::PageMapping;
use vm_memory::GUEST_PAGE_SIZE;
use zerocopy::IntoBytes;

use crate::config::VmmdevConfig;
use crate::connector::HgcmConnector;
use crate::connector::HgcmPort;
use crate::connector::WorkerEvent;
use crate::error::HgcmError;
use crate::error::Result;
use crate::events::EventState;
use crate::events::IrqLine;
use crate::heap::HeapBudgets;
use crate::heap::HeapCategory;
use crate::heap::HeapStats;
use crate::hgcm::Hgcm;
use crate::hgcm::HgcmCounters;
use crate::protocol::read_obj;
use crate::protocol::write_obj;
use crate::protocol::CtlGuestFilterMask;
use crate::protocol::Events;
use crate::protocol::HgcmCall;
use crate::protocol::HgcmCancel;
use crate::protocol::HgcmCancel2;
use crate::protocol::HgcmConnect;
use crate::protocol::HgcmDisconnect;
use crate::protocol::RequestHeader;
use crate::protocol::RequestType;
use crate::protocol::REQUEST_HEADER_RC_OFFSET;
use crate::protocol::VMMDEV_EVENT_HGCM;
use crate::protocol::VMMDEV_MAX_VMMDEVREQ_SIZE;
use crate::protocol::VMMDEV_REQUEST_HEADER_VERSION;
use crate::saved_state::SavedStateResult;
use crate::saved_state::SAVED_STATE_VERSION;
use crate::status::Status;

/// State serialized by the device lock.
pub struct DeviceState {
    pub(crate) events: EventState,
    pub(crate) heap: HeapBudgets,
    /// Whether the guest reports requestor information in request headers.
    pub(crate) requestor_info: bool,
    /// Format of the last loaded HGCM state, for the load-done pass.
    pub(crate) saved_state_version: u32,
}

/// Counters exposed for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmmdevStats {
    pub heap: Vec<(HeapCategory, HeapStats)>,
    /// Commands too large for the cached cost class.
    pub large_command_allocs: u64,
    pub fast_acks: u64,
    pub slow_acks: u64,
    pub hgcm: HgcmCounters,
    pub pending_commands: usize,
}

/// Lower bound (or exact size) of each request type.
fn size_ok(request_type: RequestType, size: usize) -> bool {
    match request_type {
        RequestType::AcknowledgeEvents => size == size_of::<Events>(),
        RequestType::CtlGuestFilterMask => size == size_of::<CtlGuestFilterMask>(),
        RequestType::HgcmConnect => size >= size_of::<HgcmConnect>(),
        RequestType::HgcmDisconnect => size >= size_of::<HgcmDisconnect>(),
        RequestType::HgcmCall32 | RequestType::HgcmCall64 => size >= size_of::<HgcmCall>(),
        RequestType::HgcmCancel => size >= size_of::<HgcmCancel>(),
        RequestType::HgcmCancel2 => size >= size_of::<HgcmCancel2>(),
    }
}

fn is_hgcm_request(request_type: RequestType) -> bool {
    matches!(
        request_type,
        RequestType::HgcmConnect
            | RequestType::HgcmDisconnect
            | RequestType::HgcmCall32
            | RequestType::HgcmCall64
    )
}

/// Applies queued completions each time the port signals new ones.
fn run_completion_worker(events: Receiver<WorkerEvent>, state: &Mutex<DeviceState>, hgcm: &Hgcm) {
    while let Ok(WorkerEvent::Completions) = events.recv() {
        let mut dev = state.lock();
        let count = hgcm.process_completions(&mut dev);
        trace!("completion worker applied {} HGCM completions", count);
    }
}

pub struct Vmmdev {
    config: VmmdevConfig,
    mem: Arc<dyn GuestPhysMemory>,
    pub(crate) state: Arc<Mutex<DeviceState>>,
    pub(crate) hgcm: Arc<Hgcm>,
    worker: Option<(Sender<WorkerEvent>, JoinHandle<()>)>,
}

impl Vmmdev {
    pub fn new(
        mem: Arc<dyn GuestPhysMemory>,
        irq: Arc<dyn IrqLine>,
        config: VmmdevConfig,
    ) -> Vmmdev {
        let heap = HeapBudgets::from_config(&config);
        for category in HeapCategory::ALL {
            debug!("HGCM heap budget {:?}: {:#x}", category, heap.available(category));
        }
        let mut vmmdev = Vmmdev {
            config,
            hgcm: Arc::new(Hgcm::new(mem.clone())),
            mem,
            state: Arc::new(Mutex::new(DeviceState {
                events: EventState::new(irq),
                heap,
                requestor_info: false,
                saved_state_version: SAVED_STATE_VERSION,
            })),
            worker: None,
        };
        vmmdev.start_worker();
        vmmdev
    }

    /// Starts the thread that applies completions reported by services. If
    /// the thread cannot be spawned, completions wait for the next request or
    /// an explicit [`Vmmdev::process_completions`].
    pub(crate) fn start_worker(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let (tx, rx) = channel();
        let state = self.state.clone();
        let hgcm = self.hgcm.clone();
        let spawned = thread::Builder::new()
            .name("vmmdev_hgcm".into())
            .spawn(move || run_completion_worker(rx, &state, &hgcm));
        match spawned {
            Ok(handle) => {
                self.hgcm.port().set_waker(Some(tx.clone()));
                // Completions queued while no worker ran.
                let _ = tx.send(WorkerEvent::Completions);
                self.worker = Some((tx, handle));
            }
            Err(e) => error!("failed to spawn HGCM completion worker: {}", e),
        }
    }

    /// Stops the completion worker. Completions queue up until it is started
    /// again.
    pub(crate) fn stop_worker(&mut self) {
        self.hgcm.port().set_waker(None);
        if let Some((tx, handle)) = self.worker.take() {
            let _ = tx.send(WorkerEvent::Exit);
            if handle.join().is_err() {
                warn!("HGCM completion worker panicked");
            }
        }
    }

    /// Connects the host side services. Until then HGCM requests fail with
    /// `NOT_SUPPORTED`.
    pub fn attach_hgcm_connector(&self, connector: Arc<dyn HgcmConnector>) {
        self.hgcm.attach_connector(connector);
    }

    /// The handle services report completions to.
    pub fn hgcm_port(&self) -> Arc<HgcmPort> {
        self.hgcm.port()
    }

    /// Records whether the guest additions reported themselves ready.
    pub fn set_additions_ok(&self, ok: bool) {
        self.state.lock().events.set_additions_ok(ok);
    }

    /// Records whether the guest fills in the requestor field of requests.
    pub fn set_requestor_info(&self, enabled: bool) {
        self.state.lock().requestor_info = enabled;
    }

    /// Posts host events to the guest.
    pub fn notify_guest(&self, events: u32) {
        self.state.lock().events.notify(events);
    }

    /// The fast acknowledge: an I/O port read returning the pending events.
    pub fn fast_ack_events(&self) -> u32 {
        self.state.lock().events.fast_acknowledge()
    }

    /// Applies the completions services have reported since the last call.
    pub fn process_completions(&self) -> usize {
        let mut dev = self.state.lock();
        self.hgcm.process_completions(&mut dev)
    }

    pub fn pending_hgcm_commands(&self) -> usize {
        self.hgcm.pending_commands()
    }

    pub fn heap_available(&self, category: HeapCategory) -> u64 {
        self.state.lock().heap.available(category)
    }

    pub fn stats(&self) -> VmmdevStats {
        let dev = self.state.lock();
        let (fast_acks, slow_acks) = dev.events.ack_counts();
        VmmdevStats {
            heap: HeapCategory::ALL
                .iter()
                .map(|&c| (c, dev.heap.stats(c)))
                .collect(),
            large_command_allocs: dev.heap.large_command_allocs(),
            fast_acks,
            slow_acks,
            hgcm: self.hgcm.counters(),
            pending_commands: self.hgcm.pending_commands(),
        }
    }

    /// Drops all in-flight commands and returns the event state to power on.
    pub fn reset(&self) {
        let mut dev = self.state.lock();
        self.hgcm.reset(&mut dev);
        dev.events.reset();
        dev.requestor_info = false;
    }

    /// Serializes the in-flight HGCM commands in the current format.
    pub fn save_hgcm_state(&self) -> Vec<u8> {
        let _dev = self.state.lock();
        let mut out = Vec::new();
        self.hgcm.save(&mut out);
        out
    }

    /// Loads HGCM commands saved in format `version`. They are resubmitted by
    /// [`hgcm_load_done`](Self::hgcm_load_done).
    pub fn load_hgcm_state(&self, version: u32, data: &[u8]) -> SavedStateResult<()> {
        let mut dev = self.state.lock();
        self.hgcm.load(&mut dev, version, data)?;
        dev.saved_state_version = version;
        Ok(())
    }

    /// Resubmits the loaded commands. Returns how many the service accepted.
    pub fn hgcm_load_done(&self) -> usize {
        let mut dev = self.state.lock();
        let version = dev.saved_state_version;
        let resubmitted = self.hgcm.load_done(&mut dev, version);
        dev.saved_state_version = SAVED_STATE_VERSION;
        resubmitted
    }

    /// Handles the request the guest placed at `gcphys`.
    pub fn handle_request(&self, gcphys: GuestAddress) {
        let mut hdr = RequestHeader::default();
        if let Err(e) = self.mem.read_exact_at_addr(hdr.as_mut_bytes(), gcphys) {
            warn!("failed to read VMMDev request header at {}: {}", gcphys, e);
            return;
        }
        if (hdr.size as usize) < size_of::<RequestHeader>()
            || hdr.version != VMMDEV_REQUEST_HEADER_VERSION
        {
            debug!("ignoring request at {}: size {} version {:#x}", gcphys, hdr.size, hdr.version);
            return;
        }

        let mut dev = self.state.lock();
        if hdr.size > VMMDEV_MAX_VMMDEVREQ_SIZE || !dev.events.additions_ok() {
            debug!(
                "refusing request type {} of {} bytes at {}",
                hdr.request_type, hdr.size, gcphys
            );
            hdr.rc = Status::NOT_SUPPORTED.0;
            if let Err(e) = self.mem.write_all_at_addr(hdr.as_bytes(), gcphys) {
                warn!("failed to write back VMMDev request at {}: {}", gcphys, e);
            }
            return;
        }

        let request_type = RequestType::n(hdr.request_type);
        let page_off = gcphys.page_offset() as usize;
        let mut req_lock = None;
        if self.config.lock_requests
            && request_type.is_some_and(RequestType::is_hgcm_call)
            && page_off + hdr.size as usize <= GUEST_PAGE_SIZE as usize
        {
            match self.mem.lock_pages(&[gcphys.page_base()], true) {
                Ok(lock) => req_lock = Some(lock),
                Err(e) => debug!("request at {} not locked: {}", gcphys, e),
            }
        }

        let mut req = vec![0u8; hdr.size as usize];
        let read = match &req_lock {
            Some(lock) => lock.read_page(0, page_off, &mut req),
            None => self.mem.read_exact_at_addr(&mut req, gcphys),
        };
        if let Err(e) = read {
            warn!("failed to read VMMDev request at {}: {}", gcphys, e);
            return;
        }

        let rc = match request_type {
            Some(t) => {
                trace!("VMMDev request {:?} at {}", t, gcphys);
                self.dispatch(&mut dev, gcphys, t, &mut req, &mut req_lock)
                    .unwrap_or_else(|e| {
                        debug!("VMMDev request {:?} at {} failed: {}", t, gcphys, e);
                        e.status()
                    })
            }
            None => {
                debug!("unsupported VMMDev request type {}", hdr.request_type);
                Status::NOT_SUPPORTED
            }
        };

        let accepted =
            rc == Status::HGCM_ASYNC_EXECUTE && request_type.is_some_and(is_hgcm_request);
        if !accepted {
            write_obj(&mut req, REQUEST_HEADER_RC_OFFSET as usize, &rc.0);
            let written = match req_lock.as_mut() {
                Some(lock) => lock.write_page(0, page_off, &req),
                None => self.mem.write_all_at_addr(&req, gcphys),
            };
            if let Err(e) = written {
                warn!("failed to write back VMMDev request at {}: {}", gcphys, e);
            }
        }
        drop(req_lock);

        // Services may have completed synchronously.
        self.hgcm.process_completions(&mut dev);
    }

    fn dispatch(
        &self,
        dev: &mut DeviceState,
        gcphys: GuestAddress,
        request_type: RequestType,
        req: &mut [u8],
        req_lock: &mut Option<Box<dyn PageMapping>>,
    ) -> Result<Status> {
        if !size_ok(request_type, req.len()) {
            return Err(HgcmError::InvalidParameter("request size"));
        }
        if is_hgcm_request(request_type) {
            self.mark_async(gcphys, req, req_lock);
        }
        match request_type {
            RequestType::AcknowledgeEvents => {
                let events = dev.events.acknowledge();
                let mut ack: Events = read_obj(req, 0).unwrap_or_default();
                ack.events = events;
                write_obj(req, 0, &ack);
                Ok(Status::SUCCESS)
            }
            RequestType::CtlGuestFilterMask => {
                let ctl: CtlGuestFilterMask = read_obj(req, 0).unwrap_or_default();
                // The guest may not turn HGCM notifications off.
                dev.events
                    .set_filter_mask(ctl.or_mask, ctl.not_mask & !VMMDEV_EVENT_HGCM);
                Ok(Status::SUCCESS)
            }
            RequestType::HgcmConnect => self.hgcm.connect(dev, gcphys, req),
            RequestType::HgcmDisconnect => self.hgcm.disconnect(dev, gcphys, req),
            RequestType::HgcmCall32 | RequestType::HgcmCall64 => {
                self.hgcm.call(dev, gcphys, req, request_type, req_lock)
            }
            RequestType::HgcmCancel => match self.hgcm.cancel(gcphys) {
                Ok(()) => Ok(Status::SUCCESS),
                Err(HgcmError::NotFound(_)) => {
                    Err(HgcmError::InvalidParameter("no such HGCM request"))
                }
                Err(e) => Err(e),
            },
            RequestType::HgcmCancel2 => {
                let cancel: HgcmCancel2 = read_obj(req, 0).unwrap_or_default();
                self.hgcm
                    .cancel(GuestAddress(u64::from(cancel.phys_req_to_cancel)))
                    .map(|_| Status::SUCCESS)
            }
        }
    }

    /// Marks an HGCM request as in progress before it is handed to a service.
    fn mark_async(
        &self,
        gcphys: GuestAddress,
        req: &mut [u8],
        req_lock: &mut Option<Box<dyn PageMapping>>,
    ) {
        let rc = Status::HGCM_ASYNC_EXECUTE.0;
        write_obj(req, REQUEST_HEADER_RC_OFFSET as usize, &rc);
        let page_off = gcphys.page_offset() as usize + REQUEST_HEADER_RC_OFFSET as usize;
        let res = match req_lock.as_mut() {
            Some(lock) => lock.write_page(0, page_off, rc.as_bytes()),
            None => self
                .mem
                .write_all_at_addr(rc.as_bytes(), gcphys.unchecked_add(REQUEST_HEADER_RC_OFFSET)),
        };
        if let Err(e) = res {
            warn!("failed to mark HGCM request at {} in progress: {}", gcphys, e);
        }
    }
}

impl Drop for Vmmdev {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
