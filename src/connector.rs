// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The boundary between the device and the host side HGCM services.

use std::sync::mpsc::channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

use log::warn;
use parking_lot::Mutex;

use crate::command::HgcmCommand;
use crate::protocol::ServiceLocation;
use crate::status::Status;

/// Host side of HGCM: routes requests to services.
///
/// Every entry point receives the command as a completion token. Returning
/// [`Status::HGCM_ASYNC_EXECUTE`] means the request was accepted and will be
/// finished later through [`HgcmPort::completed`], possibly from another
/// thread and possibly before the entry point returns. The device lock is held
/// across these calls, so implementations must not call back into the device.
pub trait HgcmConnector: Send + Sync {
    /// Connects to the service named by `loc`. The assigned client id is
    /// reported with [`HgcmCommand::set_client_id`] before completion.
    fn connect(&self, cmd: &Arc<HgcmCommand>, loc: &ServiceLocation) -> Status;

    fn disconnect(&self, cmd: &Arc<HgcmCommand>, client_id: u32) -> Status;

    /// Calls `function` of the client's service. Parameters are available
    /// through [`HgcmCommand::host_parms`].
    fn call(
        &self,
        cmd: &Arc<HgcmCommand>,
        client_id: u32,
        function: u32,
        arrival: Instant,
    ) -> Status;

    /// The guest gave up on `cmd`. Called with the registry lock held.
    fn cancelled(&self, cmd: &Arc<HgcmCommand>, client_id: u32);
}

pub struct Completion {
    pub cmd: Arc<HgcmCommand>,
    pub result: Status,
}

/// Messages to the thread applying completions.
pub(crate) enum WorkerEvent {
    Completions,
    Exit,
}

/// Where services report finished commands. Completions are queued and
/// applied to guest memory by the device's completion worker, or by the next
/// request when no worker runs.
pub struct HgcmPort {
    tx: Mutex<Sender<Completion>>,
    waker: Mutex<Option<Sender<WorkerEvent>>>,
}

impl HgcmPort {
    pub(crate) fn new() -> (Arc<HgcmPort>, Receiver<Completion>) {
        let (tx, rx) = channel();
        let port = HgcmPort {
            tx: Mutex::new(tx),
            waker: Mutex::new(None),
        };
        (Arc::new(port), rx)
    }

    /// Sets the worker woken for every queued completion.
    pub(crate) fn set_waker(&self, waker: Option<Sender<WorkerEvent>>) {
        *self.waker.lock() = waker;
    }

    /// Reports that the service finished `cmd` with `result`.
    ///
    /// Returns [`Status::CANCELLED`] if the guest already cancelled the
    /// command; the device then only releases it.
    pub fn completed(&self, cmd: &Arc<HgcmCommand>, result: Status) -> Status {
        let cancelled = cmd.is_cancelled();
        let sent = self.tx.lock().send(Completion {
            cmd: cmd.clone(),
            result,
        });
        if sent.is_err() {
            warn!("HGCM completion for {} after the device went away", cmd.gcphys());
            return Status::CANCELLED;
        }
        if let Some(waker) = self.waker.lock().as_ref() {
            // A worker that already exited leaves the completion to the next request.
            let _ = waker.send(WorkerEvent::Completions);
        }
        if cancelled {
            Status::CANCELLED
        } else {
            Status::SUCCESS
        }
    }
}
