// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use vm_memory::GuestAddress;

use crate::command::HgcmCommand;

/// All commands handed to the service and not yet completed, newest first.
#[derive(Default)]
pub struct Registry {
    list: Mutex<VecDeque<Arc<HgcmCommand>>>,
}

impl Registry {
    pub fn add(&self, cmd: Arc<HgcmCommand>) {
        self.list.lock().push_front(cmd);
    }

    /// Unregisters `cmd`. Returns false if it was not registered.
    pub fn remove(&self, cmd: &Arc<HgcmCommand>) -> bool {
        let mut list = self.list.lock();
        match list.iter().position(|c| Arc::ptr_eq(c, cmd)) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Holds the registry lock. Cancellation runs with it held so that a
    /// completion can not unregister the command in between.
    pub fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<HgcmCommand>>> {
        self.list.lock()
    }

    pub fn find(&self, gcphys: GuestAddress) -> Option<Arc<HgcmCommand>> {
        find_locked(&self.list.lock(), gcphys).cloned()
    }

    /// Snapshot of the registered commands, newest first.
    pub fn commands(&self) -> Vec<Arc<HgcmCommand>> {
        self.list.lock().iter().cloned().collect()
    }

    /// Unregisters every command, oldest first.
    pub fn take_all(&self) -> Vec<Arc<HgcmCommand>> {
        let mut list = self.list.lock();
        list.drain(..).rev().collect()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}

pub fn find_locked(
    list: &VecDeque<Arc<HgcmCommand>>,
    gcphys: GuestAddress,
) -> Option<&Arc<HgcmCommand>> {
    list.iter().find(|c| c.gcphys() == gcphys)
}
