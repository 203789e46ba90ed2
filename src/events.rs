// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host to guest event delivery.

use std::sync::Arc;

use log::trace;
use serde::Deserialize;
use serde::Serialize;

/// The device's interrupt line.
pub trait IrqLine: Send + Sync {
    fn set_level(&self, asserted: bool);
}

/// Guest visible part of the event state, as saved in snapshots.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub host_events: u32,
    pub guest_filter: u32,
    pub new_filter: Option<u32>,
    pub have_events: bool,
    pub additions_ok: bool,
}

pub struct EventState {
    host_events: u32,
    guest_filter: u32,
    /// Filter change requested while events were pending, applied by the
    /// next acknowledge.
    new_filter: Option<u32>,
    have_events: bool,
    additions_ok: bool,
    irq: Arc<dyn IrqLine>,
    fast_acks: u64,
    slow_acks: u64,
}

impl EventState {
    pub fn new(irq: Arc<dyn IrqLine>) -> EventState {
        EventState {
            host_events: 0,
            guest_filter: 0,
            new_filter: None,
            have_events: false,
            additions_ok: false,
            irq,
            fast_acks: 0,
            slow_acks: 0,
        }
    }

    pub fn additions_ok(&self) -> bool {
        self.additions_ok
    }

    pub fn set_additions_ok(&mut self, ok: bool) {
        self.additions_ok = ok;
    }

    pub fn host_events(&self) -> u32 {
        self.host_events
    }

    pub fn guest_filter(&self) -> u32 {
        self.guest_filter
    }

    pub fn have_events(&self) -> bool {
        self.have_events
    }

    /// `(fast, slow)` acknowledge counts.
    pub fn ack_counts(&self) -> (u64, u64) {
        (self.fast_acks, self.slow_acks)
    }

    fn pending(&self) -> bool {
        self.host_events & self.guest_filter != 0
    }

    fn maybe_raise_irq(&mut self) {
        if self.pending() {
            self.have_events = true;
            self.irq.set_level(true);
        }
    }

    /// Posts `events` to the guest.
    pub fn notify(&mut self, events: u32) {
        trace!("notify guest events {:#x}", events);
        if self.additions_ok {
            let had_events = self.pending();
            self.host_events |= events;
            if !had_events {
                self.maybe_raise_irq();
            }
        } else {
            self.host_events |= events;
        }
    }

    pub fn set_filter_mask(&mut self, or_mask: u32, not_mask: u32) {
        if self.pending() {
            let filter = self.new_filter.get_or_insert(self.guest_filter);
            *filter |= or_mask;
            *filter &= !not_mask;
        } else {
            self.guest_filter |= or_mask;
            self.guest_filter &= !not_mask;
            self.maybe_raise_irq();
        }
    }

    fn take_events(&mut self) -> u32 {
        if let Some(filter) = self.new_filter.take() {
            self.guest_filter = filter;
        }
        let events = self.host_events & self.guest_filter;
        self.host_events &= !self.guest_filter;
        self.have_events = false;
        self.irq.set_level(false);
        events
    }

    /// The acknowledge-events request: returns and clears the pending events.
    pub fn acknowledge(&mut self) -> u32 {
        self.slow_acks += 1;
        self.take_events()
    }

    /// The I/O port read form of [`acknowledge`](Self::acknowledge). Returns
    /// all ones until the guest additions are ready.
    pub fn fast_acknowledge(&mut self) -> u32 {
        self.fast_acks += 1;
        if !self.additions_ok {
            return u32::MAX;
        }
        self.take_events()
    }

    pub fn reset(&mut self) {
        self.host_events = 0;
        self.guest_filter = 0;
        self.new_filter = None;
        self.have_events = false;
        self.additions_ok = false;
        self.irq.set_level(false);
    }

    pub fn snapshot(&self) -> EventSnapshot {
        EventSnapshot {
            host_events: self.host_events,
            guest_filter: self.guest_filter,
            new_filter: self.new_filter,
            have_events: self.have_events,
            additions_ok: self.additions_ok,
        }
    }

    pub fn restore(&mut self, snapshot: EventSnapshot) {
        self.host_events = snapshot.host_events;
        self.guest_filter = snapshot.guest_filter;
        self.new_filter = snapshot.new_filter;
        self.have_events = snapshot.have_events;
        self.additions_ok = snapshot.additions_ok;
        let pending = self.pending();
        self.irq.set_level(pending);
    }
}
