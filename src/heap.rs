// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host memory budgets for HGCM traffic.
//!
//! Every command and every buffer allocated on behalf of a guest request is
//! charged against the budget of the requestor's category and credited back
//! when the command is freed. Budgets live in the device state and are only
//! touched with the device lock held.

use enumn::N;
use log::debug;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::config::VmmdevConfig;
use crate::error::HgcmError;
use crate::error::Result;
use crate::protocol::VMMDEV_MAX_HGCM_DATA_SIZE;
use crate::protocol::VMMDEV_REQUESTOR_LEGACY;
use crate::protocol::VMMDEV_REQUESTOR_USR_DRV;
use crate::protocol::VMMDEV_REQUESTOR_USR_DRV_OTHER;
use crate::protocol::VMMDEV_REQUESTOR_USR_MASK;
use crate::protocol::VMMDEV_REQUESTOR_USR_NOT_GIVEN;
use crate::protocol::VMMDEV_REQUESTOR_USR_ROOT;
use crate::protocol::VMMDEV_REQUESTOR_USR_SYSTEM;

/// Cost of a command with up to [`CACHED_COMMAND_PARMS`] parameters.
pub const CACHED_COMMAND_COST: u32 = 504;
pub const CACHED_COMMAND_PARMS: u32 = 6;
/// Cost model of larger commands: a fixed header plus a guest and a host
/// parameter slot per parameter, plus room for the service location of a
/// connect request.
pub const COMMAND_HEADER_COST: u32 = 120;
pub const PARM_SLOT_COST: u32 = 40 + 24;
pub const SERVICE_LOCATION_COST: u32 = 132;
/// Per page cost of a guest page address array.
pub const PAGE_ADDRESS_COST: u32 = 8;
/// Per page cost of a no-bounce page lock table.
pub const PAGE_LOCK_COST: u32 = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, N)]
#[repr(u8)]
pub enum HeapCategory {
    Kernel = 0,
    Root = 1,
    User = 2,
}

impl HeapCategory {
    pub const ALL: [HeapCategory; 3] = [
        HeapCategory::Kernel,
        HeapCategory::Root,
        HeapCategory::User,
    ];

    /// Picks the category charged for requests carrying `requestor`.
    pub fn from_requestor(requestor: u32) -> HeapCategory {
        if requestor == VMMDEV_REQUESTOR_LEGACY {
            return HeapCategory::Kernel;
        }
        match requestor & VMMDEV_REQUESTOR_USR_MASK {
            VMMDEV_REQUESTOR_USR_NOT_GIVEN
            | VMMDEV_REQUESTOR_USR_DRV
            | VMMDEV_REQUESTOR_USR_DRV_OTHER => HeapCategory::Kernel,
            VMMDEV_REQUESTOR_USR_ROOT | VMMDEV_REQUESTOR_USR_SYSTEM => HeapCategory::Root,
            _ => HeapCategory::User,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Heap cost of a command object with `parm_count` parameters.
pub fn command_cost(is_connect: bool, parm_count: u32) -> u32 {
    if parm_count <= CACHED_COMMAND_PARMS {
        return CACHED_COMMAND_COST;
    }
    let connect = if is_connect { SERVICE_LOCATION_COST } else { 0 };
    COMMAND_HEADER_COST
        .saturating_add(parm_count.saturating_mul(PARM_SLOT_COST))
        .saturating_add(connect)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    pub configured: u64,
    pub available: u64,
    pub overruns: u64,
    /// Total bytes ever charged to the category.
    pub message_usage: u64,
}

#[derive(Debug)]
struct Budget {
    configured: u64,
    available: u64,
    overruns: u64,
    message_usage: u64,
}

/// Per category budgets.
#[derive(Debug)]
pub struct HeapBudgets {
    budgets: [Budget; 3],
    large_command_allocs: u64,
}

impl HeapBudgets {
    pub fn new(kernel: u64, root: u64, user: u64) -> HeapBudgets {
        let budget = |configured| Budget {
            configured,
            available: configured,
            overruns: 0,
            message_usage: 0,
        };
        HeapBudgets {
            budgets: [budget(kernel), budget(root), budget(user)],
            large_command_allocs: 0,
        }
    }

    pub fn from_config(config: &VmmdevConfig) -> HeapBudgets {
        HeapBudgets::new(
            config.heap_budget(HeapCategory::Kernel),
            config.heap_budget(HeapCategory::Root),
            config.heap_budget(HeapCategory::User),
        )
    }

    pub fn available(&self, category: HeapCategory) -> u64 {
        self.budgets[category.index()].available
    }

    pub fn stats(&self, category: HeapCategory) -> HeapStats {
        let b = &self.budgets[category.index()];
        HeapStats {
            configured: b.configured,
            available: b.available,
            overruns: b.overruns,
            message_usage: b.message_usage,
        }
    }

    /// Number of commands too large for the cached cost class.
    pub fn large_command_allocs(&self) -> u64 {
        self.large_command_allocs
    }

    /// Takes `size` bytes from the budget of `category`. On refusal the
    /// overrun counter is bumped and nothing is charged.
    pub fn try_charge(&mut self, category: HeapCategory, size: u64) -> bool {
        let b = &mut self.budgets[category.index()];
        if size <= b.available {
            b.available -= size;
            b.message_usage = b.message_usage.saturating_add(size);
            true
        } else {
            b.overruns += 1;
            debug!(
                "HGCM heap budget overrun: {:?} wants {:#x}, {:#x} available",
                category, size, b.available
            );
            false
        }
    }

    /// Charges the object of a new command. Returns its cost.
    pub fn charge_command(
        &mut self,
        category: HeapCategory,
        is_connect: bool,
        parm_count: u32,
    ) -> Result<u32> {
        let cost = command_cost(is_connect, parm_count);
        if parm_count > CACHED_COMMAND_PARMS {
            self.large_command_allocs += 1;
        }
        if self.try_charge(category, cost as u64) {
            Ok(cost)
        } else {
            Err(HgcmError::NoMemory)
        }
    }

    /// Charges an allocation made on behalf of a command whose cost so far is
    /// `cost`. A single command may never exceed the maximum HGCM data size.
    pub fn charge_for_command(
        &mut self,
        category: HeapCategory,
        cost: &mut u32,
        size: u32,
    ) -> Result<()> {
        if size > VMMDEV_MAX_HGCM_DATA_SIZE.saturating_sub(*cost) {
            self.budgets[category.index()].overruns += 1;
            debug!("HGCM request too big: {:#x} on top of {:#x}", size, *cost);
            return Err(HgcmError::NoMemory);
        }
        if !self.try_charge(category, size as u64) {
            return Err(HgcmError::NoMemory);
        }
        *cost += size;
        Ok(())
    }

    /// Returns `size` bytes to the budget of `category`.
    pub fn credit(&mut self, category: HeapCategory, size: u64) {
        let b = &mut self.budgets[category.index()];
        let available = b.available.saturating_add(size);
        if available > b.configured {
            warn!(
                "HGCM heap budget of {:?} credited beyond its configured size ({:#x} > {:#x})",
                category, available, b.configured
            );
            b.available = b.configured;
        } else {
            b.available = available;
        }
    }
}
