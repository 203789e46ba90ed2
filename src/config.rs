// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use libc::sysconf;
use libc::_SC_PAGESIZE;
use libc::_SC_PHYS_PAGES;
use serde::Deserialize;
use serde::Serialize;

use crate::heap::HeapCategory;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Smallest and largest computed per category budget.
pub const MIN_HEAP_BUDGET: u64 = 32 * MIB;
pub const MAX_HEAP_BUDGET: u64 = GIB;

/// Host RAM assumed when the host does not tell us.
const FALLBACK_HOST_RAM: u64 = 8 * GIB;

fn default_lock_requests() -> bool {
    true
}

/// Parameters of the VMMDev device and its HGCM engine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct VmmdevConfig {
    /// Budget used for every category without a specific value.
    #[serde(default)]
    pub heap_budget_default: Option<u64>,
    #[serde(default)]
    pub heap_budget_kernel: Option<u64>,
    #[serde(default)]
    pub heap_budget_root: Option<u64>,
    #[serde(default)]
    pub heap_budget_user: Option<u64>,
    /// Lock single page HGCM call requests into host memory while in flight.
    #[serde(default = "default_lock_requests")]
    pub lock_requests: bool,
}

impl Default for VmmdevConfig {
    fn default() -> Self {
        VmmdevConfig {
            heap_budget_default: None,
            heap_budget_kernel: None,
            heap_budget_root: None,
            heap_budget_user: None,
            lock_requests: default_lock_requests(),
        }
    }
}

impl VmmdevConfig {
    /// Parses a JSON configuration document.
    pub fn from_json(json: &str) -> serde_json::Result<VmmdevConfig> {
        serde_json::from_str(json)
    }

    /// The effective budget of `category` in bytes.
    pub fn heap_budget(&self, category: HeapCategory) -> u64 {
        let specific = match category {
            HeapCategory::Kernel => self.heap_budget_kernel,
            HeapCategory::Root => self.heap_budget_root,
            HeapCategory::User => self.heap_budget_user,
        };
        specific
            .or(self.heap_budget_default)
            .unwrap_or_else(default_heap_budget)
    }
}

/// An eighth of host RAM split over the three categories, clamped to
/// [`MIN_HEAP_BUDGET`, `MAX_HEAP_BUDGET`].
pub fn default_heap_budget() -> u64 {
    (host_ram_size() / 8 / 3).clamp(MIN_HEAP_BUDGET, MAX_HEAP_BUDGET)
}

fn host_ram_size() -> u64 {
    // SAFETY: trivially safe
    let pages = unsafe { sysconf(_SC_PHYS_PAGES) };
    // SAFETY: trivially safe
    let page_size = unsafe { sysconf(_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return FALLBACK_HOST_RAM;
    }
    (pages as u64).saturating_mul(page_size as u64)
}
