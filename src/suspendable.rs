// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Snapshot and restore of the device.

use anyhow::anyhow;
use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

use crate::device::Vmmdev;
use crate::events::EventSnapshot;
use crate::saved_state::SAVED_STATE_VERSION;

/// This trait provides the functions required for a device to implement to
/// successfully suspend/resume.
pub trait Suspendable {
    /// Save the device state in an image that can be restored.
    fn snapshot(&self) -> anyhow::Result<serde_json::Value> {
        Err(anyhow!(
            "Suspendable::snapshot not implemented for {}",
            std::any::type_name::<Self>()
        ))
    }
    /// Load a saved snapshot of an image.
    fn restore(&mut self, _data: serde_json::Value) -> anyhow::Result<()> {
        Err(anyhow!(
            "Suspendable::restore not implemented for {}",
            std::any::type_name::<Self>()
        ))
    }
    /// Stop all threads related to the device.
    /// Sleep should be idempotent.
    fn sleep(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    /// Create/Resume all threads related to the device.
    /// Wake should be idempotent.
    fn wake(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct VmmdevSnapshot {
    events: EventSnapshot,
    requestor_info: bool,
    hgcm_version: u32,
    hgcm: Vec<u8>,
}

impl Suspendable for Vmmdev {
    fn snapshot(&self) -> anyhow::Result<serde_json::Value> {
        let dev = self.state.lock();
        let mut hgcm = Vec::new();
        self.hgcm.save(&mut hgcm);
        serde_json::to_value(VmmdevSnapshot {
            events: dev.events.snapshot(),
            requestor_info: dev.requestor_info,
            hgcm_version: SAVED_STATE_VERSION,
            hgcm,
        })
        .context("failed to serialize vmmdev snapshot")
    }

    fn restore(&mut self, data: serde_json::Value) -> anyhow::Result<()> {
        let snapshot: VmmdevSnapshot =
            serde_json::from_value(data).context("failed to deserialize vmmdev snapshot")?;
        let mut dev = self.state.lock();
        self.hgcm.reset(&mut dev);
        dev.events.restore(snapshot.events);
        dev.requestor_info = snapshot.requestor_info;
        self.hgcm
            .load(&mut dev, snapshot.hgcm_version, &snapshot.hgcm)
            .context("failed to load HGCM commands")?;
        self.hgcm.load_done(&mut dev, snapshot.hgcm_version);
        Ok(())
    }

    fn sleep(&mut self) -> anyhow::Result<()> {
        self.stop_worker();
        Ok(())
    }

    fn wake(&mut self) -> anyhow::Result<()> {
        self.start_worker();
        Ok(())
    }
}
