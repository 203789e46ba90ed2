// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VMMDev device model with its HGCM (host-guest communication manager)
//! request pipeline.
//!
//! The guest places requests in its own memory and hands their physical
//! address to [`Vmmdev::handle_request`]. HGCM requests are validated,
//! converted into [`HgcmCommand`]s and passed to an [`HgcmConnector`], which
//! completes them asynchronously through the [`HgcmPort`].

pub mod buffer;
pub mod command;
pub mod config;
pub mod connector;
mod device;
pub mod error;
pub mod events;
pub mod heap;
mod hgcm;
pub mod params;
pub mod protocol;
pub mod registry;
pub mod saved_state;
pub mod status;
mod suspendable;

pub use self::command::CommandKind;
pub use self::command::HgcmCommand;
pub use self::command::HostBuffer;
pub use self::command::HostPages;
pub use self::command::HostParm;
pub use self::config::VmmdevConfig;
pub use self::connector::HgcmConnector;
pub use self::connector::HgcmPort;
pub use self::device::DeviceState;
pub use self::device::Vmmdev;
pub use self::device::VmmdevStats;
pub use self::error::HgcmError;
pub use self::events::IrqLine;
pub use self::heap::HeapCategory;
pub use self::hgcm::Hgcm;
pub use self::hgcm::HgcmCounters;
pub use self::saved_state::SavedStateError;
pub use self::status::Status;
pub use self::suspendable::Suspendable;
