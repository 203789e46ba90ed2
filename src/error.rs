// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::result;

use remain::sorted;
use thiserror::Error;
use vm_memory::GuestAddress;
use vm_memory::GuestMemoryError;

use crate::status::Status;

/// Failure of a single HGCM request. These never affect the device as a whole;
/// they end up as a status code in the guest request.
#[sorted]
#[derive(Error, Debug)]
pub enum HgcmError {
    #[error("guest memory access failed: {0}")]
    GuestMemory(#[from] GuestMemoryError),
    #[error("internal error: {0}")]
    Internal(&'static str),
    #[error("invalid parameter direction flags {0:#x}")]
    InvalidFlags(u32),
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("invalid guest pointer")]
    InvalidPointer,
    #[error("request does not match the saved command: {0}")]
    Mismatch(&'static str),
    #[error("HGCM heap budget exhausted")]
    NoMemory,
    #[error("no HGCM command at {0}")]
    NotFound(GuestAddress),
    #[error("no HGCM service connector attached")]
    NotSupported,
    #[error("service failed with {0}")]
    Service(Status),
}

impl HgcmError {
    /// The status reported to the guest for this error.
    pub fn status(&self) -> Status {
        match self {
            HgcmError::GuestMemory(_) => Status::INVALID_POINTER,
            HgcmError::Internal(_) => Status::INTERNAL_ERROR,
            HgcmError::InvalidFlags(_) => Status::INVALID_FLAGS,
            HgcmError::InvalidParameter(_) => Status::INVALID_PARAMETER,
            HgcmError::InvalidPointer => Status::INVALID_POINTER,
            HgcmError::Mismatch(_) => Status::MISMATCH,
            HgcmError::NoMemory => Status::NO_MEMORY,
            HgcmError::NotFound(_) => Status::NOT_FOUND,
            HgcmError::NotSupported => Status::NOT_SUPPORTED,
            HgcmError::Service(s) => *s,
        }
    }
}

pub type Result<T> = result::Result<T, HgcmError>;
