// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Status codes exchanged with the guest and with HGCM services.

use std::fmt;
use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

/// A signed status code as written into guest request headers.
///
/// Negative values are failures, zero and positive values are successes
/// (the positive ones being informational).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const INVALID_PARAMETER: Status = Status(-2);
    pub const INVALID_POINTER: Status = Status(-6);
    pub const NO_MEMORY: Status = Status(-8);
    pub const INVALID_FLAGS: Status = Status(-13);
    pub const NOT_SUPPORTED: Status = Status(-37);
    pub const MISMATCH: Status = Status(-49);
    pub const OUT_OF_RANGE: Status = Status(-54);
    pub const CANCELLED: Status = Status(-70);
    pub const NOT_FOUND: Status = Status(-78);
    pub const INTERNAL_ERROR: Status = Status(-225);
    /// The request was accepted and will complete asynchronously.
    pub const HGCM_ASYNC_EXECUTE: Status = Status(2903);
    /// Completion delivered while the service is saving its state.
    pub const HGCM_SAVE_STATE: Status = Status(2906);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    pub fn is_failure(self) -> bool {
        self.0 < 0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Status::SUCCESS => "SUCCESS",
            Status::INVALID_PARAMETER => "INVALID_PARAMETER",
            Status::INVALID_POINTER => "INVALID_POINTER",
            Status::NO_MEMORY => "NO_MEMORY",
            Status::INVALID_FLAGS => "INVALID_FLAGS",
            Status::NOT_SUPPORTED => "NOT_SUPPORTED",
            Status::MISMATCH => "MISMATCH",
            Status::OUT_OF_RANGE => "OUT_OF_RANGE",
            Status::CANCELLED => "CANCELLED",
            Status::NOT_FOUND => "NOT_FOUND",
            Status::INTERNAL_ERROR => "INTERNAL_ERROR",
            Status::HGCM_ASYNC_EXECUTE => "HGCM_ASYNC_EXECUTE",
            Status::HGCM_SAVE_STATE => "HGCM_SAVE_STATE",
            _ => return None,
        })
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

impl From<Status> for i32 {
    fn from(s: Status) -> i32 {
        s.0
    }
}
