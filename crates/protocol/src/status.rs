//! Completion status codes
//!
//! Every request travelling through the stack finishes with one of these.
//! `Pending` is only ever returned by a submission, never stored as a final
//! status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Final or interim status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Completed successfully
    Success,
    /// Submission accepted, completion will follow asynchronously
    Pending,
    /// Cancelled before completion
    Cancelled,
    /// A synchronous wait expired
    Timeout,
    /// The target device is being removed
    DeletePending,
    /// Out-of-range index or malformed request
    InvalidParameter,
    /// Request not valid in the current device state
    InvalidDeviceState,
    /// Id pool, name or memory exhausted
    InsufficientResources,
    /// Target device does not exist (any more)
    NoSuchDevice,
    /// Request kind not handled by the target
    NotSupported,
    /// Generic failure
    Unsuccessful,
}

impl Status {
    /// True only for `Success`
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    /// True for `Pending`
    pub fn is_pending(self) -> bool {
        matches!(self, Status::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Success => "success",
            Status::Pending => "pending",
            Status::Cancelled => "cancelled",
            Status::Timeout => "timeout",
            Status::DeletePending => "delete pending",
            Status::InvalidParameter => "invalid parameter",
            Status::InvalidDeviceState => "invalid device state",
            Status::InsufficientResources => "insufficient resources",
            Status::NoSuchDevice => "no such device",
            Status::NotSupported => "not supported",
            Status::Unsuccessful => "unsuccessful",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_success_is_success() {
        assert!(Status::Success.is_success());
        assert!(!Status::Pending.is_success());
        assert!(!Status::Cancelled.is_success());
        assert!(Status::Pending.is_pending());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::DeletePending.to_string(), "delete pending");
        assert_eq!(Status::Timeout.to_string(), "timeout");
    }
}
