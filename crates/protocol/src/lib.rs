//! Shared data types for rust-usb-stack
//!
//! This crate defines the plain data exchanged between the layers of the
//! device stack: node identifiers and opaque handles, completion status
//! codes, lifecycle/power events, power and capability records, and the
//! shapes returned by the diagnostic queries.
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceId, DeviceInfo, LifecycleEvent, EventKind};
//!
//! let info = DeviceInfo {
//!     id: DeviceId(1),
//!     port: 0,
//!     parent_id: None,
//!     bus: 1,
//!     children: vec![],
//! };
//! assert_eq!(info.id.to_string(), "0001");
//! assert_eq!(LifecycleEvent::Start.kind(), EventKind::Start);
//! ```

pub mod events;
pub mod status;
pub mod types;

pub use events::{ControlRequest, EventKind, LifecycleEvent, PowerTarget, RelationType, UsageKind};
pub use status::Status;
pub use types::{
    ChildEntry, DeviceCapabilities, DeviceId, DeviceInfo, DevicePowerState, EndpointInfo,
    InterfaceInfo, InterfaceInformation, PdoHandle, PipeHandle, PipeInformation, PowerState,
    SystemPowerState,
};
