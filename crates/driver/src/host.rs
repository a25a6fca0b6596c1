//! Collaborators supplied by the host
//!
//! The stack never creates or destroys physical devices itself. It asks a
//! [`DeviceClassifier`] what a reported device is, a [`StackHost`] to
//! attach to and detach from the host's device stack, and sends requests to
//! the [`LowerDevice`] it was attached on top of.

use crate::irp::Irp;
use bitflags::bitflags;
use common::Result;
use protocol::{DeviceId, PdoHandle, PowerState, Status};
use std::sync::Arc;

bitflags! {
    /// Device object attributes reconciled with the device below
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        const BUFFERED_IO = 0x0000_0004;
        const DIRECT_IO = 0x0000_0010;
        const POWER_PAGABLE = 0x0000_2000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Characteristics: u32 {
        const REMOVABLE_MEDIA = 0x0000_0001;
    }
}

/// A device below a node: either the raw physical device or the next
/// device object in the stack
pub trait LowerDevice: Send + Sync {
    /// Hand a request down
    ///
    /// The device either completes the request before returning (and
    /// returns its final status) or returns [`Status::Pending`] and completes
    /// it later, possibly from another thread.
    fn call(&self, irp: Box<Irp>) -> Status;

    fn flags(&self) -> DeviceFlags;

    fn characteristics(&self) -> Characteristics;
}

/// Classification of reported physical devices
pub trait DeviceClassifier: Send + Sync {
    /// Hardware id string; `None` when it cannot be read
    fn device_id(&self, handle: PdoHandle) -> Option<String>;

    fn is_usb_device(&self, handle: PdoHandle) -> bool;

    fn is_hub(&self, handle: PdoHandle) -> bool;

    fn is_root_hub(&self, handle: PdoHandle) -> bool;

    /// Node should be a filter that talks to the physical device directly
    fn is_filter(&self, handle: PdoHandle) -> bool;

    /// Device is one interface of a composite device
    fn is_composite_interface(&self, handle: PdoHandle) -> bool;
}

/// Services of the host's device stack
pub trait StackHost: Send + Sync {
    /// Attach a new device object on top of the stack of `handle`; returns
    /// the device that was on top before
    fn attach_to_stack(&self, handle: PdoHandle) -> Option<Arc<dyn LowerDevice>>;

    /// Undo `attach_to_stack`
    fn detach_from_stack(&self, handle: PdoHandle, next: &Arc<dyn LowerDevice>);

    /// The raw physical device for `handle`
    fn physical_device(&self, handle: PdoHandle) -> Option<Arc<dyn LowerDevice>>;

    fn create_symbolic_link(&self, link: &str, device_name: &str) -> Result<()>;

    fn delete_symbolic_link(&self, link: &str);

    /// Tell the power manager which state the node is in
    fn set_power_state(&self, id: DeviceId, state: PowerState);

    /// Flags of the device attached above the node of `handle`, if any
    fn attached_device_flags(&self, handle: PdoHandle) -> Option<DeviceFlags>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_copy_mask() {
        let next = DeviceFlags::BUFFERED_IO | DeviceFlags::POWER_PAGABLE;
        let mask = DeviceFlags::DIRECT_IO | DeviceFlags::BUFFERED_IO | DeviceFlags::POWER_PAGABLE;
        assert_eq!(next & mask, next);
        assert!(!(next & mask).contains(DeviceFlags::DIRECT_IO));
    }
}
