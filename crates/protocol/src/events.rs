//! Lifecycle/power events and driver-issued control requests
//!
//! A `LifecycleEvent` is what the host delivers to a device node. Some events
//! carry a parameter block that layers below fill in (capabilities), the rest
//! are plain notifications. `ControlRequest`s are the requests the driver
//! issues on its own behalf through the synchronous bridge.

use crate::types::{DeviceCapabilities, DevicePowerState, SystemPowerState};
use serde::{Deserialize, Serialize};

/// Kind of relation set requested by a relations query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationType {
    /// Children enumerated on the device's bus
    Bus,
    /// Devices ejected together with this one
    Ejection,
    /// Devices removed together with this one
    Removal,
    /// The device itself
    TargetDevice,
}

/// Special file kind a usage notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageKind {
    Paging,
    Hibernation,
    DumpFile,
}

/// Target of a power transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerTarget {
    Device(DevicePowerState),
    System(SystemPowerState),
}

/// Event delivered to a device node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Start,
    QueryStop,
    Stop,
    CancelStop,
    QueryRemove,
    Remove,
    CancelRemove,
    SurpriseRemoval,
    /// Paging/hibernation/dump file placed on (or removed from) the device
    UsageNotification { kind: UsageKind, in_path: bool },
    /// Capability query; layers below fill in the parameter block
    QueryCapabilities(DeviceCapabilities),
    /// Relations query; the bus layer answers with child handles
    QueryDeviceRelations(RelationType),
    QueryId,
    QueryPnpDeviceState,
    SetPower(PowerTarget),
    QueryPower(PowerTarget),
    WaitWake,
}

/// Fieldless discriminant of `LifecycleEvent`, the dispatch table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Start,
    QueryStop,
    Stop,
    CancelStop,
    QueryRemove,
    Remove,
    CancelRemove,
    SurpriseRemoval,
    UsageNotification,
    QueryCapabilities,
    QueryDeviceRelations,
    QueryId,
    QueryPnpDeviceState,
    SetPower,
    QueryPower,
    WaitWake,
}

impl LifecycleEvent {
    /// Dispatch table key of this event
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Start => EventKind::Start,
            LifecycleEvent::QueryStop => EventKind::QueryStop,
            LifecycleEvent::Stop => EventKind::Stop,
            LifecycleEvent::CancelStop => EventKind::CancelStop,
            LifecycleEvent::QueryRemove => EventKind::QueryRemove,
            LifecycleEvent::Remove => EventKind::Remove,
            LifecycleEvent::CancelRemove => EventKind::CancelRemove,
            LifecycleEvent::SurpriseRemoval => EventKind::SurpriseRemoval,
            LifecycleEvent::UsageNotification { .. } => EventKind::UsageNotification,
            LifecycleEvent::QueryCapabilities(_) => EventKind::QueryCapabilities,
            LifecycleEvent::QueryDeviceRelations(_) => EventKind::QueryDeviceRelations,
            LifecycleEvent::QueryId => EventKind::QueryId,
            LifecycleEvent::QueryPnpDeviceState => EventKind::QueryPnpDeviceState,
            LifecycleEvent::SetPower(_) => EventKind::SetPower,
            LifecycleEvent::QueryPower(_) => EventKind::QueryPower,
            LifecycleEvent::WaitWake => EventKind::WaitWake,
        }
    }

    /// Power events travel the power path, everything else is plug and play
    pub fn is_power(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::SetPower(_) | LifecycleEvent::QueryPower(_) | LifecycleEvent::WaitWake
        )
    }
}

/// Request the driver issues itself and waits for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Select a configuration by its bConfigurationValue (0 unconfigures)
    SelectConfiguration { configuration: u8 },
    /// Read a descriptor from the device
    GetDescriptor {
        descriptor_type: u8,
        index: u8,
        length: u16,
    },
}
