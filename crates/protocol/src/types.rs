//! Device stack type definitions
//!
//! Identifiers, opaque handles, power states and the shapes returned by the
//! diagnostic queries (device info and pipe table).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device node identifier
///
/// Assigned from a bounded pool when a device is attached. Unique among the
/// currently active nodes, reused after the node is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Opaque handle of a physical device object
///
/// Handed out by the host when it reports a device or a bus child. The stack
/// only compares these, it never interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PdoHandle(pub u64);

impl fmt::Display for PdoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pdo#{:x}", self.0)
    }
}

/// Opaque pipe handle returned by configuration selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipeHandle(pub u64);

/// One resolved child of a hub: its node id and the port it sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntry {
    /// Node id of the child
    pub id: DeviceId,
    /// Port the child reported
    pub port: u32,
}

/// Topology snapshot of one device node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Node id
    pub id: DeviceId,
    /// Port number on the parent hub
    pub port: u32,
    /// Parent node, if it has been resolved
    pub parent_id: Option<DeviceId>,
    /// Bus number
    pub bus: u32,
    /// Resolved children
    pub children: Vec<ChildEntry>,
}

/// Endpoint address to pipe handle mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit
    pub address: u8,
    /// Pipe handle for transfers on this endpoint
    pub handle: PipeHandle,
}

/// Pipe table entry for one interface slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Interface slot index
    pub index: u8,
    /// Set once pipe information has been recorded for the slot
    pub valid: bool,
    /// Set while a client has claimed the interface
    pub claimed: bool,
    /// Used endpoints
    pub endpoints: Vec<EndpointInfo>,
}

/// Pipe description reported by the lower layer for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeInformation {
    /// Endpoint address including the direction bit
    pub endpoint_address: u8,
    /// Handle to use for transfers
    pub handle: PipeHandle,
}

/// Interface description reported by a configuration selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInformation {
    /// bInterfaceNumber
    pub interface_number: u8,
    /// Selected alternate setting
    pub alternate_setting: u8,
    /// Pipes opened for the interface
    pub pipes: Vec<PipeInformation>,
}

/// Device power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DevicePowerState {
    /// No state reported
    #[default]
    Unspecified,
    /// Fully on
    D0,
    /// Light sleep
    D1,
    /// Deeper sleep
    D2,
    /// Off
    D3,
}

/// System power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SystemPowerState {
    /// No state reported
    #[default]
    Unspecified,
    /// S0
    Working,
    /// S1
    Sleeping1,
    /// S2
    Sleeping2,
    /// S3
    Sleeping3,
    /// S4
    Hibernate,
    /// S5
    Shutdown,
}

impl SystemPowerState {
    /// Number of system power states, the size of a capability mapping table
    pub const COUNT: usize = 7;

    /// Position of this state in a capability mapping table
    pub fn index(self) -> usize {
        match self {
            SystemPowerState::Unspecified => 0,
            SystemPowerState::Working => 1,
            SystemPowerState::Sleeping1 => 2,
            SystemPowerState::Sleeping2 => 3,
            SystemPowerState::Sleeping3 => 4,
            SystemPowerState::Hibernate => 5,
            SystemPowerState::Shutdown => 6,
        }
    }
}

/// Device/system power pair of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerState {
    pub device: DevicePowerState,
    pub system: SystemPowerState,
}

impl Default for PowerState {
    /// Fully on, system working
    fn default() -> Self {
        Self {
            device: DevicePowerState::D0,
            system: SystemPowerState::Working,
        }
    }
}

/// Device capabilities filled in by the lower layer on a capability query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Bus-relative address of the device
    pub address: u32,
    /// Device may be unplugged without a prior query-remove
    pub surprise_removal_ok: bool,
    /// Device is removable
    pub removable: bool,
    /// Deepest device power state usable in each system power state
    pub device_states: [DevicePowerState; SystemPowerState::COUNT],
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            address: 0,
            surprise_removal_ok: false,
            removable: false,
            device_states: [DevicePowerState::Unspecified; SystemPowerState::COUNT],
        }
    }
}
