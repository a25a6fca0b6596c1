//! Per-device state
//!
//! A [`DeviceNode`] is created when the stack attaches to a physical device
//! and lives in the [`DeviceRegistry`](crate::registry::DeviceRegistry)
//! until removal teardown. Fields written from completion context sit
//! behind spin locks or atomics. Topology is only reachable with a
//! [`RegistryGuard`] so every topology change is serialized by the registry
//! lock.

use crate::host::{Characteristics, DeviceFlags, LowerDevice};
use crate::irp::Irp;
use crate::quiesce::QuiesceBarrier;
use crate::registry::RegistryGuard;
use common::{Error, Result};
use protocol::{
    ChildEntry, DeviceId, DevicePowerState, EndpointInfo, InterfaceInfo, InterfaceInformation,
    PdoHandle, PipeHandle, PowerState, PowerTarget, SystemPowerState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use tracing::debug;

pub const MAX_INTERFACES: usize = 32;
pub const MAX_ENDPOINTS: usize = 32;
pub const MAX_CHILDREN: usize = 32;

/// Where the node sends requests it passes down
#[derive(Clone)]
pub enum RoutingTarget {
    /// The raw physical device, bypassing the rest of the stack
    Filter(Arc<dyn LowerDevice>),
    /// The next device object down the stack
    Function(Arc<dyn LowerDevice>),
}

impl RoutingTarget {
    pub fn device(&self) -> &Arc<dyn LowerDevice> {
        match self {
            RoutingTarget::Filter(device) | RoutingTarget::Function(device) => device,
        }
    }

    pub fn is_filter(&self) -> bool {
        matches!(self, RoutingTarget::Filter(_))
    }
}

impl std::fmt::Debug for RoutingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingTarget::Filter(_) => f.write_str("Filter"),
            RoutingTarget::Function(_) => f.write_str("Function"),
        }
    }
}

/// Immutable classification decided at attach time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeClass {
    pub is_hub: bool,
    pub is_root_hub: bool,
    pub is_filter: bool,
}

/// Bus position of a node and its reported children
#[derive(Debug, Clone, Default)]
pub struct Topology {
    bus: u32,
    port: u32,
    parent: Option<DeviceId>,
    pending: Vec<PdoHandle>,
    resolved: Vec<ChildEntry>,
    dirty: bool,
}

impl Topology {
    fn new(bus: u32) -> Self {
        Self {
            bus,
            ..Self::default()
        }
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    pub fn set_bus(&mut self, bus: u32) {
        self.bus = bus;
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn set_port(&mut self, port: u32) {
        self.port = port;
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub fn set_parent(&mut self, parent: Option<DeviceId>) {
        self.parent = parent;
    }

    pub fn pending_children(&self) -> &[PdoHandle] {
        &self.pending
    }

    /// Replace the reported child set, dropping entries beyond `MAX_CHILDREN`
    pub fn set_pending_children(&mut self, children: &[PdoHandle]) {
        self.pending.clear();
        self.pending
            .extend(children.iter().take(MAX_CHILDREN).copied());
        self.dirty = true;
    }

    pub fn resolved_children(&self) -> &[ChildEntry] {
        &self.resolved
    }

    pub fn set_resolved_children(&mut self, children: Vec<ChildEntry>) {
        self.resolved = children;
        self.resolved.truncate(MAX_CHILDREN);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clear the dirty flag, returning its previous value
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct EndpointSlot {
    address: u8,
    handle: Option<PipeHandle>,
}

#[derive(Debug, Clone, Copy)]
struct InterfaceSlot {
    valid: bool,
    claimed: bool,
    endpoints: [EndpointSlot; MAX_ENDPOINTS],
}

impl Default for InterfaceSlot {
    fn default() -> Self {
        Self {
            valid: false,
            claimed: false,
            endpoints: [EndpointSlot::default(); MAX_ENDPOINTS],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PowerRecord {
    current: PowerState,
    supported: [DevicePowerState; SystemPowerState::COUNT],
}

pub struct DeviceNode {
    id: DeviceId,
    handle: PdoHandle,
    routing: RoutingTarget,
    next: Arc<dyn LowerDevice>,
    class: NodeClass,
    device_name: String,
    symbolic_link: String,
    topology: spin::Mutex<Topology>,
    power: spin::Mutex<PowerRecord>,
    interfaces: spin::Mutex<[InterfaceSlot; MAX_INTERFACES]>,
    configuration: AtomicU8,
    started: AtomicBool,
    flags: AtomicU32,
    characteristics: AtomicU32,
    quiesce: QuiesceBarrier,
}

impl std::fmt::Debug for DeviceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceNode")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("routing", &self.routing)
            .field("class", &self.class)
            .field("started", &self.is_started())
            .field("configuration", &self.configuration())
            .finish()
    }
}

impl DeviceNode {
    pub fn new(
        id: DeviceId,
        handle: PdoHandle,
        routing: RoutingTarget,
        next: Arc<dyn LowerDevice>,
        class: NodeClass,
        bus: u32,
    ) -> Self {
        Self {
            id,
            handle,
            routing,
            next,
            class,
            device_name: String::new(),
            symbolic_link: String::new(),
            topology: spin::Mutex::new(Topology::new(bus)),
            power: spin::Mutex::new(PowerRecord {
                current: PowerState::default(),
                supported: [DevicePowerState::Unspecified; SystemPowerState::COUNT],
            }),
            interfaces: spin::Mutex::new([InterfaceSlot::default(); MAX_INTERFACES]),
            configuration: AtomicU8::new(0),
            started: AtomicBool::new(false),
            flags: AtomicU32::new(0),
            characteristics: AtomicU32::new(0),
            quiesce: QuiesceBarrier::new(),
        }
    }

    pub fn with_names(mut self, device_name: String, symbolic_link: String) -> Self {
        self.device_name = device_name;
        self.symbolic_link = symbolic_link;
        self
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn handle(&self) -> PdoHandle {
        self.handle
    }

    pub fn routing(&self) -> &RoutingTarget {
        &self.routing
    }

    /// The device this node was attached on top of
    pub fn next(&self) -> &Arc<dyn LowerDevice> {
        &self.next
    }

    pub fn class(&self) -> NodeClass {
        self.class
    }

    pub fn is_hub(&self) -> bool {
        self.class.is_hub
    }

    pub fn is_root_hub(&self) -> bool {
        self.class.is_root_hub
    }

    pub fn is_filter(&self) -> bool {
        self.class.is_filter
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn symbolic_link(&self) -> &str {
        &self.symbolic_link
    }

    pub fn quiesce(&self) -> &QuiesceBarrier {
        &self.quiesce
    }

    /// Topology fields, reachable only while the registry is locked
    pub fn topology<'g>(&'g self, _registry: &'g RegistryGuard<'_>) -> spin::MutexGuard<'g, Topology> {
        self.topology.lock()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub fn configuration(&self) -> u8 {
        self.configuration.load(Ordering::SeqCst)
    }

    pub fn set_configuration(&self, configuration: u8) {
        self.configuration.store(configuration, Ordering::SeqCst);
    }

    pub fn flags(&self) -> DeviceFlags {
        DeviceFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn insert_flags(&self, flags: DeviceFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub fn remove_flags(&self, flags: DeviceFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn characteristics(&self) -> Characteristics {
        Characteristics::from_bits_truncate(self.characteristics.load(Ordering::SeqCst))
    }

    pub fn insert_characteristics(&self, characteristics: Characteristics) {
        self.characteristics
            .fetch_or(characteristics.bits(), Ordering::SeqCst);
    }

    pub fn power_state(&self) -> PowerState {
        self.power.lock().current
    }

    pub fn record_power_state(&self, target: PowerTarget) {
        let mut power = self.power.lock();
        match target {
            PowerTarget::Device(state) => power.current.device = state,
            PowerTarget::System(state) => power.current.system = state,
        }
    }

    /// Deepest device state per system state, from the last capability query
    pub fn supported_power_states(&self) -> [DevicePowerState; SystemPowerState::COUNT] {
        self.power.lock().supported
    }

    pub fn set_supported_power_states(&self, states: [DevicePowerState; SystemPowerState::COUNT]) {
        self.power.lock().supported = states;
    }

    /// Whether a request was opened against this node rather than passing
    /// through it
    pub fn accepts(&self, irp: &Irp) -> bool {
        irp.file_object == Some(self.id)
    }

    /// Forget every interface and pipe
    pub fn clear_pipe_info(&self) {
        let mut interfaces = self.interfaces.lock();
        *interfaces = [InterfaceSlot::default(); MAX_INTERFACES];
    }

    /// Record the pipes opened for `interface`
    ///
    /// Marks the interface valid and replaces its endpoint list; pipes beyond
    /// `MAX_ENDPOINTS` are dropped. `None` leaves the interface valid with no
    /// endpoints.
    pub fn update_pipe_info(
        &self,
        interface: usize,
        info: Option<&InterfaceInformation>,
    ) -> Result<()> {
        if interface >= MAX_INTERFACES {
            return Err(Error::Parameter(format!("interface {} out of range", interface)));
        }

        let mut interfaces = self.interfaces.lock();
        let slot = &mut interfaces[interface];
        slot.valid = true;
        slot.endpoints = [EndpointSlot::default(); MAX_ENDPOINTS];

        if let Some(info) = info {
            for (endpoint, pipe) in slot.endpoints.iter_mut().zip(&info.pipes) {
                *endpoint = EndpointSlot {
                    address: pipe.endpoint_address,
                    handle: Some(pipe.handle),
                };
            }
        }
        Ok(())
    }

    /// Handle of the pipe for `endpoint_address`
    ///
    /// Address 0 marks an unused slot and never resolves.
    pub fn pipe_handle(&self, endpoint_address: u8) -> Option<PipeHandle> {
        if endpoint_address == 0 {
            return None;
        }
        let interfaces = self.interfaces.lock();
        interfaces
            .iter()
            .flat_map(|slot| slot.endpoints.iter())
            .find(|endpoint| endpoint.address == endpoint_address)
            .and_then(|endpoint| endpoint.handle)
    }

    pub fn claim_interface(&self, interface: usize) -> Result<()> {
        let mut interfaces = self.interfaces.lock();
        let slot = Self::valid_slot(&mut interfaces, interface)?;
        if slot.claimed {
            return Err(Error::InvalidState(format!("interface {} already claimed", interface)));
        }
        slot.claimed = true;
        Ok(())
    }

    pub fn release_interface(&self, interface: usize) -> Result<()> {
        let mut interfaces = self.interfaces.lock();
        let slot = Self::valid_slot(&mut interfaces, interface)?;
        if !slot.claimed {
            return Err(Error::InvalidState(format!("interface {} is not claimed", interface)));
        }
        slot.claimed = false;
        Ok(())
    }

    pub fn release_all_interfaces(&self) {
        let mut interfaces = self.interfaces.lock();
        for slot in interfaces.iter_mut() {
            slot.claimed = false;
        }
        debug!("node {}: released all interfaces", self.id);
    }

    fn valid_slot(
        interfaces: &mut [InterfaceSlot; MAX_INTERFACES],
        interface: usize,
    ) -> Result<&mut InterfaceSlot> {
        match interfaces.get_mut(interface) {
            Some(slot) if slot.valid => Ok(slot),
            Some(_) => Err(Error::Parameter(format!("interface {} is not valid", interface))),
            None => Err(Error::Parameter(format!("interface {} out of range", interface))),
        }
    }

    /// Snapshot of the whole interface table
    pub fn pipe_table(&self) -> Vec<InterfaceInfo> {
        let interfaces = self.interfaces.lock();
        interfaces
            .iter()
            .enumerate()
            .map(|(index, slot)| InterfaceInfo {
                index: index as u8,
                valid: slot.valid,
                claimed: slot.claimed,
                endpoints: slot
                    .endpoints
                    .iter()
                    .filter_map(|endpoint| {
                        endpoint.handle.map(|handle| EndpointInfo {
                            address: endpoint.address,
                            handle,
                        })
                    })
                    .collect(),
            })
            .collect()
    }
}
