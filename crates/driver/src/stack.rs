//! The device stack: attach, dispatch and queries
//!
//! [`DeviceStack`] ties the pieces together. It attaches nodes to newly
//! reported physical devices, routes requests to them through the
//! [`LifecycleDispatcher`], and answers the diagnostic queries exposed to
//! front-ends.

use crate::bridge::SynchronousRequestBridge;
use crate::config::{StackConfig, StackSettings, TimeoutSettings};
use crate::descriptor::{DESCRIPTOR_TYPE_CONFIGURATION, InterfaceDescriptor, find_interface_descriptor};
use crate::dispatcher::LifecycleDispatcher;
use crate::host::{DeviceClassifier, DeviceFlags, StackHost};
use crate::id_pool::IdPool;
use crate::irp::{Information, Irp};
use crate::node::{DeviceNode, NodeClass, RoutingTarget};
use crate::registry::DeviceRegistry;
use crate::topology;
use common::{Error, Result};
use protocol::{DeviceId, DeviceInfo, InterfaceInfo, PdoHandle, PipeHandle, Status};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info, warn};

/// Length of a configuration descriptor header
const CONFIG_HEADER_LENGTH: u16 = 9;

pub struct DeviceStack {
    registry: Arc<DeviceRegistry>,
    ids: Arc<IdPool>,
    bus_index: AtomicU32,
    host: Arc<dyn StackHost>,
    classifier: Arc<dyn DeviceClassifier>,
    dispatcher: LifecycleDispatcher,
    settings: StackSettings,
    timeouts: TimeoutSettings,
}

impl DeviceStack {
    pub fn new(
        config: &StackConfig,
        host: Arc<dyn StackHost>,
        classifier: Arc<dyn DeviceClassifier>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let ids = Arc::new(IdPool::new(config.stack.max_devices));
        let bridge = SynchronousRequestBridge::new(config.timeouts.max_control_timeout());
        let dispatcher = LifecycleDispatcher::new(
            registry.clone(),
            ids.clone(),
            host.clone(),
            bridge,
            config.timeouts.configuration_timeout(),
        );

        Self {
            registry,
            ids,
            bus_index: AtomicU32::new(1),
            host,
            classifier,
            dispatcher,
            settings: config.stack.clone(),
            timeouts: config.timeouts.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn ids(&self) -> &IdPool {
        &self.ids
    }

    pub fn dispatcher(&self) -> &LifecycleDispatcher {
        &self.dispatcher
    }

    /// Attach a node to a newly reported physical device
    ///
    /// Returns `Ok(None)` for devices the stack does not manage: unreadable
    /// id, not USB, or an interface of a composite device seen by a filter.
    /// On failure everything created so far is undone in reverse order.
    pub fn add_device(&self, handle: PdoHandle) -> Result<Option<Arc<DeviceNode>>> {
        if self.classifier.device_id(handle).is_none() {
            error!("add_device {}: unable to read device id", handle);
            return Ok(None);
        }
        if !self.classifier.is_usb_device(handle) {
            debug!("add_device {}: not a USB device, skipping", handle);
            return Ok(None);
        }
        let is_filter = self.classifier.is_filter(handle);
        if is_filter && self.classifier.is_composite_interface(handle) {
            debug!("add_device {}: composite interface under a filter, skipping", handle);
            return Ok(None);
        }

        let id = self.ids.allocate()?;
        let device_name = self.settings.device_name(id.0);
        let symbolic_link = self.settings.symbolic_link(id.0);

        if let Err(e) = self.host.create_symbolic_link(&symbolic_link, &device_name) {
            error!("add_device {}: creating symbolic link failed: {}", handle, e);
            self.ids.release(id);
            return Err(e);
        }

        let Some(next) = self.host.attach_to_stack(handle) else {
            error!("add_device {}: attaching to device stack failed", handle);
            self.host.delete_symbolic_link(&symbolic_link);
            self.ids.release(id);
            return Err(Error::Resource(format!("cannot attach to the stack of {}", handle)));
        };

        let routing = if is_filter {
            match self.host.physical_device(handle) {
                Some(physical) => RoutingTarget::Filter(physical),
                None => {
                    error!("add_device {}: physical device not found", handle);
                    self.host.detach_from_stack(handle, &next);
                    self.host.delete_symbolic_link(&symbolic_link);
                    self.ids.release(id);
                    return Err(Error::Resource(format!("no physical device for {}", handle)));
                }
            }
        } else {
            RoutingTarget::Function(next.clone())
        };

        let class = NodeClass {
            is_hub: self.classifier.is_hub(handle),
            is_root_hub: self.classifier.is_root_hub(handle),
            is_filter,
        };
        let bus = if class.is_root_hub {
            self.bus_index.fetch_add(1, Ordering::SeqCst)
        } else {
            1
        };

        let flags = if is_filter {
            next.flags() & (DeviceFlags::BUFFERED_IO | DeviceFlags::DIRECT_IO | DeviceFlags::POWER_PAGABLE)
        } else {
            DeviceFlags::DIRECT_IO | DeviceFlags::POWER_PAGABLE
        };

        let node = Arc::new(
            DeviceNode::new(id, handle, routing, next, class, bus)
                .with_names(device_name, symbolic_link),
        );
        node.insert_flags(flags);
        node.clear_pipe_info();
        self.registry.insert(node.clone());

        info!(
            "node {} attached to {} ({:?}, bus {})",
            id,
            handle,
            node.routing(),
            bus
        );
        Ok(Some(node))
    }

    pub fn node(&self, id: DeviceId) -> Option<Arc<DeviceNode>> {
        self.registry.find_by_id(id)
    }

    pub fn node_by_handle(&self, handle: PdoHandle) -> Option<Arc<DeviceNode>> {
        self.registry.find_by_handle(handle)
    }

    pub fn dispatch(&self, node: &Arc<DeviceNode>, irp: Box<Irp>) -> Status {
        self.dispatcher.dispatch(node, irp)
    }

    /// Dispatch to a node by id; unknown ids fail with `NoSuchDevice`
    pub fn dispatch_to(&self, id: DeviceId, irp: Box<Irp>) -> Status {
        match self.node(id) {
            Some(node) => self.dispatch(&node, irp),
            None => {
                warn!("dispatch: no node {}", id);
                irp.complete_with(Status::NoSuchDevice, Information::None)
            }
        }
    }

    pub fn device_info(&self, id: DeviceId) -> Option<DeviceInfo> {
        let node = self.node(id)?;
        Some(topology::device_info(&self.registry, &node))
    }

    pub fn pipe_table(&self, id: DeviceId) -> Option<Vec<InterfaceInfo>> {
        self.node(id).map(|node| node.pipe_table())
    }

    pub fn pipe_handle(&self, id: DeviceId, endpoint_address: u8) -> Option<PipeHandle> {
        self.node(id)?.pipe_handle(endpoint_address)
    }

    fn live_node(&self, id: DeviceId) -> Result<Arc<DeviceNode>> {
        self.node(id)
            .ok_or_else(|| Error::Parameter(format!("no device {}", id)))
    }

    pub fn claim_interface(&self, id: DeviceId, interface: usize) -> Result<()> {
        let node = self.live_node(id)?;
        let _guard = node.quiesce().acquire()?;
        node.claim_interface(interface)
    }

    pub fn release_interface(&self, id: DeviceId, interface: usize) -> Result<()> {
        let node = self.live_node(id)?;
        let _guard = node.quiesce().acquire()?;
        node.release_interface(interface)
    }

    pub fn release_all_interfaces(&self, id: DeviceId) -> Result<()> {
        let node = self.live_node(id)?;
        let _guard = node.quiesce().acquire()?;
        node.release_all_interfaces();
        Ok(())
    }

    /// Read the active configuration descriptor and look up one interface
    pub fn interface_descriptor(
        &self,
        id: DeviceId,
        interface: u8,
        alternate_setting: u8,
    ) -> Result<Option<InterfaceDescriptor>> {
        let node = self.live_node(id)?;
        let _guard = node.quiesce().acquire()?;
        let timeout = self.timeouts.max_control_timeout();

        let header = self.dispatcher.get_descriptor(
            &node,
            DESCRIPTOR_TYPE_CONFIGURATION,
            0,
            CONFIG_HEADER_LENGTH,
            timeout,
        )?;
        if header.len() < 4 {
            return Err(Error::Lower(Status::Unsuccessful));
        }
        let total = u16::from_le_bytes([header[2], header[3]]);

        let config = self.dispatcher.get_descriptor(
            &node,
            DESCRIPTOR_TYPE_CONFIGURATION,
            0,
            total,
            timeout,
        )?;
        Ok(find_interface_descriptor(&config, interface, alternate_setting))
    }
}
