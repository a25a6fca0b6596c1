//! Lifecycle and power event handling
//!
//! Every request entering a node goes through [`LifecycleDispatcher::dispatch`].
//! The node's quiesce barrier is acquired first; a node that is being removed
//! fails everything with [`Status::DeletePending`]. Handlers are looked up by
//! [`EventKind`]. A handler either hands the barrier guard to a completion
//! continuation, which releases it once the lower layer is done, or drops it
//! before passing the request on.

use crate::bridge::SynchronousRequestBridge;
use crate::host::{Characteristics, DeviceFlags, StackHost};
use crate::id_pool::IdPool;
use crate::irp::{Completion, Information, Irp};
use crate::node::DeviceNode;
use crate::quiesce::QuiesceGuard;
use crate::registry::DeviceRegistry;
use common::{Error, Result};
use protocol::{ControlRequest, EventKind, LifecycleEvent, RelationType, Status};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Configuration selected when a device starts
pub const DEFAULT_CONFIGURATION: u8 = 1;

type Handler = fn(&LifecycleDispatcher, &Arc<DeviceNode>, Box<Irp>, QuiesceGuard) -> Status;

fn handler_for(kind: EventKind) -> Handler {
    match kind {
        EventKind::Remove => LifecycleDispatcher::on_remove,
        EventKind::SurpriseRemoval => LifecycleDispatcher::on_surprise_removal,
        EventKind::Start => LifecycleDispatcher::on_start,
        EventKind::Stop => LifecycleDispatcher::on_stop,
        EventKind::UsageNotification => LifecycleDispatcher::on_usage_notification,
        EventKind::QueryCapabilities => LifecycleDispatcher::on_query_capabilities,
        EventKind::QueryDeviceRelations => LifecycleDispatcher::on_query_relations,
        EventKind::SetPower => LifecycleDispatcher::on_set_power,
        EventKind::QueryStop
        | EventKind::CancelStop
        | EventKind::QueryRemove
        | EventKind::CancelRemove
        | EventKind::QueryId
        | EventKind::QueryPnpDeviceState
        | EventKind::QueryPower
        | EventKind::WaitWake => LifecycleDispatcher::pass_down,
    }
}

pub struct LifecycleDispatcher {
    registry: Arc<DeviceRegistry>,
    ids: Arc<IdPool>,
    host: Arc<dyn StackHost>,
    bridge: SynchronousRequestBridge,
    configuration_timeout: Duration,
}

impl LifecycleDispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        ids: Arc<IdPool>,
        host: Arc<dyn StackHost>,
        bridge: SynchronousRequestBridge,
        configuration_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            ids,
            host,
            bridge,
            configuration_timeout,
        }
    }

    pub fn bridge(&self) -> &SynchronousRequestBridge {
        &self.bridge
    }

    /// Route a request entering `node`
    ///
    /// Returns the status of the call down the stack, which is
    /// [`Status::Pending`] when a lower layer completes asynchronously.
    pub fn dispatch(&self, node: &Arc<DeviceNode>, irp: Box<Irp>) -> Status {
        let guard = match node.quiesce().acquire() {
            Ok(guard) => guard,
            Err(e) => {
                debug!("node {}: refusing request, {}", node.id(), e);
                return irp.complete_with(e.status(), Information::None);
            }
        };

        let Some(kind) = irp.event().map(LifecycleEvent::kind) else {
            if node.accepts(&irp) {
                drop(guard);
                debug!("node {}: no handler for requests opened on the node", node.id());
                return irp.complete_with(Status::NotSupported, Information::None);
            }
            return self.pass_down(node, irp, guard);
        };

        trace!("node {}: dispatching {:?}", node.id(), kind);
        handler_for(kind)(self, node, irp, guard)
    }

    /// Release and forward unchanged
    fn pass_down(&self, node: &Arc<DeviceNode>, irp: Box<Irp>, guard: QuiesceGuard) -> Status {
        drop(guard);
        node.next().call(irp)
    }

    fn on_remove(&self, node: &Arc<DeviceNode>, irp: Box<Irp>, guard: QuiesceGuard) -> Status {
        info!("node {}: remove requested, draining", node.id());

        node.set_started(false);
        guard.begin_drain_and_wait();
        // A start completing during the drain may have set it again
        node.set_started(false);

        let status = node.next().call(irp);

        self.host.delete_symbolic_link(node.symbolic_link());
        self.registry.remove(node);
        self.host.detach_from_stack(node.handle(), node.next());
        self.ids.release(node.id());

        info!("node {}: removed ({})", node.id(), status);
        status
    }

    fn on_surprise_removal(
        &self,
        node: &Arc<DeviceNode>,
        irp: Box<Irp>,
        guard: QuiesceGuard,
    ) -> Status {
        warn!("node {}: surprise removal", node.id());
        node.set_started(false);
        self.pass_down(node, irp, guard)
    }

    fn on_stop(&self, node: &Arc<DeviceNode>, irp: Box<Irp>, guard: QuiesceGuard) -> Status {
        debug!("node {}: stop", node.id());
        node.set_started(false);
        self.pass_down(node, irp, guard)
    }

    fn on_start(&self, node: &Arc<DeviceNode>, mut irp: Box<Irp>, guard: QuiesceGuard) -> Status {
        if !node.is_hub() {
            match self.select_configuration(node, DEFAULT_CONFIGURATION, self.configuration_timeout) {
                Ok(()) => debug!("node {}: configuration {} selected", node.id(), DEFAULT_CONFIGURATION),
                Err(e) => {
                    warn!("node {}: selecting configuration failed: {}", node.id(), e);
                    node.set_configuration(0);
                }
            }
        }

        self.host.set_power_state(node.id(), node.power_state());

        let this = node.clone();
        irp.set_completion(move |irp| {
            if this
                .next()
                .characteristics()
                .contains(Characteristics::REMOVABLE_MEDIA)
            {
                this.insert_characteristics(Characteristics::REMOVABLE_MEDIA);
            }
            this.set_started(true);
            drop(guard);
            Completion::Continue(irp)
        });

        node.next().call(irp)
    }

    fn on_usage_notification(
        &self,
        node: &Arc<DeviceNode>,
        mut irp: Box<Irp>,
        guard: QuiesceGuard,
    ) -> Status {
        let above_pagable = self
            .host
            .attached_device_flags(node.handle())
            .is_none_or(|flags| flags.contains(DeviceFlags::POWER_PAGABLE));
        if above_pagable {
            node.insert_flags(DeviceFlags::POWER_PAGABLE);
        }

        let this = node.clone();
        irp.set_completion(move |irp| {
            if !this.next().flags().contains(DeviceFlags::POWER_PAGABLE) {
                this.remove_flags(DeviceFlags::POWER_PAGABLE);
            }
            drop(guard);
            Completion::Continue(irp)
        });

        node.next().call(irp)
    }

    fn on_query_capabilities(
        &self,
        node: &Arc<DeviceNode>,
        mut irp: Box<Irp>,
        guard: QuiesceGuard,
    ) -> Status {
        if !node.is_filter() {
            if let Some(LifecycleEvent::QueryCapabilities(caps)) = irp.event_mut() {
                caps.surprise_removal_ok = true;
            }
        }

        let this = node.clone();
        let registry = self.registry.clone();
        irp.set_completion(move |mut irp| {
            if irp.io_status.status.is_success() {
                if let Some(LifecycleEvent::QueryCapabilities(caps)) = irp.event_mut() {
                    if !this.is_filter() {
                        caps.surprise_removal_ok = true;
                    }
                    let port = if this.is_root_hub() {
                        caps.address.wrapping_add(1)
                    } else {
                        caps.address
                    };
                    let states = caps.device_states;

                    {
                        let locked = registry.lock();
                        this.topology(&locked).set_port(port);
                    }
                    this.set_supported_power_states(states);
                }
            }
            drop(guard);
            Completion::Continue(irp)
        });

        node.next().call(irp)
    }

    fn on_query_relations(
        &self,
        node: &Arc<DeviceNode>,
        mut irp: Box<Irp>,
        guard: QuiesceGuard,
    ) -> Status {
        if !matches!(
            irp.event(),
            Some(LifecycleEvent::QueryDeviceRelations(RelationType::Bus))
        ) {
            return self.pass_down(node, irp, guard);
        }

        let this = node.clone();
        let registry = self.registry.clone();
        irp.set_completion(move |irp| {
            if irp.io_status.status.is_success() {
                if let Information::Relations(children) = &irp.io_status.information {
                    let locked = registry.lock();
                    this.topology(&locked).set_pending_children(children);
                }
            }
            drop(guard);
            Completion::Continue(irp)
        });

        node.next().call(irp)
    }

    fn on_set_power(&self, node: &Arc<DeviceNode>, mut irp: Box<Irp>, guard: QuiesceGuard) -> Status {
        let this = node.clone();
        irp.set_completion(move |irp| {
            if irp.io_status.status.is_success() {
                if let Some(LifecycleEvent::SetPower(target)) = irp.event() {
                    this.record_power_state(*target);
                }
            }
            drop(guard);
            Completion::Continue(irp)
        });

        node.next().call(irp)
    }

    /// Select `configuration` on the device and rebuild the pipe table from
    /// the pipes the lower layer opened
    pub fn select_configuration(
        &self,
        node: &DeviceNode,
        configuration: u8,
        timeout: Duration,
    ) -> Result<()> {
        node.clear_pipe_info();

        let io_status = self.bridge.submit_and_wait(
            node,
            ControlRequest::SelectConfiguration { configuration },
            timeout,
        )?;

        node.set_configuration(configuration);
        if let Information::Configuration(interfaces) = &io_status.information {
            for interface in interfaces {
                if let Err(e) = node.update_pipe_info(interface.interface_number as usize, Some(interface)) {
                    warn!("node {}: {}", node.id(), e);
                }
            }
        }
        Ok(())
    }

    /// Read a descriptor from the device through the bridge
    pub fn get_descriptor(
        &self,
        node: &DeviceNode,
        descriptor_type: u8,
        index: u8,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let io_status = self.bridge.submit_and_wait(
            node,
            ControlRequest::GetDescriptor {
                descriptor_type,
                index,
                length,
            },
            timeout,
        )?;

        match io_status.information {
            Information::Descriptor(bytes) => Ok(bytes),
            _ => Err(Error::Lower(Status::Unsuccessful)),
        }
    }
}
