//! Parent/child/bus resolution
//!
//! Bus relations queries leave the raw child handles on the parent node and
//! mark it dirty. Resolution into node ids happens lazily, when someone asks
//! for the node's [`DeviceInfo`].

use crate::node::{DeviceNode, MAX_CHILDREN};
use crate::registry::{DeviceRegistry, RegistryGuard};
use protocol::{ChildEntry, DeviceInfo};
use std::sync::Arc;

/// Resolve the pending child handles of `node` against the registry
///
/// Every registered child gets `node` as its parent and, unless it is a
/// root hub, inherits the parent's bus. Handles with no registered node
/// are skipped.
pub fn recompute(registry: &RegistryGuard<'_>, node: &DeviceNode) {
    let (pending, bus) = {
        let topology = node.topology(registry);
        (topology.pending_children().to_vec(), topology.bus())
    };

    let mut resolved = Vec::with_capacity(pending.len().min(MAX_CHILDREN));
    for handle in pending {
        let Some(child) = registry.find_by_handle(handle) else {
            continue;
        };
        if std::ptr::eq(Arc::as_ptr(child), node) {
            continue;
        }

        let mut child_topology = child.topology(registry);
        child_topology.set_parent(Some(node.id()));
        if !child.is_root_hub() {
            child_topology.set_bus(bus);
        }

        if resolved.len() < MAX_CHILDREN {
            resolved.push(ChildEntry {
                id: child.id(),
                port: child_topology.port(),
            });
        }
    }

    node.topology(registry).set_resolved_children(resolved);
}

/// Topology snapshot of `node`, recomputing first if children changed
pub fn device_info(registry: &DeviceRegistry, node: &DeviceNode) -> DeviceInfo {
    let guard = registry.lock();

    let dirty = node.topology(&guard).take_dirty();
    if dirty {
        recompute(&guard, node);
    }

    let topology = node.topology(&guard);
    DeviceInfo {
        id: node.id(),
        port: topology.port(),
        parent_id: topology.parent(),
        bus: topology.bus(),
        children: topology.resolved_children().to_vec(),
    }
}
