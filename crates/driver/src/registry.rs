//! Global list of active device nodes
//!
//! Guarded by a spin lock that may be taken from completion context. Hold it
//! only for scans and pointer updates: no logging, no calls into lower
//! devices, no blocking while a [`RegistryGuard`] is alive.

use crate::node::DeviceNode;
use protocol::{DeviceId, PdoHandle};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
pub struct DeviceRegistry {
    nodes: spin::Mutex<VecDeque<Arc<DeviceNode>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; newest first
    pub fn insert(&self, node: Arc<DeviceNode>) {
        self.nodes.lock().push_front(node);
    }

    /// Unlink a node. Returns whether it was registered.
    pub fn remove(&self, node: &Arc<DeviceNode>) -> bool {
        let mut nodes = self.nodes.lock();
        match nodes.iter().position(|n| Arc::ptr_eq(n, node)) {
            Some(index) => {
                nodes.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn find_by_handle(&self, handle: PdoHandle) -> Option<Arc<DeviceNode>> {
        self.lock().find_by_handle(handle).cloned()
    }

    pub fn find_by_id(&self, id: DeviceId) -> Option<Arc<DeviceNode>> {
        self.lock().find_by_id(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Ids of all active nodes, newest first
    pub fn snapshot(&self) -> Vec<DeviceId> {
        self.nodes.lock().iter().map(|n| n.id()).collect()
    }

    /// Take the registry lock. Topology fields are only reachable through
    /// the returned guard.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            nodes: self.nodes.lock(),
        }
    }
}

/// Exclusive access to the registry, the token required for topology access
pub struct RegistryGuard<'a> {
    nodes: spin::MutexGuard<'a, VecDeque<Arc<DeviceNode>>>,
}

impl RegistryGuard<'_> {
    pub fn find_by_handle(&self, handle: PdoHandle) -> Option<&Arc<DeviceNode>> {
        self.nodes.iter().find(|n| n.handle() == handle)
    }

    pub fn find_by_id(&self, id: DeviceId) -> Option<&Arc<DeviceNode>> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceNode>> {
        self.nodes.iter()
    }
}
