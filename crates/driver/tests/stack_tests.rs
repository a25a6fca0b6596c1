//! Integration tests for attaching devices and tracking topology
//!
//! Covers:
//! - Devices the stack skips, and unwinding of failed attaches
//! - Id pool exhaustion and reuse
//! - Filter versus function nodes
//! - Parent/child/bus resolution from bus relations queries
//! - Registry consistency under concurrent insert/remove

use driver::config::{DeviceKind, DeviceSpec, StackConfig};
use driver::host::StackHost;
use driver::irp::Irp;
use driver::node::{DeviceNode, NodeClass, RoutingTarget};
use driver::{DeviceFlags, DeviceRegistry, DeviceStack, LowerDevice, SimulatedBus};
use protocol::{
    ChildEntry, DeviceCapabilities, DeviceId, LifecycleEvent, PdoHandle, RelationType, Status,
};
use std::collections::HashSet;
use std::sync::Arc;

fn build(specs: Vec<DeviceSpec>, config: StackConfig) -> (Arc<SimulatedBus>, DeviceStack) {
    let bus = Arc::new(SimulatedBus::new(&specs));
    let stack = DeviceStack::new(&config, bus.clone(), bus.clone());
    (bus, stack)
}

fn attach(stack: &DeviceStack, handle: u64) -> DeviceId {
    stack
        .add_device(PdoHandle(handle))
        .unwrap()
        .expect("device should be managed")
        .id()
}

mod attach {
    use super::*;

    #[test]
    fn test_unmanaged_devices_are_skipped() {
        let mut hidden = DeviceSpec::new(1, DeviceKind::Device);
        hidden.hidden_id = true;
        let mut foreign = DeviceSpec::new(2, DeviceKind::Device);
        foreign.usb = false;
        let mut composite = DeviceSpec::new(3, DeviceKind::Device);
        composite.filter = true;
        composite.composite = true;
        let (bus, stack) = build(vec![hidden, foreign, composite], StackConfig::default());

        for handle in [1, 2, 3, 99] {
            assert!(stack.add_device(PdoHandle(handle)).unwrap().is_none());
        }
        assert!(stack.registry().is_empty());
        assert_eq!(stack.ids().in_use(), 0);
        assert!(bus.links().is_empty());
        assert!(!bus.is_attached(PdoHandle(3)));
    }

    #[test]
    fn test_composite_function_node_is_managed() {
        let mut composite = DeviceSpec::new(3, DeviceKind::Device);
        composite.composite = true;
        let (_bus, stack) = build(vec![composite], StackConfig::default());

        assert!(stack.add_device(PdoHandle(3)).unwrap().is_some());
    }

    #[test]
    fn test_link_collision_unwinds() {
        let (bus, stack) = build(
            vec![DeviceSpec::new(1, DeviceKind::Device)],
            StackConfig::default(),
        );
        let link = StackConfig::default().stack.symbolic_link(1);
        bus.create_symbolic_link(&link, "someone else").unwrap();

        let result = stack.add_device(PdoHandle(1));
        assert!(matches!(result, Err(common::Error::Resource(_))));
        assert_eq!(stack.ids().in_use(), 0);
        assert!(stack.registry().is_empty());
        assert!(!bus.is_attached(PdoHandle(1)));
        assert_eq!(bus.links(), vec![link]);
    }

    #[test]
    fn test_id_exhaustion() {
        let mut config = StackConfig::default();
        config.stack.max_devices = 2;
        let specs = (1..=3)
            .map(|handle| DeviceSpec::new(handle, DeviceKind::Device))
            .collect();
        let (bus, stack) = build(specs, config);

        assert_eq!(attach(&stack, 1), DeviceId(1));
        assert_eq!(attach(&stack, 2), DeviceId(2));
        assert!(matches!(
            stack.add_device(PdoHandle(3)),
            Err(common::Error::Resource(_))
        ));
        assert_eq!(bus.links().len(), 2);
        assert!(!bus.is_attached(PdoHandle(3)));

        stack.dispatch_to(DeviceId(1), Irp::lifecycle(LifecycleEvent::Remove));
        assert_eq!(attach(&stack, 3), DeviceId(1));
    }

    #[test]
    fn test_node_names_follow_id() {
        let (_bus, stack) = build(
            vec![DeviceSpec::new(1, DeviceKind::Device)],
            StackConfig::default(),
        );
        let node = stack.add_device(PdoHandle(1)).unwrap().unwrap();

        assert_eq!(node.device_name(), "\\Device\\usbstack0001");
        assert_eq!(node.symbolic_link(), "\\DosDevices\\usbstack-0001");
        assert_eq!(stack.node_by_handle(PdoHandle(1)).unwrap().id(), node.id());
    }

    #[test]
    fn test_filter_and_function_flags() {
        let mut filter = DeviceSpec::new(1, DeviceKind::Device);
        filter.filter = true;
        let function = DeviceSpec::new(2, DeviceKind::Device);
        let (_bus, stack) = build(vec![filter, function], StackConfig::default());

        let filter = stack.add_device(PdoHandle(1)).unwrap().unwrap();
        let function = stack.add_device(PdoHandle(2)).unwrap().unwrap();

        assert!(filter.routing().is_filter());
        assert_eq!(
            filter.flags(),
            DeviceFlags::BUFFERED_IO | DeviceFlags::POWER_PAGABLE
        );
        assert!(!function.routing().is_filter());
        assert_eq!(
            function.flags(),
            DeviceFlags::DIRECT_IO | DeviceFlags::POWER_PAGABLE
        );
    }

    #[test]
    fn test_root_hubs_get_consecutive_buses() {
        let specs = vec![
            DeviceSpec::new(1, DeviceKind::RootHub),
            DeviceSpec::new(2, DeviceKind::Device),
            DeviceSpec::new(3, DeviceKind::RootHub),
        ];
        let (_bus, stack) = build(specs, StackConfig::default());

        let first = attach(&stack, 1);
        let leaf = attach(&stack, 2);
        let second = attach(&stack, 3);

        assert_eq!(stack.device_info(first).unwrap().bus, 1);
        assert_eq!(stack.device_info(leaf).unwrap().bus, 1);
        assert_eq!(stack.device_info(second).unwrap().bus, 2);
    }
}

mod topology {
    use super::*;

    /// Root hub 1 on bus 1, root hub 2 on bus 2 with children A, B and C
    fn two_root_hubs() -> Vec<DeviceSpec> {
        let mut specs = vec![
            DeviceSpec::new(1, DeviceKind::RootHub),
            DeviceSpec::new(2, DeviceKind::RootHub),
        ];
        for (handle, address) in [(0xA, 4), (0xB, 5), (0xC, 6)] {
            let mut child = DeviceSpec::new(handle, DeviceKind::Device);
            child.parent = Some(2);
            child.address = address;
            specs.push(child);
        }
        specs
    }

    fn query_bus_relations(stack: &DeviceStack, id: DeviceId) -> Status {
        let irp = Irp::lifecycle(LifecycleEvent::QueryDeviceRelations(RelationType::Bus));
        stack.dispatch_to(id, irp)
    }

    #[test]
    fn test_only_registered_children_resolve() {
        let (_bus, stack) = build(two_root_hubs(), StackConfig::default());
        attach(&stack, 1);
        let hub = attach(&stack, 2);
        let b = attach(&stack, 0xB);

        let caps = LifecycleEvent::QueryCapabilities(DeviceCapabilities::default());
        stack.dispatch_to(b, Irp::lifecycle(caps));
        assert_eq!(query_bus_relations(&stack, hub), Status::Success);

        let hub_info = stack.device_info(hub).unwrap();
        assert_eq!(hub_info.bus, 2);
        assert_eq!(hub_info.children, vec![ChildEntry { id: b, port: 5 }]);

        let b_info = stack.device_info(b).unwrap();
        assert_eq!(b_info.parent_id, Some(hub));
        assert_eq!(b_info.bus, 2);
        assert_eq!(b_info.port, 5);
    }

    #[test]
    fn test_late_children_resolve_on_next_query() {
        let (bus, stack) = build(two_root_hubs(), StackConfig::default());
        let hub = attach(&stack, 2);
        query_bus_relations(&stack, hub);
        assert!(stack.device_info(hub).unwrap().children.is_empty());

        let a = attach(&stack, 0xA);
        let c = attach(&stack, 0xC);
        query_bus_relations(&stack, hub);
        let ids: Vec<DeviceId> = stack
            .device_info(hub)
            .unwrap()
            .children
            .iter()
            .map(|child| child.id)
            .collect();
        assert_eq!(ids, vec![a, c]);

        bus.unplug(PdoHandle(0xA));
        query_bus_relations(&stack, hub);
        let children = stack.device_info(hub).unwrap().children;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, c);
    }

    #[test]
    fn test_root_hub_child_keeps_its_bus() {
        let mut specs = vec![
            DeviceSpec::new(1, DeviceKind::RootHub),
            DeviceSpec::new(2, DeviceKind::RootHub),
            DeviceSpec::new(3, DeviceKind::RootHub),
        ];
        // A hub reporting another root hub as its child
        specs[2].parent = Some(2);
        let (_bus, stack) = build(specs, StackConfig::default());
        attach(&stack, 1);
        let parent = attach(&stack, 2);
        let child = attach(&stack, 3);

        query_bus_relations(&stack, parent);
        assert_eq!(stack.device_info(parent).unwrap().children.len(), 1);

        let info = stack.device_info(child).unwrap();
        assert_eq!(info.parent_id, Some(parent));
        assert_eq!(info.bus, 3);
    }

    #[test]
    fn test_non_bus_relations_pass_through() {
        let (_bus, stack) = build(two_root_hubs(), StackConfig::default());
        let hub = attach(&stack, 2);
        attach(&stack, 0xA);

        let irp = Irp::lifecycle(LifecycleEvent::QueryDeviceRelations(RelationType::Removal));
        assert_eq!(stack.dispatch_to(hub, irp), Status::NotSupported);
        assert!(stack.device_info(hub).unwrap().children.is_empty());
    }

    #[test]
    fn test_device_without_queries_reports_defaults() {
        let (_bus, stack) = build(two_root_hubs(), StackConfig::default());
        let a = attach(&stack, 0xA);

        let info = stack.device_info(a).unwrap();
        assert_eq!(info.id, a);
        assert_eq!(info.port, 0);
        assert_eq!(info.parent_id, None);
        assert_eq!(info.bus, 1);
        assert!(info.children.is_empty());
        assert!(stack.device_info(DeviceId(99)).is_none());
    }
}

mod registry {
    use super::*;

    fn node(bus: &SimulatedBus, id: u32, handle: u64) -> Arc<DeviceNode> {
        let next: Arc<dyn LowerDevice> = bus.device(PdoHandle(1)).unwrap().clone();
        Arc::new(DeviceNode::new(
            DeviceId(id),
            PdoHandle(handle),
            RoutingTarget::Function(next.clone()),
            next,
            NodeClass::default(),
            1,
        ))
    }

    #[test]
    fn test_concurrent_insert_and_remove() {
        let bus = SimulatedBus::new(&[DeviceSpec::new(1, DeviceKind::Device)]);
        let registry = Arc::new(DeviceRegistry::new());

        // Long-lived nodes that must survive the churn
        let stable: Vec<Arc<DeviceNode>> = (0..8).map(|i| node(&bus, i, i as u64)).collect();
        for node in &stable {
            registry.insert(node.clone());
        }

        let handles: Vec<_> = (0..4u32)
            .map(|thread| {
                let registry = registry.clone();
                let churn: Vec<Arc<DeviceNode>> = (0..50)
                    .map(|i| node(&bus, 1000 + thread * 100 + i, 0x1000 + (thread * 100 + i) as u64))
                    .collect();
                std::thread::spawn(move || {
                    for node in &churn {
                        registry.insert(node.clone());
                    }
                    for node in &churn {
                        assert!(registry.remove(node));
                        assert!(!registry.remove(node));
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            for node in &stable {
                assert!(registry.find_by_id(node.id()).is_some());
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), stable.len());
        let ids: HashSet<DeviceId> = registry.snapshot().into_iter().collect();
        assert_eq!(ids, stable.iter().map(|node| node.id()).collect::<HashSet<_>>());
    }

    #[test]
    fn test_newest_node_found_first() {
        let bus = SimulatedBus::new(&[DeviceSpec::new(1, DeviceKind::Device)]);
        let registry = DeviceRegistry::new();
        let older = node(&bus, 1, 0x50);
        let newer = node(&bus, 2, 0x50);
        registry.insert(older.clone());
        registry.insert(newer.clone());

        assert!(Arc::ptr_eq(&registry.find_by_handle(PdoHandle(0x50)).unwrap(), &newer));
        registry.remove(&newer);
        assert!(Arc::ptr_eq(&registry.find_by_handle(PdoHandle(0x50)).unwrap(), &older));
    }
}
