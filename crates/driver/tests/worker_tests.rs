//! Integration tests for the stack worker thread
//!
//! Drives a full attach/start/query/remove cycle from Tokio through the
//! channel bridge and checks the events the worker reports.

use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::{StackBridge, StackCommand, StackEvent, create_stack_bridge};
use driver::config::{DeviceKind, DeviceSpec, InterfaceSpec, StackConfig};
use driver::{DeviceStack, SimulatedBus, spawn_stack_worker};
use protocol::{DeviceId, LifecycleEvent, PdoHandle, RelationType, Status};
use std::sync::Arc;

fn devices() -> Vec<DeviceSpec> {
    let root = DeviceSpec::new(0x100, DeviceKind::RootHub);
    let mut leaf = DeviceSpec::new(0x101, DeviceKind::Device);
    leaf.parent = Some(0x100);
    leaf.address = 1;
    leaf.latency_ms = 3;
    leaf.interfaces.push(InterfaceSpec {
        number: 0,
        endpoints: vec![0x81],
    });
    vec![root, leaf]
}

async fn attach(bridge: &StackBridge, handle: u64) -> Option<DeviceId> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(StackCommand::Attach {
            handle: PdoHandle(handle),
            response: tx,
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap()
}

async fn dispatch(bridge: &StackBridge, id: DeviceId, event: LifecycleEvent) -> Status {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(StackCommand::Dispatch {
            id,
            event,
            response: tx,
        })
        .await
        .unwrap();
    rx.await.unwrap()
}

async fn next_event(bridge: &StackBridge) -> StackEvent {
    with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .expect("timed out waiting for a stack event")
        .unwrap()
}

#[tokio::test]
async fn test_full_cycle_through_worker() {
    let bus = Arc::new(SimulatedBus::new(&devices()));
    let stack = Arc::new(DeviceStack::new(
        &StackConfig::default(),
        bus.clone(),
        bus.clone(),
    ));
    let (bridge, worker) = create_stack_bridge();
    let handle = spawn_stack_worker(stack, worker).unwrap();

    let root = attach(&bridge, 0x100).await.unwrap();
    let leaf = attach(&bridge, 0x101).await.unwrap();
    assert_eq!(
        next_event(&bridge).await,
        StackEvent::DeviceAdded {
            id: root,
            handle: PdoHandle(0x100)
        }
    );
    assert_eq!(
        next_event(&bridge).await,
        StackEvent::DeviceAdded {
            id: leaf,
            handle: PdoHandle(0x101)
        }
    );

    // The leaf completes asynchronously; the worker reports the final status
    assert_eq!(dispatch(&bridge, leaf, LifecycleEvent::Start).await, Status::Success);
    assert_eq!(next_event(&bridge).await, StackEvent::DeviceStarted { id: leaf });

    let relations = LifecycleEvent::QueryDeviceRelations(RelationType::Bus);
    assert_eq!(dispatch(&bridge, root, relations).await, Status::Success);
    assert_eq!(next_event(&bridge).await, StackEvent::TopologyChanged { id: root });

    // Children resolve when the hub's own info is read
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(StackCommand::DeviceInfo { id: root, response: tx })
        .await
        .unwrap();
    let info = rx.await.unwrap().unwrap();
    assert_eq!(info.children.len(), 1);
    assert_eq!(info.children[0].id, leaf);

    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(StackCommand::DeviceInfo { id: leaf, response: tx })
        .await
        .unwrap();
    let info = rx.await.unwrap().unwrap();
    assert_eq!(info.parent_id, Some(root));

    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(StackCommand::PipeTable { id: leaf, response: tx })
        .await
        .unwrap();
    let table = rx.await.unwrap().unwrap();
    assert_eq!(table[0].endpoints[0].address, 0x81);

    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(StackCommand::ListDevices { response: tx })
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), vec![root, leaf]);

    assert_eq!(dispatch(&bridge, leaf, LifecycleEvent::Remove).await, Status::Success);
    assert_eq!(next_event(&bridge).await, StackEvent::DeviceRemoved { id: leaf });
    assert!(!bus.is_attached(PdoHandle(0x101)));

    // Gone nodes answer with NoSuchDevice / None
    assert_eq!(
        dispatch(&bridge, leaf, LifecycleEvent::Start).await,
        Status::NoSuchDevice
    );
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(StackCommand::DeviceInfo { id: leaf, response: tx })
        .await
        .unwrap();
    assert!(rx.await.unwrap().is_none());

    bridge.send_command(StackCommand::Shutdown).await.unwrap();
    tokio::task::spawn_blocking(move || handle.join().unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_skipped_device_attaches_as_none() {
    let mut spec = DeviceSpec::new(1, DeviceKind::Device);
    spec.usb = false;
    let bus = Arc::new(SimulatedBus::new(&[spec]));
    let stack = Arc::new(DeviceStack::new(
        &StackConfig::default(),
        bus.clone(),
        bus.clone(),
    ));
    let (bridge, worker) = create_stack_bridge();
    let handle = spawn_stack_worker(stack, worker).unwrap();

    assert_eq!(attach(&bridge, 1).await, None);
    assert!(bridge.try_recv_event().is_none());

    drop(bridge);
    tokio::task::spawn_blocking(move || handle.join().unwrap())
        .await
        .unwrap();
}
