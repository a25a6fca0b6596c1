//! Stack Bridge Integration Tests
//!
//! Tests for the async channel bridge between Tokio runtime and the stack
//! worker thread.
//!
//! Run with: `cargo test -p common --test stack_bridge_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_device_info, with_timeout};
use common::{StackCommand, StackEvent, create_stack_bridge};
use protocol::{DeviceId, LifecycleEvent, PdoHandle, Status};
use std::thread;
use tokio::sync::oneshot;

// ============================================================================
// Command Flow Tests
// ============================================================================

#[tokio::test]
async fn test_device_info_command_flow() {
    let (bridge, worker) = create_stack_bridge();

    let handle = thread::spawn(move || {
        if let Ok(StackCommand::DeviceInfo { id, response }) = worker.recv_command() {
            let _ = response.send(Some(create_mock_device_info(id.0, 1, &[(2, 1)])));
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(StackCommand::DeviceInfo {
            id: DeviceId(7),
            response: tx,
        })
        .await
        .expect("Failed to send command");

    let info = with_timeout(DEFAULT_TEST_TIMEOUT, rx)
        .await
        .expect("Timed out")
        .expect("Worker dropped response")
        .expect("No device info");
    assert_eq!(info.id, DeviceId(7));
    assert_eq!(info.children.len(), 1);

    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_dispatch_command_returns_status() {
    let (bridge, worker) = create_stack_bridge();

    let handle = thread::spawn(move || {
        if let Ok(StackCommand::Dispatch {
            event, response, ..
        }) = worker.recv_command()
        {
            let status = match event {
                LifecycleEvent::Start => Status::Success,
                _ => Status::NotSupported,
            };
            let _ = response.send(status);
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(StackCommand::Dispatch {
            id: DeviceId(1),
            event: LifecycleEvent::Start,
            response: tx,
        })
        .await
        .unwrap();

    let status = with_timeout(DEFAULT_TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert_eq!(status, Status::Success);

    handle.join().unwrap();
}

#[tokio::test]
async fn test_attach_skipped_device_reports_none() {
    let (bridge, worker) = create_stack_bridge();

    let handle = thread::spawn(move || {
        if let Ok(StackCommand::Attach { response, .. }) = worker.recv_command() {
            let _ = response.send(Ok(None));
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(StackCommand::Attach {
            handle: PdoHandle(0x42),
            response: tx,
        })
        .await
        .unwrap();

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert!(matches!(result, Ok(None)));

    handle.join().unwrap();
}

// ============================================================================
// Event Flow Tests
// ============================================================================

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (bridge, worker) = create_stack_bridge();

    let handle = thread::spawn(move || {
        worker
            .send_event(StackEvent::DeviceAdded {
                id: DeviceId(1),
                handle: PdoHandle(0x10),
            })
            .unwrap();
        worker
            .send_event(StackEvent::DeviceStarted { id: DeviceId(1) })
            .unwrap();
        worker
            .send_event(StackEvent::DeviceRemoved { id: DeviceId(1) })
            .unwrap();
    });

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(
            with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
                .await
                .unwrap()
                .unwrap(),
        );
    }

    assert_eq!(
        received,
        vec![
            StackEvent::DeviceAdded {
                id: DeviceId(1),
                handle: PdoHandle(0x10)
            },
            StackEvent::DeviceStarted { id: DeviceId(1) },
            StackEvent::DeviceRemoved { id: DeviceId(1) },
        ]
    );

    handle.join().unwrap();
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_worker_sees_shutdown_then_disconnect() {
    let (bridge, worker) = create_stack_bridge();

    let handle = thread::spawn(move || {
        let first = worker.recv_command();
        let second = worker.recv_command();
        (matches!(first, Ok(StackCommand::Shutdown)), second.is_err())
    });

    bridge.send_command(StackCommand::Shutdown).await.unwrap();
    drop(bridge);

    let (saw_shutdown, disconnected) = handle.join().unwrap();
    assert!(saw_shutdown);
    assert!(disconnected);
}

#[test]
fn test_try_recv_command_is_empty_initially() {
    let (_bridge, worker) = create_stack_bridge();
    assert!(worker.try_recv_command().is_none());
}

#[tokio::test]
async fn test_recv_event_fails_after_worker_dropped() {
    let (bridge, worker) = create_stack_bridge();
    drop(worker);

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap();
    assert!(result.is_err());
}
