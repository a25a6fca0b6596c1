//! Async channel bridge between Tokio runtime and the stack worker thread
//!
//! The device stack blocks (drain waits, synchronous control requests), so it
//! lives on a dedicated thread. Front-ends running on Tokio talk to it through
//! this bridge and get their answers back on oneshot channels.

use async_channel::{Receiver, Sender, bounded};
use protocol::{DeviceId, DeviceInfo, InterfaceInfo, LifecycleEvent, PdoHandle, Status};

/// Commands from Tokio runtime to the stack worker
#[derive(Debug)]
pub enum StackCommand {
    /// Attach a node to a newly reported physical device
    Attach {
        /// Physical device reported by the host
        handle: PdoHandle,
        /// `Ok(None)` when the device was skipped
        response: tokio::sync::oneshot::Sender<crate::Result<Option<DeviceId>>>,
    },

    /// Deliver a lifecycle/power event to a node
    Dispatch {
        /// Target node
        id: DeviceId,
        /// Event to deliver
        event: LifecycleEvent,
        /// Final status, sent once the request has completed
        response: tokio::sync::oneshot::Sender<Status>,
    },

    /// Topology snapshot of a node
    DeviceInfo {
        id: DeviceId,
        response: tokio::sync::oneshot::Sender<Option<DeviceInfo>>,
    },

    /// Interface/pipe table of a node
    PipeTable {
        id: DeviceId,
        response: tokio::sync::oneshot::Sender<Option<Vec<InterfaceInfo>>>,
    },

    /// Ids of every active node
    ListDevices {
        response: tokio::sync::oneshot::Sender<Vec<DeviceId>>,
    },

    /// Shutdown the worker thread gracefully
    Shutdown,
}

/// Notifications from the stack worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// A node was created for a physical device
    DeviceAdded { id: DeviceId, handle: PdoHandle },

    /// Start completed successfully
    DeviceStarted { id: DeviceId },

    /// Removal teardown finished, the id is free again
    DeviceRemoved { id: DeviceId },

    /// A bus relations query reported a new child set
    TopologyChanged { id: DeviceId },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct StackBridge {
    cmd_tx: Sender<StackCommand>,
    event_rx: Receiver<StackEvent>,
}

impl StackBridge {
    /// Send a command to the stack worker
    pub async fn send_command(&self, cmd: StackCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the stack worker
    pub async fn recv_event(&self) -> crate::Result<StackEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take an already queued event without waiting
    pub fn try_recv_event(&self) -> Option<StackEvent> {
        self.event_rx.try_recv().ok()
    }
}

/// Handle for the stack worker thread (blocking)
pub struct StackWorker {
    pub(crate) cmd_rx: Receiver<StackCommand>,
    /// Event sender (public for the worker thread to access)
    pub event_tx: Sender<StackEvent>,
}

impl StackWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<StackCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<StackCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Queue an event for the Tokio side
    ///
    /// Never blocks: when nobody drains the event queue the event is dropped.
    pub fn send_event(&self, event: StackEvent) -> crate::Result<()> {
        self.event_tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and the stack worker
///
/// Returns (StackBridge for Tokio, StackWorker for the worker thread)
pub fn create_stack_bridge() -> (StackBridge, StackWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        StackBridge { cmd_tx, event_rx },
        StackWorker { cmd_rx, event_tx },
    )
}
