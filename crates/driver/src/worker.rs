//! Stack worker thread
//!
//! The device stack blocks: removal waits for in-flight requests to drain
//! and configuration selection waits for the device. It therefore runs on a
//! dedicated OS thread and talks to the Tokio runtime through the channel
//! bridge in `common::channel`.

use crate::event::Event;
use crate::irp::{Completion, Irp};
use crate::stack::DeviceStack;
use common::{StackCommand, StackEvent, StackWorker};
use protocol::{DeviceId, LifecycleEvent, RelationType, Status};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Stack worker thread
///
/// Processes commands from the Tokio runtime one at a time and reports
/// state changes back as [`StackEvent`]s.
pub struct StackWorkerThread {
    stack: Arc<DeviceStack>,
    worker: StackWorker,
}

impl StackWorkerThread {
    pub fn new(stack: Arc<DeviceStack>, worker: StackWorker) -> Self {
        Self { stack, worker }
    }

    /// Run until a Shutdown command arrives or the bridge is dropped
    pub fn run(self) {
        info!("Stack worker thread started");

        loop {
            match self.worker.recv_command() {
                Ok(StackCommand::Shutdown) => {
                    info!("Stack worker shutting down");
                    break;
                }
                Ok(cmd) => self.handle_command(cmd),
                Err(e) => {
                    warn!("Command channel closed: {}", e);
                    break;
                }
            }
        }

        info!("Stack worker thread stopped");
    }

    /// Handle a command from the Tokio runtime
    fn handle_command(&self, cmd: StackCommand) {
        // A panicking handler must not take the worker down with it
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in stack command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&self, cmd: StackCommand) {
        match cmd {
            StackCommand::Attach { handle, response } => {
                let result = self
                    .stack
                    .add_device(handle)
                    .map(|node| node.map(|node| node.id()));
                if let Ok(Some(id)) = &result {
                    self.emit(StackEvent::DeviceAdded { id: *id, handle });
                }
                let _ = response.send(result);
            }

            StackCommand::Dispatch {
                id,
                event,
                response,
            } => {
                let status = self.dispatch_and_wait(id, event);
                let _ = response.send(status);
            }

            StackCommand::DeviceInfo { id, response } => {
                let _ = response.send(self.stack.device_info(id));
            }

            StackCommand::PipeTable { id, response } => {
                let _ = response.send(self.stack.pipe_table(id));
            }

            StackCommand::ListDevices { response } => {
                let mut ids = self.stack.registry().snapshot();
                ids.sort();
                debug!("Listing {} devices", ids.len());
                let _ = response.send(ids);
            }

            StackCommand::Shutdown => {
                debug!("Shutdown reached the command handler, ignoring");
            }
        }
    }

    /// Dispatch `event` to node `id` and wait for the request to complete
    fn dispatch_and_wait(&self, id: DeviceId, event: LifecycleEvent) -> Status {
        debug!("Dispatching {:?} to node {}", event, id);

        let done: Arc<Event<Status>> = Arc::new(Event::new());
        let mut irp = Irp::lifecycle(event.clone());
        {
            let done = done.clone();
            irp.set_completion(move |irp| {
                done.set(irp.io_status.status);
                Completion::Continue(irp)
            });
        }

        let returned = self.stack.dispatch_to(id, irp);
        if returned.is_pending() {
            done.wait();
        }
        let status = done.take().unwrap_or(returned);

        match event {
            LifecycleEvent::Start if status.is_success() => {
                self.emit(StackEvent::DeviceStarted { id });
            }
            LifecycleEvent::Remove if self.stack.node(id).is_none() => {
                self.emit(StackEvent::DeviceRemoved { id });
            }
            LifecycleEvent::QueryDeviceRelations(RelationType::Bus) if status.is_success() => {
                self.emit(StackEvent::TopologyChanged { id });
            }
            _ => {}
        }

        status
    }

    fn emit(&self, event: StackEvent) {
        if let Err(e) = self.worker.send_event(event) {
            debug!("Dropping stack event: {}", e);
        }
    }
}

/// Spawn the stack worker thread
///
/// The thread runs until a Shutdown command is received or every bridge
/// handle has been dropped.
pub fn spawn_stack_worker(
    stack: Arc<DeviceStack>,
    worker: StackWorker,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usb-stack-worker".to_string())
        .spawn(move || StackWorkerThread::new(stack, worker).run())
}
