//! Blocking submission of driver-issued requests
//!
//! The lower layers only speak asynchronously. [`SynchronousRequestBridge`]
//! sends a [`ControlRequest`] to a node's routing target and parks the
//! calling thread until the request comes back, cancelling it when the
//! timeout expires. A cancelled request is still waited for: the request is
//! only dropped once the lower layer has finished with it.

use crate::event::Event;
use crate::irp::{Completion, Irp, IoStatus};
use crate::node::DeviceNode;
use common::{Error, Result};
use protocol::ControlRequest;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SynchronousRequestBridge {
    max_timeout: Duration,
}

impl SynchronousRequestBridge {
    pub fn new(max_timeout: Duration) -> Self {
        Self { max_timeout }
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// Submit `request` to the routing target of `node` and wait for it
    ///
    /// The wait is capped at the bridge's maximum timeout. Returns the final
    /// status block on success, [`Error::Timeout`] when the wait expired
    /// (the request has been cancelled and has completed by then), or
    /// [`Error::Lower`] when the lower layer failed the request.
    pub fn submit_and_wait(
        &self,
        node: &DeviceNode,
        request: ControlRequest,
        timeout: Duration,
    ) -> Result<IoStatus> {
        let timeout = timeout.min(self.max_timeout);
        let done: Arc<Event<Box<Irp>>> = Arc::new(Event::new());

        let mut irp = Irp::control(request);
        let cancel = irp.cancel_handle();
        {
            let done = done.clone();
            irp.set_completion(move |irp| {
                done.set(irp);
                Completion::MoreProcessingRequired
            });
        }

        let status = node.routing().device().call(irp);

        let mut timed_out = false;
        if status.is_pending() && !done.wait_timeout(timeout) {
            warn!("node {}: request timed out after {:?}, cancelling", node.id(), timeout);
            timed_out = true;
            cancel.cancel();
        }

        done.wait();
        let irp = done
            .take()
            .ok_or_else(|| Error::InvalidState("completed request vanished".into()))?;

        debug!("node {}: request finished with {}", node.id(), irp.io_status.status);

        if timed_out {
            return Err(Error::Timeout(timeout));
        }
        if !irp.io_status.status.is_success() {
            return Err(Error::Lower(irp.io_status.status));
        }
        Ok(irp.io_status.clone())
    }
}
