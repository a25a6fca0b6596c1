//! I/O request packets
//!
//! An [`Irp`] travels down the device stack by value. Each layer that wants
//! to see it again on the way back registers a completion routine before
//! passing it on; the layer that finishes the request calls
//! [`Irp::complete`], which runs the routines in reverse registration order.
//! A routine either hands the request back to the next routine
//! ([`Completion::Continue`]) or keeps it ([`Completion::MoreProcessingRequired`]),
//! which ends completion processing.

use protocol::{
    ControlRequest, DeviceId, InterfaceInformation, LifecycleEvent, PdoHandle, Status,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// What the request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Plug and play or power event delivered by the host
    Lifecycle(LifecycleEvent),
    /// Request issued by the driver itself
    Control(ControlRequest),
}

/// Payload returned by the layer that completed the request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Information {
    #[default]
    None,
    /// Bus relations: handles of the physical children
    Relations(Vec<PdoHandle>),
    /// Configuration selection: pipes opened per interface
    Configuration(Vec<InterfaceInformation>),
    /// Raw descriptor bytes
    Descriptor(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoStatus {
    pub status: Status,
    pub information: Information,
}

impl Default for IoStatus {
    fn default() -> Self {
        Self {
            status: Status::NotSupported,
            information: Information::None,
        }
    }
}

/// Result of a completion routine
pub enum Completion {
    /// Keep completing with the next routine up the stack
    Continue(Box<Irp>),
    /// The routine took ownership; stop here
    MoreProcessingRequired,
}

pub type CompletionRoutine = Box<dyn FnOnce(Box<Irp>) -> Completion + Send>;

pub type CancelRoutine = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    routine: spin::Mutex<Option<CancelRoutine>>,
}

/// Shared cancellation state of one request
///
/// The layer holding a pending request installs a cancel routine; whoever
/// cancels runs it at most once. Clearing the routine before completing
/// the request makes sure a request is never completed twice.
#[derive(Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Mark the request cancelled and run the installed routine, if any
    ///
    /// Returns whether a routine ran.
    pub fn cancel(&self) -> bool {
        self.state.cancelled.store(true, Ordering::SeqCst);
        let routine = self.state.routine.lock().take();
        match routine {
            Some(routine) => {
                routine();
                true
            }
            None => false,
        }
    }

    /// Install a cancel routine; refused when the request is already cancelled
    pub fn set_cancel_routine(&self, routine: CancelRoutine) -> bool {
        let mut slot = self.state.routine.lock();
        if self.state.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        *slot = Some(routine);
        true
    }

    /// Remove the installed routine. Returns false if a canceller already took it.
    pub fn clear_cancel_routine(&self) -> bool {
        self.state.routine.lock().take().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

pub struct Irp {
    pub request: Request,
    pub io_status: IoStatus,
    /// Node the request was opened against, if any
    pub file_object: Option<DeviceId>,
    completions: Vec<CompletionRoutine>,
    cancel: CancelHandle,
}

impl std::fmt::Debug for Irp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Irp")
            .field("request", &self.request)
            .field("io_status", &self.io_status)
            .field("file_object", &self.file_object)
            .field("completions", &self.completions.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Irp {
    pub fn new(request: Request) -> Box<Self> {
        Box::new(Self {
            request,
            io_status: IoStatus::default(),
            file_object: None,
            completions: Vec::new(),
            cancel: CancelHandle::default(),
        })
    }

    pub fn lifecycle(event: LifecycleEvent) -> Box<Self> {
        Self::new(Request::Lifecycle(event))
    }

    pub fn control(request: ControlRequest) -> Box<Self> {
        Self::new(Request::Control(request))
    }

    pub fn with_file_object(mut self: Box<Self>, id: DeviceId) -> Box<Self> {
        self.file_object = Some(id);
        self
    }

    /// The lifecycle event carried by this request, if it is one
    pub fn event(&self) -> Option<&LifecycleEvent> {
        match &self.request {
            Request::Lifecycle(event) => Some(event),
            Request::Control(_) => None,
        }
    }

    pub fn event_mut(&mut self) -> Option<&mut LifecycleEvent> {
        match &mut self.request {
            Request::Lifecycle(event) => Some(event),
            Request::Control(_) => None,
        }
    }

    /// Register a routine to run when a lower layer completes the request
    pub fn set_completion<F>(&mut self, routine: F)
    where
        F: FnOnce(Box<Irp>) -> Completion + Send + 'static,
    {
        self.completions.push(Box::new(routine));
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run the registered completion routines, innermost first
    pub fn complete(self: Box<Self>) {
        let mut irp = self;
        while let Some(routine) = irp.completions.pop() {
            match routine(irp) {
                Completion::Continue(next) => irp = next,
                Completion::MoreProcessingRequired => return,
            }
        }
    }

    /// Set the final status and payload, then complete. Returns `status`.
    pub fn complete_with(mut self: Box<Self>, status: Status, information: Information) -> Status {
        self.io_status = IoStatus {
            status,
            information,
        };
        self.complete();
        status
    }
}
