//! Simulated USB bus
//!
//! Stands in for the host's device stack: classifies devices from their
//! [`DeviceSpec`], hands out [`SimDevice`]s as lower devices, and records
//! symbolic links, power reports and attachments so callers can inspect
//! what the stack did.
//!
//! Devices with a latency complete their requests on a completion thread
//! fed through an `async-channel` queue, exactly like a real bus driver
//! completing from interrupt context. A pending request can be cancelled
//! at any time; the cancel routine and the completion thread race for it
//! and only one of them completes it.

use crate::config::{DeviceKind, DeviceSpec};
use crate::descriptor::{DESCRIPTOR_TYPE_CONFIGURATION, DESCRIPTOR_TYPE_INTERFACE};
use crate::host::{Characteristics, DeviceClassifier, DeviceFlags, LowerDevice, StackHost};
use crate::irp::{CancelHandle, Information, Irp, Request};
use async_channel::{Receiver, Sender, unbounded};
use common::{Error, Result};
use protocol::{
    ControlRequest, DeviceCapabilities, DeviceId, DevicePowerState, InterfaceInformation,
    LifecycleEvent, PdoHandle, PipeHandle, PipeInformation, PowerState, RelationType, Status,
    SystemPowerState,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;

/// Completion thread polling interval
const TICK: Duration = Duration::from_millis(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type PendingSlot = Arc<spin::Mutex<Option<Box<Irp>>>>;

/// A request waiting for its completion time
struct Job {
    due: Instant,
    slot: PendingSlot,
    cancel: CancelHandle,
    status: Status,
    information: Information,
}

impl Job {
    fn fire(self) {
        // A canceller that already took the routine owns the completion
        if !self.cancel.clear_cancel_routine() {
            return;
        }
        let irp = self.slot.lock().take();
        if let Some(irp) = irp {
            irp.complete_with(self.status, self.information);
        }
    }
}

fn run_completions(jobs: Receiver<Job>) {
    let mut waiting: Vec<Job> = Vec::new();

    loop {
        if waiting.is_empty() {
            match jobs.recv_blocking() {
                Ok(job) => waiting.push(job),
                Err(_) => break,
            }
        }
        while let Ok(job) = jobs.try_recv() {
            waiting.push(job);
        }

        let now = Instant::now();
        let (due, later): (Vec<Job>, Vec<Job>) =
            std::mem::take(&mut waiting).into_iter().partition(|job| job.due <= now);
        waiting = later;

        for job in due {
            job.fire();
        }
        if !waiting.is_empty() {
            std::thread::sleep(TICK);
        }
    }

    debug!("simulated completion thread stopped");
}

/// Pipe handle the simulator assigns to an endpoint
pub fn sim_pipe_handle(handle: PdoHandle, interface: u8, endpoint_address: u8) -> PipeHandle {
    PipeHandle((handle.0 << 16) | ((interface as u64) << 8) | endpoint_address as u64)
}

/// One simulated physical device
pub struct SimDevice {
    spec: DeviceSpec,
    children: spin::Mutex<Vec<PdoHandle>>,
    received: spin::Mutex<Vec<Request>>,
    jobs: Sender<Job>,
}

impl SimDevice {
    fn new(spec: DeviceSpec, children: Vec<PdoHandle>, jobs: Sender<Job>) -> Self {
        Self {
            spec,
            children: spin::Mutex::new(children),
            received: spin::Mutex::new(Vec::new()),
            jobs,
        }
    }

    pub fn handle(&self) -> PdoHandle {
        PdoHandle(self.spec.handle)
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// Every request this device has seen, oldest first
    pub fn received(&self) -> Vec<Request> {
        self.received.lock().clone()
    }

    pub fn children(&self) -> Vec<PdoHandle> {
        self.children.lock().clone()
    }

    fn capabilities(&self, caps: &mut DeviceCapabilities) {
        caps.address = self.spec.address;
        caps.removable = self.spec.removable;
        caps.device_states = [DevicePowerState::D3; SystemPowerState::COUNT];
        caps.device_states[SystemPowerState::Unspecified.index()] = DevicePowerState::Unspecified;
        caps.device_states[SystemPowerState::Working.index()] = DevicePowerState::D0;
    }

    fn interfaces(&self) -> Vec<InterfaceInformation> {
        self.spec
            .interfaces
            .iter()
            .map(|interface| InterfaceInformation {
                interface_number: interface.number,
                alternate_setting: 0,
                pipes: interface
                    .endpoints
                    .iter()
                    .map(|&address| PipeInformation {
                        endpoint_address: address,
                        handle: sim_pipe_handle(self.handle(), interface.number, address),
                    })
                    .collect(),
            })
            .collect()
    }

    fn device_descriptor(&self) -> Vec<u8> {
        let vid = self.spec.vendor_id.to_le_bytes();
        let pid = self.spec.product_id.to_le_bytes();
        let class = if self.spec.is_hub() { 0x09 } else { 0x00 };
        vec![
            18, DESCRIPTOR_TYPE_DEVICE, 0x00, 0x02, class, 0x00, 0x00, 64, vid[0], vid[1], pid[0],
            pid[1], 0x00, 0x01, 0x00, 0x00, 0x00, 0x01,
        ]
    }

    fn config_descriptor(&self) -> Vec<u8> {
        let mut bytes = vec![
            9,
            DESCRIPTOR_TYPE_CONFIGURATION,
            0,
            0,
            self.spec.interfaces.len() as u8,
            1,
            0,
            0x80,
            50,
        ];
        for interface in &self.spec.interfaces {
            bytes.extend_from_slice(&[
                9,
                DESCRIPTOR_TYPE_INTERFACE,
                interface.number,
                0,
                interface.endpoints.len() as u8,
                0xFF,
                0,
                0,
                0,
            ]);
            for &address in &interface.endpoints {
                bytes.extend_from_slice(&[7, DESCRIPTOR_TYPE_ENDPOINT, address, 0x02, 0x00, 0x02, 0]);
            }
        }
        let total = (bytes.len() as u16).to_le_bytes();
        bytes[2] = total[0];
        bytes[3] = total[1];
        bytes
    }

    /// Final status and payload for a request
    fn answer(&self, irp: &mut Irp) -> (Status, Information) {
        match &mut irp.request {
            Request::Lifecycle(LifecycleEvent::QueryCapabilities(caps)) => {
                self.capabilities(caps);
                (Status::Success, Information::None)
            }
            Request::Lifecycle(LifecycleEvent::QueryDeviceRelations(RelationType::Bus))
                if self.spec.is_hub() =>
            {
                (Status::Success, Information::Relations(self.children()))
            }
            Request::Lifecycle(LifecycleEvent::QueryDeviceRelations(_))
            | Request::Lifecycle(LifecycleEvent::WaitWake) => (Status::NotSupported, Information::None),
            Request::Lifecycle(LifecycleEvent::Start) if self.spec.fail_start => {
                (Status::Unsuccessful, Information::None)
            }
            Request::Lifecycle(_) => (Status::Success, Information::None),
            Request::Control(ControlRequest::SelectConfiguration { configuration }) => {
                if self.spec.fail_configuration {
                    (Status::Unsuccessful, Information::None)
                } else if *configuration == 0 {
                    (Status::Success, Information::None)
                } else {
                    (Status::Success, Information::Configuration(self.interfaces()))
                }
            }
            Request::Control(ControlRequest::GetDescriptor {
                descriptor_type,
                length,
                ..
            }) => {
                let mut bytes = match *descriptor_type {
                    DESCRIPTOR_TYPE_DEVICE => self.device_descriptor(),
                    DESCRIPTOR_TYPE_CONFIGURATION => self.config_descriptor(),
                    _ => return (Status::InvalidParameter, Information::None),
                };
                bytes.truncate(*length as usize);
                (Status::Success, Information::Descriptor(bytes))
            }
        }
    }
}

impl LowerDevice for SimDevice {
    fn call(&self, mut irp: Box<Irp>) -> Status {
        trace!("sim {}: {:?}", self.handle(), irp.request);
        self.received.lock().push(irp.request.clone());

        let stall = self.spec.stall_control && matches!(irp.request, Request::Control(_));
        let (status, information) = self.answer(&mut irp);

        if !stall && self.spec.latency_ms == 0 {
            return irp.complete_with(status, information);
        }

        let cancel = irp.cancel_handle();
        let slot: PendingSlot = Arc::new(spin::Mutex::new(Some(irp)));
        let installed = {
            let slot = slot.clone();
            cancel.set_cancel_routine(Box::new(move || {
                let irp = slot.lock().take();
                if let Some(irp) = irp {
                    irp.complete_with(Status::Cancelled, Information::None);
                }
            }))
        };
        if !installed {
            let irp = slot.lock().take();
            if let Some(irp) = irp {
                irp.complete_with(Status::Cancelled, Information::None);
            }
            return Status::Pending;
        }

        if !stall {
            let job = Job {
                due: Instant::now() + Duration::from_millis(self.spec.latency_ms),
                slot,
                cancel,
                status,
                information,
            };
            if let Err(e) = self.jobs.try_send(job) {
                warn!("sim {}: completion queue closed, completing inline", self.handle());
                e.into_inner().fire();
            }
        }

        Status::Pending
    }

    fn flags(&self) -> DeviceFlags {
        DeviceFlags::BUFFERED_IO | DeviceFlags::POWER_PAGABLE
    }

    fn characteristics(&self) -> Characteristics {
        if self.spec.removable {
            Characteristics::REMOVABLE_MEDIA
        } else {
            Characteristics::empty()
        }
    }
}

/// The simulated host: device classification plus stack services
pub struct SimulatedBus {
    order: Vec<PdoHandle>,
    devices: HashMap<PdoHandle, Arc<SimDevice>>,
    attached: Mutex<HashSet<PdoHandle>>,
    links: Mutex<HashMap<String, String>>,
    power_reports: Mutex<Vec<(DeviceId, PowerState)>>,
    upper_flags: Mutex<HashMap<PdoHandle, DeviceFlags>>,
}

impl SimulatedBus {
    pub fn new(specs: &[DeviceSpec]) -> Self {
        let (jobs, queue) = unbounded();
        let spawned = std::thread::Builder::new()
            .name("sim-completion".to_string())
            .spawn(move || run_completions(queue));
        if let Err(e) = spawned {
            warn!("failed to spawn completion thread, delayed requests complete inline: {}", e);
        }

        let devices = specs
            .iter()
            .map(|spec| {
                let children = specs
                    .iter()
                    .filter(|child| child.parent == Some(spec.handle))
                    .map(|child| PdoHandle(child.handle))
                    .collect();
                (
                    PdoHandle(spec.handle),
                    Arc::new(SimDevice::new(spec.clone(), children, jobs.clone())),
                )
            })
            .collect();

        Self {
            order: specs.iter().map(|spec| PdoHandle(spec.handle)).collect(),
            devices,
            attached: Mutex::new(HashSet::new()),
            links: Mutex::new(HashMap::new()),
            power_reports: Mutex::new(Vec::new()),
            upper_flags: Mutex::new(HashMap::new()),
        }
    }

    /// Handles in the order the devices were described
    pub fn handles(&self) -> &[PdoHandle] {
        &self.order
    }

    pub fn device(&self, handle: PdoHandle) -> Option<&Arc<SimDevice>> {
        self.devices.get(&handle)
    }

    /// Drop `handle` from its hub's child list, as if it was unplugged
    pub fn unplug(&self, handle: PdoHandle) {
        for device in self.devices.values() {
            device.children.lock().retain(|child| *child != handle);
        }
    }

    pub fn is_attached(&self, handle: PdoHandle) -> bool {
        lock(&self.attached).contains(&handle)
    }

    /// Symbolic link names currently in place
    pub fn links(&self) -> Vec<String> {
        let mut links: Vec<String> = lock(&self.links).keys().cloned().collect();
        links.sort();
        links
    }

    pub fn power_reports(&self) -> Vec<(DeviceId, PowerState)> {
        lock(&self.power_reports).clone()
    }

    /// Pretend a device with `flags` sits above the node of `handle`
    pub fn set_attached_device_flags(&self, handle: PdoHandle, flags: Option<DeviceFlags>) {
        let mut upper = lock(&self.upper_flags);
        match flags {
            Some(flags) => upper.insert(handle, flags),
            None => upper.remove(&handle),
        };
    }

    fn spec(&self, handle: PdoHandle) -> Option<&DeviceSpec> {
        self.devices.get(&handle).map(|device| &device.spec)
    }
}

impl DeviceClassifier for SimulatedBus {
    fn device_id(&self, handle: PdoHandle) -> Option<String> {
        self.spec(handle)
            .filter(|spec| !spec.hidden_id)
            .map(DeviceSpec::hardware_id)
    }

    fn is_usb_device(&self, handle: PdoHandle) -> bool {
        self.spec(handle).is_some_and(|spec| spec.usb)
    }

    fn is_hub(&self, handle: PdoHandle) -> bool {
        self.spec(handle).is_some_and(DeviceSpec::is_hub)
    }

    fn is_root_hub(&self, handle: PdoHandle) -> bool {
        self.spec(handle)
            .is_some_and(|spec| spec.kind == DeviceKind::RootHub)
    }

    fn is_filter(&self, handle: PdoHandle) -> bool {
        self.spec(handle).is_some_and(|spec| spec.filter)
    }

    fn is_composite_interface(&self, handle: PdoHandle) -> bool {
        self.spec(handle).is_some_and(|spec| spec.composite)
    }
}

impl StackHost for SimulatedBus {
    fn attach_to_stack(&self, handle: PdoHandle) -> Option<Arc<dyn LowerDevice>> {
        let device = self.devices.get(&handle)?.clone();
        lock(&self.attached).insert(handle);
        Some(device)
    }

    fn detach_from_stack(&self, handle: PdoHandle, _next: &Arc<dyn LowerDevice>) {
        lock(&self.attached).remove(&handle);
    }

    fn physical_device(&self, handle: PdoHandle) -> Option<Arc<dyn LowerDevice>> {
        self.devices
            .get(&handle)
            .map(|device| device.clone() as Arc<dyn LowerDevice>)
    }

    fn create_symbolic_link(&self, link: &str, device_name: &str) -> Result<()> {
        let mut links = lock(&self.links);
        if links.contains_key(link) {
            return Err(Error::Resource(format!("symbolic link {} already exists", link)));
        }
        links.insert(link.to_string(), device_name.to_string());
        Ok(())
    }

    fn delete_symbolic_link(&self, link: &str) {
        lock(&self.links).remove(link);
    }

    fn set_power_state(&self, id: DeviceId, state: PowerState) {
        lock(&self.power_reports).push((id, state));
    }

    fn attached_device_flags(&self, handle: PdoHandle) -> Option<DeviceFlags> {
        lock(&self.upper_flags).get(&handle).copied()
    }
}
