//! Host USB enumeration
//!
//! Reads the real device tree through libusb and describes it as
//! [`DeviceSpec`]s, so the simulated bus can replay the host's topology.

use crate::config::{DeviceKind, DeviceSpec, InterfaceSpec};
use rusb::{Device, UsbContext};
use std::collections::HashSet;
use tracing::{debug, warn};

const USB_CLASS_HUB: u8 = 9;
/// Linux Foundation, vendor of the virtual root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;

/// Physical device handle of a host device
pub fn device_handle(bus: u8, address: u8) -> u64 {
    ((bus as u64) << 8) | address as u64
}

/// Enumerate every device the host can see, hubs before their children
pub fn scan_host() -> Result<Vec<DeviceSpec>, rusb::Error> {
    let context = rusb::Context::new()?;
    let devices = context.devices()?;

    let mut specs: Vec<DeviceSpec> = devices
        .iter()
        .filter_map(|device| match describe(&device) {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(
                    "Skipping device bus={} addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                None
            }
        })
        .collect();

    // Hubs we could not describe are left out; their children become roots
    let known: HashSet<u64> = specs.iter().map(|spec| spec.handle).collect();
    for spec in &mut specs {
        if spec.parent.is_some_and(|parent| !known.contains(&parent)) {
            spec.parent = None;
        }
    }

    // Parents first: root hubs, then by depth
    let index = specs_index(&specs);
    specs.sort_by_key(|spec| (depth(spec, &index), spec.handle));
    debug!("Scanned {} host devices", specs.len());
    Ok(specs)
}

fn specs_index(specs: &[DeviceSpec]) -> Vec<(u64, Option<u64>)> {
    specs.iter().map(|spec| (spec.handle, spec.parent)).collect()
}

fn depth(spec: &DeviceSpec, index: &[(u64, Option<u64>)]) -> usize {
    let mut depth = 0;
    let mut parent = spec.parent;
    while let Some(handle) = parent {
        depth += 1;
        if depth > index.len() {
            break;
        }
        parent = index
            .iter()
            .find(|(h, _)| *h == handle)
            .and_then(|(_, p)| *p);
    }
    depth
}

fn describe<T: UsbContext>(device: &Device<T>) -> Result<DeviceSpec, rusb::Error> {
    let descriptor = device.device_descriptor()?;

    let kind = if descriptor.class_code() == USB_CLASS_HUB {
        if descriptor.vendor_id() == ROOT_HUB_VENDOR_ID {
            DeviceKind::RootHub
        } else {
            DeviceKind::Hub
        }
    } else {
        DeviceKind::Device
    };

    let mut spec = DeviceSpec::new(device_handle(device.bus_number(), device.address()), kind);
    spec.vendor_id = descriptor.vendor_id();
    spec.product_id = descriptor.product_id();
    spec.address = device.port_number() as u32;
    spec.parent = device
        .get_parent()
        .map(|parent| device_handle(parent.bus_number(), parent.address()));

    match device.active_config_descriptor() {
        Ok(config) => {
            for interface in config.interfaces() {
                // Alternate setting 0 is what configuration selection opens
                if let Some(setting) = interface.descriptors().next() {
                    spec.interfaces.push(InterfaceSpec {
                        number: interface.number(),
                        endpoints: setting
                            .endpoint_descriptors()
                            .map(|endpoint| endpoint.address())
                            .collect(),
                    });
                }
            }
        }
        Err(e) => debug!(
            "No active configuration for bus={} addr={}: {}",
            device.bus_number(),
            device.address(),
            e
        ),
    }

    Ok(spec)
}
