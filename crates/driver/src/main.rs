//! usb-stack
//!
//! Runs the device stack against a simulated bus. The bus is described by the
//! `[[devices]]` tables of the configuration file, or mirrored from the host's
//! real USB tree with `--from-host`. Every device is attached, started and
//! queried, its topology and pipe table are printed, and the devices are then
//! removed again.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{StackBridge, StackCommand, StackEvent, create_stack_bridge, setup_logging};
use driver::config::{DeviceKind, DeviceSpec, InterfaceSpec, StackConfig};
use driver::{DeviceStack, SimulatedBus, host_scan, spawn_stack_worker};
use protocol::{
    DeviceCapabilities, DeviceId, DeviceInfo, InterfaceInfo, LifecycleEvent, PdoHandle,
    RelationType, Status,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-stack")]
#[command(
    author,
    version,
    about = "USB device stack - attach, start, inspect and remove devices"
)]
#[command(long_about = "
Drives the USB device stack through a full plug and play cycle against a
simulated bus and reports what each node sees.

EXAMPLES:
    # Run against the built-in demo topology (or the configured devices)
    usb-stack

    # Mirror the USB tree of this machine
    usb-stack --from-host

    # Machine readable output
    usb-stack --json

CONFIGURATION:
    The stack looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-stack/stack.toml
    3. /etc/usb-stack/stack.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Describe the simulated bus from the host's USB devices
    #[arg(long)]
    from_host: bool,

    /// Print the device report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// What one node reported after start
#[derive(Debug, Serialize)]
struct DeviceReport {
    handle: PdoHandle,
    start: Status,
    info: DeviceInfo,
    interfaces: Vec<InterfaceInfo>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let mut config = StackConfig::default();
        config.devices = demo_devices();
        let path = StackConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        driver::config::load_config(path).context("Failed to load configuration")?
    } else {
        StackConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.stack.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usb-stack v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.from_host {
        config.devices = host_scan::scan_host().context("Failed to enumerate host USB devices")?;
        info!("Mirroring {} host devices", config.devices.len());
    } else if config.devices.is_empty() {
        info!("No devices configured, using the demo topology");
        config.devices = demo_devices();
    }
    config.validate().context("Invalid device description")?;

    let bus = Arc::new(SimulatedBus::new(&config.devices));
    let stack = Arc::new(DeviceStack::new(&config, bus.clone(), bus.clone()));

    let (bridge, worker) = create_stack_bridge();
    let worker_handle =
        spawn_stack_worker(stack, worker).context("Failed to spawn stack worker")?;

    let result = run_cycle(&bridge, &bus, args.json).await;

    info!("Shutting down device stack...");
    if let Err(e) = bridge.send_command(StackCommand::Shutdown).await {
        error!("Error shutting down stack worker: {:#}", e);
    }
    if let Err(e) = worker_handle.join() {
        error!("Stack worker thread panicked: {:?}", e);
    }

    while let Some(event) = bridge.try_recv_event() {
        debug!("Unconsumed stack event: {:?}", event);
    }

    result
}

/// Attach, start and query every device, print the report, remove everything
async fn run_cycle(bridge: &StackBridge, bus: &SimulatedBus, json: bool) -> Result<()> {
    let mut attached: Vec<(PdoHandle, DeviceId)> = Vec::new();
    for &handle in bus.handles() {
        match attach(bridge, handle).await? {
            Some(id) => attached.push((handle, id)),
            None => info!("{} is not managed by the stack", handle),
        }
    }

    let mut starts = Vec::with_capacity(attached.len());
    for &(handle, id) in &attached {
        let capabilities = LifecycleEvent::QueryCapabilities(DeviceCapabilities::default());
        let status = dispatch(bridge, id, capabilities).await?;
        debug!("capabilities of {}: {}", id, status);

        let status = dispatch(bridge, id, LifecycleEvent::Start).await?;
        if !status.is_success() {
            warn!("start of node {} failed: {}", id, status);
        }
        starts.push(status);

        if bus.device(handle).is_some_and(|device| device.spec().is_hub()) {
            let relations = LifecycleEvent::QueryDeviceRelations(RelationType::Bus);
            let status = dispatch(bridge, id, relations).await?;
            debug!("bus relations of {}: {}", id, status);
        }
    }

    let mut reports = Vec::with_capacity(attached.len());
    for (&(handle, id), start) in attached.iter().zip(starts) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(StackCommand::DeviceInfo { id, response: tx })
            .await
            .context("Failed to send DeviceInfo command")?;
        let info = rx
            .await
            .context("Failed to receive device info")?
            .ok_or_else(|| anyhow!("node {} disappeared", id))?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(StackCommand::PipeTable { id, response: tx })
            .await
            .context("Failed to send PipeTable command")?;
        let interfaces = rx
            .await
            .context("Failed to receive pipe table")?
            .unwrap_or_default()
            .into_iter()
            .filter(|interface| interface.valid)
            .collect();

        reports.push(DeviceReport {
            handle,
            start,
            info,
            interfaces,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_reports(&reports);
    }

    for &(_, id) in attached.iter().rev() {
        let status = dispatch(bridge, id, LifecycleEvent::Remove).await?;
        debug!("remove of {}: {}", id, status);
    }

    let mut removed = 0;
    while let Some(event) = bridge.try_recv_event() {
        if let StackEvent::DeviceRemoved { .. } = event {
            removed += 1;
        }
        debug!("stack event: {:?}", event);
    }
    info!("{} of {} nodes removed", removed, attached.len());

    Ok(())
}

async fn attach(bridge: &StackBridge, handle: PdoHandle) -> Result<Option<DeviceId>> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(StackCommand::Attach {
            handle,
            response: tx,
        })
        .await
        .context("Failed to send Attach command")?;

    match rx.await.context("Failed to receive attach result")? {
        Ok(id) => Ok(id),
        Err(e) => {
            warn!("attaching {} failed: {}", handle, e);
            Ok(None)
        }
    }
}

async fn dispatch(bridge: &StackBridge, id: DeviceId, event: LifecycleEvent) -> Result<Status> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(StackCommand::Dispatch {
            id,
            event,
            response: tx,
        })
        .await
        .context("Failed to send Dispatch command")?;

    rx.await.context("Failed to receive dispatch status")
}

fn print_reports(reports: &[DeviceReport]) {
    if reports.is_empty() {
        println!("No devices attached.");
        return;
    }

    println!("Attached {} device(s):\n", reports.len());
    for report in reports {
        let parent = report
            .info
            .parent_id
            .map(|parent| parent.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  [{}] {} - bus {} port {} parent {} (start: {})",
            report.info.id, report.handle, report.info.bus, report.info.port, parent, report.start
        );
        for child in &report.info.children {
            println!("      child {} on port {}", child.id, child.port);
        }
        for interface in &report.interfaces {
            let endpoints: Vec<String> = interface
                .endpoints
                .iter()
                .map(|endpoint| format!("{:#04x}", endpoint.address))
                .collect();
            println!(
                "      interface {}: endpoints [{}]",
                interface.index,
                endpoints.join(", ")
            );
        }
        println!();
    }
}

/// Root hub with an external hub, a mouse on the root hub and a storage
/// device behind the external hub
fn demo_devices() -> Vec<DeviceSpec> {
    let root = DeviceSpec::new(0x100, DeviceKind::RootHub);

    let mut hub = DeviceSpec::new(0x101, DeviceKind::Hub);
    hub.parent = Some(0x100);
    hub.address = 1;
    hub.interfaces.push(InterfaceSpec {
        number: 0,
        endpoints: vec![0x81],
    });

    let mut mouse = DeviceSpec::new(0x102, DeviceKind::Device);
    mouse.parent = Some(0x100);
    mouse.address = 2;
    mouse.vendor_id = 0x046d;
    mouse.product_id = 0xc077;
    mouse.interfaces.push(InterfaceSpec {
        number: 0,
        endpoints: vec![0x81],
    });

    let mut storage = DeviceSpec::new(0x103, DeviceKind::Device);
    storage.parent = Some(0x101);
    storage.address = 3;
    storage.vendor_id = 0x0781;
    storage.product_id = 0x5567;
    storage.removable = true;
    storage.latency_ms = 2;
    storage.interfaces.push(InterfaceSpec {
        number: 0,
        endpoints: vec![0x81, 0x02],
    });

    vec![root, hub, mouse, storage]
}
