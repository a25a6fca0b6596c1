//! USB device stack lifecycle management
//!
//! Attaches device nodes to physical USB devices and hubs, dispatches
//! lifecycle and power events through the layered stack, keeps in-flight
//! requests safe against removal, and tracks bus topology.
//!
//! The pieces, bottom up:
//! - [`quiesce`]: remove lock letting removal wait for in-flight requests
//! - [`registry`] and [`id_pool`]: the set of active nodes and their ids
//! - [`node`]: per-device state
//! - [`topology`]: parent/child/bus resolution from reported child sets
//! - [`bridge`]: blocking submission of driver-issued requests
//! - [`dispatcher`]: the table of lifecycle event handlers
//! - [`stack`]: attach, dispatch and diagnostic queries
//!
//! [`sim`] provides a simulated host and [`worker`] runs the stack on its
//! own thread behind the `common` channel bridge.

pub mod bridge;
pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod event;
pub mod host;
pub mod host_scan;
pub mod id_pool;
pub mod irp;
pub mod node;
pub mod quiesce;
pub mod registry;
pub mod sim;
pub mod stack;
pub mod topology;
pub mod worker;

pub use bridge::SynchronousRequestBridge;
pub use config::StackConfig;
pub use dispatcher::LifecycleDispatcher;
pub use host::{Characteristics, DeviceClassifier, DeviceFlags, LowerDevice, StackHost};
pub use irp::{Completion, Information, IoStatus, Irp, Request};
pub use node::{DeviceNode, NodeClass, RoutingTarget};
pub use quiesce::{QuiesceBarrier, QuiesceGuard};
pub use registry::DeviceRegistry;
pub use sim::SimulatedBus;
pub use stack::DeviceStack;
pub use worker::{StackWorkerThread, spawn_stack_worker};
