//! Common utilities for rust-usb-stack
//!
//! This crate provides shared functionality between the device stack and its
//! front-ends: error handling, logging setup, test helpers, and the async
//! channel bridge for talking to the stack worker thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{StackBridge, StackCommand, StackEvent, StackWorker, create_stack_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
