//! Test utilities for rust-usb-stack
//!
//! Provides mock builders and timing helpers shared by the unit and
//! integration tests of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_interface_information;
//!
//! # fn main() {
//! let info = create_mock_interface_information(0, &[0x81, 0x02]);
//! assert_eq!(info.pipes.len(), 2);
//! # }
//! ```

use protocol::{
    ChildEntry, DeviceCapabilities, DeviceId, DeviceInfo, DevicePowerState,
    InterfaceInformation, PipeHandle, PipeInformation, SystemPowerState,
};
use std::future::Future;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock DeviceInfo for testing
///
/// # Arguments
/// * `id` - Node id
/// * `bus` - Bus number
/// * `children` - `(id, port)` pairs of resolved children
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_info;
///
/// let info = create_mock_device_info(1, 2, &[(3, 4)]);
/// assert_eq!(info.bus, 2);
/// assert_eq!(info.children[0].port, 4);
/// ```
pub fn create_mock_device_info(id: u32, bus: u32, children: &[(u32, u32)]) -> DeviceInfo {
    DeviceInfo {
        id: DeviceId(id),
        port: 0,
        parent_id: None,
        bus,
        children: children
            .iter()
            .map(|&(id, port)| ChildEntry {
                id: DeviceId(id),
                port,
            })
            .collect(),
    }
}

/// Create interface information as a configuration selection would report it
///
/// Pipe handles are derived from the interface number and endpoint address so
/// they are unique within one configuration.
pub fn create_mock_interface_information(
    interface_number: u8,
    endpoints: &[u8],
) -> InterfaceInformation {
    InterfaceInformation {
        interface_number,
        alternate_setting: 0,
        pipes: endpoints
            .iter()
            .map(|&address| PipeInformation {
                endpoint_address: address,
                handle: create_mock_pipe_handle(interface_number, address),
            })
            .collect(),
    }
}

/// Pipe handle used by `create_mock_interface_information`
pub fn create_mock_pipe_handle(interface_number: u8, endpoint_address: u8) -> PipeHandle {
    PipeHandle(0x1000 + ((interface_number as u64) << 8) + endpoint_address as u64)
}

/// Create capabilities as a bus driver would report them
pub fn create_mock_capabilities(address: u32) -> DeviceCapabilities {
    let mut device_states = [DevicePowerState::Unspecified; SystemPowerState::COUNT];
    device_states[SystemPowerState::Working.index()] = DevicePowerState::D0;
    device_states[SystemPowerState::Sleeping1.index()] = DevicePowerState::D2;
    device_states[SystemPowerState::Sleeping3.index()] = DevicePowerState::D3;
    device_states[SystemPowerState::Hibernate.index()] = DevicePowerState::D3;
    device_states[SystemPowerState::Shutdown.index()] = DevicePowerState::D3;

    DeviceCapabilities {
        address,
        surprise_removal_ok: false,
        removable: true,
        device_states,
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll `condition` from a blocking test until it holds or `duration` passes
///
/// Returns whether the condition was observed.
pub fn wait_until<F>(duration: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + duration;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Create a mock USB configuration descriptor
///
/// Configuration 1 with interface 0 (alternate settings 0 and 1) and
/// interface 1, each followed by its endpoint descriptors.
pub fn create_mock_config_descriptor() -> Vec<u8> {
    vec![
        // Configuration descriptor
        0x09, // bLength
        0x02, // bDescriptorType (Configuration)
        0x3C, 0x00, // wTotalLength (60 bytes)
        0x02, // bNumInterfaces
        0x01, // bConfigurationValue
        0x00, // iConfiguration
        0x80, // bmAttributes (Bus-powered)
        0x32, // bMaxPower (100mA)
        // Interface 0, alternate setting 0
        0x09, 0x04, 0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00,
        // Endpoint 0x81 bulk IN
        0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00,
        // Interface 0, alternate setting 1
        0x09, 0x04, 0x00, 0x01, 0x02, 0xFF, 0x01, 0x00, 0x00,
        // Endpoint 0x81 bulk IN, endpoint 0x02 bulk OUT
        0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00,
        0x07, 0x05, 0x02, 0x02, 0x00, 0x02, 0x00,
        // Interface 1, alternate setting 0
        0x09, 0x04, 0x01, 0x00, 0x01, 0x03, 0x00, 0x00, 0x00,
        // Endpoint 0x83 interrupt IN
        0x07, 0x05, 0x83, 0x03, 0x08, 0x00, 0x0A,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_device_info() {
        let info = create_mock_device_info(42, 3, &[(1, 2), (5, 6)]);

        assert_eq!(info.id.0, 42);
        assert_eq!(info.bus, 3);
        assert_eq!(info.children.len(), 2);
        assert_eq!(info.children[1].id, DeviceId(5));
    }

    #[test]
    fn test_pipe_handles_are_unique_per_endpoint() {
        let info = create_mock_interface_information(1, &[0x81, 0x02, 0x83]);
        let handles: std::collections::HashSet<_> = info.pipes.iter().map(|p| p.handle).collect();
        assert_eq!(handles.len(), 3);
    }

    #[test]
    fn test_create_mock_config_descriptor() {
        let desc = create_mock_config_descriptor();

        assert_eq!(desc.len(), 60);
        assert_eq!(desc[0], 0x09);
        assert_eq!(desc[1], 0x02);
        assert_eq!(u16::from_le_bytes([desc[2], desc[3]]) as usize, desc.len());
    }

    #[test]
    fn test_mock_capabilities_map_working_to_d0() {
        let caps = create_mock_capabilities(4);
        assert_eq!(caps.address, 4);
        assert_eq!(
            caps.device_states[SystemPowerState::Working.index()],
            DevicePowerState::D0
        );
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(10), || true));
        assert!(!wait_until(Duration::from_millis(5), || false));
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }
}
