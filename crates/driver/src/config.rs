//! Stack configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub stack: StackSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Simulated bus, attached in order
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSettings {
    /// Size of the device id pool
    #[serde(default = "StackSettings::default_max_devices")]
    pub max_devices: usize,
    #[serde(default = "StackSettings::default_device_name_prefix")]
    pub device_name_prefix: String,
    #[serde(default = "StackSettings::default_symbolic_link_prefix")]
    pub symbolic_link_prefix: String,
    #[serde(default = "StackSettings::default_log_level")]
    pub log_level: String,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            max_devices: Self::default_max_devices(),
            device_name_prefix: Self::default_device_name_prefix(),
            symbolic_link_prefix: Self::default_symbolic_link_prefix(),
            log_level: Self::default_log_level(),
        }
    }
}

impl StackSettings {
    fn default_max_devices() -> usize {
        256
    }

    fn default_device_name_prefix() -> String {
        r"\Device\usbstack".to_string()
    }

    fn default_symbolic_link_prefix() -> String {
        r"\DosDevices\usbstack-".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Device object name of node `id`
    pub fn device_name(&self, id: u32) -> String {
        format!("{}{:04}", self.device_name_prefix, id)
    }

    /// Symbolic link name of node `id`
    pub fn symbolic_link(&self, id: u32) -> String {
        format!("{}{:04}", self.symbolic_link_prefix, id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Wait for configuration selection during start
    #[serde(default = "TimeoutSettings::default_configuration_timeout")]
    pub configuration_timeout_ms: u64,
    /// Cap on any synchronous request
    #[serde(default = "TimeoutSettings::default_max_control_timeout")]
    pub max_control_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            configuration_timeout_ms: Self::default_configuration_timeout(),
            max_control_timeout_ms: Self::default_max_control_timeout(),
        }
    }
}

impl TimeoutSettings {
    fn default_configuration_timeout() -> u64 {
        1000
    }

    fn default_max_control_timeout() -> u64 {
        5000
    }

    pub fn configuration_timeout(&self) -> Duration {
        Duration::from_millis(self.configuration_timeout_ms)
    }

    pub fn max_control_timeout(&self) -> Duration {
        Duration::from_millis(self.max_control_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    RootHub,
    Hub,
    #[default]
    Device,
}

/// One physical device on the simulated bus
///
/// # Example Configuration
/// ```toml
/// [[devices]]
/// handle = 1
/// kind = "root_hub"
///
/// [[devices]]
/// handle = 2
/// parent = 1
/// address = 3
/// vendor_id = 0x046d
/// product_id = 0xc52b
///
/// [[devices.interfaces]]
/// number = 0
/// endpoints = [0x81]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Opaque physical device handle, unique on the bus
    pub handle: u64,
    #[serde(default)]
    pub kind: DeviceKind,
    /// Handle of the hub the device is plugged into
    #[serde(default)]
    pub parent: Option<u64>,
    /// Bus address reported by capability queries
    #[serde(default)]
    pub address: u32,
    #[serde(default)]
    pub vendor_id: u16,
    #[serde(default)]
    pub product_id: u16,
    /// Attach as a filter talking to the physical device directly
    #[serde(default)]
    pub filter: bool,
    /// One interface of a composite device
    #[serde(default)]
    pub composite: bool,
    /// Not a USB device at all
    #[serde(default = "DeviceSpec::default_usb")]
    pub usb: bool,
    /// Hardware id cannot be read
    #[serde(default)]
    pub hidden_id: bool,
    #[serde(default)]
    pub removable: bool,
    /// Completion delay for every request, 0 completes inline
    #[serde(default)]
    pub latency_ms: u64,
    /// Driver-issued requests never complete unless cancelled
    #[serde(default)]
    pub stall_control: bool,
    /// Configuration selection fails
    #[serde(default)]
    pub fail_configuration: bool,
    /// Start completes with a failure status
    #[serde(default)]
    pub fail_start: bool,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
}

impl DeviceSpec {
    fn default_usb() -> bool {
        true
    }

    /// A plain device with defaults for everything but the handle
    pub fn new(handle: u64, kind: DeviceKind) -> Self {
        Self {
            handle,
            kind,
            parent: None,
            address: 0,
            vendor_id: 0,
            product_id: 0,
            filter: false,
            composite: false,
            usb: true,
            hidden_id: false,
            removable: false,
            latency_ms: 0,
            stall_control: false,
            fail_configuration: false,
            fail_start: false,
            interfaces: Vec::new(),
        }
    }

    pub fn is_hub(&self) -> bool {
        matches!(self.kind, DeviceKind::RootHub | DeviceKind::Hub)
    }

    /// Hardware id string, `USB\VID_xxxx&PID_xxxx` style
    pub fn hardware_id(&self) -> String {
        let bus = if self.usb { "USB" } else { "PCI" };
        format!("{}\\VID_{:04X}&PID_{:04X}", bus, self.vendor_id, self.product_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub number: u8,
    /// Endpoint addresses, direction bit included
    #[serde(default)]
    pub endpoints: Vec<u8>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            stack: StackSettings::default(),
            timeouts: TimeoutSettings::default(),
            devices: Vec::new(),
        }
    }
}

impl StackConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-stack/stack.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: StackConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-stack").join("stack.toml")
        } else {
            PathBuf::from(".config/usb-stack/stack.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.stack.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.stack.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.stack.max_devices == 0 || self.stack.max_devices > 9999 {
            return Err(anyhow!(
                "Invalid max_devices {}, must be between 1 and 9999",
                self.stack.max_devices
            ));
        }

        if self.timeouts.max_control_timeout_ms == 0 {
            return Err(anyhow!("max_control_timeout_ms must be greater than 0"));
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.handle) {
                return Err(anyhow!("Duplicate device handle {:#x}", device.handle));
            }
        }
        for device in &self.devices {
            if let Some(parent) = device.parent {
                let hub = self
                    .devices
                    .iter()
                    .find(|d| d.handle == parent)
                    .ok_or_else(|| anyhow!("Device {:#x} has unknown parent {:#x}", device.handle, parent))?;
                if !hub.is_hub() {
                    return Err(anyhow!(
                        "Device {:#x} is plugged into {:#x}, which is not a hub",
                        device.handle,
                        parent
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Load a config from a path that may start with `~`
pub fn load_config(path: &str) -> Result<StackConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    StackConfig::load(Some(path_buf))
}
