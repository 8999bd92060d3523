//! Configuration management for the field calculation agent
//!
//! Handles loading and saving of the agent configuration (bus settings,
//! devices and their registers, the calculation script) from YAML files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::calc::smoothing::{sanitize_q, sanitize_r, DEFAULT_Q, DEFAULT_R};

/// Default config file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fieldcalc/config.yaml";

/// Environment variable overriding the config file path
pub const CONFIG_PATH_ENV: &str = "FIELDCALC_CONFIG";

/// Maximum number of configured devices
pub const MAX_DEVICES: usize = 10;

/// Maximum number of registers per device
pub const MAX_REGISTERS_PER_DEVICE: usize = 20;

/// Maximum calculation script length in characters
pub const MAX_SCRIPT_LEN: usize = 1024;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Configuration {
    /// Field bus settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Devices polled by the calculation cycle
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Calculation script and schedule
    #[serde(default)]
    pub calculation: CalculationConfig,

    /// Shared-state guard timing
    #[serde(default)]
    pub guard: GuardConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Field bus connection type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Modbus RTU over a serial port
    #[default]
    Rtu,
    /// Modbus TCP
    Tcp,
    /// In-memory register bank, no hardware
    Simulated,
}

/// Field bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    /// Connection type: "rtu", "tcp" or "simulated"
    #[serde(default)]
    pub connection_type: ConnectionType,

    /// Serial port path (RTU) or "host:port" (TCP)
    #[serde(default = "default_bus_address")]
    pub address: String,

    /// Baud rate (RTU only)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Per-request response timeout in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Pause between register operations in milliseconds
    #[serde(default = "default_inter_register_delay_ms")]
    pub inter_register_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::default(),
            address: default_bus_address(),
            baud_rate: default_baud_rate(),
            response_timeout_ms: default_response_timeout_ms(),
            inter_register_delay_ms: default_inter_register_delay_ms(),
        }
    }
}

/// One field-bus peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Display name
    #[serde(default)]
    pub name: String,

    /// Modbus slave ID (1-247)
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,

    /// Disabled devices are skipped by every read and write phase
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ordered registers; the position is the script's register index
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
}

/// Modbus table a register is read from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// FC 3 read, FC 6/16 write
    #[default]
    Holding,
    /// FC 4 read, never written
    Input,
}

/// Access mode of a register
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegisterAccess {
    /// Read-only
    Read,
    /// Write-only
    Write,
    /// Read and write
    #[default]
    ReadWrite,
}

/// Word order for two-register values
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// AB CD - most significant word first, standard Modbus
    #[default]
    BigEndian,
    /// CD AB - least significant word first
    LittleEndian,
}

impl ByteOrder {
    /// Combine two register words into one raw value
    pub fn combine(self, words: [u16; 2]) -> u32 {
        match self {
            ByteOrder::BigEndian => ((words[0] as u32) << 16) | (words[1] as u32),
            ByteOrder::LittleEndian => ((words[1] as u32) << 16) | (words[0] as u32),
        }
    }

    /// Split a raw value into the two register words, in bus order
    pub fn split(self, raw: u32) -> [u16; 2] {
        let high = (raw >> 16) as u16;
        let low = (raw & 0xFFFF) as u16;
        match self {
            ByteOrder::BigEndian => [high, low],
            ByteOrder::LittleEndian => [low, high],
        }
    }
}

/// Per-register smoothing filter parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SmoothingConfig {
    /// Feed raw readings through the estimator
    #[serde(default)]
    pub enabled: bool,

    /// Process noise
    #[serde(default = "default_q")]
    pub q: f64,

    /// Measurement noise
    #[serde(default = "default_r")]
    pub r: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            q: DEFAULT_Q,
            r: DEFAULT_R,
        }
    }
}

/// Register configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterConfig {
    /// Register address
    pub address: u16,

    /// Holding or input register
    #[serde(default)]
    pub kind: RegisterKind,

    /// Access mode
    #[serde(default)]
    pub access: RegisterAccess,

    /// Output registers are written by the cycle instead of read
    #[serde(default)]
    pub output: bool,

    /// Optional variable name shown to operators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Engineering value = raw * gain + offset
    #[serde(default = "default_gain")]
    pub gain: f64,

    /// Engineering value = raw * gain + offset
    #[serde(default)]
    pub offset: f64,

    /// Smoothing filter
    #[serde(default)]
    pub smoothing: SmoothingConfig,

    /// Number of 16-bit addresses occupied (1 or 2)
    #[serde(default = "default_span")]
    pub span: u16,

    /// Word order when span is 2
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Last raw value read from or written to the device (runtime state)
    #[serde(skip)]
    pub raw: u32,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            address: 0,
            kind: RegisterKind::default(),
            access: RegisterAccess::default(),
            output: false,
            name: None,
            gain: default_gain(),
            offset: 0.0,
            smoothing: SmoothingConfig::default(),
            span: default_span(),
            byte_order: ByteOrder::default(),
            raw: 0,
        }
    }
}

impl RegisterConfig {
    /// Whether the script or an operator may write this register
    pub fn is_read_only(&self) -> bool {
        self.access == RegisterAccess::Read || self.kind == RegisterKind::Input
    }

    /// Whether the read phase refreshes this register from the bus
    pub fn is_polled(&self) -> bool {
        !self.output && self.access != RegisterAccess::Write
    }

    /// Largest raw value the register can hold
    pub fn max_raw(&self) -> u32 {
        if self.span >= 2 {
            u32::MAX
        } else {
            u16::MAX as u32
        }
    }

    /// Forward linear conversion
    pub fn to_engineering(&self, raw: f64) -> f64 {
        raw * self.gain + self.offset
    }

    /// Label used in diagnostics
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", self.address, name),
            None => self.address.to_string(),
        }
    }
}

/// Calculation script and schedule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalculationConfig {
    /// Run the periodic cycle
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cycle period in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Newline-separated statements
    #[serde(default)]
    pub script: String,
}

impl Default for CalculationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: default_period_ms(),
            script: String::new(),
        }
    }
}

/// Shared-state guard timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardConfig {
    /// How long an administrative mutation waits for a running cycle
    #[serde(default = "default_cycle_wait_ms")]
    pub cycle_wait_ms: u64,

    /// Lock acquisition timeout for administrative mutation
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Lock acquisition timeout for a manual register read
    #[serde(default = "default_manual_read_timeout_ms")]
    pub manual_read_timeout_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            cycle_wait_ms: default_cycle_wait_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            manual_read_timeout_ms: default_manual_read_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_bus_address() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_response_timeout_ms() -> u64 {
    1000
}
fn default_inter_register_delay_ms() -> u64 {
    50
}
fn default_slave_id() -> u8 {
    1
}
fn default_gain() -> f64 {
    1.0
}
fn default_span() -> u16 {
    1
}
fn default_q() -> f64 {
    DEFAULT_Q
}
fn default_r() -> f64 {
    DEFAULT_R
}
fn default_period_ms() -> u64 {
    1000
}
fn default_cycle_wait_ms() -> u64 {
    2000
}
fn default_lock_timeout_ms() -> u64 {
    100
}
fn default_manual_read_timeout_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve the config path from the environment or the default
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl Configuration {
    /// Parse and check a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Configuration =
            serde_yaml::from_str(content).context("Failed to parse configuration YAML")?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    /// Serialize to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }

    /// Load configuration from specified path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Save configuration to specified path
    ///
    /// The file is written with owner-only permissions on unix.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = self.to_yaml()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
            }
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = fs::Permissions::from_mode(0o600);
            if let Err(e) = fs::set_permissions(path, permissions) {
                warn!("Failed to set config file permissions: {}", e);
            }
        }

        debug!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Replace invalid smoothing parameters with their defaults
    pub fn sanitize(&mut self) {
        for (d, device) in self.devices.iter_mut().enumerate() {
            for (r, register) in device.registers.iter_mut().enumerate() {
                let q = sanitize_q(register.smoothing.q);
                let r_noise = sanitize_r(register.smoothing.r);
                if q != register.smoothing.q || r_noise != register.smoothing.r {
                    warn!(
                        "Device {} register {}: invalid smoothing parameters (Q={}, R={}), using Q={}, R={}",
                        d, r, register.smoothing.q, register.smoothing.r, q, r_noise
                    );
                    register.smoothing.q = q;
                    register.smoothing.r = r_noise;
                }
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.bus.connection_type != ConnectionType::Simulated
            && self.bus.address.trim().is_empty()
        {
            anyhow::bail!("Bus address cannot be empty");
        }

        if self.bus.connection_type == ConnectionType::Rtu && self.bus.baud_rate == 0 {
            anyhow::bail!("Baud rate cannot be 0");
        }

        if self.devices.len() > MAX_DEVICES {
            anyhow::bail!(
                "Too many devices: {} configured, maximum is {}",
                self.devices.len(),
                MAX_DEVICES
            );
        }

        for (d, device) in self.devices.iter().enumerate() {
            // Modbus uses 1-247, 0 is broadcast
            if device.slave_id == 0 || device.slave_id > 247 {
                anyhow::bail!(
                    "Invalid slave_id {} for device {} '{}': must be 1-247",
                    device.slave_id,
                    d,
                    device.name
                );
            }

            if device.registers.len() > MAX_REGISTERS_PER_DEVICE {
                anyhow::bail!(
                    "Device {} '{}' has {} registers, maximum is {}",
                    d,
                    device.name,
                    device.registers.len(),
                    MAX_REGISTERS_PER_DEVICE
                );
            }

            for (r, register) in device.registers.iter().enumerate() {
                if register.span != 1 && register.span != 2 {
                    anyhow::bail!(
                        "Device {} register {}: span must be 1 or 2, got {}",
                        d,
                        r,
                        register.span
                    );
                }

                if !register.gain.is_finite() || !register.offset.is_finite() {
                    anyhow::bail!("Device {} register {}: gain and offset must be finite", d, r);
                }

                if register.gain == 0.0 && !register.is_read_only() {
                    warn!(
                        "Device {} register {}: gain is 0, writes to this register will fail",
                        d, r
                    );
                }
            }
        }

        let script_len = self.calculation.script.chars().count();
        if script_len > MAX_SCRIPT_LEN {
            anyhow::bail!(
                "Calculation script is {} characters, maximum is {}",
                script_len,
                MAX_SCRIPT_LEN
            );
        }

        if self.calculation.period_ms == 0 {
            anyhow::bail!("Calculation period cannot be 0");
        }

        Ok(())
    }

    /// Total number of configured registers
    pub fn register_count(&self) -> usize {
        self.devices.iter().map(|d| d.registers.len()).sum()
    }
}

/// Configuration persistence collaborator
pub trait ConfigStore: Send + Sync {
    /// Load the persisted configuration
    fn load(&self) -> Result<Configuration>;

    /// Persist a configuration
    fn save(&self, config: &Configuration) -> Result<()>;
}

/// YAML file persistence
#[derive(Debug, Clone)]
pub struct YamlConfigStore {
    path: PathBuf,
}

impl YamlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file, or write and return the defaults when it does not exist
    pub fn load_or_default(&self) -> Result<Configuration> {
        if self.path.exists() {
            return self.load();
        }

        info!(
            "No configuration at {}, starting with defaults",
            self.path.display()
        );
        let config = Configuration::default();
        if let Err(e) = self.save(&config) {
            warn!("Failed to write default configuration: {:#}", e);
        }
        Ok(config)
    }
}

impl ConfigStore for YamlConfigStore {
    fn load(&self) -> Result<Configuration> {
        Configuration::load_from(&self.path)
    }

    fn save(&self, config: &Configuration) -> Result<()> {
        config.save_to(&self.path)
    }
}
