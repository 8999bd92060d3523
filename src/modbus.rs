//! Register store: Modbus RTU/TCP and simulated backends
//!
//! The calculation cycle talks to field devices through the synchronous
//! [`RegisterStore`] trait. Register I/O blocks the calling thread, so the
//! cycle runs on a blocking thread and never on a runtime worker.
//!
//! Backends:
//! - [`RodbusStore`]: rodbus client channel (serial RTU or TCP), with a
//!   doubling retry strategy and a per-request response timeout
//! - [`SimulatedStore`]: in-memory register bank with injectable failures

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rodbus::client::{Channel, RequestParam, WriteMultiple};
use rodbus::{AddressRange, DecodeLevel, ExceptionCode, Indexed, RequestError, UnitId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::config::{BusConfig, ConnectionType, RegisterKind};

/// Non-success status of a register operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum StoreError {
    #[error("illegal function")]
    IllegalFunction,

    #[error("illegal data address")]
    IllegalAddress,

    #[error("illegal data value")]
    IllegalValue,

    #[error("slave device failure")]
    SlaveFailure,

    #[error("response timeout")]
    Timeout,

    #[error("invalid response")]
    MalformedResponse,

    #[error("checksum failure")]
    ChecksumFailure,

    #[error("protocol exception")]
    ProtocolException,
}

impl StoreError {
    /// Numeric status code reported in diagnostics
    pub fn code(self) -> u8 {
        match self {
            StoreError::IllegalFunction => 0x01,
            StoreError::IllegalAddress => 0x02,
            StoreError::IllegalValue => 0x03,
            StoreError::SlaveFailure => 0x04,
            StoreError::Timeout => 0xE1,
            StoreError::MalformedResponse => 0xE2,
            StoreError::ChecksumFailure => 0xE3,
            StoreError::ProtocolException => 0xE4,
        }
    }
}

impl From<RequestError> for StoreError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Exception(ExceptionCode::IllegalFunction) => StoreError::IllegalFunction,
            RequestError::Exception(ExceptionCode::IllegalDataAddress) => StoreError::IllegalAddress,
            RequestError::Exception(ExceptionCode::IllegalDataValue) => StoreError::IllegalValue,
            RequestError::Exception(ExceptionCode::ServerDeviceFailure) => StoreError::SlaveFailure,
            RequestError::Exception(_) => StoreError::ProtocolException,
            RequestError::BadRequest(_) => StoreError::IllegalAddress,
            RequestError::BadFrame(_) => StoreError::ChecksumFailure,
            RequestError::BadResponse(_) => StoreError::MalformedResponse,
            _ => StoreError::Timeout,
        }
    }
}

/// Synchronous access to device registers
pub trait RegisterStore: Send {
    /// Read `count` consecutive registers
    fn read_registers(
        &mut self,
        slave: u8,
        address: u16,
        kind: RegisterKind,
        count: u16,
    ) -> Result<Vec<u16>, StoreError>;

    /// Write one holding register
    fn write_register(&mut self, slave: u8, address: u16, value: u16) -> Result<(), StoreError>;

    /// Write consecutive holding registers
    fn write_registers(
        &mut self,
        slave: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), StoreError>;
}

/// Open the store described by the bus configuration
///
/// Must be called from within the tokio runtime.
pub async fn open_store(bus: &BusConfig) -> Result<Box<dyn RegisterStore>> {
    match bus.connection_type {
        ConnectionType::Simulated => {
            info!("Using simulated register store");
            Ok(Box::new(SimulatedStore::new()))
        }
        _ => Ok(Box::new(RodbusStore::connect(bus).await?)),
    }
}

// ============================================================================
// rodbus backend
// ============================================================================

/// Modbus client over a rodbus channel
///
/// Calls block on the runtime handle and must only be made from blocking
/// threads (`spawn_blocking`), never from an async task.
pub struct RodbusStore {
    channel: Channel,
    runtime: Handle,
    response_timeout: Duration,
}

impl RodbusStore {
    /// Spawn the client task and enable the channel
    pub async fn connect(bus: &BusConfig) -> Result<Self> {
        let mut channel = match bus.connection_type {
            ConnectionType::Tcp => {
                let socket_addr: SocketAddr = bus
                    .address
                    .parse()
                    .with_context(|| format!("Invalid TCP address: {}", bus.address))?;
                info!("Connecting to Modbus TCP bus at {}", socket_addr);

                rodbus::client::spawn_tcp_client_task(
                    rodbus::client::HostAddr::ip(socket_addr.ip(), socket_addr.port()),
                    1, // max queued requests
                    Self::retry_strategy(),
                    DecodeLevel::default(),
                    None, // listener
                )
            }
            ConnectionType::Rtu => Self::spawn_rtu(bus)?,
            ConnectionType::Simulated => {
                anyhow::bail!("Simulated bus has no Modbus channel")
            }
        };

        channel
            .enable()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to enable Modbus channel: {:?}", e))?;

        Ok(Self {
            channel,
            runtime: Handle::current(),
            response_timeout: Duration::from_millis(bus.response_timeout_ms),
        })
    }

    /// Doubling backoff between reconnect attempts, 2s to 30s
    fn retry_strategy() -> Box<dyn rodbus::RetryStrategy> {
        rodbus::doubling_retry_strategy(Duration::from_secs(2), Duration::from_secs(30))
    }

    #[cfg(target_os = "linux")]
    fn spawn_rtu(bus: &BusConfig) -> Result<Channel> {
        info!(
            "Connecting to Modbus RTU bus at {} (baud: {})",
            bus.address, bus.baud_rate
        );

        let serial_settings = rodbus::SerialSettings {
            baud_rate: bus.baud_rate,
            data_bits: rodbus::DataBits::Eight,
            stop_bits: rodbus::StopBits::One,
            parity: rodbus::Parity::None,
            flow_control: rodbus::FlowControl::None,
        };

        Ok(rodbus::client::spawn_rtu_client_task(
            &bus.address,
            serial_settings,
            1, // max queued requests
            Self::retry_strategy(),
            DecodeLevel::default(),
            None, // listener
        ))
    }

    #[cfg(not(target_os = "linux"))]
    fn spawn_rtu(_bus: &BusConfig) -> Result<Channel> {
        anyhow::bail!("Modbus RTU not supported on this platform")
    }

    fn params(&self, slave: u8) -> RequestParam {
        RequestParam::new(UnitId::new(slave), self.response_timeout)
    }
}

impl RegisterStore for RodbusStore {
    fn read_registers(
        &mut self,
        slave: u8,
        address: u16,
        kind: RegisterKind,
        count: u16,
    ) -> Result<Vec<u16>, StoreError> {
        let params = self.params(slave);
        let range =
            AddressRange::try_from(address, count).map_err(|_| StoreError::IllegalAddress)?;

        let channel = &mut self.channel;
        let values = match kind {
            RegisterKind::Holding => self
                .runtime
                .block_on(channel.read_holding_registers(params, range))?,
            RegisterKind::Input => self
                .runtime
                .block_on(channel.read_input_registers(params, range))?,
        };

        // rodbus returns Vec<Indexed<u16>>, keep the values
        Ok(values.into_iter().map(|indexed| indexed.value).collect())
    }

    fn write_register(&mut self, slave: u8, address: u16, value: u16) -> Result<(), StoreError> {
        let params = self.params(slave);
        self.runtime.block_on(
            self.channel
                .write_single_register(params, Indexed::new(address, value)),
        )?;

        debug!("Wrote value {} to slave {} register {}", value, slave, address);
        Ok(())
    }

    fn write_registers(
        &mut self,
        slave: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), StoreError> {
        let params = self.params(slave);
        let request =
            WriteMultiple::from(address, values.to_vec()).map_err(|_| StoreError::IllegalAddress)?;
        self.runtime
            .block_on(self.channel.write_multiple_registers(params, request))?;

        debug!(
            "Wrote values {:?} to slave {} registers from {}",
            values, slave, address
        );
        Ok(())
    }
}

// ============================================================================
// Simulated backend
// ============================================================================

/// A write observed by the simulated store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub slave: u8,
    pub address: u16,
    pub values: Vec<u16>,
}

#[derive(Debug, Default)]
struct SimulatedBus {
    registers: HashMap<(u8, u16), u16>,
    failures: HashMap<(u8, u16), StoreError>,
    writes: Vec<WriteRecord>,
    reads: usize,
}

impl SimulatedBus {
    fn check(&self, slave: u8, address: u16, count: u16) -> Result<(), StoreError> {
        for offset in 0..count {
            if let Some(err) = self.failures.get(&(slave, address.wrapping_add(offset))) {
                return Err(*err);
            }
        }
        Ok(())
    }
}

/// In-memory register bank
///
/// Clones share the same bank, so a handle kept outside the shared state
/// can inspect writes and inject failures.
#[derive(Debug, Clone, Default)]
pub struct SimulatedStore {
    bus: Arc<Mutex<SimulatedBus>>,
}

impl SimulatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&self, slave: u8, address: u16, value: u16) {
        self.bus.lock().registers.insert((slave, address), value);
    }

    pub fn register(&self, slave: u8, address: u16) -> Option<u16> {
        self.bus.lock().registers.get(&(slave, address)).copied()
    }

    /// Make every operation touching this register fail
    pub fn fail_register(&self, slave: u8, address: u16, err: StoreError) {
        self.bus.lock().failures.insert((slave, address), err);
    }

    pub fn clear_failures(&self) {
        self.bus.lock().failures.clear();
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.bus.lock().writes.clone()
    }

    pub fn read_count(&self) -> usize {
        self.bus.lock().reads
    }
}

impl RegisterStore for SimulatedStore {
    fn read_registers(
        &mut self,
        slave: u8,
        address: u16,
        _kind: RegisterKind,
        count: u16,
    ) -> Result<Vec<u16>, StoreError> {
        let mut bus = self.bus.lock();
        bus.check(slave, address, count)?;
        bus.reads += 1;

        Ok((0..count)
            .map(|offset| {
                bus.registers
                    .get(&(slave, address.wrapping_add(offset)))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    fn write_register(&mut self, slave: u8, address: u16, value: u16) -> Result<(), StoreError> {
        self.write_registers(slave, address, &[value])
    }

    fn write_registers(
        &mut self,
        slave: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), StoreError> {
        let mut bus = self.bus.lock();
        bus.check(slave, address, values.len() as u16)?;

        for (offset, value) in values.iter().enumerate() {
            bus.registers
                .insert((slave, address.wrapping_add(offset as u16)), *value);
        }
        bus.writes.push(WriteRecord {
            slave,
            address,
            values: values.to_vec(),
        });
        Ok(())
    }
}
