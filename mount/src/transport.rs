//! Byte-stream transports for the axis command channel
//!
//! An axis controller sits at the end of a duplex byte stream. The
//! [`SerialTransport`] trait is the only thing the command channel knows
//! about it; real hardware goes through [`SerialPortTransport`] and tests
//! through [`crate::simulator::SimulatedServo`].

use crate::error::{AxisError, AxisResult};
use async_trait::async_trait;
use serialport::SerialPort;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Port name that selects the in-memory servo simulator
pub const SIMULATOR_PORT: &str = "simulator";

/// Duplex byte stream to one or more axis controllers
#[async_trait]
pub trait SerialTransport: Send {
    /// Write a whole frame
    async fn write(&mut self, bytes: &[u8]) -> AxisResult<()>;

    /// Return whatever bytes have arrived, possibly none
    async fn read_available(&mut self) -> AxisResult<Vec<u8>>;

    /// Release the underlying port
    async fn close(&mut self) -> AxisResult<()>;

    /// Port name for logs
    fn name(&self) -> &str;
}

/// A transport shared by every axis wired to the same port. The lock is
/// held for a whole command/response exchange.
pub type SharedTransport = Arc<tokio::sync::Mutex<Box<dyn SerialTransport>>>;

pub fn shared(transport: impl SerialTransport + 'static) -> SharedTransport {
    Arc::new(tokio::sync::Mutex::new(Box::new(transport)))
}

// =============================================================================
// SERIAL PORT
// =============================================================================

/// Hardware serial port via the `serialport` crate
///
/// `serialport` is blocking, so every read and write runs on the blocking
/// thread pool.
pub struct SerialPortTransport {
    name: String,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialPortTransport {
    pub fn open(name: &str, baud_rate: u32) -> AxisResult<Self> {
        let port = serialport::new(name, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()?;
        info!("Opened serial port {} at {} baud", name, baud_rate);
        Ok(Self {
            name: name.to_string(),
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    fn port(&self) -> AxisResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| AxisError::PortError(format!("{} is closed", self.name)))
    }
}

async fn blocking<T, F>(f: F) -> AxisResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AxisResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AxisError::PortError(format!("serial I/O task failed: {}", e)))?
}

#[async_trait]
impl SerialTransport for SerialPortTransport {
    async fn write(&mut self, bytes: &[u8]) -> AxisResult<()> {
        let port = self.port()?;
        let bytes = bytes.to_vec();
        blocking(move || {
            let mut port = port.lock().unwrap_or_else(PoisonError::into_inner);
            port.write_all(&bytes)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn read_available(&mut self) -> AxisResult<Vec<u8>> {
        let port = self.port()?;
        blocking(move || {
            let mut port = port.lock().unwrap_or_else(PoisonError::into_inner);
            let available = port.bytes_to_read()? as usize;
            if available == 0 {
                return Ok(Vec::new());
            }
            let mut buf = vec![0u8; available];
            let read = port.read(&mut buf)?;
            buf.truncate(read);
            Ok(buf)
        })
        .await
    }

    async fn close(&mut self) -> AxisResult<()> {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.name);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// PORT REGISTRY
// =============================================================================

/// Opens each named port once so axes on the same wire share it
#[derive(Default)]
pub struct PortRegistry {
    ports: HashMap<String, SharedTransport>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared transport for `name`, opening it on first use
    pub fn open_serial(&mut self, name: &str, baud_rate: u32) -> AxisResult<SharedTransport> {
        if let Some(existing) = self.ports.get(name) {
            debug!("Reusing serial port {}", name);
            return Ok(existing.clone());
        }
        let transport = shared(SerialPortTransport::open(name, baud_rate)?);
        self.ports.insert(name.to_string(), transport.clone());
        Ok(transport)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_is_port_error() {
        let mut registry = PortRegistry::new();
        let result = registry.open_serial("/dev/starget-does-not-exist", 115_200);
        assert!(matches!(result, Err(AxisError::PortError(_))));
        assert!(registry.is_empty());
    }
}
