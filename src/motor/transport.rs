// Byte-stream link to the serial-to-CAN adapter

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::error::{MotorError, Result};

/// Largest chunk pulled from the port in one receive
const READ_CHUNK: usize = 512;

/// Exclusive handle to the physical link.
///
/// Implementations own the only handle to the link for the whole session;
/// sends and receives are serialized by `&mut self`.
pub trait Transport {
    /// Write one complete frame
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Return whatever bytes arrive within `timeout` (at least one byte)
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Release the link. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Serial port transport for the USB-CAN adapter
pub struct SerialTransport {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Open the adapter's serial port
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|source| MotorError::Connection {
                port: port_name.to_string(),
                baud_rate,
                source,
            })?;

        info!("Connected to {} at {} baud", port_name, baud_rate);
        Ok(Self {
            port_name: port_name.to_string(),
            port: Some(port),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(MotorError::Closed)
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(frame)?;
        port.flush()?;
        debug!("TX {:02X?}", frame);
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let port = self.port()?;
        port.set_timeout(timeout)?;

        let mut buf = vec![0u8; READ_CHUNK];
        let n = match port.read(&mut buf) {
            Ok(0) => return Err(MotorError::Timeout(timeout)),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(MotorError::Timeout(timeout));
            }
            Err(e) => return Err(MotorError::Io(e)),
        };
        buf.truncate(n);

        // Pick up the rest of a burst without waiting again
        let pending = port.bytes_to_read()? as usize;
        if pending > 0 {
            let mut rest = vec![0u8; pending];
            port.read_exact(&mut rest)?;
            buf.extend_from_slice(&rest);
        }

        debug!("RX {} byte(s)", buf.len());
        Ok(buf)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(port) = self.port.take() {
            // Dropping the handle releases the device
            drop(port);
            info!("Closed {}", self.port_name);
        }
        Ok(())
    }
}
