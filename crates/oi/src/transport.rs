//! Byte transport seam for the OI driver.
//!
//! Production uses a blocking serial port (`tokio-serial` native); tests
//! drive the reader with scripted transports. The reader thread is the only
//! owner of a transport, so implementations need `Send` but no locking.

use crate::OiError;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio_serial::SerialPort;

/// Blocking byte link to the robot.
pub trait Transport: Send {
    /// Read whatever is available, waiting at most the transport's internal
    /// timeout. `Ok(0)` means nothing arrived.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write and flush a full command.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Opens a fresh transport; called on connect and on every self-heal
/// reopen.
pub type TransportFactory = Arc<dyn Fn() -> Result<Box<dyn Transport>, OiError> + Send + Sync>;

/// How long a single blocking read may wait. Short enough to keep the
/// command queue responsive while streaming.
const READ_SLICE_TIMEOUT: Duration = Duration::from_millis(50);

/// Serial port transport (8N1, configured baud).
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32) -> Result<Self, OiError> {
        let mut port = tokio_serial::new(path, baud)
            .timeout(READ_SLICE_TIMEOUT)
            .open()
            .map_err(|e| OiError::PortUnavailable(format!("{path}: {e}")))?;
        // Platform-default line state; some adapters hold the robot in
        // reset when these float.
        let _ = port.write_data_terminal_ready(false);
        let _ = port.write_request_to_send(false);
        let _ = port.clear(tokio_serial::ClearBuffer::All);
        Ok(Self { port })
    }

    /// A factory reopening this port, for the driver's self-heal path.
    pub fn factory(path: String, baud: u32) -> TransportFactory {
        Arc::new(move || {
            SerialTransport::open(&path, baud).map(|t| Box::new(t) as Box<dyn Transport>)
        })
    }
}

impl Transport for SerialTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }
}
