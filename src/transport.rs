//! Serial access to the programmer.
//!
//! The driver talks through the [`Link`] trait so the protocol code can be
//! exercised against a scripted device in tests. The real implementation,
//! [`SerialLink`], owns a serial port opened at the fixed 19200 8N1 settings
//! every supported programmer model uses.

use std::fmt::{self, Debug};
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{Error, Result};

const BAUD_RATE: u32 = 19_200;

/// Underlying port timeout. Higher layers poll in a loop against their own
/// deadlines instead of re-configuring this, because changing port settings
/// on the fly toggles DTR on some host stacks and that resets the
/// programmer.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// A byte pipe with DTR control.
pub trait Link {
    /// Writes the whole buffer to the device.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Reads whatever is available into `buf` and returns the byte count.
    /// Returns 0 when nothing arrived within one poll interval.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Discards any unread input from the device.
    fn flush_input(&mut self) -> Result<()>;

    /// Gives the device time to act on a DTR edge.
    fn settle(&mut self) {
        thread::sleep(Duration::from_millis(100));
    }
}

/// [`Link`] over a real serial port.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Opens `path` at 19200 8N1 with no flow control.
    pub fn open(path: &str) -> Result<SerialLink> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(|err| {
                Error::Connection(format!("unable to open serial port \"{}\": {}", path, err))
            })?;
        Ok(SerialLink { port })
    }
}

impl Link for SerialLink {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(count) => Ok(count),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.port
            .write_data_terminal_ready(level)
            .map_err(|err| Error::Connection(format!("cannot set DTR: {}", err)))
    }

    fn flush_input(&mut self) -> Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|err| Error::Connection(format!("cannot flush input: {}", err)))
    }
}

impl Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLink")
            .field("port", &self.port.name())
            .finish()
    }
}
