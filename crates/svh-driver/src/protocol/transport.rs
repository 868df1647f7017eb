//! Byte transport
//!
//! Minimal contract the driver needs from the physical link, plus the
//! `serialport`-backed implementation used with real hardware.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::io::{self, Read, Write};
use std::time::Duration;

use super::ProtocolError;

/// Abstraction over the byte pipe to the hand.
///
/// The receiver thread reads from one handle while senders write through
/// another, so implementations must support [`try_clone`](Self::try_clone)
/// yielding a handle onto the same underlying link.
pub trait ByteTransport: Send {
    /// Open the link at `path`
    fn open(&mut self, path: &str, baud_rate: u32) -> io::Result<()>;

    /// Check whether the link is open
    fn is_open(&self) -> bool;

    /// Read available bytes, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write bytes, returning how many were accepted
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Close the link. Closing a closed link does nothing.
    fn close(&mut self);

    /// Get a second handle onto the same open link
    fn try_clone(&self) -> io::Result<Box<dyn ByteTransport>>;
}

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// List available serial ports, sorted by name
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}

fn to_io(e: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// Serial port transport
#[derive(Default)]
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Create a closed transport
    pub fn new() -> Self {
        Self { port: None }
    }

    /// Open `path` right away
    pub fn open_port(path: &str, baud_rate: u32) -> Result<Self, ProtocolError> {
        let mut transport = Self::new();
        transport
            .open(path, baud_rate)
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        Ok(transport)
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port not open"))
    }
}

impl ByteTransport for SerialTransport {
    fn open(&mut self, path: &str, baud_rate: u32) -> io::Result<()> {
        // Standard 8N1, no flow control
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(super::DEFAULT_READ_TIMEOUT_MS))
            .open()
            .map_err(to_io)?;
        port.clear(serialport::ClearBuffer::All).map_err(to_io)?;
        self.port = Some(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let port = self.port()?;
        port.set_timeout(timeout).map_err(to_io)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let port = self.port()?;
        let n = port.write(buf)?;
        port.flush()?;
        Ok(n)
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteTransport>> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port not open"))?
            .try_clone()
            .map_err(to_io)?;
        Ok(Box::new(SerialTransport { port: Some(port) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports() {
        // Only ensures enumeration doesn't panic
        for port in list_ports() {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_closed_transport_rejects_io() {
        let mut transport = SerialTransport::new();
        assert!(!transport.is_open());
        assert!(transport.write(&[1, 2, 3]).is_err());
        let mut buf = [0u8; 4];
        assert!(transport.read(&mut buf, Duration::from_millis(1)).is_err());
        assert!(transport.try_clone().is_err());
        transport.close();
    }

    #[test]
    fn test_open_missing_port_fails() {
        assert!(SerialTransport::open_port("/dev/does-not-exist-svh", 921_600).is_err());
    }
}
