//! Transport adapters: one uniform contract over serial, USB-bulk, and TCP.
//!
//! Grounded in spec §4.1. Suspension points are exactly `open`, `read_some`,
//! and `write_all`; `cancel` never suspends. The cooperative scheduler
//! (§5) drives these from a `tokio::task::LocalSet`, so the trait is
//! `?Send` — no device's transport state needs to cross threads.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;

use crate::error::{Error, Result};

/// Uniform transport contract driven by the port device engine.
#[async_trait(?Send)]
pub trait Transport {
    /// Parse a transport-specific connection string and acquire the handle.
    async fn open(&mut self, conn_str: &str) -> Result<()>;

    /// Suspend until at least one byte is available, or the handle is
    /// cancelled (`Err(Error::Cancelled)`).
    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Suspend until all bytes are delivered.
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Abort any in-flight operation on this handle. Non-suspending.
    fn cancel(&mut self);

    /// Release the handle.
    async fn close(&mut self);
}

#[async_trait(?Send)]
impl Transport for Box<dyn Transport> {
    async fn open(&mut self, conn_str: &str) -> Result<()> {
        (**self).open(conn_str).await
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_some(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write_all(buf).await
    }

    fn cancel(&mut self) {
        (**self).cancel()
    }

    async fn close(&mut self) {
        (**self).close().await
    }
}

fn map_io_err(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::Interrupted {
        Error::Cancelled
    } else {
        Error::TransportIo(e.to_string())
    }
}

/// `device[:baud[:bits[:parity[:stop]]]]`, e.g. `/dev/ttyUSB0:115200:8:n:1`.
struct SerialConnStr {
    device: String,
    baud: u32,
    data_bits: tokio_serial::DataBits,
    parity: tokio_serial::Parity,
    stop_bits: tokio_serial::StopBits,
}

fn parse_serial_conn_str(conn_str: &str) -> Result<SerialConnStr> {
    let parts: Vec<&str> = conn_str.split(':').collect();
    if parts.is_empty() || parts[0].is_empty() {
        return Err(Error::Config(format!("invalid serial connection string: {conn_str}")));
    }
    let baud = parts.get(1).map(|s| s.parse::<u32>()).transpose()
        .map_err(|_| Error::Config(format!("invalid baud rate in: {conn_str}")))?
        .unwrap_or(115_200);
    let data_bits = match parts.get(2).copied().unwrap_or("8") {
        "5" => tokio_serial::DataBits::Five,
        "6" => tokio_serial::DataBits::Six,
        "7" => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let parity = match parts.get(3).copied().unwrap_or("n") {
        "o" | "O" => tokio_serial::Parity::Odd,
        "e" | "E" => tokio_serial::Parity::Even,
        _ => tokio_serial::Parity::None,
    };
    let stop_bits = match parts.get(4).copied().unwrap_or("1") {
        "2" => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    Ok(SerialConnStr { device: parts[0].to_string(), baud, data_bits, parity, stop_bits })
}

/// Serial-port transport, backed by `tokio-serial`.
#[derive(Default)]
pub struct SerialTransport {
    port: Option<tokio_serial::SerialStream>,
    cancelled: bool,
}

#[async_trait(?Send)]
impl Transport for SerialTransport {
    async fn open(&mut self, conn_str: &str) -> Result<()> {
        let parsed = parse_serial_conn_str(conn_str)?;
        let port = tokio_serial::new(&parsed.device, parsed.baud)
            .data_bits(parsed.data_bits)
            .parity(parsed.parity)
            .stop_bits(parsed.stop_bits)
            .open_native_async()
            .map_err(|e| Error::TransportOpen(e.to_string()))?;
        self.port = Some(port);
        self.cancelled = false;
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.cancelled {
            self.cancelled = false;
            return Err(Error::Cancelled);
        }
        let port = self.port.as_mut().ok_or_else(|| Error::Disconnected("not open".into()))?;
        let n = port.read(buf).await.map_err(map_io_err)?;
        if n == 0 {
            return Err(Error::Disconnected("serial port closed".into()));
        }
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or_else(|| Error::Disconnected("not open".into()))?;
        port.write_all(buf).await.map_err(map_io_err)
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }

    async fn close(&mut self) {
        self.port = None;
    }
}

/// `host[:port]` TCP transport.
#[derive(Default)]
pub struct TcpTransport {
    stream: Option<tokio::net::TcpStream>,
    cancelled: bool,
}

#[async_trait(?Send)]
impl Transport for TcpTransport {
    async fn open(&mut self, conn_str: &str) -> Result<()> {
        let addr = if conn_str.contains(':') {
            conn_str.to_string()
        } else {
            format!("{conn_str}:80")
        };
        let stream = tokio::net::TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::TransportOpen(e.to_string()))?;
        self.stream = Some(stream);
        self.cancelled = false;
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.cancelled {
            self.cancelled = false;
            return Err(Error::Cancelled);
        }
        let stream = self.stream.as_mut().ok_or_else(|| Error::Disconnected("not open".into()))?;
        let n = stream.read(buf).await.map_err(map_io_err)?;
        if n == 0 {
            return Err(Error::Disconnected("connection closed".into()));
        }
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| Error::Disconnected("not open".into()))?;
        stream.write_all(buf).await.map_err(map_io_err)
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }

    async fn close(&mut self) {
        self.stream = None;
    }
}

/// `VID:PID[,index]` USB-bulk transport, backed by `rusb`.
///
/// `rusb`'s transfer API is synchronous; each suspension point below is a
/// short-timeout blocking call rather than a true async wait. This is the
/// one adapter where the cooperative-scheduler contract is approximated
/// rather than met exactly — acceptable because USB bulk transfers are used
/// only for device command/response exchanges, never the hot polling path.
pub struct UsbBulkTransport {
    handle: Option<rusb::DeviceHandle<rusb::GlobalContext>>,
    read_endpoint: u8,
    write_endpoint: u8,
    cancelled: bool,
}

impl Default for UsbBulkTransport {
    fn default() -> Self {
        UsbBulkTransport { handle: None, read_endpoint: 0x81, write_endpoint: 0x01, cancelled: false }
    }
}

fn parse_usb_conn_str(conn_str: &str) -> Result<(u16, u16, usize)> {
    let (ids, index) = match conn_str.split_once(',') {
        Some((ids, idx)) => (
            ids,
            idx.parse::<usize>()
                .map_err(|_| Error::Config(format!("invalid USB index in: {conn_str}")))?,
        ),
        None => (conn_str, 0),
    };
    let (vid, pid) = ids
        .split_once(':')
        .ok_or_else(|| Error::Config(format!("invalid USB connection string: {conn_str}")))?;
    let vid = u16::from_str_radix(vid.trim_start_matches("0x"), 16)
        .or_else(|_| vid.parse())
        .map_err(|_| Error::Config(format!("invalid VID in: {conn_str}")))?;
    let pid = u16::from_str_radix(pid.trim_start_matches("0x"), 16)
        .or_else(|_| pid.parse())
        .map_err(|_| Error::Config(format!("invalid PID in: {conn_str}")))?;
    Ok((vid, pid, index))
}

#[async_trait(?Send)]
impl Transport for UsbBulkTransport {
    async fn open(&mut self, conn_str: &str) -> Result<()> {
        let (vid, pid, index) = parse_usb_conn_str(conn_str)?;
        let devices = rusb::devices().map_err(|e| Error::TransportOpen(e.to_string()))?;
        let mut matches = devices.iter().filter(|d| {
            d.device_descriptor()
                .map(|desc| desc.vendor_id() == vid && desc.product_id() == pid)
                .unwrap_or(false)
        });
        let device = matches
            .nth(index)
            .ok_or_else(|| Error::TransportOpen(format!("no USB device matching {vid:04x}:{pid:04x}[{index}]")))?;
        let handle = device.open().map_err(|e| Error::TransportOpen(e.to_string()))?;
        let _ = handle.claim_interface(0);
        self.handle = Some(handle);
        self.cancelled = false;
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.cancelled {
            self.cancelled = false;
            return Err(Error::Cancelled);
        }
        let handle = self.handle.as_ref().ok_or_else(|| Error::Disconnected("not open".into()))?;
        match handle.read_bulk(self.read_endpoint, buf, Duration::from_millis(50)) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(rusb::Error::NoDevice) => Err(Error::Disconnected("USB device removed".into())),
            Err(e) => Err(Error::TransportIo(e.to_string())),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let handle = self.handle.as_ref().ok_or_else(|| Error::Disconnected("not open".into()))?;
        handle
            .write_bulk(self.write_endpoint, buf, Duration::from_millis(1000))
            .map_err(|e| Error::TransportIo(e.to_string()))?;
        Ok(())
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }

    async fn close(&mut self) {
        self.handle = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serial_conn_str_with_defaults() {
        let p = parse_serial_conn_str("/dev/ttyUSB0").unwrap();
        assert_eq!(p.device, "/dev/ttyUSB0");
        assert_eq!(p.baud, 115_200);
    }

    #[test]
    fn parses_serial_conn_str_full() {
        let p = parse_serial_conn_str("/dev/ttyUSB0:9600:7:e:2").unwrap();
        assert_eq!(p.baud, 9600);
        assert_eq!(p.data_bits, tokio_serial::DataBits::Seven);
        assert_eq!(p.parity, tokio_serial::Parity::Even);
        assert_eq!(p.stop_bits, tokio_serial::StopBits::Two);
    }

    #[test]
    fn parses_usb_conn_str() {
        let (vid, pid, index) = parse_usb_conn_str("2639:0301").unwrap();
        assert_eq!((vid, pid, index), (0x2639, 0x0301, 0));
        let (vid, pid, index) = parse_usb_conn_str("2639:0301,1").unwrap();
        assert_eq!((vid, pid, index), (0x2639, 0x0301, 1));
    }
}
