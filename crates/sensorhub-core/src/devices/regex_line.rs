//! Regex line-protocol device: no handshake, just a transport feeding a
//! configurable [`RegexParser`].
//!
//! Grounded in `original_source/src/devices/regex.{h,cpp}`, which performs
//! no connect-time negotiation — the device starts polling as soon as the
//! transport opens.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::device::{Device, DeviceCore, DeviceFactoryRegistry};
use crate::error::Result;
use crate::parser::regex_line::{QuantityFilter, RegexParser};
use crate::parser::FrameParser;
use crate::quantity::Quantity;
use crate::transport::{SerialTransport, TcpTransport, Transport};

/// Register this device's serial and TCP-socket factory variants, matching
/// the original's `regex_device_serial`/`..._socket` type-string convention.
pub fn register(registry: &mut DeviceFactoryRegistry) {
    registry.register("regex_device_serial", |id, name, clock| {
        Box::new(RegexLineDevice::new(id, name, clock, Box::new(SerialTransport::default())))
    });
    registry.register("regex_device_socket", |id, name, clock| {
        Box::new(RegexLineDevice::new(id, name, clock, Box::new(TcpTransport::default())))
    });
}

pub struct RegexLineDevice {
    core: DeviceCore,
    transport: Box<dyn Transport>,
    parser: RegexParser,
}

impl RegexLineDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, clock: Arc<Clock>, transport: Box<dyn Transport>) -> Self {
        RegexLineDevice { core: DeviceCore::new(id, name, clock), transport, parser: RegexParser::new() }
    }

    pub fn set_filter(&mut self, quantity: Quantity, filter: QuantityFilter) {
        self.parser.set_filter(quantity, filter);
    }
}

#[async_trait(?Send)]
impl Device for RegexLineDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let conn_str = self.connection_string();
        self.transport.open(&conn_str).await?;
        self.core.set_connected(true);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.is_connected() {
            self.core.set_connected(false);
        }
    }

    async fn poll_once(&mut self) -> Result<()> {
        let mut buf = [0u8; 0x400];
        let n = self.transport.read_some(&mut buf).await?;
        let stamp = self.core.clock().now();
        self.parser.feed(stamp, &buf[..n]);
        for sample in self.parser.drain() {
            self.core.insert_value(sample);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpTransport;

    #[test]
    fn starts_disconnected() {
        let device = RegexLineDevice::new(
            "line0",
            "line protocol device",
            Arc::new(Clock::new()),
            Box::new(TcpTransport::default()),
        );
        assert!(!device.is_connected());
    }
}
