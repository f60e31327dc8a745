//! Device abstraction: identity, the per-device sample cache and processor
//! fan-out, the async connect/poll contract, and the command/response engine
//! shared by every port-backed device.
//!
//! Grounded in `original_source/src/device.{h,cpp}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::cache::{SampleCache, StampedQuantity, StampedValue};
use crate::clock::{Clock, DEFAULT_ADJUST_RATE};
use crate::config::ConfigTree;
use crate::device_log::DeviceLog;
use crate::error::{Error, Result};
use crate::processor::ProcessorHandle;
use crate::quantity::Quantity;
use crate::transport::Transport;

/// Identity and enablement shared by every device.
#[derive(Debug, Clone)]
pub struct Named {
    id: String,
    name: String,
    enabled: bool,
}

impl Named {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Named { id: id.into(), name: name.into(), enabled: false }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        if id != self.id {
            info!("setting device id from \"{}\" to \"{}\"", self.id, id);
            self.id = id;
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if name != self.name {
            info!("setting name to \"{name}\"");
            self.name = name;
        }
    }

    pub fn set_enabled(&mut self, value: bool) {
        self.enabled = value;
    }
}

/// State and behavior common to every device, independent of its transport
/// and wire protocol: identity, connection bookkeeping, the sample cache,
/// attached processors, and time-source clock discipline.
pub struct DeviceCore {
    named: Named,
    connected: bool,
    connection_string: String,
    cache: SampleCache,
    processors: Vec<ProcessorHandle>,
    enable_logging: bool,
    device_log: Option<DeviceLog>,
    use_as_time_source: bool,
    clock: Arc<Clock>,
}

impl DeviceCore {
    pub fn new(id: impl Into<String>, name: impl Into<String>, clock: Arc<Clock>) -> Self {
        DeviceCore {
            named: Named::new(id, name),
            connected: false,
            connection_string: String::new(),
            cache: SampleCache::new(),
            processors: Vec::new(),
            enable_logging: false,
            device_log: None,
            use_as_time_source: false,
            clock,
        }
    }

    pub fn named(&self) -> &Named {
        &self.named
    }

    pub fn named_mut(&mut self) -> &mut Named {
        &mut self.named
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn set_connection_string(&mut self, connection_string: impl Into<String>) {
        self.connection_string = connection_string.into();
    }

    pub fn add_processor(&mut self, processor: ProcessorHandle) {
        self.processors.push(processor);
    }

    pub fn processors(&self) -> &[ProcessorHandle] {
        &self.processors
    }

    pub fn enable_logging(&mut self, value: bool) {
        self.enable_logging = value;
        if value {
            info!("logging enabled for {}", self.named.name());
        } else {
            info!("logging disabled for {}", self.named.name());
        }
    }

    /// Open this device's rotating sample-log file under `dir`, named after
    /// its id. No-op, beyond a warning, if opening the file fails; a device
    /// log problem shouldn't stop the device itself from running.
    pub fn open_device_log(&mut self, dir: &std::path::Path, max_size: u64, max_files: u32) {
        match DeviceLog::open(dir, self.named.id(), max_size, max_files) {
            Ok(log) => self.device_log = Some(log),
            Err(e) => warn!("failed to open device log for {}: {e}", self.named.name()),
        }
    }

    /// Register this device as the application's time source. `adjust_rate`
    /// should be [`crate::clock::XSENS_ADJUST_RATE`] for an XSens device (its
    /// high-frequency `ut` samples call for much gentler slewing) and
    /// [`DEFAULT_ADJUST_RATE`] otherwise.
    pub fn use_as_time_source(&mut self, value: bool, adjust_rate: f64) {
        self.use_as_time_source = value;
        if value {
            info!("using {} as time source", self.named.name());
            self.clock.set_adjust_rate(adjust_rate);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        if connected == self.connected {
            warn!("connected state of device was already: {connected}");
        }
        if connected {
            info!("device \"{}\": {} connected", self.named.name(), self.named.id());
        } else {
            info!("device \"{}\": {} disconnected", self.named.name(), self.named.id());
        }
        self.connected = connected;
    }

    pub fn get_value(&self, quantity: Quantity) -> Option<f64> {
        self.cache.get_value(quantity)
    }

    pub fn get_sample(&self, quantity: Quantity) -> Option<StampedValue> {
        self.cache.get_sample(quantity)
    }

    pub fn require_value(&self, quantity: Quantity) -> Result<f64> {
        self.get_value(quantity).ok_or(Error::QuantityNotAvailable)
    }

    pub fn quantities(&self) -> impl Iterator<Item = Quantity> + '_ {
        self.cache.quantities()
    }

    /// Adjust the clock (if registered as time source), cache the value,
    /// fan it out to every attached processor, and write the device log
    /// line if logging is enabled.
    pub fn insert_value(&mut self, value: StampedQuantity) {
        if self.use_as_time_source && value.quantity == Quantity::ut {
            self.clock.adjust_diff(value.value - value.stamp);
        }
        self.cache.insert(value.quantity, value.as_stamped_value());
        for handle in &mut self.processors {
            handle.processor.insert_value(&value);
        }
        if self.enable_logging {
            let line = format!("{:.15},{},{}", value.stamp, value.quantity.name(), value.value);
            debug!(target: "device_log", "{}: {line}", self.named.name());
            if let Some(log) = &mut self.device_log {
                log.write_line(&format!("{line}\n"));
            }
        }
    }
}

/// Async lifecycle contract every sensor device implements. The cooperative
/// scheduler (spec §5) drives these from a single `tokio::task::LocalSet`,
/// so the trait is `?Send`.
#[async_trait(?Send)]
pub trait Device {
    fn core(&self) -> &DeviceCore;
    fn core_mut(&mut self) -> &mut DeviceCore;

    /// Device-specific handshake, run once the transport is open. The
    /// default accepts unconditionally, matching devices with no setup
    /// handshake (e.g. the regex line protocol).
    async fn initialize(&mut self) -> Result<bool> {
        Ok(true)
    }

    async fn reset(&mut self) -> Result<bool> {
        Ok(true)
    }

    /// Run `initialize` and mark the device connected on success.
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            warn!("connecting device {} that is already connected", self.core().named().name());
            return Ok(());
        }
        match self.initialize().await {
            Ok(true) => {
                self.core_mut().set_connected(true);
                Ok(())
            }
            Ok(false) => Err(Error::FatalProcess(format!(
                "failed to initialize device {}",
                self.core().named().name()
            ))),
            Err(e) => Err(e),
        }
    }

    fn disconnect(&mut self) {
        if self.is_connected() {
            self.core_mut().set_connected(false);
        }
    }

    fn is_connected(&self) -> bool {
        self.core().is_connected()
    }

    /// Connection string to use when configuration names `"auto"`.
    fn auto_connection_string(&self) -> String {
        "unimplemented_auto_connection_string".to_string()
    }

    fn connection_string(&self) -> String {
        let cs = self.core().connection_string().to_string();
        if cs == "auto" {
            self.auto_connection_string()
        } else {
            cs
        }
    }

    /// Apply device-type-specific options parsed from its `device{i}.options`
    /// configuration block (e.g. XSens's `flip_axes`, u-blox's `dyn_model`).
    /// The default accepts no options, matching devices with none to set.
    fn set_options(&mut self, _options: &ConfigTree) {}

    /// Read and process one chunk of incoming data. Devices with nothing to
    /// poll (push-only protocols are not modelled in this catalogue) keep
    /// the default no-op.
    async fn poll_once(&mut self) -> Result<()> {
        Ok(())
    }

    /// Slew rate to apply to the shared [`Clock`] when this device is
    /// configured as the application's time source. XSens devices report
    /// `ut` at sensor rate and call for much gentler slewing than the
    /// default.
    fn time_source_adjust_rate(&self) -> f64 {
        DEFAULT_ADJUST_RATE
    }
}

/// First index at which `needle` occurs as a contiguous subsequence of
/// `haystack`, if any.
pub fn contains_at(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A device that communicates over a [`Transport`] using a request/response
/// discipline: write a command, then scan incoming bytes for either an
/// expected-response or an error-response marker.
///
/// Ported from the C++ `Port_device` template's `command`/`query` pair.
pub struct PortDevice<T: Transport> {
    pub transport: T,
}

impl<T: Transport> PortDevice<T> {
    pub fn new(transport: T) -> Self {
        PortDevice { transport }
    }

    pub async fn write(&mut self, command: &[u8]) -> Result<()> {
        self.transport.write_all(command).await
    }

    /// Read up to `len` bytes (default `0x1000` in the original), appending
    /// whatever arrived to `response`.
    pub async fn read_into(&mut self, response: &mut Vec<u8>, len: usize) -> Result<()> {
        let mut buf = vec![0u8; len];
        let n = self.transport.read_some(&mut buf).await?;
        response.extend_from_slice(&buf[..n]);
        Ok(())
    }

    /// Write `command`, then read until `error_response` or `expected_response`
    /// is found in the accumulated response, or `timeout` elapses.
    pub async fn command(
        &mut self,
        command: &[u8],
        expected_response: &[u8],
        error_response: &[u8],
        timeout: Duration,
    ) -> Result<bool> {
        self.write(command).await?;
        let mut response = Vec::new();
        let result = tokio::time::timeout(timeout, async {
            loop {
                self.read_into(&mut response, 0x1000).await?;
                if contains_at(&response, error_response).is_some() {
                    return Ok(false);
                }
                if contains_at(&response, expected_response).is_some() {
                    return Ok(true);
                }
            }
        })
        .await;
        match result {
            Ok(inner) => inner,
            Err(_) => {
                self.transport.cancel();
                Err(Error::CommandTimeout)
            }
        }
    }

    /// Write `command`, then read until `expected_response` is found and at
    /// least `expected_len` bytes follow it (or `expected_len` is derived
    /// from one or two little-endian length bytes at `len_offset_ls`/`_ms`,
    /// relative to the end of `expected_response`).
    #[allow(clippy::too_many_arguments)]
    pub async fn query(
        &mut self,
        command: &[u8],
        expected_response: &[u8],
        error_response: &[u8],
        mut expected_len: usize,
        len_offset_ls: Option<usize>,
        len_offset_ms: Option<usize>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if expected_len == 0 {
            let next_offset = len_offset_ls.max(len_offset_ms).map(|o| o + 1).unwrap_or(0);
            expected_len = expected_response.len() + next_offset;
        }
        let result = tokio::time::timeout(timeout, async {
            let mut data = Vec::new();
            loop {
                self.read_into(&mut data, 0x1000).await?;
                if contains_at(&data, error_response).is_some() {
                    return Err(Error::FrameError("device reported an error response".into()));
                }
                let Some(offset) = contains_at(&data, expected_response) else { continue };
                if offset > 0 {
                    data.drain(0..offset);
                }
                if data.len() >= expected_len {
                    if let Some(ls) = len_offset_ls {
                        let mut extra = *data.get(expected_response.len() + ls).unwrap_or(&0) as usize;
                        if let Some(ms) = len_offset_ms {
                            extra += (*data.get(expected_response.len() + ms).unwrap_or(&0) as usize) << 8;
                        }
                        expected_len += extra;
                    }
                }
                while data.len() < expected_len {
                    let remaining = expected_len - data.len();
                    self.read_into(&mut data, remaining).await?;
                }
                data.truncate(expected_len);
                return Ok(data);
            }
        })
        .await;
        match result {
            Ok(inner) => inner,
            Err(_) => {
                self.transport.cancel();
                Err(Error::CommandTimeout)
            }
        }
    }
}

type DeviceFactory = fn(id: &str, name: &str, clock: Arc<Clock>) -> Box<dyn Device>;

/// Process-wide device factory registry, mirroring
/// [`crate::processor::ProcessorRegistry`]'s shape. Concrete device modules
/// register one factory per `device{i}.type` string; the transport kind is
/// baked into the factory itself, matching the original's one-factory-per-
/// transport-variant convention (`xsens_mti_g_710_usb` vs. `..._serial`).
#[derive(Default)]
pub struct DeviceFactoryRegistry {
    factories: HashMap<&'static str, DeviceFactory>,
}

impl DeviceFactoryRegistry {
    pub fn new() -> Self {
        DeviceFactoryRegistry { factories: HashMap::new() }
    }

    pub fn register(&mut self, name: &'static str, factory: DeviceFactory) {
        self.factories.insert(name, factory);
    }

    pub fn create(&self, type_name: &str, id: &str, name: &str, clock: Arc<Clock>) -> Option<Box<dyn Device>> {
        match self.factories.get(type_name) {
            Some(f) => Some(f(id, name, clock)),
            None => {
                warn!("device with type \"{type_name}\" does not appear to be registered");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_at_finds_subsequence() {
        assert_eq!(contains_at(b"abcdef", b"cd"), Some(2));
        assert_eq!(contains_at(b"abcdef", b"xy"), None);
        assert_eq!(contains_at(b"abcdef", b""), None);
    }

    #[test]
    fn insert_value_adjusts_clock_when_registered_as_time_source() {
        let clock = Arc::new(Clock::new());
        let mut core = DeviceCore::new("id_0", "test", clock.clone());
        core.use_as_time_source(true, DEFAULT_ADJUST_RATE);
        clock.set_adjust_rate(1.0);
        let reported = clock.now() + 100.0;
        core.insert_value(StampedQuantity::new(Quantity::ut, reported, clock.now()));
        assert!(clock.now() >= reported - 1.0);
    }

    #[test]
    fn insert_value_caches_and_fans_out_to_processors() {
        let clock = Arc::new(Clock::new());
        let mut core = DeviceCore::new("id_0", "test", clock);
        core.add_processor(ProcessorHandle {
            name: "statistics".to_string(),
            processor: Box::new(crate::processors::statistics::Statistics::new()),
        });
        core.insert_value(StampedQuantity::new(Quantity::ax, 1.0, 10.0));
        assert_eq!(core.get_value(Quantity::ax), Some(1.0));
        assert!(!core.processors()[0].processor.is_empty());
    }

    #[test]
    fn set_connected_to_same_state_warns_but_still_applies() {
        let clock = Arc::new(Clock::new());
        let mut core = DeviceCore::new("id_0", "test", clock);
        assert!(!core.is_connected());
        core.set_connected(false);
        assert!(!core.is_connected());
        core.set_connected(true);
        assert!(core.is_connected());
    }
}
