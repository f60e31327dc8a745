//! The service loop: constructs devices and processors from configuration,
//! spawns each device's poll loop on a single-threaded cooperative
//! scheduler, and drives the periodic 10s/60s/5m/1h housekeeping ticks.
//!
//! Grounded in `original_source/src/loop.{h,cpp}`'s `Service` singleton.
//! `boost::asio::io_context` + `spawn` become `tokio::task::LocalSet` +
//! `tokio::task::spawn_local`; the `?Send` [`crate::device::Device`] and
//! [`crate::transport::Transport`] traits rely on that single-threaded
//! confinement.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::LocalSet;

use crate::clock::Clock;
use crate::config::ConfigTree;
use crate::device::Device;
use crate::devices;
use crate::processor::{ProcessorHandle, ProcessorRegistry};
use crate::quantity::Quantity;
use crate::scale::{BaseScale, Scale};
use crate::snapshot::{new_shared_state, DeviceSnapshot, ProcessorSnapshot, QuantitySample, SharedState};

/// A connected or connecting device plus whether configuration enabled it.
struct ManagedDevice {
    name: String,
    enabled: bool,
    device: Rc<RefCell<Box<dyn Device>>>,
}

/// Owns every device and processor the service was configured with, and the
/// shared clock they discipline and are disciplined by.
pub struct Service {
    clock: Arc<Clock>,
    devices: Vec<ManagedDevice>,
    /// `(device index, position in that device's processor list)` for every
    /// attached processor, in `processor{i}` configuration order — the
    /// Modbus processor map's unit id indexes into this list.
    processor_locations: Vec<(usize, usize)>,
    base_scale: BaseScale,
    state: SharedState,
}

impl Service {
    /// Build devices and processors from `cfg`'s `device{i}`/`processor{i}`
    /// blocks, mirroring `Service::setup_devices`/`setup_processors`.
    pub fn from_config(cfg: &mut ConfigTree) -> Self {
        let clock = Arc::new(Clock::new());
        let base_scale = build_base_scale(cfg);
        let mut service = Service {
            clock,
            devices: Vec::new(),
            processor_locations: Vec::new(),
            base_scale,
            state: new_shared_state(),
        };
        service.setup_devices(cfg);
        service.setup_processors(cfg);
        service
    }

    pub fn clock(&self) -> Arc<Clock> {
        self.clock.clone()
    }

    /// Shared handle the HTTP and Modbus views read from. Updated once per
    /// second by [`Service::run`]'s tick loop.
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    fn setup_devices(&mut self, cfg: &mut ConfigTree) {
        let registry = devices::registry();
        let device_count = cfg.int_or("devices.count", 0);
        for i in 0..device_count {
            let section = format!("device{i}");
            let device_type = cfg.string_or(&format!("{section}.type"), "missing_device_type");
            let name = cfg.string_or(&format!("{section}.name"), "missing_device_name");
            let Some(mut device) = registry.create(&device_type, &format!("{section}_id"), &name, self.clock.clone()) else {
                continue;
            };
            device.core_mut().named_mut().set_enabled(cfg.bool_or(&format!("{section}.enabled"), false));
            let connection_string = cfg.string_or(&format!("{section}.connection_string"), "missing_connection_string");
            device.core_mut().set_connection_string(connection_string);
            device.set_options(&cfg.table(&format!("{section}.options")));
            let enable_logging = cfg.bool_or(&format!("{section}.enable_logging"), false);
            device.core_mut().enable_logging(enable_logging);
            if enable_logging {
                let dir = cfg.string_or("logging.device_log_dir", "");
                if !dir.is_empty() {
                    let max_log_size = cfg.int_or(&format!("{section}.max_log_size"), 64 * 1024 * 1024);
                    let max_log_files = cfg.int_or(&format!("{section}.max_log_files"), 32);
                    device.core_mut().open_device_log(
                        std::path::Path::new(&dir),
                        max_log_size.max(1) as u64,
                        max_log_files.max(0) as u32,
                    );
                }
            }
            let use_as_time_source = cfg.bool_or(&format!("{section}.use_as_time_source"), false);
            let adjust_rate = device.time_source_adjust_rate();
            device.core_mut().use_as_time_source(use_as_time_source, adjust_rate);

            let enabled = device.core().named().is_enabled();
            self.devices.push(ManagedDevice { name, enabled, device: Rc::new(RefCell::new(device)) });
        }
    }

    fn setup_processors(&mut self, cfg: &mut ConfigTree) {
        let registry = ProcessorRegistry::new();
        let processor_count = cfg.int_or("processors.count", 0);
        for i in 0..processor_count {
            let section = format!("processor{i}");
            let processor_type = cfg.string_or(&format!("{section}.type"), "missing_processor_type");
            let Some(mut processor) = registry.create(&processor_type) else {
                warn!("processor type \"{processor_type}\" does not appear to be registered");
                continue;
            };
            let name = cfg.string_or(&format!("{section}.name"), "missing_processor_name");
            processor.set_params(&cfg.string_or(&format!("{section}.parameters"), ""));
            processor.set_filter(&cfg.string_or(&format!("{section}.filter"), ""));
            let device_names = cfg.string_or(&format!("{section}.device"), "missing_processor_device");

            let mut attached = false;
            for target in device_names.split(',') {
                let target = target.trim();
                if let Some(device_idx) = self.devices.iter().position(|d| d.name == target) {
                    let managed = &self.devices[device_idx];
                    let position = managed.device.borrow().core().processors().len();
                    managed.device.borrow_mut().core_mut().add_processor(ProcessorHandle {
                        name: name.clone(),
                        processor: std::mem::replace(&mut processor, Box::new(NullProcessor)),
                    });
                    self.processor_locations.push((device_idx, position));
                    attached = true;
                    break;
                }
            }
            if !attached {
                warn!("processor \"{name}\" was not added to any device");
            }
        }
    }

    /// Copy the live device/processor state into [`Service::state`] for the
    /// HTTP and Modbus views to read. Called once per tick from [`Service::run`].
    fn publish_snapshot(&self) {
        let mut devices = Vec::with_capacity(self.devices.len());
        for managed in &self.devices {
            let device = managed.device.borrow();
            let core = device.core();
            let mut data = BTreeMap::new();
            let mut time = 0.0_f64;
            for quantity in core.quantities() {
                if let Some(sample) = core.get_sample(quantity) {
                    time = time.max(sample.stamp);
                    data.insert(quantity.name().to_string(), QuantitySample { time: sample.stamp, value: sample.value });
                }
            }
            devices.push(DeviceSnapshot {
                id: core.named().id().to_string(),
                name: core.named().name().to_string(),
                connected: core.is_connected(),
                time,
                data,
            });
        }

        let mut processors = Vec::with_capacity(self.processor_locations.len());
        for &(device_idx, position) in &self.processor_locations {
            let device = self.devices[device_idx].device.borrow();
            let handle = &device.core().processors()[position];
            let registers = (0..handle.processor.len())
                .map(|i| handle.processor.modbus_register(i, &self.base_scale))
                .collect();
            processors.push(ProcessorSnapshot {
                name: handle.name.clone(),
                json: handle.processor.to_json(),
                registers,
            });
        }

        let mut state = self.state.lock().unwrap();
        state.devices = devices;
        state.processors = processors;
    }

    /// Attempt to connect every enabled, not-yet-connected device.
    async fn connect_devices(&self) {
        for managed in &self.devices {
            let (enabled, connected) = {
                let device = managed.device.borrow();
                (managed.enabled, device.is_connected())
            };
            if enabled && !connected {
                let result = managed.device.borrow_mut().connect().await;
                if let Err(e) = result {
                    warn!("failed to connect device \"{}\": {e}", managed.name);
                }
            }
        }
    }

    /// Spawn one polling task per device onto `local`, looping `poll_once`
    /// while the device reports connected. A device that disconnects
    /// (transport error) is picked back up by the next `connect_devices` tick.
    fn spawn_pollers(&self, local: &LocalSet) {
        for managed in &self.devices {
            let device = managed.device.clone();
            let name = managed.name.clone();
            local.spawn_local(async move {
                loop {
                    let connected = device.borrow().is_connected();
                    if !connected {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        continue;
                    }
                    let result = device.borrow_mut().poll_once().await;
                    if let Err(e) = result {
                        warn!("device \"{name}\" poll failed: {e}");
                        device.borrow_mut().disconnect();
                    }
                }
            });
        }
    }

    /// Drive the 1s/10s/60s/5m/1h periodic housekeeping ticks, mirroring
    /// `one_second_service` and its cascade. Runs until the process
    /// receives SIGINT/SIGTERM.
    async fn run_ticks(&self) {
        let mut counter: u64 = 0;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            counter += 1;
            self.publish_snapshot();
            if counter % 10 == 0 {
                // ten_seconds_service: no periodic work in the original either.
            }
            if counter % 60 == 0 {
                self.connect_devices().await;
            }
            if counter % 300 == 0 {
                debug!("uptime: {} minutes", counter / 60);
            }
            if counter % 3600 == 0 {
                info!("uptime: {} hours", counter / 3600);
            }
        }
    }

    /// Enter the service main loop: connect every enabled device once, spawn
    /// its poll task, then run housekeeping until interrupted.
    pub async fn run(&self) {
        let local = LocalSet::new();
        self.connect_devices().await;
        self.spawn_pollers(&local);
        local
            .run_until(async {
                tokio::select! {
                    _ = self.run_ticks() => {}
                    _ = wait_for_shutdown_signal() => {
                        info!("received shutdown signal");
                    }
                }
            })
            .await;
        self.close_devices();
    }

    fn close_devices(&self) {
        for managed in &self.devices {
            managed.device.borrow_mut().disconnect();
        }
    }
}

struct NullProcessor;
impl crate::processor::Processor for NullProcessor {}

/// Build the Modbus base-map scaler from `modbus.{quantity}_min`/`_max`/
/// `_multiplier`/`_offset`/`_overflow`/`_signed` configuration keys, falling
/// back to each quantity's catalogue bounds.
fn build_base_scale(cfg: &mut ConfigTree) -> BaseScale {
    let mut scaler = BaseScale::with_defaults();
    for quantity in Quantity::ALL {
        let (default_min, default_max) = quantity.default_bounds();
        let prefix = format!("modbus.{}", quantity.name());
        let scale = Scale {
            min: cfg.float_or(&format!("{prefix}_min"), default_min),
            max: cfg.float_or(&format!("{prefix}_max"), default_max),
            multiplier: cfg.float_or(&format!("{prefix}_multiplier"), 0.0),
            offset: cfg.float_or(&format!("{prefix}_offset"), 0.0),
            overflow: cfg.bool_or(&format!("{prefix}_overflow"), false),
            signed_type: cfg.bool_or(&format!("{prefix}_signed"), false),
        };
        scaler.set(*quantity, scale);
    }
    scaler
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_one_device_and_processor() -> ConfigTree {
        ConfigTree::parse(
            r#"
            [devices]
            count = 1
            [device0]
            type = "regex_device_socket"
            name = "line0"
            enabled = false

            [processors]
            count = 1
            [processor0]
            type = "statistics"
            name = "stats0"
            device = "line0"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn setup_attaches_processor_and_tracks_its_location() {
        let mut cfg = config_with_one_device_and_processor();
        let service = Service::from_config(&mut cfg);
        assert_eq!(service.devices.len(), 1);
        assert_eq!(service.processor_locations, vec![(0, 0)]);
    }

    #[test]
    fn publish_snapshot_reflects_connection_state() {
        let mut cfg = config_with_one_device_and_processor();
        let service = Service::from_config(&mut cfg);
        service.publish_snapshot();
        let state = service.state.lock().unwrap();
        assert_eq!(state.devices.len(), 1);
        assert!(!state.devices[0].connected);
        assert_eq!(state.processors.len(), 1);
        assert_eq!(state.processors[0].name, "stats0");
    }

    #[test]
    fn unmatched_processor_device_is_not_attached() {
        let mut cfg = ConfigTree::parse(
            r#"
            [processors]
            count = 1
            [processor0]
            type = "statistics"
            name = "stats0"
            device = "nonexistent"
            "#,
        )
        .unwrap();
        let service = Service::from_config(&mut cfg);
        assert!(service.processor_locations.is_empty());
    }

    #[test]
    fn build_base_scale_falls_back_to_catalogue_bounds() {
        let mut cfg = ConfigTree::new();
        let scaler = build_base_scale(&mut cfg);
        let v: u16 = scaler.scale_to(Quantity::la, 0.0);
        assert_eq!(v, 0x8000);
    }
}
