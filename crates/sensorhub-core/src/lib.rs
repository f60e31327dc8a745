//! # sensorhub-core
//!
//! Device-protocol runtime for the sensor hub daemon: a quantity catalogue
//! shared by every device, the XSens MT / u-blox UBX / regex-line-protocol
//! parsers, the transport and port-device command/response engine, the
//! stamped-sample cache, the statistics/acceleration-history processors, and
//! the service loop that ties them together.
//!
//! Grounded throughout in `original_source/` (DamenShipyards `sensor_hub`):
//! the module boundaries here track that codebase's `device.h`/`processor.h`/
//! `loop.h`/`configuration.h` split, re-expressed as Rust traits and a
//! single-threaded `tokio::task::LocalSet` scheduler in place of
//! `boost::asio::spawn` coroutines.

pub mod cache;
pub mod clock;
pub mod config;
pub mod device;
pub mod device_log;
pub mod devices;
pub mod error;
pub mod parser;
pub mod processor;
pub mod processors;
pub mod quantity;
pub mod scale;
pub mod service;
pub mod snapshot;
pub mod transport;

pub use cache::{SampleCache, StampedQuantity, StampedValue};
pub use clock::Clock;
pub use config::ConfigTree;
pub use device::{Device, DeviceCore, DeviceFactoryRegistry, Named, PortDevice};
pub use device_log::DeviceLog;
pub use error::{Error, Result};
pub use processor::{Processor, ProcessorHandle, ProcessorRegistry};
pub use quantity::Quantity;
pub use scale::{BaseScale, Scale};
pub use service::Service;
pub use snapshot::{DeviceSnapshot, ProcessorSnapshot, QuantitySample, SharedState, StateSnapshot};
pub use transport::Transport;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
