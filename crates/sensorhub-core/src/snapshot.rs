//! `Send`-safe snapshots of device and processor state, published by the
//! service loop for the HTTP and Modbus views to read.
//!
//! `Device` and `Transport` are `?Send` (spec §4.1/§5: the cooperative
//! scheduler confines them to one thread), but the external interfaces in
//! spec.md §6 are plain read-only views that can run on their own runtime.
//! Rather than reach across that boundary, the service publishes owned,
//! thread-safe copies of what those views need once per tick.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// The most recent `(time, value)` pair for one quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantitySample {
    pub time: f64,
    pub value: f64,
}

/// Everything the HTTP `/devices/*` view and the Modbus base/plain maps need
/// from one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub connected: bool,
    /// Timestamp of the most recently inserted sample across all quantities.
    pub time: f64,
    pub data: BTreeMap<String, QuantitySample>,
}

/// Everything the HTTP `/processors/*` view and the Modbus processor map
/// need from one processor. `registers` is precomputed once per tick because
/// the live processor object lives inside the `?Send` device tree and can't
/// be reached from the Modbus server's own executor.
#[derive(Debug, Clone, Default)]
pub struct ProcessorSnapshot {
    pub name: String,
    pub json: String,
    pub registers: Vec<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub devices: Vec<DeviceSnapshot>,
    pub processors: Vec<ProcessorSnapshot>,
}

/// Shared handle the service publishes into and the HTTP/Modbus servers
/// read from. Cheaply cloneable; every clone sees the latest publish.
pub type SharedState = Arc<Mutex<StateSnapshot>>;

pub fn new_shared_state() -> SharedState {
    Arc::new(Mutex::new(StateSnapshot::default()))
}
