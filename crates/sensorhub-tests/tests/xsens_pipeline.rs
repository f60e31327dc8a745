//! Drives an [`sensorhub_core::devices::xsens::XsensMtDevice`] through its
//! full config-mode handshake and one MT_DATA2 frame, using a scripted
//! transport in place of the USB/serial link.

use std::sync::Arc;

use sensorhub_core::clock::Clock;
use sensorhub_core::device::Device;
use sensorhub_core::devices::xsens::XsensMtDevice;
use sensorhub_core::parser::xsens::{build_frame, mid, xdi};
use sensorhub_core::processor::{Processor, ProcessorHandle};
use sensorhub_core::processors::statistics::Statistics;
use sensorhub_core::quantity::Quantity;

use sensorhub_tests::ScriptedTransport;

fn utc_time_data_frame() -> Vec<u8> {
    // nano=343_000_000, 2018-09-10 08:57:56, flags=valid_utc
    let mut payload = Vec::new();
    payload.extend_from_slice(&343_000_000u32.to_be_bytes());
    payload.extend_from_slice(&2018u16.to_be_bytes());
    payload.push(9);
    payload.push(10);
    payload.push(8);
    payload.push(57);
    payload.push(56);
    payload.push(0x04);

    let mut record = Vec::new();
    record.extend_from_slice(&xdi::UTC_TIME.to_be_bytes());
    record.push(payload.len() as u8);
    record.extend_from_slice(&payload);

    build_frame(mid::MT_DATA2, &record)
}

#[tokio::test]
async fn connect_runs_the_full_handshake_before_data_flows() {
    let transport = ScriptedTransport::new(vec![
        build_frame(mid::GOTO_CONFIG_ACK, &[]),
        build_frame(mid::DID, &[0x01, 0x02, 0x03, 0x04]),
        build_frame(mid::PRODUCT_CODE, b"MTi-G-710"),
        build_frame(mid::FIRMWARE_REVISION, &[4, 6, 0, 0, 0, 0, 32, 0, 0, 0, 1]),
        build_frame(mid::SET_OPTION_FLAGS_ACK, &[]),
        build_frame(mid::SET_STRING_OUTPUT_TYPE_ACK, &[]),
        build_frame(mid::SET_OUTPUT_CONFIGURATION_ACK, &[]),
        build_frame(mid::GOTO_MEASUREMENT_ACK, &[]),
        utc_time_data_frame(),
    ]);

    let mut device = XsensMtDevice::new("xsens0", "MTi-G-710", Arc::new(Clock::new()), Box::new(transport), false);
    device.core_mut().add_processor(ProcessorHandle {
        name: "stats0".to_string(),
        processor: Box::new(Statistics::default()),
    });

    device.connect().await.expect("handshake should succeed");
    assert!(device.is_connected());
    assert!(device.core().get_sample(Quantity::ut).is_none());

    device.poll_once().await.expect("poll should decode the data frame");

    let sample = device.core().get_sample(Quantity::ut).expect("utc time sample");
    assert!((sample.value - 1536569876.343).abs() < 1e-3);

    let stats = &device.core().processors()[0];
    assert!(stats.processor.to_json().contains("\"ut\""));
}

#[tokio::test]
async fn a_missing_ack_leaves_the_device_disconnected() {
    let transport = ScriptedTransport::new(vec![build_frame(mid::ERROR, &[])]);
    let mut device = XsensMtDevice::new("xsens0", "MTi-G-710", Arc::new(Clock::new()), Box::new(transport), false);

    device.connect().await.expect("an error response is not itself an I/O error");
    assert!(!device.is_connected());
}
