//! Drives a [`sensorhub_core::devices::regex_line::RegexLineDevice`] from a
//! raw line of text through its regex filter, cache, and an attached
//! processor, using a scripted transport in place of a real socket.

use std::sync::Arc;

use regex::Regex;

use sensorhub_core::clock::Clock;
use sensorhub_core::device::Device;
use sensorhub_core::devices::regex_line::RegexLineDevice;
use sensorhub_core::parser::regex_line::QuantityFilter;
use sensorhub_core::processor::{Processor, ProcessorHandle};
use sensorhub_core::processors::statistics::Statistics;
use sensorhub_core::quantity::Quantity;

use sensorhub_tests::ScriptedTransport;

#[tokio::test]
async fn a_line_flows_from_transport_through_cache_into_a_processor() {
    let transport = ScriptedTransport::new(vec![b"1,0,224,69767,18.927,18.984,27.366,0.630\n".to_vec()]);

    let mut device = RegexLineDevice::new("line0", "line protocol device", Arc::new(Clock::new()), Box::new(transport));
    let mut filter = QuantityFilter::new(Regex::new(r"^([0-2]),[0-2]").unwrap());
    filter.multipliers[0] = 3.1415927;
    device.set_filter(Quantity::ax, filter);
    device.core_mut().add_processor(ProcessorHandle {
        name: "stats0".to_string(),
        processor: Box::new(Statistics::default()),
    });

    device.connect().await.expect("regex line device has no handshake");
    assert!(device.is_connected());

    device.poll_once().await.expect("poll should decode the line");

    let sample = device.core().get_sample(Quantity::ax).expect("ax sample");
    assert!((sample.value - 3.1415927).abs() < 1e-7);

    let stats = &device.core().processors()[0];
    assert!(stats.processor.to_json().contains("\"ax\""));
}

#[tokio::test]
async fn an_unmatched_line_leaves_the_cache_empty() {
    let transport = ScriptedTransport::new(vec![b"garbage that matches nothing\n".to_vec()]);
    let mut device = RegexLineDevice::new("line0", "line protocol device", Arc::new(Clock::new()), Box::new(transport));
    let mut filter = QuantityFilter::new(Regex::new(r"^([0-2]),[0-2]").unwrap());
    filter.multipliers[0] = 1.0;
    device.set_filter(Quantity::ax, filter);

    device.connect().await.unwrap();
    device.poll_once().await.expect("an unmatched line is not an error");

    assert!(device.core().get_sample(Quantity::ax).is_none());
}
