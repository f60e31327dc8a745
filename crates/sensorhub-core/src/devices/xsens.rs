//! XSens MT device: queries identity, applies output configuration and
//! filtering, and cycles config/measurement mode before polling begins.
//!
//! Grounded in `original_source/src/devices/xsens.h`'s `Xsens::initialize`.
//! `request_identifier` sets the device's identity from the returned
//! serial bytes, so it (and the product-code/firmware-revision queries run
//! alongside it) are wired up here rather than skipped; `set_option_flags`
//! and `set_string_output_type` are real device-configuration commands,
//! not logging.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info};

use crate::clock::{Clock, XSENS_ADJUST_RATE};
use crate::config::ConfigTree;
use crate::device::{Device, DeviceCore, DeviceFactoryRegistry, PortDevice};
use crate::error::Result;
use crate::parser::xsens::{build_frame, mid, option_flags_payload, string_output_type_payload, XsensParser};
use crate::parser::FrameParser;
use crate::transport::{SerialTransport, Transport, UsbBulkTransport};

const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Every config-mode command waits this long first, matching the real
/// device's settling time between commands.
const COMMAND_PACE: Duration = Duration::from_millis(50);

/// Register this device's USB and serial factory variants, matching the
/// original's `xsens_mti_g_710_usb`/`..._serial` type-string convention.
pub fn register(registry: &mut DeviceFactoryRegistry) {
    registry.register("xsens_mti_g_710_usb", |id, name, clock| {
        Box::new(XsensMtDevice::new(id, name, clock, Box::new(UsbBulkTransport::default()), false))
    });
    registry.register("xsens_mti_g_710_serial", |id, name, clock| {
        Box::new(XsensMtDevice::new(id, name, clock, Box::new(SerialTransport::default()), false))
    });
}

pub struct XsensMtDevice {
    core: DeviceCore,
    port: PortDevice<Box<dyn Transport>>,
    parser: XsensParser,
    filter_profile: u8,
}

impl XsensMtDevice {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        clock: Arc<Clock>,
        transport: Box<dyn Transport>,
        flip_axes: bool,
    ) -> Self {
        XsensMtDevice {
            core: DeviceCore::new(id, name, clock),
            port: PortDevice::new(transport),
            parser: XsensParser::new(flip_axes),
            filter_profile: 0,
        }
    }

    async fn pace(&self) {
        tokio::time::sleep(COMMAND_PACE).await;
    }

    async fn goto_config(&mut self) -> Result<bool> {
        self.pace().await;
        info!("xsens gotoconfig");
        let cmd = build_frame(mid::GOTO_CONFIG, &[]);
        let ack = build_frame(mid::GOTO_CONFIG_ACK, &[]);
        let err = build_frame(mid::ERROR, &[]);
        self.port.command(&cmd, &ack, &err, COMMAND_TIMEOUT).await
    }

    /// `ReqDid`: sets the device id from the returned serial bytes.
    async fn request_identifier(&mut self) -> Result<bool> {
        self.pace().await;
        info!("xsens requesting device id");
        let cmd = build_frame(mid::REQ_DID, &[]);
        let header = build_frame(mid::DID, &[])[..3].to_vec();
        let err = build_frame(mid::ERROR, &[]);
        let response =
            self.port.query(&cmd, &header, &err, 0, Some(0), None, COMMAND_TIMEOUT).await?;
        let size = response[3] as usize;
        if response.len() >= 4 + size {
            let serial_no: String =
                response[4..4 + size].iter().map(|b| format!("{b:02X}")).collect();
            info!("xsens device serial#: {serial_no}");
            self.core.named_mut().set_id(format!("xsens_{serial_no}"));
        }
        Ok(true)
    }

    /// `ReqProductCode`: logging only.
    async fn request_product_code(&mut self) -> Result<bool> {
        self.pace().await;
        info!("xsens requesting product code");
        let cmd = build_frame(mid::REQ_PRODUCT_CODE, &[]);
        let header = build_frame(mid::PRODUCT_CODE, &[])[..3].to_vec();
        let err = build_frame(mid::ERROR, &[]);
        let response =
            self.port.query(&cmd, &header, &err, 0, Some(0), None, COMMAND_TIMEOUT).await?;
        let size = response[3] as usize;
        if response.len() >= 4 + size {
            let product_code = String::from_utf8_lossy(&response[4..4 + size]);
            info!("xsens product code: {product_code}");
        }
        Ok(true)
    }

    /// `ReqFirmwareRevision`: logging only.
    async fn request_firmware(&mut self) -> Result<bool> {
        self.pace().await;
        info!("xsens requesting firmware revision");
        let cmd = build_frame(mid::REQ_FIRMWARE_REVISION, &[]);
        let header = build_frame(mid::FIRMWARE_REVISION, &[])[..3].to_vec();
        let err = build_frame(mid::ERROR, &[]);
        let response =
            self.port.query(&cmd, &header, &err, 0, Some(0), None, COMMAND_TIMEOUT).await?;
        if response.len() >= 15 {
            let (major, minor, revision) = (response[4], response[5], response[6]);
            let build = u32::from_be_bytes([response[7], response[8], response[9], response[10]]);
            let svn = u32::from_be_bytes([response[11], response[12], response[13], response[14]]);
            info!("xsens firmware version {major}.{minor}.{revision}, build {build}, svn {svn}");
        }
        Ok(true)
    }

    async fn set_option_flags(&mut self) -> Result<bool> {
        self.pace().await;
        info!("xsens set option flags");
        let cmd = build_frame(mid::SET_OPTION_FLAGS, &option_flags_payload());
        let ack_head = &build_frame(mid::SET_OPTION_FLAGS_ACK, &[])[..3];
        let err = build_frame(mid::ERROR, &[]);
        self.port.command(&cmd, ack_head, &err, COMMAND_TIMEOUT).await
    }

    async fn set_string_output_type(&mut self) -> Result<bool> {
        self.pace().await;
        info!("xsens set string output type");
        let cmd = build_frame(mid::SET_STRING_OUTPUT_TYPE, &string_output_type_payload());
        let ack_head = &build_frame(mid::SET_STRING_OUTPUT_TYPE_ACK, &[])[..3];
        let err = build_frame(mid::ERROR, &[]);
        self.port.command(&cmd, ack_head, &err, COMMAND_TIMEOUT).await
    }

    /// `SetFilterProfile`: skipped when `filter_profile` is left at its
    /// default of 0, matching the original leaving the onboard filter
    /// untouched.
    async fn set_filter_profile(&mut self) -> Result<bool> {
        if self.filter_profile == 0 {
            return Ok(true);
        }
        self.pace().await;
        info!("xsens set filter profile {}", self.filter_profile);
        let cmd = build_frame(mid::SET_FILTER_PROFILE, &[0x00, self.filter_profile]);
        let ack_head = &build_frame(mid::SET_FILTER_PROFILE_ACK, &[])[..3];
        let err = build_frame(mid::ERROR, &[]);
        self.port.command(&cmd, ack_head, &err, COMMAND_TIMEOUT).await
    }

    async fn set_output_configuration(&mut self, payload: &[u8]) -> Result<bool> {
        self.pace().await;
        info!("xsens set output configuration");
        let cmd = build_frame(mid::SET_OUTPUT_CONFIGURATION, payload);
        // The ack's payload content isn't checked, only its header.
        let ack_head = &build_frame(mid::SET_OUTPUT_CONFIGURATION_ACK, &[])[..4];
        let err = build_frame(mid::ERROR, &[]);
        self.port.command(&cmd, ack_head, &err, COMMAND_TIMEOUT).await
    }

    async fn goto_measurement(&mut self) -> Result<bool> {
        self.pace().await;
        info!("xsens gotomeasurement");
        let cmd = build_frame(mid::GOTO_MEASUREMENT, &[]);
        let ack = build_frame(mid::GOTO_MEASUREMENT_ACK, &[]);
        let err = build_frame(mid::ERROR, &[]);
        self.port.command(&cmd, &ack, &err, COMMAND_TIMEOUT).await
    }
}

#[async_trait(?Send)]
impl Device for XsensMtDevice {
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
        self.port.transport.open(&conn_str).await?;
        match self.initialize().await {
            Ok(true) => {
                self.core.set_connected(true);
                Ok(())
            }
            Ok(false) => {
                error!("failed to initialize xsens device {}", self.core.named().name());
                self.port.transport.close().await;
                Ok(())
            }
            Err(e) => {
                self.port.transport.close().await;
                Err(e)
            }
        }
    }

    async fn initialize(&mut self) -> Result<bool> {
        if !self.goto_config().await? {
            return Ok(false);
        }
        if !(self.request_identifier().await?
            && self.request_product_code().await?
            && self.request_firmware().await?
            && self.set_option_flags().await?
            && self.set_string_output_type().await?
            && self.set_filter_profile().await?)
        {
            return Ok(false);
        }
        // One XDI group per axis-vector quantity set this device reports;
        // the MT_DATA2 payload itself interleaves whatever DIDs are listed
        // here at the configured output rate.
        let output_configuration: Vec<u8> = [
            crate::parser::xsens::xdi::UTC_TIME,
            crate::parser::xsens::xdi::ACCELERATION,
            crate::parser::xsens::xdi::RATE_OF_TURN,
            crate::parser::xsens::xdi::MAGNETIC_FIELD,
            crate::parser::xsens::xdi::EULER_ANGLES,
        ]
        .iter()
        .flat_map(|did| {
            let mut entry = did.to_be_bytes().to_vec();
            entry.extend_from_slice(&100u16.to_be_bytes()); // 100 Hz output rate
            entry
        })
        .collect();
        if !self.set_output_configuration(&output_configuration).await? {
            return Ok(false);
        }
        self.goto_measurement().await
    }

    fn set_options(&mut self, options: &ConfigTree) {
        let mut options = options.clone();
        let flip_axes = options.bool_or("flip_axes", false);
        self.parser.set_flip_axes(flip_axes);
        self.filter_profile = options.int_or("filter_profile", 0).clamp(0, 255) as u8;
    }

    fn auto_connection_string(&self) -> String {
        "2639:0301".to_string()
    }

    async fn poll_once(&mut self) -> Result<()> {
        let mut buf = [0u8; 0x200];
        let n = self.port.transport.read_some(&mut buf).await?;
        let stamp = self.core.clock().now();
        self.parser.feed(stamp, &buf[..n]);
        for sample in self.parser.drain() {
            self.core.insert_value(sample);
        }
        Ok(())
    }

    fn time_source_adjust_rate(&self) -> f64 {
        XSENS_ADJUST_RATE
    }
}
