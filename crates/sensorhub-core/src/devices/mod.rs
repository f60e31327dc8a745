//! Concrete devices: each pairs a [`crate::transport::Transport`] with a
//! [`crate::parser::FrameParser`] and a protocol-specific connect handshake.
//!
//! Grounded in `original_source/src/devices/{xsens,ublox,regex}.{h,cpp}` —
//! those files hard-code the transport per device; here the transport is
//! supplied at construction (from configuration) and the handshake is the
//! part that stays protocol-specific.

pub mod regex_line;
pub mod ublox;
pub mod xsens;

use crate::device::DeviceFactoryRegistry;

/// A [`DeviceFactoryRegistry`] with every built-in device type registered,
/// mirroring [`crate::processor::ProcessorRegistry::new`].
pub fn registry() -> DeviceFactoryRegistry {
    let mut registry = DeviceFactoryRegistry::new();
    xsens::register(&mut registry);
    ublox::register(&mut registry);
    regex_line::register(&mut registry);
    registry
}
