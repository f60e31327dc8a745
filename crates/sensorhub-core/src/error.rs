//! Error taxonomy for the device-protocol runtime.

use thiserror::Error;

/// The runtime's error taxonomy. Variants map directly onto the propagation
/// rules they carry: most are logged and contained at a specific boundary
/// (the parser, the device task, the periodic service tick) rather than
/// bubbled to the process.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to open transport: {0}")]
    TransportOpen(String),

    #[error("transport I/O error: {0}")]
    TransportIo(String),

    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("command timed out")]
    CommandTimeout,

    #[error("checksum mismatch: {0}")]
    ChecksumError(String),

    #[error("frame error: {0}")]
    FrameError(String),

    #[error("quantity not available")]
    QuantityNotAvailable,

    #[error("fatal process error: {0}")]
    FatalProcess(String),

    #[error("device log error: {0}")]
    DeviceLog(String),
}

pub type Result<T> = std::result::Result<T, Error>;
