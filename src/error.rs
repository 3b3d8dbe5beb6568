//! Error kinds raised by the protocol stack.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No echo or no response arrived within the configured timeout.
    #[error("transport timeout during {0}")]
    TransportTimeout(&'static str),

    /// The expected ACK (or echo) byte was absent or wrong.
    #[error("protocol error during {op}: expected 0x{expected:02x}, got 0x{actual:02x}")]
    ProtocolAck {
        op: &'static str,
        expected: u8,
        actual: u8,
    },

    /// The UPDI status register stayed unreadable after a double-break retry.
    #[error("UPDI link initialization failed (check wiring and target power)")]
    LinkInitFailed,

    /// An activation key was transmitted but the key-status bit never set.
    #[error("{0} key not accepted by the device")]
    KeyRejected(&'static str),

    /// Unlock was acknowledged but the lock status never cleared in time.
    #[error("device stayed locked after {0:?}")]
    DeviceLocked(std::time::Duration),

    /// Programming mode was requested but the status bit never confirmed it.
    #[error("programming mode not confirmed by the device")]
    ProgModeNotConfirmed,

    /// The device on the wire is not the chip the caller selected.
    #[error("device id mismatch: expected {expected}, read {actual}")]
    DeviceIdMismatch { expected: String, actual: String },

    /// The NVM controller latched its write-error status bit.
    #[error("NVM controller error during {0}")]
    NvmError(&'static str),

    /// The NVM controller never reported ready within the bound.
    #[error("NVM controller busy timeout during {0}")]
    NvmBusyTimeout(&'static str),

    /// Post-write read-back differs from what was written.
    #[error("verification failed at 0x{address:06x}: wrote 0x{expected:02x}, read 0x{actual:02x}")]
    VerificationMismatch {
        address: u32,
        expected: u8,
        actual: u8,
    },

    /// A request exceeds a protocol burst limit or the target memory size.
    #[error("{what}: requested {requested}, limit {limit}")]
    SizeLimitExceeded {
        what: &'static str,
        requested: usize,
        limit: usize,
    },

    /// A configuration record field is outside its documented range.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// User-row programming mode did not behave as the key flow demands.
    #[error("user-row programming mode {0}")]
    UserRowMode(&'static str),

    /// The SIB decoded fine but names a family or NVM variant this tool
    /// has no driver for.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// The caller's progress handler requested an early stop.
    #[error("operation aborted")]
    Aborted,

    #[error(transparent)]
    Codec(#[from] scroll::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
