//! UPDI protocol stack and programming workflow.

pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod link;
pub mod memory;
pub mod nvm;
pub mod session;
pub mod transport;

pub use self::config::ChargeConfig;
pub use self::device::{Device, DeviceDb};
pub use self::error::{Error, Result};
pub use self::flashing::{FlashProgress, Flashing, ProgressPhase};
pub use self::format::Firmware;
pub use self::session::Session;
pub use self::transport::{SerialTransport, Transport};
