//! Programming session against one target.
//!
//! Owns the transport for its whole lifetime and sequences the unlock and
//! reset choreography around the lower layers.

use std::time::{Duration, Instant};

use crate::constants::{cs, keys, opcodes};
use crate::device::{Device, DeviceDb};
use crate::error::{Error, Result};
use crate::link::{AddressWidth, UpdiLink};
use crate::memory::Memory;
use crate::nvm::{NvmDriver, NvmVariant};
use crate::transport::Transport;

/// How long a freshly keyed and reset device may take to unlock.
const PROGMODE_UNLOCK_TIMEOUT: Duration = Duration::from_millis(100);
/// Chip erase wipes the full array first, so the bound is longer.
const CHIP_ERASE_TIMEOUT: Duration = Duration::from_millis(500);
/// Entering and leaving user-row programming mode.
const UROW_MODE_TIMEOUT: Duration = Duration::from_millis(500);

/// The signature row sits here on every supported family.
const SIGROW_PROBE: u32 = 0x1100;

/// Decoded System Information Block.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub family: String,
    pub nvm: String,
    pub ocd: String,
    pub osc: String,
}

impl DeviceInfo {
    fn decode(sib: &[u8]) -> DeviceInfo {
        let field = |range: std::ops::Range<usize>| {
            String::from_utf8_lossy(&sib[range]).trim().to_string()
        };
        DeviceInfo {
            family: field(0..7),
            nvm: field(8..11),
            ocd: field(11..14),
            osc: field(15..19),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LinkInitialized,
    FamilyIdentified,
    Locked,
    Unlocked,
    ProgModeActive,
    Disconnected,
}

pub struct Session<T: Transport> {
    mem: Memory<T>,
    nvm: NvmDriver,
    info: Option<DeviceInfo>,
    device: Option<Device>,
    state: SessionState,
}

impl<T: Transport> Session<T> {
    /// Bring the link up and identify the device family. No memory
    /// operation is possible on a session whose link init failed.
    pub fn connect(transport: T) -> Result<Self> {
        let mut link = UpdiLink::new(transport);
        link.init()?;
        let mut session = Session {
            mem: Memory::new(link),
            nvm: NvmDriver::new(NvmVariant::V0),
            info: None,
            device: None,
            state: SessionState::LinkInitialized,
        };
        session.read_device_info()?;
        Ok(session)
    }

    /// Read and decode the SIB, then rebind the link address width and the
    /// NVM driver to the variant the device reports.
    pub fn read_device_info(&mut self) -> Result<&DeviceInfo> {
        let sib = self.mem.link().read_sib()?;
        let info = DeviceInfo::decode(&sib);
        log::info!(
            "SIB: family {:?}, NVM {:?}, OCD {:?}, OSC {:?}",
            info.family,
            info.nvm,
            info.ocd,
            info.osc
        );

        let (width, variant) = match info.nvm.as_str() {
            "P:0" => (AddressWidth::Bits16, NvmVariant::V0),
            "P:2" => (AddressWidth::Bits24, NvmVariant::V2),
            other => {
                return Err(Error::UnsupportedDevice(format!(
                    "no driver for NVM variant {:?}",
                    other
                )));
            }
        };
        self.mem.link().set_address_width(width);
        self.nvm = NvmDriver::new(variant);
        self.info = Some(info);
        self.state = SessionState::FamilyIdentified;

        if self.is_locked()? {
            log::warn!("Device is locked");
            self.state = SessionState::Locked;
        } else {
            self.state = SessionState::Unlocked;
        }
        Ok(self.info.as_ref().unwrap())
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn memory(&mut self) -> &mut Memory<T> {
        &mut self.mem
    }

    /// Memory, NVM driver and device descriptor for one NVM operation.
    pub fn nvm_parts(&mut self) -> Result<(&mut Memory<T>, &NvmDriver, &Device)> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| Error::UnsupportedDevice("no device selected".into()))?;
        Ok((&mut self.mem, &self.nvm, device))
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// Read the signature row and resolve the part from the database.
    /// Requires programming mode on most parts.
    pub fn detect_device(&mut self) -> Result<&Device> {
        let sig = self.mem.read_data(SIGROW_PROBE, 3)?;
        let device = DeviceDb::find_by_signature([sig[0], sig[1], sig[2]])?;
        log::info!("Detected {}", device);
        self.device = Some(device);
        Ok(self.device.as_ref().unwrap())
    }

    /// Verify the connected device against the part the caller selected.
    /// Must pass before anything destructive happens: flashing the wrong
    /// family bricks boards.
    pub fn verify_device_id(&mut self, expected: Device) -> Result<()> {
        let sig = self.mem.read_data(expected.sigrow_base, 3)?;
        if sig != expected.signature {
            return Err(Error::DeviceIdMismatch {
                expected: format!("{}", expected),
                actual: hex::encode(&sig),
            });
        }
        log::info!("Verified {}", expected);
        self.device = Some(expected);
        Ok(())
    }

    pub fn in_prog_mode(&mut self) -> Result<bool> {
        let status = self.mem.link().ldcs(cs::ASI_SYS_STATUS)?;
        Ok(status & cs::SYS_STATUS_NVMPROG != 0)
    }

    fn is_locked(&mut self) -> Result<bool> {
        let status = self.mem.link().ldcs(cs::ASI_SYS_STATUS)?;
        Ok(status & cs::SYS_STATUS_LOCKSTATUS != 0)
    }

    /// Enter NVM programming mode: key, reset toggle, bounded unlock poll,
    /// prog-mode confirmation. Each failure is distinguishable.
    pub fn enter_progmode(&mut self) -> Result<()> {
        if self.in_prog_mode()? {
            log::debug!("already in programming mode");
            self.state = SessionState::ProgModeActive;
            return Ok(());
        }

        self.mem.link().key(opcodes::KEY_64, keys::NVMPROG)?;
        let key_status = self.mem.link().ldcs(cs::ASI_KEY_STATUS)?;
        if key_status & cs::KEY_STATUS_NVMPROG == 0 {
            return Err(Error::KeyRejected("NVM programming"));
        }

        self.reset(true)?;
        self.reset(false)?;

        if !self.wait_unlocked(PROGMODE_UNLOCK_TIMEOUT)? {
            return Err(Error::DeviceLocked(PROGMODE_UNLOCK_TIMEOUT));
        }
        if !self.in_prog_mode()? {
            return Err(Error::ProgModeNotConfirmed);
        }
        log::info!("Programming mode entered");
        self.state = SessionState::ProgModeActive;
        Ok(())
    }

    /// Reset the device and disable the UPDI interface, releasing any held
    /// keys. The session is done afterwards.
    pub fn leave_progmode(&mut self) -> Result<()> {
        self.reset(true)?;
        self.reset(false)?;
        self.mem.link().stcs(cs::CTRLB, cs::CTRLB_UPDIDIS)?;
        self.state = SessionState::Disconnected;
        log::info!("Programming mode left, device released");
        Ok(())
    }

    /// Unlock a locked device with the chip-erase key. Wipes flash and
    /// EEPROM as a side effect; that is the deal the lock offers.
    pub fn unlock(&mut self) -> Result<()> {
        self.mem.link().key(opcodes::KEY_64, keys::CHIPERASE)?;
        let key_status = self.mem.link().ldcs(cs::ASI_KEY_STATUS)?;
        if key_status & cs::KEY_STATUS_CHIPERASE == 0 {
            return Err(Error::KeyRejected("chip erase"));
        }

        self.reset(true)?;
        self.reset(false)?;

        if !self.wait_unlocked(CHIP_ERASE_TIMEOUT)? {
            return Err(Error::DeviceLocked(CHIP_ERASE_TIMEOUT));
        }
        log::info!("Device unlocked via chip erase");
        self.state = SessionState::Unlocked;
        Ok(())
    }

    /// Write the user row of a locked device through the dedicated key
    /// flow. The data lands in the row buffer while user-row programming
    /// mode is active, then a finalize bit commits it.
    pub fn write_user_row_locked(&mut self, device: &Device, data: &[u8]) -> Result<()> {
        if data.len() > device.userrow_size as usize {
            return Err(Error::SizeLimitExceeded {
                what: "user row data",
                requested: data.len(),
                limit: device.userrow_size as usize,
            });
        }

        self.mem.link().key(opcodes::KEY_64, keys::UROWWRITE)?;
        let key_status = self.mem.link().ldcs(cs::ASI_KEY_STATUS)?;
        if key_status & cs::KEY_STATUS_UROWWRITE == 0 {
            return Err(Error::KeyRejected("user row write"));
        }

        self.reset(true)?;
        self.reset(false)?;
        self.wait_urow_prog(true)?;

        self.mem.write(device.userrow_base, data)?;
        self.mem.link().stcs(
            cs::ASI_SYS_CTRLA,
            cs::SYS_CTRLA_UROW_FINAL | cs::SYS_CTRLA_CLKREQ,
        )?;

        if let Err(e) = self.wait_urow_prog(false) {
            // Do not leave the device stuck in user-row mode.
            self.reset(true)?;
            self.reset(false)?;
            return Err(e);
        }

        self.mem
            .link()
            .stcs(cs::ASI_KEY_STATUS, cs::KEY_STATUS_UROWWRITE)?;
        self.reset(true)?;
        self.reset(false)?;
        log::info!("User row written on locked device");
        Ok(())
    }

    /// Apply or release reset through the ASI reset request register.
    pub fn reset(&mut self, apply: bool) -> Result<()> {
        let value = if apply { cs::RESET_REQ_SIGNATURE } else { 0x00 };
        self.mem.link().stcs(cs::ASI_RESET_REQ, value)
    }

    fn wait_unlocked(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_locked()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    fn wait_urow_prog(&mut self, entering: bool) -> Result<()> {
        let deadline = Instant::now() + UROW_MODE_TIMEOUT;
        loop {
            let status = self.mem.link().ldcs(cs::ASI_SYS_STATUS)?;
            if (status & cs::SYS_STATUS_UROWPROG != 0) == entering {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::UserRowMode(if entering {
                    "never entered"
                } else {
                    "never exited"
                }));
            }
        }
    }

    /// Tear the session down. The graceful leave is attempted but the
    /// transport is handed back regardless of its outcome.
    pub fn disconnect(mut self) -> T {
        if let Err(e) = self.leave_progmode() {
            log::warn!("graceful disconnect failed: {}", e);
        }
        self.mem.into_link().into_transport()
    }
}
