//! Device programming workflow.

use crate::config::{CONFIG_EEPROM_OFFSET, CONFIG_SIZE, ChargeConfig};
use crate::error::{Error, Result};
use crate::format::Firmware;
use crate::session::Session;
use crate::transport::Transport;

/// Fill byte for the tail of a partial page; matches flash erase state.
const PAGE_FILL: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Erase,
    Write,
    Verify,
}

/// Progress reporting for the long-running phases.
///
/// The handler sees the phase and completed/total page counts and may
/// return `false` to stop the run between page operations; a page that has
/// been started is always finished.
pub struct FlashProgress {
    handler: Box<dyn Fn(ProgressPhase, usize, usize) -> bool>,
}

impl FlashProgress {
    pub fn new(handler: impl Fn(ProgressPhase, usize, usize) -> bool + 'static) -> Self {
        FlashProgress {
            handler: Box::new(handler),
        }
    }

    pub fn silent() -> Self {
        FlashProgress::new(|_, _, _| true)
    }

    fn step(&self, phase: ProgressPhase, done: usize, total: usize) -> Result<()> {
        if (self.handler)(phase, done, total) {
            Ok(())
        } else {
            Err(Error::Aborted)
        }
    }
}

pub struct Flashing<T: Transport> {
    session: Session<T>,
}

impl<T: Transport> Flashing<T> {
    /// Wrap a session whose device identity has been established.
    pub fn new(session: Session<T>) -> Self {
        Flashing { session }
    }

    pub fn session(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    pub fn into_session(self) -> Session<T> {
        self.session
    }

    pub fn dump_info(&mut self) -> Result<()> {
        if let Some(info) = self.session.device_info() {
            log::info!(
                "Target: {} family, NVM {}, OCD {}, OSC {}",
                info.family,
                info.nvm,
                info.ocd,
                info.osc
            );
        }
        if let Some(device) = self.session.device() {
            log::info!(
                "Chip: {} (Flash: {}KiB/page {}B, EEPROM: {}B, user row: {}B)",
                device,
                device.flash_size / 1024,
                device.flash_page_size,
                device.eeprom_size,
                device.userrow_size
            );
        }
        Ok(())
    }

    /// Erase flash and EEPROM of an unlocked device through the NVM
    /// controller.
    pub fn erase_chip(&mut self) -> Result<()> {
        self.require_progmode()?;
        let (mem, nvm, device) = self.session.nvm_parts()?;
        nvm.chip_erase(mem, device)?;
        log::info!("Chip erased");
        Ok(())
    }

    /// Program a firmware image: size check, whole-flash page erase, page
    /// writes, then a full read-back verify.
    pub fn program(&mut self, firmware: &Firmware, progress: &FlashProgress) -> Result<()> {
        self.require_progmode()?;
        let (mem, nvm, device) = self.session.nvm_parts()?;
        let page_size = device.flash_page_size as usize;

        let (offset, data) = page_partition(firmware, page_size);
        let flash_size = device.flash_size as usize;
        if offset + data.len() > flash_size {
            return Err(Error::SizeLimitExceeded {
                what: "firmware image",
                requested: firmware.base_address as usize + firmware.data.len(),
                limit: flash_size,
            });
        }

        // There is no whole-chip erase reachable outside the locked-erase
        // key flow, so every page is erased individually, across the full
        // flash region rather than just the image's span.
        let flash_pages = flash_size / page_size;
        for index in 0..flash_pages {
            let address = device.flash_base + (index * page_size) as u32;
            nvm.erase_flash_page(mem, device, address)?;
            progress.step(ProgressPhase::Erase, index + 1, flash_pages)?;
        }

        let image_pages = data.len() / page_size;
        for (index, chunk) in data.chunks(page_size).enumerate() {
            let address = device.flash_base + offset as u32 + (index * page_size) as u32;
            nvm.write_flash(mem, device, address, chunk)?;
            progress.step(ProgressPhase::Write, index + 1, image_pages)?;
        }
        log::info!("Wrote {} pages ({} bytes)", image_pages, data.len());

        self.verify_raw(offset, &data, progress)
    }

    /// Compare flash content against an image without writing anything.
    pub fn verify(&mut self, firmware: &Firmware, progress: &FlashProgress) -> Result<()> {
        self.require_progmode()?;
        let page_size = {
            let (_, _, device) = self.session.nvm_parts()?;
            device.flash_page_size as usize
        };
        let (offset, data) = page_partition(firmware, page_size);
        self.verify_raw(offset, &data, progress)
    }

    fn verify_raw(&mut self, offset: usize, data: &[u8], progress: &FlashProgress) -> Result<()> {
        let (mem, _, device) = self.session.nvm_parts()?;
        let page_size = device.flash_page_size as usize;
        let total = data.len().div_ceil(page_size);

        for (index, chunk) in data.chunks(page_size).enumerate() {
            let address = device.flash_base + offset as u32 + (index * page_size) as u32;
            let read = mem.read(address, chunk.len())?;
            for (i, (&expected, &actual)) in chunk.iter().zip(&read).enumerate() {
                if expected != actual {
                    return Err(Error::VerificationMismatch {
                        address: address + i as u32,
                        expected,
                        actual,
                    });
                }
            }
            progress.step(ProgressPhase::Verify, index + 1, total)?;
        }
        log::info!("Verified {} bytes", data.len());
        Ok(())
    }

    /// Read the configuration record from EEPROM. `None` means the area is
    /// blank or carries something that is not a valid record; the caller
    /// decides whether defaults get written back.
    pub fn read_config(&mut self) -> Result<Option<ChargeConfig>> {
        self.require_progmode()?;
        let (mem, _, device) = self.session.nvm_parts()?;
        let raw = mem.read(device.eeprom_base + CONFIG_EEPROM_OFFSET, CONFIG_SIZE)?;
        ChargeConfig::decode(&raw)
    }

    /// Validate, write and read back the configuration record.
    pub fn write_config(&mut self, config: &ChargeConfig) -> Result<()> {
        config.validate()?;
        self.require_progmode()?;
        let encoded = config.encode();
        let (mem, nvm, device) = self.session.nvm_parts()?;
        let address = device.eeprom_base + CONFIG_EEPROM_OFFSET;
        nvm.write_eeprom(mem, device, address, &encoded)?;

        let read = mem.read(address, CONFIG_SIZE)?;
        for (i, (&expected, &actual)) in encoded.iter().zip(&read).enumerate() {
            if expected != actual {
                return Err(Error::VerificationMismatch {
                    address: address + i as u32,
                    expected,
                    actual,
                });
            }
        }
        log::info!("Configuration written");
        Ok(())
    }

    /// Write the user row of an unlocked device. Locked parts go through
    /// [`Session::write_user_row_locked`] instead.
    pub fn write_user_row(&mut self, data: &[u8]) -> Result<()> {
        self.require_progmode()?;
        let (mem, nvm, device) = self.session.nvm_parts()?;
        if data.len() > device.userrow_size as usize {
            return Err(Error::SizeLimitExceeded {
                what: "user row data",
                requested: data.len(),
                limit: device.userrow_size as usize,
            });
        }
        nvm.write_user_row(mem, device, device.userrow_base, data)
    }

    fn require_progmode(&mut self) -> Result<()> {
        if !self.session.in_prog_mode()? {
            return Err(Error::ProgModeNotConfirmed);
        }
        Ok(())
    }
}

/// Aligns an image down to its page boundary and pads both ends with the
/// erase pattern so every write is page-sized.
fn page_partition(firmware: &Firmware, page_size: usize) -> (usize, Vec<u8>) {
    let offset = (firmware.base_address as usize / page_size) * page_size;
    let front = firmware.base_address as usize - offset;

    let mut data = vec![PAGE_FILL; front];
    data.extend_from_slice(&firmware.data);
    let tail = data.len() % page_size;
    if tail != 0 {
        data.resize(data.len() + page_size - tail, PAGE_FILL);
    }
    (offset, data)
}
