//! NVM controller drivers.
//!
//! Two controller generations are supported: v0 (tinyAVR-0/1, megaAVR-0)
//! with a page buffer, and v2 (AVR Dx) where data is streamed directly
//! while a write command is armed. Every destructive operation runs inside
//! the same bracket: wait-ready, command, wait-ready.

use std::time::{Duration, Instant};

use crate::constants::{nvm, nvm_v0, nvm_v2};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::transport::Transport;

/// How long the controller may stay busy before we fail closed.
const NVM_READY_TIMEOUT: Duration = Duration::from_millis(100);

/// NVM controller generation, decoded from the SIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmVariant {
    V0,
    V2,
}

pub struct NvmDriver {
    variant: NvmVariant,
}

impl NvmDriver {
    pub fn new(variant: NvmVariant) -> Self {
        NvmDriver { variant }
    }

    pub fn variant(&self) -> NvmVariant {
        self.variant
    }

    /// Poll the status register until the controller reports ready.
    ///
    /// A set write-error bit is a hardware fault, not busyness, and raises
    /// immediately.
    fn wait_ready<T: Transport>(
        &self,
        mem: &mut Memory<T>,
        device: &Device,
        op: &'static str,
    ) -> Result<()> {
        let deadline = Instant::now() + NVM_READY_TIMEOUT;
        loop {
            let status = mem.read_data(device.nvm_base + nvm::STATUS, 1)?[0];
            if status & nvm::STATUS_WRITE_ERROR != 0 {
                return Err(Error::NvmError(op));
            }
            if status & (nvm::STATUS_FLASH_BUSY | nvm::STATUS_EEPROM_BUSY) == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::NvmBusyTimeout(op));
            }
        }
    }

    fn command<T: Transport>(
        &self,
        mem: &mut Memory<T>,
        device: &Device,
        command: u8,
    ) -> Result<()> {
        log::trace!("NVM command 0x{:02x}", command);
        mem.write_data(device.nvm_base + nvm::CTRLA, &[command])
    }

    /// Whole-array erase through the NVM controller. Only reaches flash and
    /// EEPROM of an already-unlocked device; locked parts go through the
    /// key-based erase in the session layer.
    pub fn chip_erase<T: Transport>(&self, mem: &mut Memory<T>, device: &Device) -> Result<()> {
        let cmd = match self.variant {
            NvmVariant::V0 => nvm_v0::CMD_CHIP_ERASE,
            NvmVariant::V2 => nvm_v2::CMD_CHIP_ERASE,
        };
        self.wait_ready(mem, device, "chip erase")?;
        self.command(mem, device, cmd)?;
        self.wait_ready(mem, device, "chip erase")
    }

    pub fn erase_flash_page<T: Transport>(
        &self,
        mem: &mut Memory<T>,
        device: &Device,
        address: u32,
    ) -> Result<()> {
        self.wait_ready(mem, device, "page erase")?;
        match self.variant {
            NvmVariant::V0 => {
                // A dummy write marks the page in the buffer; the erase
                // command then targets that page.
                mem.write_data(address, &[0xFF])?;
                self.command(mem, device, nvm_v0::CMD_ERASE_PAGE)?;
            }
            NvmVariant::V2 => {
                self.command(mem, device, nvm_v2::CMD_FLASH_PAGE_ERASE)?;
                mem.write_data(address, &[0xFF])?;
                self.wait_ready(mem, device, "page erase")?;
                return self.command(mem, device, nvm_v2::CMD_NOCMD);
            }
        }
        self.wait_ready(mem, device, "page erase")
    }

    pub fn erase_eeprom<T: Transport>(&self, mem: &mut Memory<T>, device: &Device) -> Result<()> {
        let cmd = match self.variant {
            NvmVariant::V0 => nvm_v0::CMD_ERASE_EEPROM,
            NvmVariant::V2 => nvm_v2::CMD_EEPROM_ERASE,
        };
        self.wait_ready(mem, device, "eeprom erase")?;
        self.command(mem, device, cmd)?;
        self.wait_ready(mem, device, "eeprom erase")
    }

    pub fn erase_user_row<T: Transport>(&self, mem: &mut Memory<T>, device: &Device) -> Result<()> {
        // No dedicated erase command exists for the user row; an
        // erase-write of all-0xFF has the same effect.
        let blank = vec![0xFF; device.userrow_size as usize];
        self.write_user_row(mem, device, device.userrow_base, &blank)
    }

    /// Program one flash page. The caller delivers page-aligned, page-sized
    /// data to an erased page.
    pub fn write_flash<T: Transport>(
        &self,
        mem: &mut Memory<T>,
        device: &Device,
        address: u32,
        data: &[u8],
    ) -> Result<()> {
        match self.variant {
            NvmVariant::V0 => {
                self.wait_ready(mem, device, "flash write")?;
                self.command(mem, device, nvm_v0::CMD_PAGE_BUFFER_CLEAR)?;
                self.wait_ready(mem, device, "page buffer clear")?;
                // Flash must be loaded with word accesses.
                mem.write_words(address, data)?;
                self.command(mem, device, nvm_v0::CMD_WRITE_PAGE)?;
                self.wait_ready(mem, device, "flash write")
            }
            NvmVariant::V2 => {
                self.wait_ready(mem, device, "flash write")?;
                self.command(mem, device, nvm_v2::CMD_FLASH_WRITE)?;
                mem.write_words(address, data)?;
                self.wait_ready(mem, device, "flash write")?;
                self.command(mem, device, nvm_v2::CMD_NOCMD)
            }
        }
    }

    /// Program EEPROM bytes. The controller erases the touched page(s) as
    /// part of the erase-write command, so arbitrary content is fine.
    pub fn write_eeprom<T: Transport>(
        &self,
        mem: &mut Memory<T>,
        device: &Device,
        address: u32,
        data: &[u8],
    ) -> Result<()> {
        match self.variant {
            NvmVariant::V0 => {
                self.wait_ready(mem, device, "eeprom write")?;
                self.command(mem, device, nvm_v0::CMD_PAGE_BUFFER_CLEAR)?;
                self.wait_ready(mem, device, "page buffer clear")?;
                mem.write(address, data)?;
                self.command(mem, device, nvm_v0::CMD_ERASE_WRITE_PAGE)?;
                self.wait_ready(mem, device, "eeprom write")
            }
            NvmVariant::V2 => {
                self.wait_ready(mem, device, "eeprom write")?;
                self.command(mem, device, nvm_v2::CMD_EEPROM_ERASE_WRITE)?;
                mem.write(address, data)?;
                self.wait_ready(mem, device, "eeprom write")?;
                self.command(mem, device, nvm_v2::CMD_NOCMD)
            }
        }
    }

    /// Program the user row. On both controller generations this is the
    /// EEPROM primitive, which is also what makes the locked-device key
    /// flow work against the same code path.
    pub fn write_user_row<T: Transport>(
        &self,
        mem: &mut Memory<T>,
        device: &Device,
        address: u32,
        data: &[u8],
    ) -> Result<()> {
        self.write_eeprom(mem, device, address, data)
    }

    /// Program one fuse byte. `offset` indexes into the fuse area.
    pub fn write_fuse<T: Transport>(
        &self,
        mem: &mut Memory<T>,
        device: &Device,
        offset: u32,
        value: u8,
    ) -> Result<()> {
        let fuse_address = device.fuses_base + offset;
        match self.variant {
            NvmVariant::V0 => {
                // The v0 controller takes the target through its own
                // address/data registers.
                self.wait_ready(mem, device, "fuse write")?;
                mem.write_data(
                    device.nvm_base + nvm::ADDR_LO,
                    &(fuse_address as u16).to_le_bytes(),
                )?;
                mem.write_data(device.nvm_base + nvm::DATA_LO, &[value])?;
                self.command(mem, device, nvm_v0::CMD_WRITE_FUSE)?;
                self.wait_ready(mem, device, "fuse write")
            }
            NvmVariant::V2 => self.write_eeprom(mem, device, fuse_address, &[value]),
        }
    }
}
