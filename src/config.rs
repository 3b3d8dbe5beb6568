//! On-device configuration record.
//!
//! A fixed 20-byte little-endian record persisted at the start of EEPROM.
//! The magic word distinguishes a programmed record from erased or foreign
//! content; anything without it is reported blank and the caller decides
//! whether the documented defaults get written back.

use scroll::{LE, Pread, Pwrite};

use crate::error::{Error, Result};

/// Sentinel marking a valid record.
pub const CONFIG_MAGIC: u16 = 0xC7A9;
/// Encoded record size; the layout ends with two reserved padding bytes.
pub const CONFIG_SIZE: usize = 20;
/// Where the record lives inside the EEPROM region.
pub const CONFIG_EEPROM_OFFSET: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PowerRole {
    Sink = 0,
    Source = 1,
    Dual = 2,
}

impl PowerRole {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PowerRole::Sink),
            1 => Some(PowerRole::Source),
            2 => Some(PowerRole::Dual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PdMode {
    Off = 0,
    Fixed = 1,
    Pps = 2,
}

impl PdMode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PdMode::Off),
            1 => Some(PdMode::Fixed),
            2 => Some(PdMode::Pps),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeConfig {
    pub role: PowerRole,
    pub pd_mode: PdMode,
    pub charge_current_ma: u16,
    pub charge_voltage_mv: u16,
    pub input_current_ma: u16,
    pub input_voltage_min_mv: u16,
    pub precharge_current_ma: u16,
    pub autostart: bool,
    pub led_enabled: bool,
    /// Thermistor calibration offset in tenths of a degree.
    pub temp_offset_dc: i16,
}

impl Default for ChargeConfig {
    fn default() -> Self {
        ChargeConfig {
            role: PowerRole::Sink,
            pd_mode: PdMode::Fixed,
            charge_current_ma: 1000,
            charge_voltage_mv: 8400,
            input_current_ma: 3000,
            input_voltage_min_mv: 4500,
            precharge_current_ma: 100,
            autostart: true,
            led_enabled: true,
            temp_offset_dc: 0,
        }
    }
}

impl ChargeConfig {
    /// Decode a record buffer.
    ///
    /// Returns `Ok(None)` for blank or invalid content (erased EEPROM, a
    /// wrong magic, an out-of-range enum) so the caller can substitute
    /// defaults explicitly. Fails outright only on a short buffer.
    pub fn decode(bytes: &[u8]) -> Result<Option<ChargeConfig>> {
        if bytes.len() < CONFIG_SIZE {
            return Err(Error::ConfigInvalid(format!(
                "record needs {} bytes, got {}",
                CONFIG_SIZE,
                bytes.len()
            )));
        }
        if bytes[0] == 0xFF && bytes[1] == 0xFF {
            log::debug!("configuration area is erased");
            return Ok(None);
        }
        let magic: u16 = bytes.pread_with(0, LE)?;
        if magic != CONFIG_MAGIC {
            log::debug!("configuration magic 0x{:04x} does not match", magic);
            return Ok(None);
        }

        let (Some(role), Some(pd_mode)) = (PowerRole::from_u8(bytes[2]), PdMode::from_u8(bytes[3]))
        else {
            log::debug!("configuration enums out of range");
            return Ok(None);
        };

        Ok(Some(ChargeConfig {
            role,
            pd_mode,
            charge_current_ma: bytes.pread_with(4, LE)?,
            charge_voltage_mv: bytes.pread_with(6, LE)?,
            input_current_ma: bytes.pread_with(8, LE)?,
            input_voltage_min_mv: bytes.pread_with(10, LE)?,
            precharge_current_ma: bytes.pread_with(12, LE)?,
            autostart: bytes[14] != 0,
            led_enabled: bytes[15] != 0,
            temp_offset_dc: bytes.pread_with(16, LE)?,
        }))
    }

    /// Encode to the wire layout. The magic is always forced to the
    /// sentinel; a caller cannot persist an invalid record by accident.
    pub fn encode(&self) -> [u8; CONFIG_SIZE] {
        let mut buf = [0u8; CONFIG_SIZE];
        buf.pwrite_with(CONFIG_MAGIC, 0, LE).unwrap();
        buf[2] = self.role as u8;
        buf[3] = self.pd_mode as u8;
        buf.pwrite_with(self.charge_current_ma, 4, LE).unwrap();
        buf.pwrite_with(self.charge_voltage_mv, 6, LE).unwrap();
        buf.pwrite_with(self.input_current_ma, 8, LE).unwrap();
        buf.pwrite_with(self.input_voltage_min_mv, 10, LE).unwrap();
        buf.pwrite_with(self.precharge_current_ma, 12, LE).unwrap();
        buf[14] = self.autostart as u8;
        buf[15] = self.led_enabled as u8;
        buf.pwrite_with(self.temp_offset_dc, 16, LE).unwrap();
        buf
    }

    /// Range checks applied before a record may be written to the device.
    pub fn validate(&self) -> Result<()> {
        fn check<V: PartialOrd + std::fmt::Display>(
            name: &str,
            value: V,
            min: V,
            max: V,
        ) -> Result<()> {
            if value < min || value > max {
                return Err(Error::ConfigInvalid(format!(
                    "{} = {} outside {}..={}",
                    name, value, min, max
                )));
            }
            Ok(())
        }

        check("charge current (mA)", self.charge_current_ma, 50, 5000)?;
        check("charge voltage (mV)", self.charge_voltage_mv, 3000, 20000)?;
        check("input current (mA)", self.input_current_ma, 100, 5000)?;
        check(
            "input voltage floor (mV)",
            self.input_voltage_min_mv,
            3000,
            20000,
        )?;
        check(
            "precharge current (mA)",
            self.precharge_current_ma,
            10,
            1000,
        )?;
        check("temperature offset (d°C)", self.temp_offset_dc, -300, 300)?;
        Ok(())
    }
}
