//! UPDI device definitions, grouped per family with a shared memory map.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A device family: one NVM generation, one memory map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    #[serde(deserialize_with = "parse_address_or_size")]
    pub nvm_base: u32,
    #[serde(deserialize_with = "parse_address_or_size")]
    pub sigrow_base: u32,
    #[serde(deserialize_with = "parse_address_or_size")]
    pub fuses_base: u32,
    #[serde(deserialize_with = "parse_address_or_size")]
    pub userrow_base: u32,
    #[serde(deserialize_with = "parse_address_or_size")]
    pub eeprom_base: u32,
    #[serde(deserialize_with = "parse_address_or_size")]
    pub flash_base: u32,
    pub variants: Vec<Variant>,
}

/// One orderable part within a family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    #[serde(deserialize_with = "parse_signature")]
    pub signature: [u8; 3],
    #[serde(deserialize_with = "parse_address_or_size")]
    pub flash_size: u32,
    pub flash_page_size: u32,
    #[serde(deserialize_with = "parse_address_or_size")]
    pub eeprom_size: u32,
    pub eeprom_page_size: u32,
    pub userrow_size: u32,
}

/// A fully resolved target: family memory map plus variant sizes.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub signature: [u8; 3],
    pub nvm_base: u32,
    pub sigrow_base: u32,
    pub fuses_base: u32,
    pub userrow_base: u32,
    pub userrow_size: u32,
    pub eeprom_base: u32,
    pub eeprom_size: u32,
    pub eeprom_page_size: u32,
    pub flash_base: u32,
    pub flash_size: u32,
    pub flash_page_size: u32,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, hex::encode(self.signature))
    }
}

impl Device {
    fn resolve(family: &Family, variant: &Variant) -> Device {
        Device {
            name: variant.name.clone(),
            signature: variant.signature,
            nvm_base: family.nvm_base,
            sigrow_base: family.sigrow_base,
            fuses_base: family.fuses_base,
            userrow_base: family.userrow_base,
            userrow_size: variant.userrow_size,
            eeprom_base: family.eeprom_base,
            eeprom_size: variant.eeprom_size,
            eeprom_page_size: variant.eeprom_page_size,
            flash_base: family.flash_base,
            flash_size: variant.flash_size,
            flash_page_size: variant.flash_page_size,
        }
    }
}

pub struct DeviceDb {
    families: Vec<Family>,
}

impl DeviceDb {
    pub fn load() -> Result<Self> {
        let parse = |s: &str| {
            serde_yaml::from_str::<Family>(s)
                .map_err(|e| Error::UnsupportedDevice(format!("device database: {}", e)))
        };
        Ok(DeviceDb {
            families: vec![
                parse(include_str!("../devices/tinyavr-01.yaml"))?,
                parse(include_str!("../devices/megaavr-0.yaml"))?,
                parse(include_str!("../devices/avr-da.yaml"))?,
            ],
        })
    }

    /// Look a part up by the 3-byte signature read from its signature row.
    pub fn find_by_signature(signature: [u8; 3]) -> Result<Device> {
        let db = DeviceDb::load()?;
        for family in &db.families {
            if let Some(variant) = family.variants.iter().find(|v| v.signature == signature) {
                log::debug!("signature {} is in family {}", hex::encode(signature), family.name);
                return Ok(Device::resolve(family, variant));
            }
        }
        Err(Error::UnsupportedDevice(format!(
            "no device with signature {}",
            hex::encode(signature)
        )))
    }

    /// Look a part up by name, e.g. from a `--chip` option.
    pub fn find_by_name(name: &str) -> Result<Device> {
        let db = DeviceDb::load()?;
        for family in &db.families {
            if let Some(variant) = family
                .variants
                .iter()
                .find(|v| v.name.eq_ignore_ascii_case(name))
            {
                return Ok(Device::resolve(family, variant));
            }
        }
        Err(Error::UnsupportedDevice(format!("unknown chip {:?}", name)))
    }

    pub fn known_chips() -> Result<Vec<String>> {
        let db = DeviceDb::load()?;
        Ok(db
            .families
            .iter()
            .flat_map(|f| f.variants.iter().map(|v| v.name.clone()))
            .collect())
    }
}

fn parse_signature<'de, D>(deserializer: D) -> std::result::Result<[u8; 3], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let raw = hex::decode(s.trim()).map_err(serde::de::Error::custom)?;
    raw.try_into()
        .map_err(|_| serde::de::Error::custom("signature must be 3 bytes"))
}

fn parse_address_or_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    let s = match serde::Deserialize::deserialize(deserializer)? {
        Raw::Number(n) => return Ok(n),
        Raw::Text(s) => s,
    };
    let parsed = if let Some(hex_digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex_digits, 16).ok()
    } else if let Some(kib) = s.strip_suffix("K") {
        kib.parse::<u32>().ok().map(|v| v * 1024)
    } else {
        s.parse().ok()
    };
    parsed.ok_or_else(|| serde::de::Error::custom(format!("cannot parse {:?}", s)))
}
