//! Firmware file formats.
use std::path::Path;
use std::str;

use anyhow::Result;

/// A loaded firmware image: contiguous bytes anchored at an offset into
/// flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware {
    pub base_address: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    IntelHex,
    Binary,
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Firmware> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::Binary => Ok(Firmware {
            base_address: 0,
            data: raw,
        }),
    }
}

/// Format selection is by file suffix; a leading ':' rescues hex files
/// with unhelpful names.
pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Parse Intel HEX text into one merged image.
///
/// Data records accumulate as address-keyed runs; the first end-of-file
/// record stops the reader and anything after it is ignored. The merged
/// buffer spans the lowest to the highest addressed byte, with gaps
/// between runs left zero-filled.
pub fn read_ihex(data: &str) -> Result<Firmware> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;
                records.push((offset, value));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    merge_records(records)
}

fn merge_records(mut records: Vec<(u32, Vec<u8>)>) -> Result<Firmware> {
    records.sort(); // order by start address

    let Some(first) = records.first() else {
        anyhow::bail!("no data records in image");
    };
    let start_address = first.0;
    let end_address = records.last().unwrap().0 + records.last().unwrap().1.len() as u32;

    let total_size = end_address - start_address;

    let mut binary = vec![0u8; total_size as usize];
    for (addr, chunk) in records {
        let start = (addr - start_address) as usize;
        binary[start..start + chunk.len()].copy_from_slice(&chunk);
    }
    Ok(Firmware {
        base_address: start_address,
        data: binary,
    })
}
