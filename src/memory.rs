//! Chunked memory access over the data link.

use crate::constants::MAX_REPEAT_SIZE;
use crate::error::{Error, Result};
use crate::link::UpdiLink;
use crate::transport::Transport;

/// Largest single byte-granular burst one REPEAT can cover.
pub const MAX_BURST_BYTES: usize = MAX_REPEAT_SIZE;
/// Largest single word-granular burst, in 16-bit words.
pub const MAX_BURST_WORDS: usize = MAX_REPEAT_SIZE / 2;

/// Presents the target's data space as contiguous memory.
///
/// The `*_data` primitives map to one pointer/repeat burst and refuse
/// anything beyond the protocol maximum; `read`/`write`/`write_words`
/// chunk arbitrary lengths on top of them.
pub struct Memory<T: Transport> {
    link: UpdiLink<T>,
}

impl<T: Transport> Memory<T> {
    pub fn new(link: UpdiLink<T>) -> Self {
        Memory { link }
    }

    pub fn link(&mut self) -> &mut UpdiLink<T> {
        &mut self.link
    }

    pub fn into_link(self) -> UpdiLink<T> {
        self.link
    }

    /// Read up to [`MAX_BURST_BYTES`] bytes in one burst.
    pub fn read_data(&mut self, address: u32, size: usize) -> Result<Vec<u8>> {
        log::trace!("read {} bytes at 0x{:06x}", size, address);
        if size > MAX_BURST_BYTES {
            return Err(Error::SizeLimitExceeded {
                what: "read burst",
                requested: size,
                limit: MAX_BURST_BYTES,
            });
        }
        match size {
            0 => Ok(Vec::new()),
            1 => Ok(vec![self.link.ld8(address)?]),
            _ => {
                self.link.st_ptr(address)?;
                self.link.repeat(size)?;
                self.link.ld_ptr_inc(size)
            }
        }
    }

    /// Read up to [`MAX_BURST_WORDS`] 16-bit words in one burst.
    pub fn read_data_words(&mut self, address: u32, words: usize) -> Result<Vec<u8>> {
        if words > MAX_BURST_WORDS {
            return Err(Error::SizeLimitExceeded {
                what: "word read burst",
                requested: words,
                limit: MAX_BURST_WORDS,
            });
        }
        match words {
            0 => Ok(Vec::new()),
            1 => Ok(self.link.ld16(address)?.to_le_bytes().to_vec()),
            _ => {
                self.link.st_ptr(address)?;
                self.link.repeat(words)?;
                self.link.ld_ptr_inc16(words)
            }
        }
    }

    /// Write up to [`MAX_BURST_BYTES`] bytes in one burst.
    ///
    /// One- and two-byte writes use direct addressed stores: no pointer
    /// setup, one ACK round-trip less.
    pub fn write_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        log::trace!("write {} bytes at 0x{:06x}", data.len(), address);
        if data.len() > MAX_BURST_BYTES {
            return Err(Error::SizeLimitExceeded {
                what: "write burst",
                requested: data.len(),
                limit: MAX_BURST_BYTES,
            });
        }
        match data.len() {
            0 => Ok(()),
            1 => self.link.st8(address, data[0]),
            2 => self.link.st16(address, u16::from_le_bytes([data[0], data[1]])),
            n => {
                self.link.st_ptr(address)?;
                self.link.repeat(n)?;
                self.link.st_ptr_inc(data)
            }
        }
    }

    /// Write up to [`MAX_BURST_WORDS`] words in one burst. A single word
    /// keeps the acknowledged direct store; larger bursts run with the
    /// response signature disabled for throughput.
    pub fn write_data_words(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.len() % 2 != 0 {
            return Err(Error::SizeLimitExceeded {
                what: "word write alignment",
                requested: data.len(),
                limit: data.len() + 1,
            });
        }
        let words = data.len() / 2;
        if words > MAX_BURST_WORDS {
            return Err(Error::SizeLimitExceeded {
                what: "word write burst",
                requested: words,
                limit: MAX_BURST_WORDS,
            });
        }
        match words {
            0 => Ok(()),
            1 => self.link.st16(address, u16::from_le_bytes([data[0], data[1]])),
            n => {
                self.link.st_ptr(address)?;
                self.link.repeat(n)?;
                self.link.st_ptr_inc16_rsd(data)
            }
        }
    }

    /// Read an arbitrary range, chunked into maximum-size bursts.
    pub fn read(&mut self, address: u32, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        let mut offset = 0;
        while offset < size {
            let chunk = (size - offset).min(MAX_BURST_BYTES);
            out.extend(self.read_data(address + offset as u32, chunk)?);
            offset += chunk;
        }
        Ok(out)
    }

    /// Write an arbitrary range, chunked into maximum-size bursts.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        for chunk in data.chunks(MAX_BURST_BYTES) {
            self.write_data(address + offset as u32, chunk)?;
            offset += chunk.len();
        }
        Ok(())
    }

    /// Word-granular chunked write, for memories that must be loaded with
    /// 16-bit accesses.
    pub fn write_words(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        for chunk in data.chunks(MAX_BURST_WORDS * 2) {
            self.write_data_words(address + offset as u32, chunk)?;
            offset += chunk.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::SimTarget;

    const SRAM: u32 = 0x3800;

    fn memory() -> Memory<SimTarget> {
        let mut link = UpdiLink::new(SimTarget::new());
        link.init().expect("init");
        Memory::new(link)
    }

    #[test]
    fn single_byte_round_trip() {
        let mut mem = memory();
        mem.write_data(SRAM, &[0x42]).unwrap();
        assert_eq!(mem.read_data(SRAM, 1).unwrap(), vec![0x42]);
    }

    #[test]
    fn two_byte_round_trip() {
        let mut mem = memory();
        mem.write_data(SRAM, &[0x12, 0x34]).unwrap();
        assert_eq!(mem.read_data(SRAM, 2).unwrap(), vec![0x12, 0x34]);
    }

    #[test]
    fn burst_round_trip() {
        let mut mem = memory();
        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        mem.write_data(SRAM, &data).unwrap();
        assert_eq!(mem.read_data(SRAM, data.len()).unwrap(), data);
    }

    #[test]
    fn word_round_trip() {
        let mut mem = memory();
        let data: Vec<u8> = (0..64).map(|i| (i * 3) as u8).collect();
        mem.write_data_words(SRAM, &data).unwrap();
        assert_eq!(mem.read_data_words(SRAM, data.len() / 2).unwrap(), data);
    }

    #[test]
    fn oversize_bursts_are_rejected() {
        let mut mem = memory();
        let big = vec![0u8; MAX_BURST_BYTES + 1];
        assert!(matches!(
            mem.write_data(SRAM, &big),
            Err(Error::SizeLimitExceeded { .. })
        ));
        assert!(matches!(
            mem.read_data(SRAM, MAX_BURST_BYTES + 1),
            Err(Error::SizeLimitExceeded { .. })
        ));
        assert!(matches!(
            mem.read_data_words(SRAM, MAX_BURST_WORDS + 1),
            Err(Error::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn chunked_transfer_spans_bursts() {
        let mut mem = memory();
        let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        mem.write(SRAM, &data).unwrap();
        assert_eq!(mem.read(SRAM, data.len()).unwrap(), data);
    }
}
