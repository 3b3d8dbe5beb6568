//! UPDI data link: instruction framing on top of a transport.

use crate::constants::{ACK, MAX_REPEAT_SIZE, SIB_LENGTH, SYNC, cs, opcodes};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Width of addresses carried by direct load/store instructions.
///
/// Parts with the v0 NVM controller decode 16-bit addresses; the Dx
/// generation maps flash high and needs 24-bit ones. Selected once after
/// SIB decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressWidth {
    #[default]
    Bits16,
    Bits24,
}

/// Encoder for the UPDI instruction set.
///
/// Every public method maps 1:1 onto one wire instruction. Bulk transfers
/// are composed by the memory layer from `st_ptr`/`repeat`/`*_ptr_inc`.
pub struct UpdiLink<T: Transport> {
    transport: T,
    width: AddressWidth,
}

impl<T: Transport> UpdiLink<T> {
    pub fn new(transport: T) -> Self {
        UpdiLink {
            transport,
            width: AddressWidth::default(),
        }
    }

    pub fn address_width(&self) -> AddressWidth {
        self.width
    }

    /// Rebinds the link to the address width the detected device needs.
    pub fn set_address_width(&mut self, width: AddressWidth) {
        self.width = width;
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Brings the link up: disable collision detection (the host drives the
    /// wire through a resistor), enable the inter-byte guard time, then
    /// prove the link by reading a non-zero status register. One
    /// double-break retry before giving up.
    pub fn init(&mut self) -> Result<()> {
        if self.try_init().is_ok() {
            return Ok(());
        }
        log::info!("UPDI not responding, sending double break");
        self.transport.send_double_break()?;
        self.try_init().map_err(|e| {
            log::debug!("init retry failed: {}", e);
            Error::LinkInitFailed
        })
    }

    fn try_init(&mut self) -> Result<()> {
        self.stcs(cs::CTRLB, cs::CTRLB_CCDETDIS)?;
        self.stcs(cs::CTRLA, cs::CTRLA_IBDLY)?;
        let status = self.ldcs(cs::STATUSA)?;
        if status == 0 {
            return Err(Error::LinkInitFailed);
        }
        log::debug!("UPDI link up, STATUSA = 0x{:02x}", status);
        Ok(())
    }

    /// Load from a control/status register.
    pub fn ldcs(&mut self, reg: u8) -> Result<u8> {
        self.frame(&[SYNC, opcodes::LDCS | reg])?;
        Ok(self.transport.receive(1)?[0])
    }

    /// Store to a control/status register. No response on the wire.
    pub fn stcs(&mut self, reg: u8, value: u8) -> Result<()> {
        self.frame(&[SYNC, opcodes::STCS | reg, value])
    }

    /// Direct-addressed byte load.
    pub fn ld8(&mut self, address: u32) -> Result<u8> {
        let mut buf = vec![SYNC, opcodes::LDS | self.address_size() | opcodes::DATA_8];
        self.push_address(&mut buf, address);
        self.frame(&buf)?;
        Ok(self.transport.receive(1)?[0])
    }

    /// Direct-addressed word load, little-endian.
    pub fn ld16(&mut self, address: u32) -> Result<u16> {
        let mut buf = vec![SYNC, opcodes::LDS | self.address_size() | opcodes::DATA_16];
        self.push_address(&mut buf, address);
        self.frame(&buf)?;
        let data = self.transport.receive(2)?;
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    /// Direct-addressed byte store.
    pub fn st8(&mut self, address: u32, value: u8) -> Result<()> {
        let mut buf = vec![SYNC, opcodes::STS | self.address_size() | opcodes::DATA_8];
        self.push_address(&mut buf, address);
        self.frame(&buf)?;
        self.wait_ack("st address")?;
        self.frame(&[value])?;
        self.wait_ack("st data")
    }

    /// Direct-addressed word store, little-endian.
    pub fn st16(&mut self, address: u32, value: u16) -> Result<()> {
        let mut buf = vec![SYNC, opcodes::STS | self.address_size() | opcodes::DATA_16];
        self.push_address(&mut buf, address);
        self.frame(&buf)?;
        self.wait_ack("st address")?;
        self.frame(&value.to_le_bytes())?;
        self.wait_ack("st data")
    }

    /// Set the indirection pointer.
    pub fn st_ptr(&mut self, address: u32) -> Result<()> {
        let ptr_width = match self.width {
            AddressWidth::Bits16 => opcodes::DATA_16,
            AddressWidth::Bits24 => opcodes::DATA_24,
        };
        let mut buf = vec![SYNC, opcodes::ST | opcodes::PTR_ADDRESS | ptr_width];
        self.push_address(&mut buf, address);
        self.frame(&buf)?;
        self.wait_ack("st ptr")
    }

    /// Load `count` bytes through the pointer with post-increment. The
    /// caller primes `repeat` for anything beyond a single byte.
    pub fn ld_ptr_inc(&mut self, count: usize) -> Result<Vec<u8>> {
        self.frame(&[SYNC, opcodes::LD | opcodes::PTR_INC | opcodes::DATA_8])?;
        self.transport.receive(count)
    }

    /// Load `words` 16-bit words through the pointer with post-increment.
    pub fn ld_ptr_inc16(&mut self, words: usize) -> Result<Vec<u8>> {
        self.frame(&[SYNC, opcodes::LD | opcodes::PTR_INC | opcodes::DATA_16])?;
        self.transport.receive(words * 2)
    }

    /// Store bytes through the pointer with post-increment, one ACK each.
    pub fn st_ptr_inc(&mut self, data: &[u8]) -> Result<()> {
        self.frame(&[SYNC, opcodes::ST | opcodes::PTR_INC | opcodes::DATA_8, data[0]])?;
        self.wait_ack("st ptr inc")?;
        for &byte in &data[1..] {
            self.frame(&[byte])?;
            self.wait_ack("st ptr inc")?;
        }
        Ok(())
    }

    /// Store words through the pointer as one unacknowledged burst.
    ///
    /// Response-signature-disable is set for the duration of the burst and
    /// restored afterwards; leaving it disabled would break every later
    /// acknowledged operation.
    pub fn st_ptr_inc16_rsd(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() % 2 == 0);
        self.stcs(cs::CTRLA, cs::CTRLA_RSD | cs::CTRLA_IBDLY)?;
        let mut buf = Vec::with_capacity(2 + data.len());
        buf.extend_from_slice(&[SYNC, opcodes::ST | opcodes::PTR_INC | opcodes::DATA_16]);
        buf.extend_from_slice(data);
        let sent = self.frame(&buf);
        // Re-enable ACKs even if the burst itself failed.
        let restored = self.stcs(cs::CTRLA, cs::CTRLA_IBDLY);
        sent?;
        restored
    }

    /// Prime the next pointer-indirect instruction to run `count` times.
    /// The wire carries `count - 1`, so more than 256 cannot be encoded.
    pub fn repeat(&mut self, count: usize) -> Result<()> {
        if count == 0 || count > MAX_REPEAT_SIZE {
            return Err(Error::SizeLimitExceeded {
                what: "repeat count",
                requested: count,
                limit: MAX_REPEAT_SIZE,
            });
        }
        self.frame(&[SYNC, opcodes::REPEAT | opcodes::DATA_8, (count - 1) as u8])
    }

    /// Transmit an activation key. Keys go out in reverse byte order and
    /// must be exactly 8 << size bytes long.
    pub fn key(&mut self, size: u8, key: &[u8]) -> Result<()> {
        let expected = 8usize << size;
        if key.len() != expected {
            return Err(Error::SizeLimitExceeded {
                what: "key length",
                requested: key.len(),
                limit: expected,
            });
        }
        let mut buf = Vec::with_capacity(2 + key.len());
        buf.extend_from_slice(&[SYNC, opcodes::KEY | size]);
        buf.extend(key.iter().rev());
        self.frame(&buf)
    }

    /// Read the System Information Block.
    pub fn read_sib(&mut self) -> Result<[u8; SIB_LENGTH]> {
        self.frame(&[SYNC, opcodes::KEY | opcodes::KEY_SIB | opcodes::SIB_32BYTES])?;
        let data = self.transport.receive(SIB_LENGTH)?;
        let mut sib = [0u8; SIB_LENGTH];
        sib.copy_from_slice(&data);
        Ok(sib)
    }

    fn frame(&mut self, bytes: &[u8]) -> Result<()> {
        log::trace!("=> {}", hex::encode(bytes));
        self.transport.send(bytes)
    }

    fn wait_ack(&mut self, op: &'static str) -> Result<()> {
        let ack = self.transport.receive(1)?[0];
        if ack != ACK {
            return Err(Error::ProtocolAck {
                op,
                expected: ACK,
                actual: ack,
            });
        }
        Ok(())
    }

    fn address_size(&self) -> u8 {
        match self.width {
            AddressWidth::Bits16 => opcodes::ADDRESS_16,
            AddressWidth::Bits24 => opcodes::ADDRESS_24,
        }
    }

    fn push_address(&self, buf: &mut Vec<u8>, address: u32) {
        buf.push(address as u8);
        buf.push((address >> 8) as u8);
        if self.width == AddressWidth::Bits24 {
            buf.push((address >> 16) as u8);
        }
    }
}
