//! Simulated UPDI target for protocol tests.
//!
//! Interprets the instruction stream a real target would see and models
//! just enough of the data space (CS registers, NVM controller, page
//! buffer, key/reset handling) for the upper layers to run against it.

use std::collections::{HashMap, VecDeque};

use crate::constants::{ACK, SIB_LENGTH, SYNC, cs, keys, nvm, nvm_v0, nvm_v2, opcodes};
use crate::error::{Error, Result};

use super::Transport;

/// Which NVM controller generation the fake target emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimVariant {
    V0,
    V2,
}

/// Memory map of the emulated part.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub variant: SimVariant,
    pub signature: [u8; 3],
    pub nvm_base: u32,
    pub sigrow_base: u32,
    pub fuses_base: u32,
    pub userrow_base: u32,
    pub userrow_size: u32,
    pub eeprom_base: u32,
    pub eeprom_size: u32,
    pub flash_base: u32,
    pub flash_size: u32,
    pub page_size: u32,
}

impl Default for SimConfig {
    /// Roughly an ATtiny1616.
    fn default() -> Self {
        SimConfig {
            variant: SimVariant::V0,
            signature: [0x1E, 0x94, 0x21],
            nvm_base: 0x1000,
            sigrow_base: 0x1100,
            fuses_base: 0x1280,
            userrow_base: 0x1300,
            userrow_size: 32,
            eeprom_base: 0x1400,
            eeprom_size: 256,
            flash_base: 0x8000,
            flash_size: 16 * 1024,
            page_size: 64,
        }
    }
}

impl SimConfig {
    /// Roughly an AVR128DA48.
    pub fn dx() -> Self {
        SimConfig {
            variant: SimVariant::V2,
            signature: [0x1E, 0x97, 0x0A],
            nvm_base: 0x1000,
            sigrow_base: 0x1100,
            fuses_base: 0x1050,
            userrow_base: 0x1080,
            userrow_size: 32,
            eeprom_base: 0x1400,
            eeprom_size: 512,
            flash_base: 0x80_0000,
            flash_size: 128 * 1024,
            page_size: 512,
        }
    }
}

const SIB_V0: &[u8] = b"tinyAVR P:0D:0-3M2 (01.59B14.0)";
const SIB_V2: &[u8] = b"AVR     P:2D:1-3M2 (A3.KV00S.0)";

enum Pending {
    LdsAddr {
        addr_len: usize,
        data_len: usize,
        got: Vec<u8>,
    },
    StsAddr {
        addr_len: usize,
        data_len: usize,
        got: Vec<u8>,
    },
    StsData {
        addr: u32,
        data_len: usize,
        got: Vec<u8>,
    },
    StPtrAddr {
        len: usize,
        got: Vec<u8>,
    },
    StPtrData {
        data_len: usize,
        got: Vec<u8>,
        remaining: usize,
    },
    Stcs {
        reg: u8,
    },
    RepeatCount,
    Key {
        remaining: usize,
        got: Vec<u8>,
    },
    Opcode,
}

pub struct SimTarget {
    cfg: SimConfig,
    mem: HashMap<u32, u8>,
    page_buffer: HashMap<u32, u8>,
    out: VecDeque<u8>,
    pending: Option<Pending>,

    pointer: u32,
    repeat: usize,
    rsd: bool,

    locked: bool,
    in_reset: bool,
    prog_mode: bool,
    urow_prog: bool,
    key_status: u8,
    armed_command: u8,

    stuck_busy: bool,
    write_error: bool,
    fail_echo: bool,

    instructions: usize,
    nvm_commands: Vec<u8>,
}

impl SimTarget {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(cfg: SimConfig) -> Self {
        SimTarget {
            cfg,
            mem: HashMap::new(),
            page_buffer: HashMap::new(),
            out: VecDeque::new(),
            pending: None,
            pointer: 0,
            repeat: 0,
            rsd: false,
            locked: false,
            in_reset: false,
            prog_mode: false,
            urow_prog: false,
            key_status: 0,
            armed_command: 0,
            stuck_busy: false,
            write_error: false,
            fail_echo: false,
            instructions: 0,
            nvm_commands: Vec::new(),
        }
    }

    // Test knobs ---------------------------------------------------------

    pub fn corrupt_echo(&mut self) {
        self.fail_echo = true;
    }

    pub fn set_locked(&mut self) {
        self.locked = true;
    }

    pub fn stick_busy(&mut self) {
        self.stuck_busy = true;
    }

    pub fn set_write_error(&mut self) {
        self.write_error = true;
    }

    pub fn frames_accepted(&self) -> usize {
        self.instructions
    }

    /// NVM controller commands executed so far, in order.
    pub fn nvm_commands(&self) -> &[u8] {
        &self.nvm_commands
    }

    pub fn mem_read(&self, addr: u32) -> u8 {
        self.read_byte_raw(addr)
    }

    // Memory model -------------------------------------------------------

    fn in_nvm_region(&self, addr: u32) -> bool {
        let c = &self.cfg;
        (addr >= c.flash_base && addr < c.flash_base + c.flash_size)
            || (addr >= c.eeprom_base && addr < c.eeprom_base + c.eeprom_size)
            || (addr >= c.userrow_base && addr < c.userrow_base + c.userrow_size)
            || (addr >= c.fuses_base && addr < c.fuses_base + 16)
    }

    fn read_byte_raw(&self, addr: u32) -> u8 {
        if addr == self.cfg.nvm_base + nvm::STATUS {
            let mut status = 0;
            if self.stuck_busy {
                status |= nvm::STATUS_FLASH_BUSY | nvm::STATUS_EEPROM_BUSY;
            }
            if self.write_error {
                status |= nvm::STATUS_WRITE_ERROR;
            }
            return status;
        }
        if addr >= self.cfg.sigrow_base && addr < self.cfg.sigrow_base + 3 {
            return self.cfg.signature[(addr - self.cfg.sigrow_base) as usize];
        }
        match self.mem.get(&addr) {
            Some(&v) => v,
            None if self.in_nvm_region(addr) => 0xFF,
            None => 0x00,
        }
    }

    fn write_byte(&mut self, addr: u32, value: u8) {
        if addr == self.cfg.nvm_base + nvm::CTRLA {
            self.execute_nvm_command(value);
            return;
        }
        if self.in_nvm_region(addr) && addr < self.cfg.fuses_base + 16 && addr >= self.cfg.fuses_base
        {
            // Fuse space is written through the controller, direct stores
            // land in the shadow registers only.
            self.mem.insert(addr, value);
            return;
        }
        if self.in_nvm_region(addr) {
            match self.cfg.variant {
                SimVariant::V0 => {
                    self.page_buffer.insert(addr, value);
                }
                SimVariant::V2 => match self.armed_command {
                    nvm_v2::CMD_FLASH_WRITE | nvm_v2::CMD_EEPROM_ERASE_WRITE => {
                        self.mem.insert(addr, value);
                    }
                    nvm_v2::CMD_FLASH_PAGE_ERASE => self.erase_page_at(addr),
                    _ => {}
                },
            }
            return;
        }
        self.mem.insert(addr, value);
    }

    fn erase_page_at(&mut self, addr: u32) {
        let page = self.cfg.page_size;
        let start = addr - (addr % page);
        for a in start..start + page {
            self.mem.remove(&a);
        }
    }

    fn erase_region(&mut self, base: u32, size: u32) {
        for a in base..base + size {
            self.mem.remove(&a);
        }
    }

    fn execute_nvm_command(&mut self, command: u8) {
        self.nvm_commands.push(command);
        match self.cfg.variant {
            SimVariant::V0 => self.execute_v0(command),
            SimVariant::V2 => self.armed_command = command,
        }
        if self.cfg.variant == SimVariant::V2 {
            match command {
                nvm_v2::CMD_CHIP_ERASE => {
                    self.erase_region(self.cfg.flash_base, self.cfg.flash_size);
                    self.erase_region(self.cfg.eeprom_base, self.cfg.eeprom_size);
                }
                nvm_v2::CMD_EEPROM_ERASE => {
                    self.erase_region(self.cfg.eeprom_base, self.cfg.eeprom_size);
                }
                _ => {}
            }
        }
    }

    fn execute_v0(&mut self, command: u8) {
        match command {
            nvm_v0::CMD_WRITE_PAGE => self.commit_page_buffer(false),
            nvm_v0::CMD_ERASE_PAGE => {
                let touched: Vec<u32> = self.page_buffer.keys().copied().collect();
                self.page_buffer.clear();
                for addr in touched {
                    self.erase_page_at(addr);
                }
            }
            nvm_v0::CMD_ERASE_WRITE_PAGE => self.commit_page_buffer(true),
            nvm_v0::CMD_PAGE_BUFFER_CLEAR => self.page_buffer.clear(),
            nvm_v0::CMD_CHIP_ERASE => {
                self.erase_region(self.cfg.flash_base, self.cfg.flash_size);
                self.erase_region(self.cfg.eeprom_base, self.cfg.eeprom_size);
            }
            nvm_v0::CMD_ERASE_EEPROM => {
                self.erase_region(self.cfg.eeprom_base, self.cfg.eeprom_size)
            }
            nvm_v0::CMD_WRITE_FUSE => {
                let lo = self.read_byte_raw(self.cfg.nvm_base + nvm::ADDR_LO) as u32;
                let hi = self.read_byte_raw(self.cfg.nvm_base + nvm::ADDR_LO + 1) as u32;
                let data = self.read_byte_raw(self.cfg.nvm_base + nvm::DATA_LO);
                self.mem.insert(lo | (hi << 8), data);
            }
            _ => {}
        }
    }

    fn commit_page_buffer(&mut self, erase_first: bool) {
        let buffered: Vec<(u32, u8)> = self.page_buffer.drain().collect();
        if erase_first {
            let addrs: Vec<u32> = buffered.iter().map(|(a, _)| *a).collect();
            for addr in addrs {
                self.erase_page_at(addr);
            }
        }
        for (addr, value) in buffered {
            self.mem.insert(addr, value);
        }
    }

    // Key / reset handling ----------------------------------------------

    fn handle_key(&mut self, wire_bytes: &[u8]) {
        let mut key: Vec<u8> = wire_bytes.to_vec();
        key.reverse();
        if key == keys::NVMPROG {
            self.key_status |= cs::KEY_STATUS_NVMPROG;
        } else if key == keys::CHIPERASE {
            self.key_status |= cs::KEY_STATUS_CHIPERASE;
        } else if key == keys::UROWWRITE {
            self.key_status |= cs::KEY_STATUS_UROWWRITE;
        }
    }

    fn release_reset(&mut self) {
        self.in_reset = false;
        if self.key_status & cs::KEY_STATUS_CHIPERASE != 0 {
            self.erase_region(self.cfg.flash_base, self.cfg.flash_size);
            self.erase_region(self.cfg.eeprom_base, self.cfg.eeprom_size);
            self.locked = false;
            self.prog_mode = false;
            self.key_status &= !cs::KEY_STATUS_CHIPERASE;
        } else if self.key_status & cs::KEY_STATUS_NVMPROG != 0 {
            if !self.locked {
                self.prog_mode = true;
            }
            self.key_status &= !cs::KEY_STATUS_NVMPROG;
        } else if self.key_status & cs::KEY_STATUS_UROWWRITE != 0 {
            self.urow_prog = true;
        } else {
            self.prog_mode = false;
        }
    }

    fn ldcs(&self, reg: u8) -> u8 {
        match reg {
            cs::STATUSA => 0x30,
            cs::ASI_KEY_STATUS => self.key_status,
            cs::ASI_SYS_STATUS => {
                let mut status = 0;
                if self.locked {
                    status |= cs::SYS_STATUS_LOCKSTATUS;
                }
                if self.prog_mode {
                    status |= cs::SYS_STATUS_NVMPROG;
                }
                if self.urow_prog {
                    status |= cs::SYS_STATUS_UROWPROG;
                }
                status
            }
            _ => 0,
        }
    }

    fn stcs(&mut self, reg: u8, value: u8) {
        match reg {
            cs::CTRLA => self.rsd = value & cs::CTRLA_RSD != 0,
            cs::ASI_RESET_REQ => {
                if value == cs::RESET_REQ_SIGNATURE {
                    self.in_reset = true;
                } else if self.in_reset {
                    self.release_reset();
                }
            }
            cs::ASI_KEY_STATUS => self.key_status &= !value,
            cs::ASI_SYS_CTRLA => {
                if value & cs::SYS_CTRLA_UROW_FINAL != 0 && self.urow_prog {
                    self.commit_page_buffer(true);
                    self.urow_prog = false;
                }
            }
            _ => {}
        }
    }

    // Instruction stream parser -----------------------------------------

    fn push_ack(&mut self) {
        if !self.rsd {
            self.out.push_back(ACK);
        }
    }

    fn take_repeat(&mut self) -> usize {
        let n = self.repeat + 1;
        self.repeat = 0;
        n
    }

    fn feed(&mut self, byte: u8) {
        match self.pending.take() {
            None => {
                if byte == SYNC {
                    self.pending = Some(Pending::Opcode);
                }
            }
            Some(Pending::Opcode) => self.decode_opcode(byte),
            Some(Pending::LdsAddr {
                addr_len,
                data_len,
                mut got,
            }) => {
                got.push(byte);
                if got.len() == addr_len {
                    let addr = le_address(&got);
                    for i in 0..data_len as u32 {
                        let v = self.read_byte_raw(addr + i);
                        self.out.push_back(v);
                    }
                    self.instructions += 1;
                } else {
                    self.pending = Some(Pending::LdsAddr {
                        addr_len,
                        data_len,
                        got,
                    });
                }
            }
            Some(Pending::StsAddr {
                addr_len,
                data_len,
                mut got,
            }) => {
                got.push(byte);
                if got.len() == addr_len {
                    let addr = le_address(&got);
                    self.push_ack();
                    self.pending = Some(Pending::StsData {
                        addr,
                        data_len,
                        got: Vec::new(),
                    });
                } else {
                    self.pending = Some(Pending::StsAddr {
                        addr_len,
                        data_len,
                        got,
                    });
                }
            }
            Some(Pending::StsData {
                addr,
                data_len,
                mut got,
            }) => {
                got.push(byte);
                if got.len() == data_len {
                    for (i, &v) in got.iter().enumerate() {
                        self.write_byte(addr + i as u32, v);
                    }
                    self.push_ack();
                    self.instructions += 1;
                } else {
                    self.pending = Some(Pending::StsData {
                        addr,
                        data_len,
                        got,
                    });
                }
            }
            Some(Pending::StPtrAddr { len, mut got }) => {
                got.push(byte);
                if got.len() == len {
                    self.pointer = le_address(&got);
                    self.push_ack();
                    self.instructions += 1;
                } else {
                    self.pending = Some(Pending::StPtrAddr { len, got });
                }
            }
            Some(Pending::StPtrData {
                data_len,
                mut got,
                remaining,
            }) => {
                got.push(byte);
                if got.len() == data_len {
                    for &v in &got {
                        let addr = self.pointer;
                        self.write_byte(addr, v);
                        self.pointer += 1;
                    }
                    self.push_ack();
                    self.instructions += 1;
                    if remaining > 1 {
                        self.pending = Some(Pending::StPtrData {
                            data_len,
                            got: Vec::new(),
                            remaining: remaining - 1,
                        });
                    }
                } else {
                    self.pending = Some(Pending::StPtrData {
                        data_len,
                        got,
                        remaining,
                    });
                }
            }
            Some(Pending::Stcs { reg }) => {
                self.stcs(reg, byte);
                self.instructions += 1;
            }
            Some(Pending::RepeatCount) => {
                self.repeat = byte as usize;
                self.instructions += 1;
            }
            Some(Pending::Key { remaining, mut got }) => {
                got.push(byte);
                if got.len() == remaining {
                    self.handle_key(&got);
                    self.instructions += 1;
                } else {
                    self.pending = Some(Pending::Key { remaining, got });
                }
            }
        }
    }

    fn decode_opcode(&mut self, op: u8) {
        match op & 0xE0 {
            opcodes::LDS => {
                self.pending = Some(Pending::LdsAddr {
                    addr_len: addr_field_len(op),
                    data_len: data_field_len(op),
                    got: Vec::new(),
                });
            }
            opcodes::STS => {
                self.pending = Some(Pending::StsAddr {
                    addr_len: addr_field_len(op),
                    data_len: data_field_len(op),
                    got: Vec::new(),
                });
            }
            opcodes::LD => {
                let data_len = data_field_len(op);
                let n = self.take_repeat();
                for _ in 0..n {
                    for _ in 0..data_len {
                        let addr = self.pointer;
                        let v = self.read_byte_raw(addr);
                        self.out.push_back(v);
                        self.pointer += 1;
                    }
                }
                self.instructions += 1;
            }
            opcodes::ST => {
                if op & 0x0C == opcodes::PTR_ADDRESS {
                    // Pointer width rides in the data-size field.
                    self.pending = Some(Pending::StPtrAddr {
                        len: data_field_len(op),
                        got: Vec::new(),
                    });
                } else {
                    let remaining = self.take_repeat();
                    self.pending = Some(Pending::StPtrData {
                        data_len: data_field_len(op),
                        got: Vec::new(),
                        remaining,
                    });
                }
            }
            opcodes::LDCS => {
                let v = self.ldcs(op & 0x0F);
                self.out.push_back(v);
                self.instructions += 1;
            }
            opcodes::STCS => {
                self.pending = Some(Pending::Stcs { reg: op & 0x0F });
            }
            opcodes::REPEAT => {
                self.pending = Some(Pending::RepeatCount);
            }
            opcodes::KEY => {
                if op & opcodes::KEY_SIB != 0 {
                    let sib = match self.cfg.variant {
                        SimVariant::V0 => SIB_V0,
                        SimVariant::V2 => SIB_V2,
                    };
                    for i in 0..SIB_LENGTH {
                        self.out.push_back(sib.get(i).copied().unwrap_or(b' '));
                    }
                    self.instructions += 1;
                } else {
                    self.pending = Some(Pending::Key {
                        remaining: 8usize << (op & 0x03),
                        got: Vec::new(),
                    });
                }
            }
            _ => unreachable!(),
        }
    }
}

fn addr_field_len(op: u8) -> usize {
    if op & 0x0C == opcodes::ADDRESS_24 { 3 } else { 2 }
}

fn data_field_len(op: u8) -> usize {
    match op & 0x03 {
        0x02 => 3,
        0x01 => 2,
        _ => 1,
    }
}

fn le_address(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | (b as u32) << (8 * i))
}

impl Transport for SimTarget {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.fail_echo {
            return Err(Error::ProtocolAck {
                op: "echo read-back",
                expected: data[0],
                actual: !data[0],
            });
        }
        for &byte in data {
            self.feed(byte);
        }
        Ok(())
    }

    fn receive(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.out.len() < n {
            self.out.clear();
            return Err(Error::TransportTimeout("response read"));
        }
        Ok(self.out.drain(..n).collect())
    }

    fn send_break(&mut self) -> Result<()> {
        // A break aborts any partially decoded instruction.
        self.pending = None;
        self.repeat = 0;
        self.out.clear();
        Ok(())
    }
}
