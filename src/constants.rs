//! UPDI wire protocol and NVM controller constants.

/// Every frame starts with a synchronization character.
pub const SYNC: u8 = 0x55;

/// Acknowledge byte returned after store instructions.
pub const ACK: u8 = 0x40;

/// Maximum number of operations one REPEAT instruction can prime.
pub const MAX_REPEAT_SIZE: usize = 256;

/// The System Information Block is always read as 32 bytes.
pub const SIB_LENGTH: usize = 32;

/// UPDI instruction set. The opcode occupies the upper bits, size and
/// pointer-mode fields the lower bits.
pub mod opcodes {
    pub const LDS: u8 = 0x00;
    pub const LD: u8 = 0x20;
    pub const STS: u8 = 0x40;
    pub const ST: u8 = 0x60;
    pub const LDCS: u8 = 0x80;
    pub const REPEAT: u8 = 0xA0;
    pub const STCS: u8 = 0xC0;
    pub const KEY: u8 = 0xE0;

    // Address size field of LDS/STS, bits [3:2]
    pub const ADDRESS_16: u8 = 0x04;
    pub const ADDRESS_24: u8 = 0x08;

    // Data size field, bits [1:0]
    pub const DATA_8: u8 = 0x00;
    pub const DATA_16: u8 = 0x01;
    pub const DATA_24: u8 = 0x02;

    // Pointer access mode of LD/ST, bits [3:2]
    pub const PTR_INC: u8 = 0x04;
    pub const PTR_ADDRESS: u8 = 0x08;

    // KEY instruction flags
    pub const KEY_SIB: u8 = 0x04;
    pub const KEY_64: u8 = 0x00;
    pub const SIB_32BYTES: u8 = 0x02;
}

/// Control/status register addresses reachable through LDCS/STCS.
pub mod cs {
    pub const STATUSA: u8 = 0x00;
    pub const CTRLA: u8 = 0x02;
    pub const CTRLB: u8 = 0x03;
    pub const ASI_KEY_STATUS: u8 = 0x07;
    pub const ASI_RESET_REQ: u8 = 0x08;
    pub const ASI_SYS_CTRLA: u8 = 0x0A;
    pub const ASI_SYS_STATUS: u8 = 0x0B;

    // CTRLA bits
    pub const CTRLA_IBDLY: u8 = 1 << 7;
    pub const CTRLA_RSD: u8 = 1 << 3;

    // CTRLB bits
    pub const CTRLB_CCDETDIS: u8 = 1 << 3;
    pub const CTRLB_UPDIDIS: u8 = 1 << 2;

    // ASI_KEY_STATUS bits
    pub const KEY_STATUS_CHIPERASE: u8 = 1 << 3;
    pub const KEY_STATUS_NVMPROG: u8 = 1 << 4;
    pub const KEY_STATUS_UROWWRITE: u8 = 1 << 5;

    // ASI_SYS_STATUS bits
    pub const SYS_STATUS_LOCKSTATUS: u8 = 1 << 0;
    pub const SYS_STATUS_UROWPROG: u8 = 1 << 2;
    pub const SYS_STATUS_NVMPROG: u8 = 1 << 3;

    // ASI_SYS_CTRLA bits
    pub const SYS_CTRLA_CLKREQ: u8 = 1 << 0;
    pub const SYS_CTRLA_UROW_FINAL: u8 = 1 << 1;

    /// Written to ASI_RESET_REQ to hold the device in reset; 0x00 releases.
    pub const RESET_REQ_SIGNATURE: u8 = 0x59;
}

/// 64-bit activation keys, as ASCII. The data link transmits them in
/// reverse byte order.
pub mod keys {
    pub const NVMPROG: &[u8; 8] = b"NVMProg ";
    pub const CHIPERASE: &[u8; 8] = b"NVMErase";
    pub const UROWWRITE: &[u8; 8] = b"NVMUs&te";
}

/// NVM controller register offsets from the controller base address.
/// The registers this tool touches sit at the same offsets on the v0
/// (tiny/mega) and v2 (Dx) controllers.
pub mod nvm {
    pub const CTRLA: u32 = 0x00;
    pub const STATUS: u32 = 0x02;
    pub const DATA_LO: u32 = 0x06;
    pub const ADDR_LO: u32 = 0x08;

    // STATUS bits
    pub const STATUS_FLASH_BUSY: u8 = 1 << 0;
    pub const STATUS_EEPROM_BUSY: u8 = 1 << 1;
    pub const STATUS_WRITE_ERROR: u8 = 1 << 2;
}

/// CTRLA command set of the v0 controller (tinyAVR-0/1, megaAVR-0).
pub mod nvm_v0 {
    pub const CMD_NOCMD: u8 = 0x00;
    pub const CMD_WRITE_PAGE: u8 = 0x01;
    pub const CMD_ERASE_PAGE: u8 = 0x02;
    pub const CMD_ERASE_WRITE_PAGE: u8 = 0x03;
    pub const CMD_PAGE_BUFFER_CLEAR: u8 = 0x04;
    pub const CMD_CHIP_ERASE: u8 = 0x05;
    pub const CMD_ERASE_EEPROM: u8 = 0x06;
    pub const CMD_WRITE_FUSE: u8 = 0x07;
}

/// CTRLA command set of the v2 controller (AVR Dx). There is no page
/// buffer; flash words are streamed directly while a write command is
/// armed.
pub mod nvm_v2 {
    pub const CMD_NOCMD: u8 = 0x00;
    pub const CMD_FLASH_WRITE: u8 = 0x02;
    pub const CMD_FLASH_PAGE_ERASE: u8 = 0x08;
    pub const CMD_EEPROM_ERASE_WRITE: u8 = 0x13;
    pub const CMD_CHIP_ERASE: u8 = 0x20;
    pub const CMD_EEPROM_ERASE: u8 = 0x30;
}
