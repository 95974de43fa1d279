//! AN3155 USART bootloader protocol constants and chip table

pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Largest payload accepted by a single read or write memory command
pub const MAX_CHUNK: usize = 256;

/// Default base address of the main flash array
pub const FLASH_BASE: u32 = 0x0800_0000;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    /// Command byte followed by its complement, as sent on the wire
    pub fn frame(self) -> [u8; 2] {
        let c = self as u8;
        [c, c ^ 0xFF]
    }
}

/// XOR checksum over a frame, as appended to addresses and data blocks
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Address frame: four big-endian bytes followed by their checksum
pub fn address_frame(addr: u32) -> [u8; 5] {
    let b = addr.to_be_bytes();
    [b[0], b[1], b[2], b[3], checksum(&b)]
}

/// Static description of a supported part
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chip {
    pub pid: u16,
    pub name: &'static str,
    pub flash_base: u32,
    /// Location of the 96-bit unique device identifier
    pub uid_addr: u32,
}

const UID_F0_F3: u32 = 0x1FFF_F7AC;
const UID_F1: u32 = 0x1FFF_F7E8;
const UID_F2_F4: u32 = 0x1FFF_7A10;
const UID_F7: u32 = 0x1FF0_F420;
const UID_L0: u32 = 0x1FF8_0050;
const UID_L4_G: u32 = 0x1FFF_7590;
const UID_H7: u32 = 0x1FF1_E800;

const fn chip(pid: u16, name: &'static str, uid_addr: u32) -> Chip {
    Chip { pid, name, flash_base: FLASH_BASE, uid_addr }
}

pub const CHIPS: &[Chip] = &[
    chip(0x412, "STM32F10xxx low-density", UID_F1),
    chip(0x410, "STM32F10xxx medium-density", UID_F1),
    chip(0x414, "STM32F10xxx high-density", UID_F1),
    chip(0x430, "STM32F10xxx XL-density", UID_F1),
    chip(0x418, "STM32F105/107", UID_F1),
    chip(0x444, "STM32F03xx4/6", UID_F0_F3),
    chip(0x440, "STM32F05xxx/030x8", UID_F0_F3),
    chip(0x448, "STM32F07xxx", UID_F0_F3),
    chip(0x422, "STM32F30xxB/C", UID_F0_F3),
    chip(0x413, "STM32F40xxx/41xxx", UID_F2_F4),
    chip(0x419, "STM32F42xxx/43xxx", UID_F2_F4),
    chip(0x431, "STM32F411xx", UID_F2_F4),
    chip(0x421, "STM32F446xx", UID_F2_F4),
    chip(0x449, "STM32F74xxx/75xxx", UID_F7),
    chip(0x417, "STM32L05xxx/06xxx", UID_L0),
    chip(0x415, "STM32L47xxx/48xxx", UID_L4_G),
    chip(0x468, "STM32G431xx/441xx", UID_L4_G),
    chip(0x460, "STM32G07xxx/08xxx", UID_L4_G),
    chip(0x450, "STM32H74xxx/75xxx", UID_H7),
];

/// Look up a part by the product id returned from `GetId`
pub fn chip_by_pid(pid: u16) -> Option<&'static Chip> {
    CHIPS.iter().find(|c| c.pid == pid)
}

/// Fold a 96-bit unique id into a locally administered unicast MAC
pub fn uid_to_mac(uid: &[u8; 12]) -> [u8; 6] {
    let mut mac = [0u8; 6];
    for (i, m) in mac.iter_mut().enumerate() {
        *m = uid[i] ^ uid[i + 6];
    }
    mac[0] = (mac[0] & 0xFC) | 0x02;
    mac
}
