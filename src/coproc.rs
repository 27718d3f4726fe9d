//! Capabilities consumed from the embedding emulator
//!
//! The source model never drives the coprocessor itself. It reads state
//! through the narrow [`Coprocessor`] trait, learns where the cartridge
//! loaded each ELF section through [`CartridgeMapping`], and asks a
//! [`Disassembler`] for opaque per-instruction text.
//!
//! Two small implementations are provided: [`SnapshotCoprocessor`], a
//! register/memory snapshot useful for offline evaluation and tests, and
//! [`HalfwordDisassembler`], which splits Thumb code into 16/32-bit opcodes
//! without decoding mnemonics.

use std::collections::{BTreeMap, HashMap};

/// Number of core registers on the ARM coprocessor
pub const NUM_REGISTERS: usize = 16;

/// Read access to a running (or frozen) ARM coprocessor
///
/// Both methods report failure with `None` instead of an error; the caller
/// degrades the affected variable or frame to "unresolved".
#[cfg_attr(test, mockall::automock)]
pub trait Coprocessor {
    /// Read the 32-bit little-endian word starting at `address`
    fn peek(&self, address: u32) -> Option<u32>;

    /// Read core register `register` (0-15, 13 = SP, 14 = LR, 15 = PC)
    fn register(&self, register: u16) -> Option<u32>;
}

/// Where the cartridge placed each section of the ELF in coprocessor memory
pub trait CartridgeMapping {
    /// Load origin of a section, or `None` to use its linked address
    fn section_origin(&self, section: &str) -> Option<u32>;
}

/// Mapping for binaries linked at fixed addresses
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkedAddresses;

impl CartridgeMapping for LinkedAddresses {
    fn section_origin(&self, _section: &str) -> Option<u32> {
        None
    }
}

/// Explicit per-section load origins, as reported by a cartridge that
/// relocates the ELF while loading it
#[derive(Debug, Clone, Default)]
pub struct SectionOrigins {
    origins: HashMap<String, u32>,
}

impl SectionOrigins {
    /// Create an empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the origin of one section
    pub fn with(mut self, section: impl Into<String>, origin: u32) -> Self {
        self.origins.insert(section.into(), origin);
        self
    }
}

impl CartridgeMapping for SectionOrigins {
    fn section_origin(&self, section: &str) -> Option<u32> {
        self.origins.get(section).copied()
    }
}

/// One decoded opcode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisasmEntry {
    /// Address of the first byte of the opcode
    pub address: u32,
    /// Raw opcode (16-bit opcodes occupy the low half)
    pub opcode: u32,
    /// Opcode size in bytes
    pub size: u8,
    /// Disassembly text; opaque to the source model
    pub text: String,
}

/// Turns executable bytes into per-instruction annotations
pub trait Disassembler {
    /// Disassemble `data`, which is loaded at `origin`
    fn disassemble(&self, origin: u32, data: &[u8]) -> Vec<DisasmEntry>;
}

/// Splits Thumb code into opcodes by width without decoding them
#[derive(Debug, Clone, Copy, Default)]
pub struct HalfwordDisassembler;

impl HalfwordDisassembler {
    /// First halfwords with the top five bits 0b11101, 0b11110 or 0b11111
    /// begin a 32-bit Thumb-2 instruction
    fn is_wide(halfword: u16) -> bool {
        (halfword >> 11) >= 0b11101
    }
}

impl Disassembler for HalfwordDisassembler {
    fn disassemble(&self, origin: u32, data: &[u8]) -> Vec<DisasmEntry> {
        let mut entries = Vec::with_capacity(data.len() / 2);
        let mut offset = 0usize;

        while offset + 2 <= data.len() {
            let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
            let address = origin.wrapping_add(offset as u32);

            if Self::is_wide(first) && offset + 4 <= data.len() {
                let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
                entries.push(DisasmEntry {
                    address,
                    opcode: ((first as u32) << 16) | second as u32,
                    size: 4,
                    text: format!("{:04x} {:04x}", first, second),
                });
                offset += 4;
            } else {
                entries.push(DisasmEntry {
                    address,
                    opcode: first as u32,
                    size: 2,
                    text: format!("{:04x}", first),
                });
                offset += 2;
            }
        }

        entries
    }
}

/// A frozen copy of coprocessor registers and memory
///
/// Memory is stored byte-wise so unaligned and sub-word reads behave like
/// the real bus. A peek fails unless all four bytes are present.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCoprocessor {
    registers: [Option<u32>; NUM_REGISTERS],
    memory: BTreeMap<u32, u8>,
}

impl SnapshotCoprocessor {
    /// Create a snapshot with no registers or memory
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a register value
    pub fn with_register(mut self, register: u16, value: u32) -> Self {
        self.set_register(register, value);
        self
    }

    /// Store a little-endian word
    pub fn with_word(mut self, address: u32, value: u32) -> Self {
        self.write_bytes(address, &value.to_le_bytes());
        self
    }

    /// Set a register value in place
    pub fn set_register(&mut self, register: u16, value: u32) {
        if let Some(slot) = self.registers.get_mut(register as usize) {
            *slot = Some(value);
        }
    }

    /// Store raw bytes starting at `address`
    pub fn write_bytes(&mut self, address: u32, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(address.wrapping_add(i as u32), *byte);
        }
    }
}

impl Coprocessor for SnapshotCoprocessor {
    fn peek(&self, address: u32) -> Option<u32> {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = *self.memory.get(&address.wrapping_add(i as u32))?;
        }
        Some(u32::from_le_bytes(bytes))
    }

    fn register(&self, register: u16) -> Option<u32> {
        self.registers.get(register as usize).copied().flatten()
    }
}
