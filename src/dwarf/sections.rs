//! Binary section access
//!
//! The DWARF engine reads the binary only through [`BinarySections`]: named
//! sections, byte order, the symbol table and the list of executable
//! sections. [`ElfSections`] implements it for 32-bit ELF files using the
//! `object` crate, including relocation of the debug sections when the
//! cartridge loads a relocatable object.
//!
//! Symbol names are demangled (C++ and Rust) the same way for every
//! consumer, and Thumb function addresses have their interworking bit
//! cleared.

use crate::coproc::CartridgeMapping;
use crate::error::{Result, SourceError};
use cpp_demangle::Symbol as CppSymbol;
use gimli::RunTimeEndian;
use object::{
    Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget,
    SectionKind, SymbolKind,
};
use rustc_demangle::demangle as rust_demangle;
use std::collections::HashMap;

/// Debug sections copied out of the ELF (and relocated when needed)
pub const DEBUG_SECTIONS: &[&str] = &[
    ".debug_info",
    ".debug_abbrev",
    ".debug_str",
    ".debug_line",
    ".debug_loc",
    ".debug_ranges",
    ".debug_frame",
];

/// Kind of a symbol table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfSymbolKind {
    /// Code
    Function,
    /// Data object (variable)
    Object,
}

/// A symbol with its load address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfSymbol {
    /// Demangled name
    pub name: String,
    /// Original (mangled) name
    pub mangled_name: String,
    /// Load address (Thumb bit cleared for functions)
    pub address: u32,
    /// Size in bytes, zero when unknown
    pub size: u32,
    /// Symbol kind
    pub kind: ElfSymbolKind,
}

impl ElfSymbol {
    /// Create a function symbol
    pub fn function(name: impl Into<String>, address: u32, size: u32) -> Self {
        let name = name.into();
        Self {
            mangled_name: name.clone(),
            name,
            address,
            size,
            kind: ElfSymbolKind::Function,
        }
    }
}

/// An executable section placed at its load origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableSection {
    /// Section name
    pub name: String,
    /// Address of the first byte in coprocessor memory
    pub origin: u32,
    /// Section contents
    pub data: Vec<u8>,
}

/// Read access to the sections of a binary
///
/// Debug sections are expected to already be relocated: every address in
/// them is a coprocessor address.
pub trait BinarySections {
    /// Contents of a named section
    fn section(&self, name: &str) -> Option<&[u8]>;

    /// Byte order of the binary
    fn endian(&self) -> RunTimeEndian;

    /// Function and data symbols
    fn symbols(&self) -> &[ElfSymbol];

    /// Sections holding code
    fn executable_sections(&self) -> &[ExecutableSection];
}

/// Sections of a 32-bit ELF file
#[derive(Debug, Clone)]
pub struct ElfSections {
    endian: RunTimeEndian,
    relocatable: bool,
    sections: HashMap<String, Vec<u8>>,
    symbols: Vec<ElfSymbol>,
    executable: Vec<ExecutableSection>,
}

impl ElfSections {
    /// Read an ELF file from disk
    pub fn load(path: impl AsRef<std::path::Path>, mapping: &dyn CartridgeMapping) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            SourceError::Elf(format!("Failed to read file {}: {}", path.display(), e))
        })?;
        Self::parse(&data, mapping)
    }

    /// Parse ELF data
    pub fn parse(data: &[u8], mapping: &dyn CartridgeMapping) -> Result<Self> {
        let file = object::File::parse(data)
            .map_err(|e| SourceError::Elf(format!("Failed to parse ELF: {}", e)))?;

        if file.is_64() {
            return Err(SourceError::Unsupported("64-bit ELF".to_string()));
        }
        if file.architecture() != object::Architecture::Arm {
            tracing::warn!("ELF architecture is {:?}, expected ARM", file.architecture());
        }

        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let relocatable = file.kind() == ObjectKind::Relocatable;

        let mut sections = HashMap::new();
        for name in DEBUG_SECTIONS {
            let Some(section) = file.section_by_name(name) else {
                continue;
            };
            let mut bytes = section.uncompressed_data()?.into_owned();
            if relocatable {
                apply_relocations(&file, &section, &mut bytes, endian, mapping);
            }
            sections.insert(name.to_string(), bytes);
        }

        let symbols = file
            .symbols()
            .filter_map(|symbol| parse_symbol(&file, &symbol, mapping))
            .collect::<Vec<_>>();

        let mut executable = Vec::new();
        for section in file.sections() {
            if section.kind() != SectionKind::Text {
                continue;
            }
            let data = section.uncompressed_data()?.into_owned();
            if data.is_empty() {
                continue;
            }
            executable.push(ExecutableSection {
                name: section.name().unwrap_or_default().to_string(),
                origin: section_origin(&section, mapping),
                data,
            });
        }

        tracing::info!(
            "ELF: {} debug sections, {} symbols, {} executable sections{}",
            sections.len(),
            symbols.len(),
            executable.len(),
            if relocatable { " (relocatable)" } else { "" },
        );

        Ok(Self {
            endian,
            relocatable,
            sections,
            symbols,
            executable,
        })
    }

    /// Whether the ELF was a relocatable object
    pub fn is_relocatable(&self) -> bool {
        self.relocatable
    }
}

impl BinarySections for ElfSections {
    fn section(&self, name: &str) -> Option<&[u8]> {
        self.sections.get(name).map(Vec::as_slice)
    }

    fn endian(&self) -> RunTimeEndian {
        self.endian
    }

    fn symbols(&self) -> &[ElfSymbol] {
        &self.symbols
    }

    fn executable_sections(&self) -> &[ExecutableSection] {
        &self.executable
    }
}

/// Load origin of a section: the cartridge's choice, else its linked address
fn section_origin(section: &object::Section<'_, '_>, mapping: &dyn CartridgeMapping) -> u32 {
    section
        .name()
        .ok()
        .and_then(|name| mapping.section_origin(name))
        .unwrap_or(section.address() as u32)
}

/// Translate a linked address inside `section` to its load address
fn load_address(
    section: &object::Section<'_, '_>,
    address: u64,
    mapping: &dyn CartridgeMapping,
) -> u32 {
    let offset = address.wrapping_sub(section.address()) as u32;
    section_origin(section, mapping).wrapping_add(offset)
}

/// Apply `R_ARM_ABS32` relocations from the section's relocation table
fn apply_relocations(
    file: &object::File<'_>,
    section: &object::Section<'_, '_>,
    bytes: &mut [u8],
    endian: RunTimeEndian,
    mapping: &dyn CartridgeMapping,
) {
    let mut applied = 0usize;
    let mut skipped = 0usize;

    for (offset, reloc) in section.relocations() {
        let r_type = match reloc.flags() {
            RelocationFlags::Elf { r_type } => r_type,
            _ => continue,
        };
        if r_type != object::elf::R_ARM_ABS32 {
            skipped += 1;
            continue;
        }

        let RelocationTarget::Symbol(index) = reloc.target() else {
            skipped += 1;
            continue;
        };
        let Ok(symbol) = file.symbol_by_index(index) else {
            skipped += 1;
            continue;
        };

        let value = match symbol
            .section_index()
            .and_then(|idx| file.section_by_index(idx).ok())
        {
            Some(target) => load_address(&target, symbol.address(), mapping),
            None => symbol.address() as u32,
        };

        let offset = offset as usize;
        let Some(slot) = bytes.get_mut(offset..offset + 4) else {
            skipped += 1;
            continue;
        };
        let existing = [slot[0], slot[1], slot[2], slot[3]];
        let addend = if reloc.has_implicit_addend() {
            match endian {
                RunTimeEndian::Little => u32::from_le_bytes(existing),
                RunTimeEndian::Big => u32::from_be_bytes(existing),
            }
        } else {
            reloc.addend() as u32
        };
        let relocated = value.wrapping_add(addend);
        let out = match endian {
            RunTimeEndian::Little => relocated.to_le_bytes(),
            RunTimeEndian::Big => relocated.to_be_bytes(),
        };
        slot.copy_from_slice(&out);
        applied += 1;
    }

    if skipped > 0 {
        tracing::warn!(
            "{}: skipped {} unsupported relocations",
            section.name().unwrap_or("?"),
            skipped
        );
    }
    tracing::debug!(
        "{}: applied {} relocations",
        section.name().unwrap_or("?"),
        applied
    );
}

/// Parse a single symbol from the symbol table
fn parse_symbol(
    file: &object::File<'_>,
    symbol: &object::Symbol<'_, '_>,
    mapping: &dyn CartridgeMapping,
) -> Option<ElfSymbol> {
    let name = symbol.name().ok()?;
    // ARM mapping symbols ($a, $t, $d) mark code/data boundaries, not entities
    if name.is_empty() || name.starts_with('$') {
        return None;
    }

    let kind = match symbol.kind() {
        SymbolKind::Text => ElfSymbolKind::Function,
        SymbolKind::Data => ElfSymbolKind::Object,
        _ => return None,
    };

    let section = file.section_by_index(symbol.section_index()?).ok()?;
    let mut address = load_address(&section, symbol.address(), mapping);
    if kind == ElfSymbolKind::Function {
        address &= !1;
    }

    Some(ElfSymbol {
        name: demangle_symbol(name),
        mangled_name: name.to_string(),
        address,
        size: symbol.size() as u32,
        kind,
    })
}

/// Demangle a symbol name (supports C++ and Rust mangling)
pub fn demangle_symbol(mangled: &str) -> String {
    if let Ok(symbol) = CppSymbol::new(mangled) {
        if let Ok(demangled) = symbol.demangle(&cpp_demangle::DemangleOptions::default()) {
            return demangled;
        }
    }

    let demangled = rust_demangle(mangled).to_string();
    if demangled != mangled {
        return demangled;
    }

    mangled.to_string()
}
