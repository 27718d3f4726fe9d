//! Entry Indexer
//!
//! One linear walk over `.debug_info` copies every debugging information
//! entry into an owned arena keyed by its section offset. Nesting is kept
//! as a depth plus a parent offset, computed once from the depth stack while
//! walking; encounter order is preserved separately because later passes
//! depend on it (member allocation follows "the last composite seen").
//!
//! Attribute values are normalized into [`AttrValue`] so the resolvers
//! never deal with DWARF forms directly.

use super::lines::{self, LineRow};
use super::ranges::{entry_ranges, RangeSection, SourceRange};
use super::sections::BinarySections;
use crate::error::{Result, SourceError};
use gimli::{AttributeValue, DwAt, DwTag, EndianSlice, RunTimeEndian, Unit};
use std::collections::{BTreeMap, HashMap};

/// The reader type used for all DWARF parsing
pub type Reader<'a> = EndianSlice<'a, RunTimeEndian>;

/// The only `.debug_info` unit version accepted
pub const SUPPORTED_DWARF_VERSION: u16 = 4;

/// Sections that must be present for a model to be built
pub const MANDATORY_SECTIONS: &[&str] = &[".debug_info", ".debug_abbrev", ".debug_line"];

/// Attributes copied into the index; the resolvers read nothing else
pub const INDEXED_ATTRIBUTES: &[DwAt] = &[
    gimli::DW_AT_name,
    gimli::DW_AT_linkage_name,
    gimli::DW_AT_MIPS_linkage_name,
    gimli::DW_AT_comp_dir,
    gimli::DW_AT_stmt_list,
    gimli::DW_AT_low_pc,
    gimli::DW_AT_high_pc,
    gimli::DW_AT_ranges,
    gimli::DW_AT_type,
    gimli::DW_AT_byte_size,
    gimli::DW_AT_encoding,
    gimli::DW_AT_data_member_location,
    gimli::DW_AT_count,
    gimli::DW_AT_upper_bound,
    gimli::DW_AT_location,
    gimli::DW_AT_frame_base,
    gimli::DW_AT_const_value,
    gimli::DW_AT_abstract_origin,
    gimli::DW_AT_specification,
    gimli::DW_AT_declaration,
    gimli::DW_AT_external,
    gimli::DW_AT_decl_file,
    gimli::DW_AT_decl_line,
    gimli::DW_AT_call_file,
    gimli::DW_AT_call_line,
    gimli::DW_AT_inline,
];

/// A decoded attribute value, classified by what it can be used for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// A target address (`DW_FORM_addr`)
    Address(u32),
    /// An unsigned constant (`udata`, `dataN`, file indices, encodings)
    Udata(u64),
    /// A signed constant (`sdata`)
    Sdata(i64),
    /// A flag
    Flag(bool),
    /// An expression or block (`exprloc`, `blockN`)
    Block(Vec<u8>),
    /// Offset into `.debug_loc`
    LocList(usize),
    /// Offset into `.debug_ranges`
    RangeList(usize),
    /// Reference to another entry, as a `.debug_info` offset
    Reference(usize),
    /// A string
    String(String),
    /// Offset into `.debug_line`
    LinePtr(usize),
    /// A class this crate does not interpret
    Other,
}

impl AttrValue {
    /// The value as an unsigned constant, if it has a constant class
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::Udata(v) => Some(*v),
            AttrValue::Sdata(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// The value as a signed constant
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Udata(v) => Some(*v as i64),
            AttrValue::Sdata(v) => Some(*v),
            _ => None,
        }
    }

    /// The referenced entry offset
    pub fn as_reference(&self) -> Option<usize> {
        match self {
            AttrValue::Reference(offset) => Some(*offset),
            _ => None,
        }
    }

    /// The value as a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// One debugging information entry
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Offset in `.debug_info`
    pub offset: usize,
    /// Entry tag
    pub tag: DwTag,
    /// Offset of the owning compile unit entry
    pub unit: usize,
    /// Nesting depth, zero for the compile unit entry
    pub depth: usize,
    /// Enclosing entry, `None` for the compile unit entry
    pub parent: Option<usize>,
    /// Attributes in declaration order
    pub attrs: Vec<(DwAt, AttrValue)>,
}

impl Entry {
    /// Create an entry with no attributes at depth zero
    pub fn new(offset: usize, tag: DwTag) -> Self {
        Self {
            offset,
            tag,
            unit: 0,
            depth: 0,
            parent: None,
            attrs: Vec::new(),
        }
    }

    /// Set the nesting depth
    pub fn at_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Append an attribute
    pub fn with_attr(mut self, name: DwAt, value: AttrValue) -> Self {
        self.attrs.push((name, value));
        self
    }

    /// Look up an attribute
    pub fn attr(&self, name: DwAt) -> Option<&AttrValue> {
        self.attrs
            .iter()
            .find(|(at, _)| *at == name)
            .map(|(_, value)| value)
    }

    /// Check whether an attribute is present
    pub fn has_attr(&self, name: DwAt) -> bool {
        self.attr(name).is_some()
    }

    /// `DW_AT_name`
    pub fn name(&self) -> Option<&str> {
        self.attr(gimli::DW_AT_name).and_then(AttrValue::as_str)
    }

    /// `DW_AT_linkage_name`, or the older MIPS spelling
    pub fn linkage_name(&self) -> Option<&str> {
        self.attr(gimli::DW_AT_linkage_name)
            .or_else(|| self.attr(gimli::DW_AT_MIPS_linkage_name))
            .and_then(AttrValue::as_str)
    }

    /// A flag attribute; absent flags are false
    pub fn flag(&self, name: DwAt) -> bool {
        matches!(self.attr(name), Some(AttrValue::Flag(true)))
    }

    /// An unsigned constant attribute
    pub fn udata(&self, name: DwAt) -> Option<u64> {
        self.attr(name).and_then(AttrValue::as_u64)
    }

    /// A reference attribute
    pub fn reference(&self, name: DwAt) -> Option<usize> {
        self.attr(name).and_then(AttrValue::as_reference)
    }

    /// `DW_AT_byte_size`
    pub fn byte_size(&self) -> Option<u32> {
        self.udata(gimli::DW_AT_byte_size).map(|v| v as u32)
    }

    /// `DW_AT_type`
    pub fn type_ref(&self) -> Option<usize> {
        self.reference(gimli::DW_AT_type)
    }
}

/// A compile unit and the line-table data attached to it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileUnit {
    /// Offset of the compile unit entry
    pub offset: usize,
    /// `DW_AT_name`
    pub name: String,
    /// `DW_AT_comp_dir`
    pub comp_dir: Option<String>,
    /// Base address for range and location lists (`DW_AT_low_pc`)
    pub base_address: u32,
    /// Code covered by the unit
    pub ranges: Vec<SourceRange>,
    /// Line-table file names by `DW_AT_decl_file` index
    pub files: HashMap<u64, String>,
    /// Line-table rows in program order
    pub rows: Vec<LineRow>,
}

impl CompileUnit {
    /// Create a unit with no files or rows
    pub fn new(offset: usize, name: impl Into<String>) -> Self {
        Self {
            offset,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the base address
    pub fn with_base_address(mut self, base: u32) -> Self {
        self.base_address = base;
        self
    }

    /// Register a file under its line-table index
    pub fn with_file(mut self, index: u64, path: impl Into<String>) -> Self {
        self.files.insert(index, path.into());
        self
    }

    /// Set the line-table rows
    pub fn with_rows(mut self, rows: Vec<LineRow>) -> Self {
        self.rows = rows;
        self
    }

    /// Resolve a `DW_AT_decl_file` index
    pub fn file(&self, index: u64) -> Option<&str> {
        self.files.get(&index).map(String::as_str)
    }
}

/// All entries of `.debug_info`, addressable by offset
#[derive(Debug, Clone, Default)]
pub struct EntryIndex {
    order: Vec<usize>,
    entries: HashMap<usize, Entry>,
    units: BTreeMap<usize, CompileUnit>,
    children: HashMap<usize, Vec<usize>>,
    stack: Vec<(usize, usize)>,
}

impl EntryIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every unit of a binary
    ///
    /// Every unit must be 32-bit DWARF version 4. Line tables are read
    /// alongside so each [`CompileUnit`] carries its file names and rows.
    pub fn build(sections: &dyn BinarySections) -> Result<Self> {
        for name in MANDATORY_SECTIONS {
            if sections.section(name).is_none() {
                return Err(SourceError::MissingSection(name));
            }
        }

        let endian = sections.endian();
        let dwarf = gimli::Dwarf::load(|id| {
            Ok::<_, gimli::Error>(EndianSlice::new(
                sections.section(id.name()).unwrap_or(&[]),
                endian,
            ))
        })?;
        let range_section =
            RangeSection::new(sections.section(".debug_ranges").unwrap_or(&[]), endian);

        let mut index = EntryIndex::new();
        let mut units = dwarf.units();
        let mut next_offset = 0usize;
        while let Some(header) = units.next()? {
            let unit_offset = next_offset;
            next_offset += header.length_including_self();

            if header.version() != SUPPORTED_DWARF_VERSION {
                return Err(SourceError::UnsupportedDwarfVersion {
                    version: header.version(),
                    offset: unit_offset,
                });
            }
            if header.format() != gimli::Format::Dwarf32 {
                return Err(SourceError::Unsupported(format!(
                    "64-bit DWARF in unit at offset 0x{:x}",
                    unit_offset
                )));
            }

            let unit = dwarf.unit(header)?;
            index.index_unit(&dwarf, &unit, &range_section)?;
        }

        tracing::info!(
            "Indexed {} entries in {} compile units",
            index.len(),
            index.units.len()
        );

        Ok(index)
    }

    fn index_unit(
        &mut self,
        dwarf: &gimli::Dwarf<Reader<'_>>,
        unit: &Unit<Reader<'_>>,
        ranges: &RangeSection<'_>,
    ) -> Result<()> {
        let mut cursor = unit.entries();
        let mut depth: isize = 0;
        let mut unit_offset = None;

        while let Some((delta, entry)) = cursor.next_dfs()? {
            depth += delta;
            let Some(offset) = entry
                .offset()
                .to_debug_info_offset(&unit.header)
                .map(|o| o.0)
            else {
                continue;
            };

            let mut converted = Entry::new(offset, entry.tag()).at_depth(depth.max(0) as usize);
            for &name in INDEXED_ATTRIBUTES {
                if let Some(value) = entry.attr_value(name)? {
                    converted
                        .attrs
                        .push((name, convert_attr(dwarf, unit, name, value)));
                }
            }

            let cu = match unit_offset {
                Some(cu) => cu,
                None => {
                    let cu = self.register_unit(dwarf, unit, &converted, ranges)?;
                    unit_offset = Some(cu);
                    cu
                }
            };
            self.push_entry(cu, converted)?;
        }

        Ok(())
    }

    fn register_unit(
        &mut self,
        dwarf: &gimli::Dwarf<Reader<'_>>,
        unit: &Unit<Reader<'_>>,
        root: &Entry,
        ranges: &RangeSection<'_>,
    ) -> Result<usize> {
        let mut cu = CompileUnit::new(root.offset, root.name().unwrap_or_default());
        cu.comp_dir = root
            .attr(gimli::DW_AT_comp_dir)
            .and_then(AttrValue::as_str)
            .map(str::to_string);
        if let Some(AttrValue::Address(low)) = root.attr(gimli::DW_AT_low_pc) {
            cu.base_address = *low;
        }
        cu.ranges = entry_ranges(root, &cu, ranges)?;

        let (files, rows) = lines::read_line_program(dwarf, unit, cu.comp_dir.as_deref())?;
        cu.files = files;
        cu.rows = rows;

        tracing::debug!(
            "Unit {} at 0x{:x}: {} files, {} line rows",
            cu.name,
            cu.offset,
            cu.files.len(),
            cu.rows.len()
        );

        let offset = cu.offset;
        self.push_unit(cu);
        Ok(offset)
    }

    /// Register a compile unit; subsequent entries nest from scratch
    pub fn push_unit(&mut self, unit: CompileUnit) {
        self.stack.clear();
        self.units.insert(unit.offset, unit);
    }

    /// Append an entry owned by `unit`
    ///
    /// The parent is derived from the depth of the entries pushed before it.
    pub fn push_entry(&mut self, unit: usize, mut entry: Entry) -> Result<()> {
        if !self.units.contains_key(&unit) {
            return Err(SourceError::UnknownCompileUnit {
                offset: entry.offset,
                unit,
            });
        }

        while matches!(self.stack.last(), Some((depth, _)) if *depth >= entry.depth) {
            self.stack.pop();
        }
        entry.unit = unit;
        entry.parent = self.stack.last().map(|(_, offset)| *offset);
        if let Some(parent) = entry.parent {
            self.children.entry(parent).or_default().push(entry.offset);
        }

        self.stack.push((entry.depth, entry.offset));
        self.order.push(entry.offset);
        self.entries.insert(entry.offset, entry);
        Ok(())
    }

    /// Look up an entry by offset
    pub fn entry(&self, offset: usize) -> Option<&Entry> {
        self.entries.get(&offset)
    }

    /// The compile unit owning the entry at `offset`
    pub fn unit_of(&self, offset: usize) -> Result<&CompileUnit> {
        let unit = self
            .entries
            .get(&offset)
            .map(|entry| entry.unit)
            .unwrap_or(offset);
        self.units
            .get(&unit)
            .ok_or(SourceError::UnknownCompileUnit { offset, unit })
    }

    /// Look up a compile unit by the offset of its entry
    pub fn unit(&self, offset: usize) -> Option<&CompileUnit> {
        self.units.get(&offset)
    }

    /// All compile units in section order
    pub fn units(&self) -> impl Iterator<Item = &CompileUnit> {
        self.units.values()
    }

    /// Direct children of an entry
    pub fn children(&self, offset: usize) -> &[usize] {
        self.children
            .get(&offset)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Entries in encounter order
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.order.iter().filter_map(|offset| self.entries.get(offset))
    }

    /// Enclosing entries, innermost first
    pub fn ancestors(&self, offset: usize) -> impl Iterator<Item = &Entry> {
        let mut next = self.entry(offset).and_then(|e| e.parent);
        std::iter::from_fn(move || {
            let entry = self.entry(next?)?;
            next = entry.parent;
            Some(entry)
        })
    }

    /// The entry an `abstract_origin` or `specification` attribute points at
    pub fn origin_of(&self, entry: &Entry) -> Option<&Entry> {
        entry
            .reference(gimli::DW_AT_abstract_origin)
            .or_else(|| entry.reference(gimli::DW_AT_specification))
            .and_then(|offset| self.entry(offset))
    }

    /// Number of indexed entries
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no entries were indexed
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Normalize a gimli attribute value
fn convert_attr(
    dwarf: &gimli::Dwarf<Reader<'_>>,
    unit: &Unit<Reader<'_>>,
    name: DwAt,
    value: AttributeValue<Reader<'_>>,
) -> AttrValue {
    match value {
        AttributeValue::Addr(addr) => AttrValue::Address(addr as u32),
        AttributeValue::Udata(v) => AttrValue::Udata(v),
        AttributeValue::Data1(v) => AttrValue::Udata(v as u64),
        AttributeValue::Data2(v) => AttrValue::Udata(v as u64),
        AttributeValue::Data4(v) => AttrValue::Udata(v as u64),
        AttributeValue::Data8(v) => AttrValue::Udata(v),
        AttributeValue::Sdata(v) => AttrValue::Sdata(v),
        AttributeValue::Flag(f) => AttrValue::Flag(f),
        AttributeValue::FileIndex(i) => AttrValue::Udata(i),
        AttributeValue::Encoding(e) => AttrValue::Udata(e.0 as u64),
        AttributeValue::Exprloc(expr) => AttrValue::Block(expr.0.slice().to_vec()),
        AttributeValue::Block(block) => AttrValue::Block(block.slice().to_vec()),
        AttributeValue::LocationListsRef(offset) => AttrValue::LocList(offset.0),
        AttributeValue::RangeListsRef(offset) => AttrValue::RangeList(offset.0),
        AttributeValue::DebugLineRef(offset) => AttrValue::LinePtr(offset.0),
        AttributeValue::SecOffset(offset) => match name {
            gimli::DW_AT_location | gimli::DW_AT_frame_base => AttrValue::LocList(offset),
            gimli::DW_AT_ranges => AttrValue::RangeList(offset),
            gimli::DW_AT_stmt_list => AttrValue::LinePtr(offset),
            _ => AttrValue::Other,
        },
        AttributeValue::UnitRef(offset) => offset
            .to_debug_info_offset(&unit.header)
            .map(|o| AttrValue::Reference(o.0))
            .unwrap_or(AttrValue::Other),
        AttributeValue::DebugInfoRef(offset) => AttrValue::Reference(offset.0),
        AttributeValue::DebugStrRef(_) | AttributeValue::String(_) => dwarf
            .attr_string(unit, value)
            .map(|s| AttrValue::String(s.to_string_lossy().into_owned()))
            .unwrap_or(AttrValue::Other),
        other => {
            tracing::trace!("Unhandled attribute class for {}: {:?}", name, other);
            AttrValue::Other
        }
    }
}
