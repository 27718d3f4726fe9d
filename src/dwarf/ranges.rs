//! Address ranges
//!
//! DWARF describes code extents as `[low, high)` where `high` is one past
//! the last instruction. Every range handed to the rest of the crate is a
//! [`SourceRange`] with an inclusive end; the conversion happens once, here.

use super::entries::{AttrValue, CompileUnit, Entry};
use gimli::{EndianSlice, Reader, RunTimeEndian};

/// Range-list entry value that selects a new base address
pub const BASE_ADDRESS_SELECTION: u32 = 0xffff_ffff;

/// An inclusive instruction address interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceRange {
    /// First address in the range
    pub start: u32,
    /// Last address in the range (inclusive)
    pub end: u32,
    /// Whether the range belongs to an inlined expansion
    pub inline: bool,
}

impl SourceRange {
    /// Create an inclusive range
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            inline: false,
        }
    }

    /// Convert a DWARF `[low, high)` pair; empty pairs yield `None`
    pub fn from_exclusive(low: u32, high: u32) -> Option<Self> {
        if high <= low {
            return None;
        }
        Some(Self::new(low, high - 1))
    }

    /// Mark the range as an inlined expansion
    pub fn inlined(mut self) -> Self {
        self.inline = true;
        self
    }

    /// Check whether `address` lies within the range
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address <= self.end
    }

    /// Number of bytes covered
    pub fn size(&self) -> u64 {
        self.end as u64 - self.start as u64 + 1
    }

    /// Check whether two ranges share at least one address
    pub fn overlaps(&self, other: &SourceRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Shift both ends by `delta`
    pub fn offset(self, delta: u32) -> Self {
        Self {
            start: self.start.wrapping_add(delta),
            end: self.end.wrapping_add(delta),
            inline: self.inline,
        }
    }
}

impl std::fmt::Display for SourceRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#010x}, {:#010x}]", self.start, self.end)?;
        if self.inline {
            write!(f, " inline")?;
        }
        Ok(())
    }
}

/// The `.debug_ranges` section
#[derive(Debug, Clone, Copy)]
pub struct RangeSection<'a> {
    data: &'a [u8],
    endian: RunTimeEndian,
}

impl<'a> RangeSection<'a> {
    /// Wrap raw section data
    pub fn new(data: &'a [u8], endian: RunTimeEndian) -> Self {
        Self { data, endian }
    }

    /// Decode the range list at `offset`
    ///
    /// `base` is the owning compile unit's base address. A pair whose first
    /// word is [`BASE_ADDRESS_SELECTION`] replaces the base for the pairs
    /// that follow; a `(0, 0)` pair terminates the list.
    pub fn decode(&self, offset: usize, base: u32) -> gimli::Result<Vec<SourceRange>> {
        let mut reader = EndianSlice::new(self.data, self.endian);
        reader.skip(offset)?;

        let mut base = base;
        let mut ranges = Vec::new();
        loop {
            let low = reader.read_u32()?;
            let high = reader.read_u32()?;
            if low == 0 && high == 0 {
                break;
            }
            if low == BASE_ADDRESS_SELECTION {
                base = high;
                continue;
            }
            if let Some(range) =
                SourceRange::from_exclusive(base.wrapping_add(low), base.wrapping_add(high))
            {
                ranges.push(range);
            }
        }
        Ok(ranges)
    }
}

/// Address ranges covered by an entry
///
/// Uses `DW_AT_low_pc`/`DW_AT_high_pc` when present (both address classes
/// of `high_pc`), else `DW_AT_ranges`. Entries with neither yield an empty
/// list.
pub fn entry_ranges(
    entry: &Entry,
    unit: &CompileUnit,
    ranges: &RangeSection<'_>,
) -> gimli::Result<Vec<SourceRange>> {
    if let Some(AttrValue::Address(low)) = entry.attr(gimli::DW_AT_low_pc) {
        let high = match entry.attr(gimli::DW_AT_high_pc) {
            Some(AttrValue::Address(high)) => *high,
            Some(value) => match value.as_u64() {
                Some(delta) => low.wrapping_add(delta as u32),
                None => return Ok(Vec::new()),
            },
            // A lone low_pc marks a single address
            None => low.wrapping_add(1),
        };
        return Ok(SourceRange::from_exclusive(*low, high).into_iter().collect());
    }

    if let Some(AttrValue::RangeList(offset)) = entry.attr(gimli::DW_AT_ranges) {
        return ranges.decode(*offset, unit.base_address);
    }

    Ok(Vec::new())
}
