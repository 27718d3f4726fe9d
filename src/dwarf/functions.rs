//! Function Resolver
//!
//! Turns subprogram and inlined-subroutine entries into [`SourceFunction`]s.
//! Abstract subprograms carry no code; their concrete and inlined instances
//! do, and each instance contributes its ranges to the one function of that
//! name.

use super::entries::{AttrValue, CompileUnit, Entry, EntryIndex};
use super::loclist::{LocExpr, LocSection, Location};
use super::ranges::{entry_ranges, RangeSection, SourceRange};
use std::collections::HashMap;

/// Index of a function in a [`FunctionSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub usize);

/// A source-level function
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFunction {
    /// Function name
    pub name: String,
    /// Code ranges, inlined instances included
    pub ranges: Vec<SourceRange>,
    /// Location of the frame base of the out-of-line copy
    pub frame_base: Option<Location>,
    /// Frame base of each instance, keyed by the instance's ranges; an
    /// inlined instance runs in its caller's frame
    pub instance_frame_bases: Vec<(SourceRange, Location)>,
    /// Declaring file
    pub decl_file: Option<String>,
    /// Declaring line
    pub decl_line: Option<u32>,
    /// Synthesized from the symbol table rather than DWARF
    pub stub: bool,
}

impl SourceFunction {
    /// A function with no ranges
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ranges: Vec::new(),
            frame_base: None,
            instance_frame_bases: Vec::new(),
            decl_file: None,
            decl_line: None,
            stub: false,
        }
    }

    /// A function known only from the symbol table
    pub fn stub(name: impl Into<String>, ranges: Vec<SourceRange>) -> Self {
        Self {
            ranges,
            stub: true,
            ..Self::new(name)
        }
    }

    /// Add a range unless it is already present
    pub fn add_range(&mut self, range: SourceRange) {
        if !self.ranges.contains(&range) {
            self.ranges.push(range);
        }
    }

    /// Whether any range covers `address`
    pub fn contains(&self, address: u32) -> bool {
        self.ranges.iter().any(|r| r.contains(address))
    }

    /// The smallest range covering `address`, inlined ranges first on ties
    pub fn range_at(&self, address: u32) -> Option<&SourceRange> {
        self.ranges
            .iter()
            .filter(|r| r.contains(address))
            .min_by_key(|r| (r.size(), !r.inline))
    }

    /// Frame base for code at `address`: the one of the innermost instance
    /// covering it, else the function's own
    pub fn frame_base_at(&self, address: u32) -> Option<&Location> {
        self.instance_frame_bases
            .iter()
            .filter(|(r, _)| r.contains(address))
            .min_by_key(|(r, _)| (r.size(), !r.inline))
            .map(|(_, location)| location)
            .or(self.frame_base.as_ref())
    }

    fn record_instance_frame_base(&mut self, ranges: &[SourceRange], location: &Location) {
        for range in ranges {
            if !self.instance_frame_bases.iter().any(|(r, _)| r == range) {
                self.instance_frame_bases.push((*range, location.clone()));
            }
        }
    }
}

/// All functions, addressable by name and by defining entry
#[derive(Debug, Clone, Default)]
pub struct FunctionSet {
    functions: Vec<SourceFunction>,
    by_name: HashMap<String, FunctionId>,
    by_entry: HashMap<usize, FunctionId>,
}

impl FunctionSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, or merge its ranges into the one of the same name
    ///
    /// Frame bases stay attached to the ranges they came with. The merged
    /// function's own frame base is the out-of-line copy's when there is one.
    pub fn insert(&mut self, mut function: SourceFunction) -> FunctionId {
        if let Some(location) = function.frame_base.clone() {
            let ranges = function.ranges.clone();
            function.record_instance_frame_base(&ranges, &location);
        }

        if let Some(&id) = self.by_name.get(&function.name) {
            let existing = &mut self.functions[id.0];
            let existing_inline_only = existing.ranges.iter().all(|r| r.inline);
            let incoming_out_of_line = function.ranges.iter().any(|r| !r.inline);
            for range in function.ranges {
                existing.add_range(range);
            }
            for (range, location) in function.instance_frame_bases {
                existing.record_instance_frame_base(&[range], &location);
            }
            if function.frame_base.is_some()
                && (existing.frame_base.is_none() || (existing_inline_only && incoming_out_of_line))
            {
                existing.frame_base = function.frame_base;
            }
            if existing.decl_line.is_none() {
                existing.decl_file = function.decl_file;
                existing.decl_line = function.decl_line;
            }
            return id;
        }

        let id = FunctionId(self.functions.len());
        self.by_name.insert(function.name.clone(), id);
        self.functions.push(function);
        id
    }

    /// Look up a function
    pub fn get(&self, id: FunctionId) -> Option<&SourceFunction> {
        self.functions.get(id.0)
    }

    /// Look up a function by name
    pub fn by_name(&self, name: &str) -> Option<FunctionId> {
        self.by_name.get(name).copied()
    }

    /// The function a subprogram or inlined-subroutine entry resolved into
    pub fn for_entry(&self, offset: usize) -> Option<FunctionId> {
        self.by_entry.get(&offset).copied()
    }

    /// All functions with their ids
    pub fn iter(&self) -> impl Iterator<Item = (FunctionId, &SourceFunction)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| (FunctionId(i), f))
    }

    /// Number of functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Pairs of distinct non-inlined functions whose ranges overlap
    pub fn overlaps(&self) -> Vec<(FunctionId, FunctionId, SourceRange)> {
        let mut ranges: Vec<(SourceRange, FunctionId)> = self
            .iter()
            .flat_map(|(id, f)| {
                f.ranges
                    .iter()
                    .filter(|r| !r.inline)
                    .map(move |r| (*r, id))
            })
            .collect();
        ranges.sort_by_key(|(r, _)| (r.start, r.end));

        let mut conflicts = Vec::new();
        for (i, (range, id)) in ranges.iter().enumerate() {
            for (other, other_id) in ranges[i + 1..].iter() {
                if other.start > range.end {
                    break;
                }
                if other_id != id && range.overlaps(other) {
                    conflicts.push((*id, *other_id, *other));
                }
            }
        }
        conflicts
    }
}

/// Resolve every subprogram and inlined subroutine that has code
///
/// Entries whose data cannot be used are skipped with a log message.
pub fn resolve_functions(
    index: &EntryIndex,
    ranges: &RangeSection<'_>,
    locs: &LocSection<'_>,
) -> FunctionSet {
    let mut set = FunctionSet::new();

    for entry in index.iter() {
        let inline = match entry.tag {
            gimli::DW_TAG_subprogram => false,
            gimli::DW_TAG_inlined_subroutine => true,
            _ => continue,
        };
        let Some(unit) = index.unit(entry.unit) else {
            continue;
        };

        let entry_ranges = match entry_ranges(entry, unit, ranges) {
            Ok(r) if r.is_empty() => continue,
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Function at 0x{:x}: bad ranges: {}", entry.offset, e);
                continue;
            }
        };

        let Some(name) = function_name(index, entry) else {
            tracing::debug!("Function at 0x{:x} has no name", entry.offset);
            continue;
        };

        let frame_base_entry = if inline {
            index
                .ancestors(entry.offset)
                .find(|e| e.tag == gimli::DW_TAG_subprogram)
        } else {
            Some(entry)
        };
        let frame_base = frame_base_entry.and_then(|e| frame_base(e, unit, locs));

        let (decl_file, decl_line) = declaration(index, entry, unit);
        let function = SourceFunction {
            name: name.to_string(),
            ranges: entry_ranges
                .into_iter()
                .map(|r| if inline { r.inlined() } else { r })
                .collect(),
            frame_base,
            instance_frame_bases: Vec::new(),
            decl_file,
            decl_line,
            stub: false,
        };
        let id = set.insert(function);
        set.by_entry.insert(entry.offset, id);
    }

    for (a, b, range) in set.overlaps() {
        if let (Some(a), Some(b)) = (set.get(a), set.get(b)) {
            tracing::warn!("Functions {} and {} overlap at {}", a.name, b.name, range);
        }
    }
    tracing::info!("Resolved {} functions", set.len());
    set
}

/// Entries to consult for names and declarations: the entry itself, then
/// its origin, then the origin's origin
fn lineage<'a>(index: &'a EntryIndex, entry: &'a Entry) -> impl Iterator<Item = &'a Entry> {
    let origin = index.origin_of(entry);
    let origin_origin = origin.and_then(|o| index.origin_of(o));
    std::iter::once(entry).chain(origin).chain(origin_origin)
}

fn function_name<'a>(index: &'a EntryIndex, entry: &'a Entry) -> Option<&'a str> {
    lineage(index, entry)
        .find_map(Entry::name)
        .or_else(|| lineage(index, entry).find_map(Entry::linkage_name))
}

fn declaration(index: &EntryIndex, entry: &Entry, unit: &CompileUnit) -> (Option<String>, Option<u32>) {
    let Some(decl) = lineage(index, entry).find(|e| e.has_attr(gimli::DW_AT_decl_line)) else {
        return (None, None);
    };
    // The declaring entry may live in another unit
    let unit = index.unit(decl.unit).unwrap_or(unit);
    let file = decl
        .udata(gimli::DW_AT_decl_file)
        .and_then(|i| unit.file(i))
        .map(str::to_string);
    let line = decl.udata(gimli::DW_AT_decl_line).map(|l| l as u32);
    (file, line)
}

/// Decode the `DW_AT_frame_base` of an entry
pub(crate) fn frame_base(entry: &Entry, unit: &CompileUnit, locs: &LocSection<'_>) -> Option<Location> {
    let result = match entry.attr(gimli::DW_AT_frame_base)? {
        AttrValue::Block(bytes) => LocExpr::decode(bytes).map(Location::Expr),
        AttrValue::LocList(offset) => locs.location(*offset, unit.base_address),
        other => {
            tracing::debug!(
                "Function at 0x{:x}: unusable frame base {:?}",
                entry.offset,
                other
            );
            return None;
        }
    };
    result
        .map_err(|e| tracing::debug!("Function at 0x{:x}: frame base: {}", entry.offset, e))
        .ok()
}
