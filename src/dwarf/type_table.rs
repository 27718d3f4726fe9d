//! Type Resolver
//!
//! Types live in a single table and refer to each other by [`TypeId`], so
//! self-referential structures and forward references need no boxing.
//!
//! [`TypeBuilder`] owns the table while it is being filled:
//! 1. base and enumeration types (size is mandatory, and so is the name of
//!    a base type)
//! 2. repeated passes over typedef, pointer, composite, array, const and
//!    volatile entries until the configured pass count is reached
//!
//! Pointers are allocated immediately for their target offset, so a pointer
//! to a type resolved in a later pass (or to itself) still links up.
//! [`TypeBuilder::resolve`] consumes the builder and yields the immutable
//! [`TypeTable`].

use super::entries::{AttrValue, Entry, EntryIndex};
use super::loclist::LocExpr;
use crate::config::BuildConfig;
use std::collections::HashMap;

/// Size of a pointer on the coprocessor
pub const POINTER_SIZE: u32 = 4;

/// A unique identifier for a type in the type table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

/// How a raw value should be reinterpreted for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conversion {
    /// Integer
    #[default]
    None,
    /// IEEE-754 single precision
    Float,
}

/// Where a member sits inside its composite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberLocation {
    /// Constant byte offset from the start of the composite
    Offset(u32),
    /// Expression evaluated with the composite's address pushed
    Expr(LocExpr),
}

/// A member of a struct or union
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member name
    pub name: String,
    /// Member type
    pub type_id: TypeId,
    /// Member location
    pub location: MemberLocation,
}

/// The shape of a type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    /// Scalar (integer, float, enum)
    Base,
    /// Pointer; `None` for `void *` or an unresolvable target
    Pointer(Option<TypeId>),
    /// Fixed-size array
    Array { element: TypeId, count: u32 },
    /// Struct or union
    Composite { members: Vec<Member>, union: bool },
}

/// A resolved source-level type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceType {
    /// Display name
    pub name: String,
    /// Size in bytes
    pub size: u32,
    /// Shape
    pub kind: TypeKind,
    /// Signed integer encoding
    pub signed: bool,
    /// `const` qualified
    pub constant: bool,
    /// `volatile` qualified
    pub volatile: bool,
    /// Display reinterpretation hint
    pub conversion: Conversion,
    /// Offset of the defining entry
    pub offset: usize,
}

impl SourceType {
    /// A scalar type
    pub fn base(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
            kind: TypeKind::Base,
            signed: false,
            constant: false,
            volatile: false,
            conversion: Conversion::None,
            offset: 0,
        }
    }

    /// Members, for composites
    pub fn members(&self) -> &[Member] {
        match &self.kind {
            TypeKind::Composite { members, .. } => members,
            _ => &[],
        }
    }

    /// Whether the type is a struct or union
    pub fn is_composite(&self) -> bool {
        matches!(self.kind, TypeKind::Composite { .. })
    }

    /// Whether the type is a pointer
    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer(_))
    }

    /// Keep only the bytes the type occupies
    pub fn mask(&self, raw: u32) -> u32 {
        match self.size {
            1 => raw & 0xff,
            2 => raw & 0xffff,
            _ => raw,
        }
    }

    /// Render a raw 32-bit value of this type
    pub fn format_value(&self, raw: u32) -> String {
        let value = self.mask(raw);
        match &self.kind {
            _ if self.conversion == Conversion::Float && self.size == 4 => {
                format!("{}", f32::from_bits(value))
            }
            TypeKind::Pointer(_) => format!("0x{:08x}", value),
            TypeKind::Base if self.signed => {
                let shift = 32 - 8 * self.size.clamp(1, 4);
                (((value << shift) as i32) >> shift).to_string()
            }
            TypeKind::Base => value.to_string(),
            TypeKind::Array { .. } | TypeKind::Composite { .. } => format!("0x{:08x}", value),
        }
    }
}

/// The resolved type table
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    types: Vec<Option<SourceType>>,
    by_offset: HashMap<usize, TypeId>,
}

impl TypeTable {
    /// Get a type by id
    pub fn get(&self, id: TypeId) -> Option<&SourceType> {
        self.types.get(id.0 as usize)?.as_ref()
    }

    /// The id of the type defined at a DWARF offset
    pub fn by_offset(&self, offset: usize) -> Option<TypeId> {
        let id = *self.by_offset.get(&offset)?;
        self.get(id).map(|_| id)
    }

    /// The type defined at a DWARF offset
    pub fn type_at(&self, offset: usize) -> Option<&SourceType> {
        self.by_offset(offset).and_then(|id| self.get(id))
    }

    /// Find a type by display name
    pub fn find_by_name(&self, name: &str) -> Option<TypeId> {
        self.iter().find(|(_, ty)| ty.name == name).map(|(id, _)| id)
    }

    /// All resolved types
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &SourceType)> {
        self.types
            .iter()
            .enumerate()
            .filter_map(|(i, ty)| ty.as_ref().map(|ty| (TypeId(i as u32), ty)))
    }

    /// Number of resolved types
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether no types resolved
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds a [`TypeTable`] from indexed entries
pub struct TypeBuilder<'a> {
    index: &'a EntryIndex,
    passes: usize,
    float_name_heuristic: bool,
    types: Vec<Option<SourceType>>,
    by_offset: HashMap<usize, TypeId>,
    members: HashMap<usize, Vec<&'a Entry>>,
}

impl<'a> TypeBuilder<'a> {
    /// Create a builder over an index
    pub fn new(index: &'a EntryIndex, config: &BuildConfig) -> Self {
        Self {
            index,
            passes: config.type_passes,
            float_name_heuristic: config.float_name_heuristic,
            types: Vec::new(),
            by_offset: HashMap::new(),
            members: HashMap::new(),
        }
    }

    /// Run every pass and hand over the finished table
    pub fn resolve(mut self) -> TypeTable {
        self.collect_members();
        self.resolve_base_types();
        for pass in 0..self.passes {
            let last = pass + 1 == self.passes;
            let resolved = self.resolve_pass(last);
            tracing::debug!("Type pass {}: {} new types", pass + 1, resolved);
        }
        self.finish()
    }

    fn get_or_allocate(&mut self, offset: usize) -> TypeId {
        if let Some(&id) = self.by_offset.get(&offset) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(None);
        self.by_offset.insert(offset, id);
        id
    }

    fn define(&mut self, offset: usize, ty: SourceType) {
        let id = self.get_or_allocate(offset);
        self.types[id.0 as usize] = Some(ty);
    }

    fn resolved(&self, offset: usize) -> Option<&SourceType> {
        let id = self.by_offset.get(&offset)?;
        self.types.get(id.0 as usize)?.as_ref()
    }

    fn resolved_id(&self, offset: usize) -> Option<TypeId> {
        let id = *self.by_offset.get(&offset)?;
        self.types.get(id.0 as usize)?.as_ref().map(|_| id)
    }

    fn conversion(&self, name: &str, encoding: Option<u64>) -> Conversion {
        if encoding == Some(gimli::DW_ATE_float.0 as u64)
            || (self.float_name_heuristic && name.contains("float"))
        {
            Conversion::Float
        } else {
            Conversion::None
        }
    }

    /// Assign member entries to composites in encounter order
    ///
    /// The last struct or union seen collects the members that follow it;
    /// any other tag ends the run.
    fn collect_members(&mut self) {
        let index = self.index;
        let mut target: Option<usize> = None;
        for entry in index.iter() {
            match entry.tag {
                gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type => {
                    target = Some(entry.offset);
                    self.members.entry(entry.offset).or_default();
                }
                gimli::DW_TAG_member => {
                    if let Some(composite) = target {
                        self.members.entry(composite).or_default().push(entry);
                    }
                }
                _ => target = None,
            }
        }
    }

    fn resolve_base_types(&mut self) {
        let index = self.index;
        let mut count = 0;
        for entry in index.iter() {
            if !matches!(
                entry.tag,
                gimli::DW_TAG_base_type | gimli::DW_TAG_enumeration_type
            ) {
                continue;
            }
            let enumeration = entry.tag == gimli::DW_TAG_enumeration_type;
            let name = match entry.name() {
                Some(name) => name.to_string(),
                None if enumeration => format!("anon_enum_{:x}", entry.offset),
                None => {
                    tracing::debug!("Base type at 0x{:x} has no name", entry.offset);
                    continue;
                }
            };
            let Some(size) = entry.byte_size() else {
                tracing::debug!("Base type at 0x{:x} has no size", entry.offset);
                continue;
            };

            let encoding = entry.udata(gimli::DW_AT_encoding);
            let signed = matches!(
                encoding,
                Some(e) if e == gimli::DW_ATE_signed.0 as u64
                    || e == gimli::DW_ATE_signed_char.0 as u64
            );
            let ty = SourceType {
                signed,
                conversion: self.conversion(&name, encoding),
                offset: entry.offset,
                ..SourceType::base(name, size)
            };
            self.define(entry.offset, ty);
            count += 1;
        }
        tracing::debug!("Resolved {} base types", count);
    }

    fn resolve_pass(&mut self, last: bool) -> usize {
        let index = self.index;
        let mut count = 0;
        for entry in index.iter() {
            if self.resolved(entry.offset).is_some() {
                continue;
            }
            let ty = match entry.tag {
                gimli::DW_TAG_typedef => self.typedef(entry),
                gimli::DW_TAG_pointer_type => Some(self.pointer(entry)),
                gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type => {
                    self.composite(entry, last)
                }
                gimli::DW_TAG_array_type => self.array(entry),
                gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => self.qualified(entry),
                _ => None,
            };
            if let Some(ty) = ty {
                self.define(entry.offset, ty);
                count += 1;
            }
        }
        count
    }

    fn typedef(&self, entry: &Entry) -> Option<SourceType> {
        let name = entry.name()?;
        let target = self.resolved(entry.type_ref()?)?;
        let conversion = match target.conversion {
            Conversion::Float => Conversion::Float,
            Conversion::None => self.conversion(name, None),
        };
        Some(SourceType {
            name: name.to_string(),
            conversion,
            offset: entry.offset,
            ..target.clone()
        })
    }

    fn pointer(&mut self, entry: &Entry) -> SourceType {
        let target = entry.type_ref().map(|offset| self.get_or_allocate(offset));
        SourceType {
            kind: TypeKind::Pointer(target),
            offset: entry.offset,
            ..SourceType::base("void *", entry.byte_size().unwrap_or(POINTER_SIZE))
        }
    }

    fn qualified(&self, entry: &Entry) -> Option<SourceType> {
        let target = self.resolved(entry.type_ref()?)?;
        let mut ty = target.clone();
        ty.offset = entry.offset;
        if entry.tag == gimli::DW_TAG_const_type {
            ty.constant = true;
            ty.name = format!("const {}", target.name);
        } else {
            ty.volatile = true;
            ty.name = format!("volatile {}", target.name);
        }
        Some(ty)
    }

    fn array(&self, entry: &Entry) -> Option<SourceType> {
        let element_id = self.resolved_id(entry.type_ref()?)?;
        let element = self.resolved(entry.type_ref()?)?;

        let mut count: u32 = 1;
        let mut dims = String::new();
        let subranges = self
            .index
            .children(entry.offset)
            .iter()
            .filter_map(|offset| self.index.entry(*offset))
            .filter(|child| child.tag == gimli::DW_TAG_subrange_type);
        for subrange in subranges {
            let n = subrange_count(subrange);
            count = count.saturating_mul(n);
            dims.push_str(&format!("[{}]", n));
        }
        if dims.is_empty() {
            count = 0;
            dims.push_str("[]");
        }

        Some(SourceType {
            name: format!("{}{}", element.name, dims),
            size: element.size.saturating_mul(count),
            kind: TypeKind::Array {
                element: element_id,
                count,
            },
            offset: entry.offset,
            ..SourceType::base("", 0)
        })
    }

    fn composite(&self, entry: &Entry, last: bool) -> Option<SourceType> {
        let candidates = self.members.get(&entry.offset)?;
        let mut members = Vec::with_capacity(candidates.len());
        for member in candidates {
            let Some(type_id) = member.type_ref().and_then(|t| self.resolved_id(t)) else {
                continue;
            };
            let location = match member.attr(gimli::DW_AT_data_member_location) {
                Some(AttrValue::Block(bytes)) => match LocExpr::decode(bytes) {
                    Ok(expr) => match expr.as_member_offset() {
                        Some(offset) => MemberLocation::Offset(offset),
                        None => MemberLocation::Expr(expr),
                    },
                    Err(e) => {
                        tracing::debug!(
                            "Member at 0x{:x}: unusable location: {}",
                            member.offset,
                            e
                        );
                        continue;
                    }
                },
                Some(value) => MemberLocation::Offset(value.as_u64().unwrap_or(0) as u32),
                None => MemberLocation::Offset(0),
            };
            members.push(Member {
                name: member
                    .name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("anon_{:x}", member.offset)),
                type_id,
                location,
            });
        }

        // Wait for forward references unless this is the final pass
        if members.is_empty() || (members.len() < candidates.len() && !last) {
            return None;
        }

        let union = entry.tag == gimli::DW_TAG_union_type;
        let name = match entry.name() {
            Some(name) => name.to_string(),
            None => format!(
                "{}_{:x}",
                if union { "anon_union" } else { "anon_struct" },
                entry.offset
            ),
        };
        Some(SourceType {
            conversion: self.conversion(&name, None),
            name,
            size: entry.byte_size().unwrap_or(0),
            kind: TypeKind::Composite { members, union },
            offset: entry.offset,
            ..SourceType::base("", 0)
        })
    }

    /// Name of a pointer entry (`T *`) or of a qualifier entry over one
    /// (`T * const`), once every target is known; other types keep theirs
    fn derived_name(&self, id: TypeId, depth: usize) -> Option<String> {
        let ty = self.types.get(id.0 as usize)?.as_ref()?;
        let entry = self.index.entry(ty.offset)?;
        match entry.tag {
            gimli::DW_TAG_pointer_type => {
                let TypeKind::Pointer(target) = ty.kind else {
                    return None;
                };
                let target = match target {
                    Some(target) => self.display_name(target, depth + 1),
                    None => "void".to_string(),
                };
                Some(format!("{} *", target))
            }
            gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                let qualifier = if entry.tag == gimli::DW_TAG_const_type {
                    "const"
                } else {
                    "volatile"
                };
                let target = *self.by_offset.get(&entry.type_ref()?)?;
                let target_name = self.display_name(target, depth + 1);
                let over_pointer = self
                    .types
                    .get(target.0 as usize)
                    .and_then(Option::as_ref)
                    .is_some_and(SourceType::is_pointer);
                Some(if over_pointer {
                    format!("{} {}", target_name, qualifier)
                } else {
                    format!("{} {}", qualifier, target_name)
                })
            }
            _ => None,
        }
    }

    fn display_name(&self, id: TypeId, depth: usize) -> String {
        if depth >= 8 {
            return "...".to_string();
        }
        self.derived_name(id, depth)
            .or_else(|| {
                self.types
                    .get(id.0 as usize)
                    .and_then(Option::as_ref)
                    .map(|t| t.name.clone())
            })
            .unwrap_or_else(|| "void".to_string())
    }

    /// Drop dangling pointer targets and name pointers after their targets
    fn finish(mut self) -> TypeTable {
        let ids: Vec<usize> = (0..self.types.len()).collect();
        for i in &ids {
            let dangling = match self.types[*i].as_ref().map(|ty| &ty.kind) {
                Some(TypeKind::Pointer(Some(target))) => {
                    self.types.get(target.0 as usize).map_or(true, Option::is_none)
                }
                _ => false,
            };
            if dangling {
                if let Some(ty) = self.types[*i].as_mut() {
                    ty.kind = TypeKind::Pointer(None);
                }
            }
        }

        let names: Vec<Option<String>> = ids
            .iter()
            .map(|i| self.derived_name(TypeId(*i as u32), 0))
            .collect();
        for (i, name) in names.into_iter().enumerate() {
            if let (Some(name), Some(ty)) = (name, self.types[i].as_mut()) {
                ty.name = name;
            }
        }

        let discarded = self
            .index
            .iter()
            .filter(|e| {
                matches!(
                    e.tag,
                    gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type
                )
            })
            .filter(|e| self.resolved(e.offset).is_none())
            .count();
        let table = TypeTable {
            types: self.types,
            by_offset: self.by_offset,
        };
        tracing::info!(
            "Resolved {} types ({} unresolvable composites discarded)",
            table.len(),
            discarded
        );
        table
    }
}

/// Element count of a subrange: `DW_AT_count`, else `DW_AT_upper_bound + 1`
fn subrange_count(subrange: &Entry) -> u32 {
    if let Some(count) = subrange.udata(gimli::DW_AT_count) {
        return count as u32;
    }
    subrange
        .attr(gimli::DW_AT_upper_bound)
        .and_then(AttrValue::as_i64)
        .map(|upper| (upper + 1).max(0) as u32)
        .unwrap_or(0)
}
