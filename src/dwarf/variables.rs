//! Variable Resolver
//!
//! Variables and formal parameters become either globals (one location,
//! valid everywhere) or locals scoped to the address ranges of the block,
//! function or inlined instance that declares them.
//!
//! Composite, array and pointer variables get their children synthesized
//! once at build time. A child's location refers to its parent's resolved
//! location, so [`SourceVariable::update`] walks the tree top-down.
//!
//! The last resolution of every variable is published as an immutable
//! [`Resolution`] behind an `RwLock<Arc<_>>`; readers clone the `Arc` and
//! never see a half-written result.

use super::entries::{AttrValue, CompileUnit, Entry, EntryIndex};
use super::functions::{FunctionId, FunctionSet};
use super::loclist::{
    EvalEnv, LocError, LocExpr, LocResult, LocSection, Location, Op, PieceLocation,
};
use super::ranges::{entry_ranges, RangeSection, SourceRange};
use super::type_table::{MemberLocation, TypeId, TypeKind, TypeTable};
use crate::config::BuildConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// How a variable's location is obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarLocation {
    /// `DW_AT_const_value`; memory is never consulted
    Constant(u32),
    /// A DWARF location of a top-level variable
    Dwarf(Location),
    /// Parent location plus a byte offset (array elements, members)
    Offset(u32),
    /// Member expression evaluated with the parent address pushed
    MemberExpr(LocExpr),
    /// The parent's value, used as an address
    Deref,
    /// No usable location
    NotLocatable(String),
}

/// Last resolution of a variable
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Resolution {
    /// Not evaluated yet
    #[default]
    Pending,
    /// Evaluated; `value` is `None` when memory could not be read
    Resolved {
        address: Option<u32>,
        value: Option<u32>,
    },
    /// The program counter is outside every range of the location list
    OutOfScope,
    /// The location could not be evaluated
    NotLocatable(String),
}

/// A source-level variable
#[derive(Debug)]
pub struct SourceVariable {
    /// Variable name (`[i]`, member name or `*` for children)
    pub name: String,
    /// Resolved type
    pub type_id: TypeId,
    /// Byte size of the type
    pub size: u32,
    /// Declaring file
    pub decl_file: Option<String>,
    /// Declaring line
    pub decl_line: Option<u32>,
    /// Location
    pub location: VarLocation,
    children: Vec<SourceVariable>,
    resolution: RwLock<Arc<Resolution>>,
}

impl SourceVariable {
    /// Create a variable with no children
    pub fn new(name: impl Into<String>, type_id: TypeId, size: u32, location: VarLocation) -> Self {
        Self {
            name: name.into(),
            type_id,
            size,
            decl_file: None,
            decl_line: None,
            location,
            children: Vec::new(),
            resolution: RwLock::new(Arc::new(Resolution::Pending)),
        }
    }

    /// Synthesize children for the variable's type
    pub fn with_children(mut self, types: &TypeTable, max_depth: usize) -> Self {
        self.children = synthesize_children(types, self.type_id, 0, max_depth);
        self
    }

    /// Synthesized children (elements, members, pointer target)
    pub fn children(&self) -> &[SourceVariable] {
        &self.children
    }

    /// Find a descendant by path, e.g. `["pos", "x"]`
    pub fn child_path(&self, path: &[&str]) -> Option<&SourceVariable> {
        let (first, rest) = path.split_first()?;
        let child = self.children.iter().find(|c| c.name == *first)?;
        if rest.is_empty() {
            Some(child)
        } else {
            child.child_path(rest)
        }
    }

    /// The last published resolution
    pub fn snapshot(&self) -> Arc<Resolution> {
        match self.resolution.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Address of the last resolution, if it lives in memory
    pub fn address(&self) -> Option<u32> {
        match *self.snapshot() {
            Resolution::Resolved { address, .. } => address,
            _ => None,
        }
    }

    /// Value of the last resolution
    pub fn value(&self) -> Option<u32> {
        match *self.snapshot() {
            Resolution::Resolved { value, .. } => value,
            _ => None,
        }
    }

    /// Address fixed at link time (`DW_OP_addr`), independent of any state
    pub fn static_address(&self) -> Option<u32> {
        match &self.location {
            VarLocation::Dwarf(Location::Expr(expr)) => {
                let mut ops = expr.ops();
                match (ops.next(), ops.next()) {
                    (Some(Op::Const(address)), None) => Some(*address),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Re-evaluate the variable and all of its children
    pub fn update(&self, env: &EvalEnv<'_>) -> Arc<Resolution> {
        self.update_from(env, None);
        self.snapshot()
    }

    /// Mark the variable and its children as out of scope
    pub fn mark_out_of_scope(&self) {
        self.publish(Resolution::OutOfScope);
        for child in &self.children {
            child.mark_out_of_scope();
        }
    }

    fn publish(&self, resolution: Resolution) {
        let resolution = Arc::new(resolution);
        match self.resolution.write() {
            Ok(mut guard) => *guard = resolution,
            Err(poisoned) => *poisoned.into_inner() = resolution,
        }
    }

    fn update_from(&self, env: &EvalEnv<'_>, parent: Option<&Result<LocResult, Resolution>>) {
        let located = self.locate(env, parent);
        let resolution = match &located {
            Ok(result) => self.read(env, result),
            Err(resolution) => resolution.clone(),
        };
        self.publish(resolution);
        for child in &self.children {
            child.update_from(env, Some(&located));
        }
    }

    /// Evaluate this variable's location given its parent's
    fn locate(
        &self,
        env: &EvalEnv<'_>,
        parent: Option<&Result<LocResult, Resolution>>,
    ) -> Result<LocResult, Resolution> {
        let parent = match (&self.location, parent) {
            (VarLocation::Constant(value), _) => return Ok(LocResult::Value(*value)),
            (VarLocation::NotLocatable(reason), _) => {
                return Err(Resolution::NotLocatable(reason.clone()))
            }
            (VarLocation::Dwarf(location), _) => {
                return location.evaluate(env).map_err(|e| self.failed(e))
            }
            (_, None) => return Err(Resolution::NotLocatable("no parent".to_string())),
            (_, Some(Err(resolution))) => return Err(resolution.clone()),
            (_, Some(Ok(parent))) => parent,
        };

        match (&self.location, parent) {
            (VarLocation::Offset(offset), LocResult::Address(base)) => {
                Ok(LocResult::Address(base.wrapping_add(*offset)))
            }
            (VarLocation::Offset(offset), LocResult::Value(value)) => {
                Ok(LocResult::Value(
                    value.checked_shr(offset.saturating_mul(8)).unwrap_or(0),
                ))
            }
            (VarLocation::Offset(offset), LocResult::Pieces(pieces)) => {
                piece_at(pieces, *offset).ok_or_else(|| {
                    Resolution::NotLocatable(format!("no piece at offset {}", offset))
                })
            }
            (VarLocation::MemberExpr(expr), LocResult::Address(base)) => {
                expr.evaluate_with_base(env, *base).map_err(|e| self.failed(e))
            }
            (VarLocation::Deref, parent) => match read_value(env, parent) {
                Some(pointer) => Ok(LocResult::Address(pointer)),
                None => Err(Resolution::Resolved {
                    address: None,
                    value: None,
                }),
            },
            _ => Err(Resolution::NotLocatable(
                "parent is not addressable".to_string(),
            )),
        }
    }

    fn failed(&self, error: LocError) -> Resolution {
        match error {
            LocError::NoEntryForAddress(_) => Resolution::OutOfScope,
            error => {
                tracing::debug!("Variable {} not locatable: {}", self.name, error);
                Resolution::NotLocatable(error.to_string())
            }
        }
    }

    fn read(&self, env: &EvalEnv<'_>, result: &LocResult) -> Resolution {
        let address = match result {
            LocResult::Address(address) => Some(*address),
            _ => None,
        };
        Resolution::Resolved {
            address,
            value: read_value(env, result).map(|v| mask(v, self.size)),
        }
    }
}

fn mask(value: u32, size: u32) -> u32 {
    match size {
        1 => value & 0xff,
        2 => value & 0xffff,
        _ => value,
    }
}

/// Current 32-bit value of a location
fn read_value(env: &EvalEnv<'_>, result: &LocResult) -> Option<u32> {
    match result {
        LocResult::Address(address) => env.coproc.peek(*address),
        LocResult::Value(value) => Some(*value),
        LocResult::Pieces(pieces) => {
            let mut value = 0u32;
            let mut shift = 0u32;
            for piece in pieces {
                if shift >= 32 {
                    break;
                }
                let part = match piece.location {
                    PieceLocation::Address(address) => env.coproc.peek(address)?,
                    PieceLocation::Value(v) => v,
                    PieceLocation::Empty => 0,
                };
                value |= mask(part, piece.size).checked_shl(shift).unwrap_or(0);
                shift = shift.saturating_add(piece.size.saturating_mul(8));
            }
            Some(value)
        }
    }
}

/// Location of the byte at `offset` of a value split into pieces
fn piece_at(pieces: &[super::loclist::Piece], offset: u32) -> Option<LocResult> {
    let mut start = 0u32;
    for piece in pieces {
        if offset < start + piece.size {
            let within = offset - start;
            return match piece.location {
                PieceLocation::Address(address) => {
                    Some(LocResult::Address(address.wrapping_add(within)))
                }
                PieceLocation::Value(value) => {
                    Some(LocResult::Value(
                    value.checked_shr(within.saturating_mul(8)).unwrap_or(0),
                ))
                }
                PieceLocation::Empty => None,
            };
        }
        start += piece.size;
    }
    None
}

fn synthesize_children(
    types: &TypeTable,
    type_id: TypeId,
    depth: usize,
    max_depth: usize,
) -> Vec<SourceVariable> {
    if depth >= max_depth {
        return Vec::new();
    }
    let Some(ty) = types.get(type_id) else {
        return Vec::new();
    };

    let child = |name: String, type_id: TypeId, location: VarLocation| {
        let size = types.get(type_id).map(|t| t.size).unwrap_or(0);
        let mut child = SourceVariable::new(name, type_id, size, location);
        child.children = synthesize_children(types, type_id, depth + 1, max_depth);
        child
    };

    match &ty.kind {
        TypeKind::Base | TypeKind::Pointer(None) => Vec::new(),
        TypeKind::Pointer(Some(target)) => vec![child("*".to_string(), *target, VarLocation::Deref)],
        TypeKind::Array { element, count } => {
            let stride = types.get(*element).map(|t| t.size).unwrap_or(0);
            (0..*count)
                .map(|i| {
                    child(
                        format!("[{}]", i),
                        *element,
                        VarLocation::Offset(i.wrapping_mul(stride)),
                    )
                })
                .collect()
        }
        TypeKind::Composite { members, .. } => members
            .iter()
            .map(|member| {
                let location = match &member.location {
                    MemberLocation::Offset(offset) => VarLocation::Offset(*offset),
                    MemberLocation::Expr(expr) => VarLocation::MemberExpr(expr.clone()),
                };
                child(member.name.clone(), member.type_id, location)
            })
            .collect(),
    }
}

/// A variable valid over one address range
#[derive(Debug)]
pub struct SourceVariableLocal {
    /// The variable
    pub variable: SourceVariable,
    /// Where the variable is in scope
    pub range: SourceRange,
    /// Function (or inlined instance) declaring it
    pub function: Option<FunctionId>,
}

/// Globals and scoped locals
#[derive(Debug, Default)]
pub struct VariableSet {
    /// Variables valid everywhere
    pub globals: Vec<SourceVariable>,
    /// Scoped variables; one per valid range
    pub locals: Vec<SourceVariableLocal>,
    global_by_name: HashMap<String, usize>,
}

impl VariableSet {
    /// Add a global; the first of a name wins name lookups
    pub fn push_global(&mut self, variable: SourceVariable) {
        self.global_by_name
            .entry(variable.name.clone())
            .or_insert(self.globals.len());
        self.globals.push(variable);
    }

    /// Look up a global by name
    pub fn global(&self, name: &str) -> Option<&SourceVariable> {
        self.global_by_name.get(name).map(|&i| &self.globals[i])
    }
}

/// Tags that bound the scope of the variables they contain
fn is_scope(tag: gimli::DwTag) -> bool {
    matches!(
        tag,
        gimli::DW_TAG_lexical_block | gimli::DW_TAG_subprogram | gimli::DW_TAG_inlined_subroutine
    )
}

/// Resolves variables of an indexed binary
pub struct VariableResolver<'a> {
    index: &'a EntryIndex,
    types: &'a TypeTable,
    functions: &'a FunctionSet,
    ranges: RangeSection<'a>,
    locs: LocSection<'a>,
    max_child_depth: usize,
}

impl<'a> VariableResolver<'a> {
    /// Create a resolver
    pub fn new(
        index: &'a EntryIndex,
        types: &'a TypeTable,
        functions: &'a FunctionSet,
        ranges: RangeSection<'a>,
        locs: LocSection<'a>,
        config: &BuildConfig,
    ) -> Self {
        Self {
            index,
            types,
            functions,
            ranges,
            locs,
            max_child_depth: config.max_child_depth,
        }
    }

    /// Resolve every variable and formal parameter
    pub fn resolve(&self) -> VariableSet {
        let mut set = VariableSet::default();
        let mut skipped = 0;

        for entry in self.index.iter() {
            if !matches!(
                entry.tag,
                gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter
            ) || entry.flag(gimli::DW_AT_declaration)
            {
                continue;
            }
            if !self.resolve_entry(entry, &mut set) {
                skipped += 1;
            }
        }

        tracing::info!(
            "Resolved {} globals and {} locals ({} variables skipped)",
            set.globals.len(),
            set.locals.len(),
            skipped
        );
        set
    }

    fn resolve_entry(&self, entry: &Entry, set: &mut VariableSet) -> bool {
        let Some(unit) = self.index.unit(entry.unit) else {
            return false;
        };
        let origin = self.index.origin_of(entry);
        let Some(name) = first_str(entry, origin, Entry::name) else {
            tracing::debug!("Variable at 0x{:x} has no name", entry.offset);
            return false;
        };
        let Some((type_id, size)) = entry
            .type_ref()
            .or_else(|| origin.and_then(Entry::type_ref))
            .and_then(|offset| self.types.by_offset(offset))
            .and_then(|id| self.types.get(id).map(|ty| (id, ty.size)))
        else {
            tracing::debug!("Variable {} has an unresolvable type", name);
            return false;
        };

        let decl = if entry.has_attr(gimli::DW_AT_decl_line) {
            Some(entry)
        } else {
            origin
        };
        let make = |location: VarLocation| {
            let mut variable = SourceVariable::new(name, type_id, size, location)
                .with_children(self.types, self.max_child_depth);
            if let Some(decl) = decl {
                let decl_unit = self.index.unit(decl.unit).unwrap_or(unit);
                variable.decl_file = decl
                    .udata(gimli::DW_AT_decl_file)
                    .and_then(|i| decl_unit.file(i))
                    .map(str::to_string);
                variable.decl_line = decl.udata(gimli::DW_AT_decl_line).map(|l| l as u32);
            }
            variable
        };

        let scope = self
            .index
            .ancestors(entry.offset)
            .find(|e| is_scope(e.tag));
        let inside_function = scope.is_some();
        let constant = entry.attr(gimli::DW_AT_const_value).map(const_value);

        let external = entry.flag(gimli::DW_AT_external)
            || origin.is_some_and(|o| o.flag(gimli::DW_AT_external));
        let linkage_differs =
            first_str(entry, origin, Entry::linkage_name).is_some_and(|l| l != name);
        let global = if inside_function && constant.is_some() {
            false
        } else {
            !inside_function || external || linkage_differs
        };

        let location = match (constant, entry.attr(gimli::DW_AT_location)) {
            (Some(Some(value)), _) => VarLocation::Constant(value),
            (Some(None), _) => VarLocation::NotLocatable("unusable constant value".to_string()),
            (None, Some(AttrValue::Block(bytes))) => match LocExpr::decode(bytes) {
                Ok(expr) => VarLocation::Dwarf(Location::Expr(expr)),
                Err(e) => {
                    tracing::debug!("Variable {}: {}", name, e);
                    VarLocation::NotLocatable(e.to_string())
                }
            },
            (None, Some(AttrValue::LocList(offset))) => {
                match self.locs.location(*offset, unit.base_address) {
                    Ok(Location::List(entries)) if !global => {
                        // One local per list entry, scoped to that entry's range
                        let function = scope.and_then(|s| self.function_of(s));
                        for item in entries {
                            let Some(range) = SourceRange::from_exclusive(item.start, item.end)
                            else {
                                continue;
                            };
                            set.locals.push(SourceVariableLocal {
                                variable: make(VarLocation::Dwarf(Location::Expr(item.expr))),
                                range,
                                function,
                            });
                        }
                        return true;
                    }
                    Ok(location) => VarLocation::Dwarf(location),
                    Err(e) => {
                        tracing::debug!("Variable {}: {}", name, e);
                        VarLocation::NotLocatable(e.to_string())
                    }
                }
            }
            (None, Some(other)) => {
                tracing::debug!("Variable {}: unusable location class {:?}", name, other);
                VarLocation::NotLocatable("unusable location class".to_string())
            }
            (None, None) => VarLocation::NotLocatable("no location".to_string()),
        };

        if global {
            set.push_global(make(location));
            return true;
        }

        let Some(scope) = scope else {
            return false;
        };
        let ranges = self.scope_ranges(scope, unit);
        if ranges.is_empty() {
            // Abstract instances carry no code; their concrete copies do
            return false;
        }
        let function = self.function_of(scope);
        for range in ranges {
            set.locals.push(SourceVariableLocal {
                variable: make(location.clone()),
                range,
                function,
            });
        }
        true
    }

    /// Ranges of the innermost scope that has any
    fn scope_ranges(&self, scope: &Entry, unit: &CompileUnit) -> Vec<SourceRange> {
        std::iter::once(scope)
            .chain(self.index.ancestors(scope.offset))
            .filter(|e| is_scope(e.tag))
            .find_map(|e| match entry_ranges(e, unit, &self.ranges) {
                Ok(ranges) if !ranges.is_empty() => Some(ranges),
                Ok(_) => None,
                Err(err) => {
                    tracing::debug!("Scope at 0x{:x}: bad ranges: {}", e.offset, err);
                    None
                }
            })
            .unwrap_or_default()
    }

    /// Function owning a scope: the nearest enclosing subprogram or
    /// inlined instance that resolved to a function
    fn function_of(&self, scope: &Entry) -> Option<FunctionId> {
        std::iter::once(scope)
            .chain(self.index.ancestors(scope.offset))
            .find_map(|e| self.functions.for_entry(e.offset))
    }
}

/// Resolve the variables of an indexed binary
pub fn resolve_variables(
    index: &EntryIndex,
    types: &TypeTable,
    functions: &FunctionSet,
    ranges: RangeSection<'_>,
    locs: LocSection<'_>,
    config: &BuildConfig,
) -> VariableSet {
    VariableResolver::new(index, types, functions, ranges, locs, config).resolve()
}

/// A string attribute of an entry, or of its origin
fn first_str<'a>(
    entry: &'a Entry,
    origin: Option<&'a Entry>,
    f: impl Fn(&'a Entry) -> Option<&'a str>,
) -> Option<&'a str> {
    f(entry).or_else(|| origin.and_then(|o| f(o)))
}

/// Interpret a `DW_AT_const_value`
fn const_value(value: &AttrValue) -> Option<u32> {
    match value {
        AttrValue::Udata(v) => Some(*v as u32),
        AttrValue::Sdata(v) => Some(*v as u32),
        AttrValue::Block(bytes) => {
            let mut word = [0u8; 4];
            let n = bytes.len().min(4);
            word[..n].copy_from_slice(&bytes[..n]);
            Some(u32::from_le_bytes(word))
        }
        _ => None,
    }
}
