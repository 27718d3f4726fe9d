//! DWARF engine
//!
//! Leaf-first:
//! - [`sections`]: binary section access and the ELF adapter
//! - [`entries`]: one-pass entry indexer
//! - [`ranges`]: address ranges and `.debug_ranges` decoding
//! - [`lines`]: line-table loading
//! - [`frame`]: call frame information unwinder
//! - [`loclist`]: location expression evaluator
//! - [`type_table`], [`functions`], [`variables`]: resolvers

pub mod entries;
pub mod frame;
pub mod functions;
pub mod lines;
pub mod loclist;
pub mod ranges;
pub mod sections;
pub mod type_table;
pub mod variables;

pub use entries::{AttrValue, CompileUnit, Entry, EntryIndex};
pub use frame::{FrameError, FrameSection};
pub use functions::{resolve_functions, FunctionId, FunctionSet, SourceFunction};
pub use loclist::{EvalEnv, LocError, LocExpr, LocResult, LocSection, Location};
pub use ranges::{RangeSection, SourceRange};
pub use sections::{BinarySections, ElfSections, ElfSymbol, ExecutableSection};
pub use type_table::{SourceType, TypeBuilder, TypeId, TypeTable};
pub use variables::{
    resolve_variables, Resolution, SourceVariable, SourceVariableLocal, VariableSet,
};
