//! # coproc-source: source-level model of ARM coprocessor programs
//!
//! Builds a queryable debugging model for the ARM program embedded in a
//! cartridge from its ELF/DWARF data, and keeps variable values live
//! against a running emulator.
//!
//! ## Architecture
//!
//! - **DWARF engine** ([`dwarf`]): entry indexer, type/function/variable
//!   resolvers, location expression evaluator and CFI unwinder
//! - **Model** ([`model`]): maps instructions onto source lines, assigns
//!   owning functions and exposes the live-update API
//! - **Capabilities** ([`coproc`]): the narrow register/memory interface
//!   consumed from the emulator, plus the disassembler hook
//!
//! ## Example
//!
//! ```ignore
//! use coproc_source::{
//!     coproc::{HalfwordDisassembler, LinkedAddresses, SnapshotCoprocessor},
//!     dwarf::ElfSections,
//!     BuildConfig, SourceModel,
//! };
//!
//! let sections = ElfSections::load("game.elf", &LinkedAddresses)?;
//! let model = SourceModel::build(&sections, &HalfwordDisassembler, BuildConfig::default())?;
//!
//! let coproc = SnapshotCoprocessor::new().with_register(15, 0x8000_0100);
//! model.update_global_variables(&coproc);
//! for local in model.update_local_variables(&coproc) {
//!     println!("{} = {:?}", local.variable.name, local.variable.value());
//! }
//! ```

pub mod config;
pub mod coproc;
pub mod dwarf;
pub mod error;
pub mod model;

// Re-export commonly used types
pub use config::BuildConfig;
pub use coproc::{Coprocessor, Disassembler};
pub use error::{Result, SourceError};
pub use model::{BuildSummary, SourceModel};
