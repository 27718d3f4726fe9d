//! Line-table loading
//!
//! Reads a unit's `.debug_line` program into plain rows and resolves the
//! file table to full paths. Mapping rows onto instructions happens later in
//! [`crate::model::mapper`].

use super::entries::Reader;
use crate::error::Result;
use gimli::{AttributeValue, Unit};
use std::collections::HashMap;
use std::path::PathBuf;

/// One row of the line-number matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRow {
    /// Address of the first instruction of the row
    pub address: u32,
    /// Full path of the source file
    pub file: String,
    /// One-based line number, zero when the compiler emitted no line
    pub line: u32,
    /// Row marks the first address past a sequence
    pub end_sequence: bool,
}

impl LineRow {
    /// Create a statement row
    pub fn new(address: u32, file: impl Into<String>, line: u32) -> Self {
        Self {
            address,
            file: file.into(),
            line,
            end_sequence: false,
        }
    }

    /// Create an end-of-sequence row
    pub fn end(address: u32) -> Self {
        Self {
            address,
            file: String::new(),
            line: 0,
            end_sequence: true,
        }
    }
}

/// Read the file table and rows of a unit's line program
///
/// Units without a line program yield empty results.
pub fn read_line_program(
    dwarf: &gimli::Dwarf<Reader<'_>>,
    unit: &Unit<Reader<'_>>,
    comp_dir: Option<&str>,
) -> Result<(HashMap<u64, String>, Vec<LineRow>)> {
    let Some(program) = unit.line_program.clone() else {
        return Ok((HashMap::new(), Vec::new()));
    };

    let header = program.header();
    // DWARF 4 numbers files from one; zero means "no file"
    let first_index = if header.version() >= 5 { 0 } else { 1 };
    let mut files = HashMap::new();
    for (i, file) in header.file_names().iter().enumerate() {
        let name = attr_string(dwarf, unit, file.path_name())?;
        let directory = match file.directory(header) {
            Some(dir) => Some(attr_string(dwarf, unit, dir)?),
            None => None,
        };
        files.insert(
            i as u64 + first_index,
            join_path(comp_dir, directory.as_deref(), &name),
        );
    }

    let mut rows = Vec::new();
    let mut iter = program.rows();
    while let Some((_, row)) = iter.next_row()? {
        let file = files.get(&row.file_index()).cloned().unwrap_or_default();
        rows.push(LineRow {
            address: row.address() as u32,
            file,
            line: row.line().map(|l| l.get() as u32).unwrap_or(0),
            end_sequence: row.end_sequence(),
        });
    }

    Ok((files, rows))
}

fn attr_string(
    dwarf: &gimli::Dwarf<Reader<'_>>,
    unit: &Unit<Reader<'_>>,
    value: AttributeValue<Reader<'_>>,
) -> Result<String> {
    Ok(dwarf
        .attr_string(unit, value)?
        .to_string_lossy()
        .into_owned())
}

/// Join the compilation directory, include directory and file name
///
/// Absolute components replace everything before them.
pub fn join_path(comp_dir: Option<&str>, directory: Option<&str>, name: &str) -> String {
    let mut path = PathBuf::new();
    if let Some(comp_dir) = comp_dir {
        path.push(comp_dir);
    }
    if let Some(directory) = directory {
        path.push(directory);
    }
    path.push(name);
    path.to_string_lossy().into_owned()
}
