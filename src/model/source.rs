//! Source-level data model: files, lines and instructions

use crate::dwarf::FunctionId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Index of a file in the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub usize);

/// Index of a line in the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineId(pub usize);

/// Execution counters, updated from the emulation thread
#[derive(Debug, Default)]
pub struct ExecutionStats {
    executions: AtomicU64,
    cycles: AtomicU64,
}

impl ExecutionStats {
    /// Count one execution taking `cycles`
    pub fn record(&self, cycles: u64) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.cycles.fetch_add(cycles, Ordering::Relaxed);
    }

    /// Number of recorded executions
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Total recorded cycles
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Zero both counters
    pub fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
        self.cycles.store(0, Ordering::Relaxed);
    }
}

/// One decoded opcode at one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInstruction {
    /// Address of the opcode
    pub address: u32,
    /// Raw opcode
    pub opcode: u32,
    /// Size in bytes
    pub size: u8,
    /// Disassembly, as produced by the disassembler
    pub text: String,
    /// Line the instruction belongs to
    pub line: Option<LineId>,
}

impl SourceInstruction {
    /// Whether `address` falls inside the opcode
    pub fn covers(&self, address: u32) -> bool {
        address >= self.address && (address - self.address) < self.size as u32
    }
}

/// One physical line of a source file
#[derive(Debug)]
pub struct SourceLine {
    /// Owning file
    pub file: FileId,
    /// One-based line number
    pub number: u32,
    /// Text of the line, empty when the file could not be read
    pub text: String,
    /// Addresses of the instructions generated for the line
    pub instructions: Vec<u32>,
    /// Function owning the line; a stub when no DWARF function does
    pub function: FunctionId,
    /// Line synthesized for code without line-table coverage
    pub stub: bool,
    /// Profiling counters
    pub stats: ExecutionStats,
}

impl SourceLine {
    /// Create a line with no code
    pub fn new(file: FileId, number: u32, text: impl Into<String>, function: FunctionId) -> Self {
        Self {
            file,
            number,
            text: text.into(),
            instructions: Vec::new(),
            function,
            stub: false,
            stats: ExecutionStats::default(),
        }
    }

    /// Whether any instruction maps to the line
    pub fn has_code(&self) -> bool {
        !self.instructions.is_empty()
    }
}

/// A source file referenced by the line table
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Full path, as recorded in the line table
    pub path: String,
    /// Path with the common prefix of all files removed
    pub short_path: String,
    /// Lines by number
    pub lines: BTreeMap<u32, LineId>,
    /// The source text was read from disk
    pub loaded: bool,
    /// Stands in for code that has no line-table coverage
    pub synthetic: bool,
}

impl SourceFile {
    /// Create a file with no lines
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            short_path: path.clone(),
            path,
            lines: BTreeMap::new(),
            loaded: false,
            synthetic: false,
        }
    }
}

/// Strip the longest directory prefix shared by every path
pub fn shorten_paths<'a>(paths: impl Iterator<Item = &'a str> + Clone) -> Vec<String> {
    let mut prefix: Option<Vec<&str>> = None;
    for path in paths.clone() {
        let dirs: Vec<&str> = match path.rsplit_once('/') {
            Some((dir, _)) => dir.split('/').collect(),
            None => Vec::new(),
        };
        prefix = Some(match prefix {
            None => dirs,
            Some(p) => p
                .iter()
                .zip(dirs.iter())
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| *a)
                .collect(),
        });
    }

    let strip = prefix
        .filter(|p| !p.is_empty())
        .map(|p| p.join("/").len() + 1)
        .unwrap_or(0);
    paths
        .map(|path| path.get(strip..).unwrap_or(path).to_string())
        .collect()
}
