//! Source-line/address mapper
//!
//! Attaches disassembled instructions to line-table rows, gives every line
//! an owning function and synthesizes stub functions for code the DWARF
//! data does not describe.

use super::source::{shorten_paths, FileId, LineId, SourceFile, SourceInstruction, SourceLine};
use crate::config::BuildConfig;
use crate::coproc::Disassembler;
use crate::dwarf::lines::LineRow;
use crate::dwarf::sections::{ElfSymbol, ElfSymbolKind};
use crate::dwarf::{BinarySections, EntryIndex, FunctionId, FunctionSet, SourceFunction, SourceRange};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Address span covered by one line-table row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineExtent {
    /// File of the row
    pub file: String,
    /// Line number of the row
    pub line: u32,
    /// First address
    pub start: u32,
    /// One past the last address
    pub end: u32,
}

/// Compute the address span of every row
///
/// A row ends where the next row starts. The last row of a sequence ends at
/// the end of the sequence or the next symbol, whichever comes first, but
/// never less than `min_line_bytes` after its start.
pub fn line_extents(rows: &[LineRow], symbol_starts: &[u32], min_line_bytes: u32) -> Vec<LineExtent> {
    let mut extents = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if row.end_sequence || row.line == 0 {
            continue;
        }
        let next = rows.get(i + 1);
        let end = match next {
            Some(next) if !next.end_sequence => next.address,
            _ => {
                let sequence_end = next.map(|n| n.address);
                let symbol = symbol_starts
                    .get(symbol_starts.partition_point(|&a| a <= row.address))
                    .copied();
                let end = match (sequence_end, symbol) {
                    (Some(a), Some(b)) => a.min(b),
                    (a, b) => a.or(b).unwrap_or(0),
                };
                end.max(row.address.saturating_add(min_line_bytes))
            }
        };
        if end > row.address {
            extents.push(LineExtent {
                file: row.file.clone(),
                line: row.line,
                start: row.address,
                end,
            });
        }
    }
    extents
}

/// Disjoint, sorted union of ranges
#[derive(Debug, Clone, Default)]
pub struct Coverage {
    spans: Vec<(u32, u32)>,
}

impl Coverage {
    /// Merge ranges into disjoint spans
    pub fn new(ranges: impl Iterator<Item = SourceRange>) -> Self {
        let mut ranges: Vec<(u32, u32)> = ranges.map(|r| (r.start, r.end)).collect();
        ranges.sort_unstable();
        let mut spans: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match spans.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
                _ => spans.push((start, end)),
            }
        }
        Self { spans }
    }

    /// Whether `address` is covered
    pub fn contains(&self, address: u32) -> bool {
        let i = self.spans.partition_point(|(start, _)| *start <= address);
        i > 0 && self.spans[i - 1].1 >= address
    }
}

/// The function with the smallest range enclosing `address`
///
/// At equal size an inlined range wins over a non-inlined one.
pub fn smallest_enclosing(functions: &FunctionSet, address: u32) -> Option<FunctionId> {
    functions
        .iter()
        .filter_map(|(id, f)| f.range_at(address).map(|r| ((r.size(), !r.inline), id)))
        .min_by_key(|(key, _)| *key)
        .map(|(_, id)| id)
}

/// Everything the mapper produces
#[derive(Debug)]
pub struct MappedSource {
    /// Files, real and synthetic
    pub files: Vec<SourceFile>,
    /// Lines of every file
    pub lines: Vec<SourceLine>,
    /// Instructions by address
    pub instructions: BTreeMap<u32, SourceInstruction>,
    /// The catch-all stub function
    pub driver: FunctionId,
}

/// Builds files, lines and instructions
pub struct LineMapper<'a> {
    config: &'a BuildConfig,
    functions: &'a mut FunctionSet,
    files: Vec<SourceFile>,
    file_by_path: HashMap<String, FileId>,
    lines: Vec<SourceLine>,
    instructions: BTreeMap<u32, SourceInstruction>,
}

impl<'a> LineMapper<'a> {
    /// Create a mapper that adds stubs to `functions`
    pub fn new(config: &'a BuildConfig, functions: &'a mut FunctionSet) -> Self {
        Self {
            config,
            functions,
            files: Vec::new(),
            file_by_path: HashMap::new(),
            lines: Vec::new(),
            instructions: BTreeMap::new(),
        }
    }

    /// Run every mapping step
    pub fn map(
        mut self,
        index: &EntryIndex,
        sections: &dyn BinarySections,
        disassembler: &dyn Disassembler,
    ) -> MappedSource {
        self.disassemble(sections, disassembler);
        self.add_symbol_stubs(sections.symbols());
        let driver = self.add_driver();

        let mut symbol_starts: Vec<u32> = sections
            .symbols()
            .iter()
            .filter(|s| s.kind == ElfSymbolKind::Function)
            .map(|s| s.address)
            .collect();
        symbol_starts.sort_unstable();
        symbol_starts.dedup();

        for unit in index.units() {
            for extent in line_extents(&unit.rows, &symbol_starts, self.config.min_line_bytes) {
                self.attach(&extent, driver);
            }
        }
        if self.config.load_source_text {
            self.load_source_text(driver);
        }
        self.attach_orphans(driver);
        self.assign_functions(driver);

        let short = shorten_paths(
            self.files
                .iter()
                .filter(|f| !f.synthetic)
                .map(|f| f.path.as_str()),
        );
        for (file, short) in self.files.iter_mut().filter(|f| !f.synthetic).zip(short) {
            file.short_path = short;
        }

        tracing::info!(
            "Mapped {} instructions onto {} lines in {} files",
            self.instructions.len(),
            self.lines.len(),
            self.files.len()
        );
        MappedSource {
            files: self.files,
            lines: self.lines,
            instructions: self.instructions,
            driver,
        }
    }

    fn disassemble(&mut self, sections: &dyn BinarySections, disassembler: &dyn Disassembler) {
        for section in sections.executable_sections() {
            let entries = disassembler.disassemble(section.origin, &section.data);
            tracing::debug!(
                "Disassembled {} opcodes from {} at 0x{:08x}",
                entries.len(),
                section.name,
                section.origin
            );
            for entry in entries {
                self.instructions.insert(
                    entry.address,
                    SourceInstruction {
                        address: entry.address,
                        opcode: entry.opcode,
                        size: entry.size,
                        text: entry.text,
                        line: None,
                    },
                );
            }
        }
    }

    /// Stub functions for symbols no DWARF function covers
    fn add_symbol_stubs(&mut self, symbols: &[ElfSymbol]) {
        let coverage = Coverage::new(self.functions.iter().flat_map(|(_, f)| f.ranges.clone()));
        let mut code: Vec<&ElfSymbol> = symbols
            .iter()
            .filter(|s| s.kind == ElfSymbolKind::Function)
            .collect();
        code.sort_by_key(|s| s.address);

        let mut count = 0;
        let mut stub_end = 0u32;
        for (i, symbol) in code.iter().enumerate() {
            // Aliases of a symbol already stubbed share its code
            if coverage.contains(symbol.address) || (count > 0 && symbol.address < stub_end) {
                continue;
            }
            let size = if symbol.size > 0 {
                symbol.size
            } else {
                code[i + 1..]
                    .iter()
                    .find(|s| s.address > symbol.address)
                    .map(|s| s.address - symbol.address)
                    .unwrap_or(self.config.min_line_bytes)
            };
            let end = symbol.address.saturating_add(size);
            if let Some(range) = SourceRange::from_exclusive(symbol.address, end) {
                stub_end = end;
                self.functions
                    .insert(SourceFunction::stub(symbol.name.clone(), vec![range]));
                count += 1;
            }
        }
        tracing::debug!("Added {} symbol-table stub functions", count);
    }

    /// The catch-all stub owning every instruction nothing else claims
    fn add_driver(&mut self) -> FunctionId {
        let coverage = Coverage::new(self.functions.iter().flat_map(|(_, f)| f.ranges.clone()));
        let mut ranges: Vec<SourceRange> = Vec::new();
        for instruction in self.instructions.values() {
            if coverage.contains(instruction.address) {
                continue;
            }
            let last = instruction
                .address
                .saturating_add(instruction.size.saturating_sub(1) as u32);
            match ranges.last_mut() {
                Some(range) if range.end.wrapping_add(1) == instruction.address => {
                    range.end = last
                }
                _ => ranges.push(SourceRange::new(instruction.address, last)),
            }
        }
        let driver_name = self.config.driver_name.clone();
        self.functions.insert(SourceFunction::stub(driver_name, ranges))
    }

    fn file_id(&mut self, path: &str) -> FileId {
        if let Some(&id) = self.file_by_path.get(path) {
            return id;
        }
        let id = FileId(self.files.len());
        self.files.push(SourceFile::new(path));
        self.file_by_path.insert(path.to_string(), id);
        id
    }

    fn line_id(&mut self, file: FileId, number: u32, driver: FunctionId) -> LineId {
        if let Some(&id) = self.files[file.0].lines.get(&number) {
            return id;
        }
        let id = LineId(self.lines.len());
        self.lines.push(SourceLine::new(file, number, "", driver));
        self.files[file.0].lines.insert(number, id);
        id
    }

    fn attach(&mut self, extent: &LineExtent, driver: FunctionId) {
        let file = self.file_id(&extent.file);
        let line = self.line_id(file, extent.line, driver);
        for instruction in self.instructions.range_mut(extent.start..extent.end).map(|(_, i)| i) {
            if instruction.line.is_none() {
                instruction.line = Some(line);
                self.lines[line.0].instructions.push(instruction.address);
            }
        }
    }

    /// Give every instruction without a row a line of its function's stub file
    fn attach_orphans(&mut self, driver: FunctionId) {
        let orphans: Vec<u32> = self
            .instructions
            .values()
            .filter(|i| i.line.is_none())
            .map(|i| i.address)
            .collect();

        for address in orphans {
            let function = smallest_enclosing(&*self.functions, address).unwrap_or(driver);
            let name = self
                .functions
                .get(function)
                .map(|f| f.name.clone())
                .unwrap_or_default();
            let file = self.file_id(&name);
            self.files[file.0].synthetic = true;
            let line = self.line_id(file, 1, function);
            self.lines[line.0].stub = true;
            self.lines[line.0].instructions.push(address);
            if let Some(instruction) = self.instructions.get_mut(&address) {
                instruction.line = Some(line);
            }
        }
    }

    /// Owning function of each line: the smallest range around its first
    /// instruction, else the driver
    fn assign_functions(&mut self, driver: FunctionId) {
        let functions = &*self.functions;
        for line in self.lines.iter_mut() {
            line.function = line
                .instructions
                .first()
                .and_then(|&address| smallest_enclosing(functions, address))
                .unwrap_or(driver);
        }
    }

    fn load_source_text(&mut self, driver: FunctionId) {
        for file in 0..self.files.len() {
            let Some(path) = self.find_source(&self.files[file].path) else {
                tracing::debug!("Source file {} not found", self.files[file].path);
                continue;
            };
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    tracing::debug!("Failed to read {}: {}", path.display(), e);
                    continue;
                }
            };
            for (i, content) in text.lines().enumerate() {
                let line = self.line_id(FileId(file), i as u32 + 1, driver);
                self.lines[line.0].text = content.to_string();
            }
            self.files[file].loaded = true;
        }
    }

    fn find_source(&self, path: &str) -> Option<PathBuf> {
        let direct = Path::new(path);
        if direct.is_file() {
            return Some(direct.to_path_buf());
        }
        let name = direct.file_name()?;
        self.config
            .source_search_paths
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }
}
