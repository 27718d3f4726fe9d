//! Source Model Orchestrator
//!
//! [`SourceModel::build`] runs the whole pipeline once:
//!
//! 1. index the DWARF entries and parse the call frame information
//! 2. resolve types, functions and variables
//! 3. disassemble the executable sections and map instructions onto lines
//! 4. add stub functions for code without DWARF coverage
//!
//! Structure is immutable afterwards. The live API ([`update_global_variables`],
//! [`update_local_variables`], [`record_execution`]) only publishes new
//! variable snapshots and bumps atomic counters, so the model can be shared
//! with reader threads while the emulation thread updates it.
//!
//! [`update_global_variables`]: SourceModel::update_global_variables
//! [`update_local_variables`]: SourceModel::update_local_variables
//! [`record_execution`]: SourceModel::record_execution

pub mod mapper;
pub mod sorting;
pub mod source;

pub use mapper::{LineExtent, LineMapper};
pub use sorting::{FunctionSort, LineSort};
pub use source::{ExecutionStats, FileId, LineId, SourceFile, SourceInstruction, SourceLine};

use crate::config::BuildConfig;
use crate::coproc::{Coprocessor, Disassembler};
use crate::dwarf::variables::VariableSet;
use crate::dwarf::{
    resolve_functions, resolve_variables, BinarySections, EntryIndex, EvalEnv, FrameSection,
    FunctionId, FunctionSet, LocError, LocResult, LocSection, RangeSection, SourceFunction,
    SourceVariable, SourceVariableLocal, TypeBuilder, TypeTable,
};
use crate::error::{Result, ResultExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Counts describing a built model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSummary {
    /// Compile units
    pub units: usize,
    /// Source files, synthetic ones excluded
    pub files: usize,
    /// Lines with at least one instruction
    pub lines_with_code: usize,
    /// Instructions
    pub instructions: usize,
    /// Functions from DWARF
    pub functions: usize,
    /// Functions from the symbol table, driver included
    pub stub_functions: usize,
    /// Resolved types
    pub types: usize,
    /// Global variables
    pub globals: usize,
    /// Scoped local variables
    pub locals: usize,
}

impl std::fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "compile units:   {}", self.units)?;
        writeln!(f, "source files:    {}", self.files)?;
        writeln!(f, "lines with code: {}", self.lines_with_code)?;
        writeln!(f, "instructions:    {}", self.instructions)?;
        writeln!(
            f,
            "functions:       {} ({} stubs)",
            self.functions, self.stub_functions
        )?;
        writeln!(f, "types:           {}", self.types)?;
        write!(
            f,
            "variables:       {} globals, {} locals",
            self.globals, self.locals
        )
    }
}

/// Queryable source-level model of a coprocessor program
#[derive(Debug)]
pub struct SourceModel {
    config: BuildConfig,
    units: usize,
    types: Arc<TypeTable>,
    functions: FunctionSet,
    function_stats: Vec<ExecutionStats>,
    driver: FunctionId,
    driver_line: Option<LineId>,
    variables: VariableSet,
    frame: Option<FrameSection>,
    files: Vec<SourceFile>,
    lines: Vec<SourceLine>,
    instructions: BTreeMap<u32, SourceInstruction>,
    active_locals: RwLock<Vec<usize>>,
}

impl SourceModel {
    /// Build the model from a binary
    ///
    /// Fails on unsupported DWARF, missing mandatory sections or malformed
    /// call frame information. Individual types, functions and variables
    /// that cannot be resolved are logged and left out.
    pub fn build(
        sections: &dyn BinarySections,
        disassembler: &dyn Disassembler,
        config: BuildConfig,
    ) -> Result<Self> {
        config.validate()?;
        let endian = sections.endian();

        let index = EntryIndex::build(sections).context("Failed to index debug info")?;
        let frame = sections
            .section(".debug_frame")
            .map(|data| FrameSection::parse(data, endian))
            .transpose()
            .context("Failed to parse .debug_frame")?;
        let ranges = RangeSection::new(sections.section(".debug_ranges").unwrap_or(&[]), endian);
        let locs = LocSection::new(sections.section(".debug_loc").unwrap_or(&[]), endian);

        let types = Arc::new(TypeBuilder::new(&index, &config).resolve());
        let mut functions = resolve_functions(&index, &ranges, &locs);
        let variables = resolve_variables(&index, &types, &functions, ranges, locs, &config);

        let mapped = LineMapper::new(&config, &mut functions).map(&index, sections, disassembler);
        let function_stats = (0..functions.len())
            .map(|_| ExecutionStats::default())
            .collect();

        let driver_line = mapped
            .lines
            .iter()
            .position(|l| l.stub && l.function == mapped.driver)
            .map(LineId);

        let model = Self {
            units: index.units().count(),
            config,
            types,
            functions,
            function_stats,
            driver: mapped.driver,
            driver_line,
            variables,
            frame,
            files: mapped.files,
            lines: mapped.lines,
            instructions: mapped.instructions,
            active_locals: RwLock::new(Vec::new()),
        };
        tracing::info!("Source model built\n{}", model.summary());
        Ok(model)
    }

    /// Resolved types
    pub fn types(&self) -> &Arc<TypeTable> {
        &self.types
    }

    /// All functions, stubs included
    pub fn functions(&self) -> &FunctionSet {
        &self.functions
    }

    /// The catch-all stub function
    pub fn driver(&self) -> FunctionId {
        self.driver
    }

    /// Call frame information, when the binary has any
    pub fn frame_section(&self) -> Option<&FrameSection> {
        self.frame.as_ref()
    }

    /// All files
    pub fn files(&self) -> impl Iterator<Item = (FileId, &SourceFile)> {
        self.files.iter().enumerate().map(|(i, f)| (FileId(i), f))
    }

    /// Look up a file
    pub fn file(&self, id: FileId) -> Option<&SourceFile> {
        self.files.get(id.0)
    }

    /// Look up a file by full or shortened path
    pub fn file_by_path(&self, path: &str) -> Option<FileId> {
        self.files
            .iter()
            .position(|f| f.path == path || f.short_path == path)
            .map(FileId)
    }

    /// All lines
    pub fn lines(&self) -> impl Iterator<Item = &SourceLine> {
        self.lines.iter()
    }

    /// Look up a line
    pub fn line(&self, id: LineId) -> Option<&SourceLine> {
        self.lines.get(id.0)
    }

    /// Line `number` of a file
    pub fn line_in_file(&self, file: FileId, number: u32) -> Option<&SourceLine> {
        let id = self.file(file)?.lines.get(&number)?;
        self.line(*id)
    }

    /// The instruction covering `address`
    pub fn instruction_at(&self, address: u32) -> Option<&SourceInstruction> {
        self.instructions
            .range(..=address)
            .next_back()
            .map(|(_, i)| i)
            .filter(|i| i.covers(address))
    }

    /// The line owning the instruction at `address`
    pub fn line_at(&self, address: u32) -> Option<&SourceLine> {
        self.instruction_at(address)
            .and_then(|i| i.line)
            .and_then(|id| self.line(id))
    }

    /// Like [`line_at`](Self::line_at), falling back to the driver's line so
    /// that every executed address can be counted
    pub fn line_for_profiling(&self, address: u32) -> Option<&SourceLine> {
        self.line_at(address)
            .or_else(|| self.driver_line.and_then(|id| self.line(id)))
    }

    /// The function owning `address`
    pub fn function_at(&self, address: u32) -> Option<&SourceFunction> {
        self.line_at(address)
            .and_then(|line| self.functions.get(line.function))
    }

    /// Look up a function by name
    pub fn function_by_name(&self, name: &str) -> Option<&SourceFunction> {
        self.functions
            .by_name(name)
            .and_then(|id| self.functions.get(id))
    }

    /// Execution counters of a function
    pub fn function_stats(&self, id: FunctionId) -> Option<&ExecutionStats> {
        self.function_stats.get(id.0)
    }

    /// Global variables
    pub fn globals(&self) -> &[SourceVariable] {
        &self.variables.globals
    }

    /// Scoped local variables
    pub fn locals(&self) -> &[SourceVariableLocal] {
        &self.variables.locals
    }

    /// Look up a global by name
    pub fn global(&self, name: &str) -> Option<&SourceVariable> {
        self.variables.global(name)
    }

    /// The global whose storage contains `address`
    pub fn global_at(&self, address: u32) -> Option<&SourceVariable> {
        self.variables.globals.iter().find(|v| {
            v.address()
                .or_else(|| v.static_address())
                .is_some_and(|start| address >= start && address - start < v.size.max(1))
        })
    }

    fn env<'a>(&'a self, coproc: &'a dyn Coprocessor) -> EvalEnv<'a> {
        let pc = coproc.register(self.config.pc_register).unwrap_or(0);
        EvalEnv::new(coproc, pc).with_frame(self.frame.as_ref())
    }

    /// Re-evaluate every global; called once per emulated frame
    pub fn update_global_variables(&self, coproc: &dyn Coprocessor) {
        let env = self.env(coproc);
        for variable in &self.variables.globals {
            variable.update(&env);
        }
    }

    /// Indices of the locals in scope at `pc`
    ///
    /// A local is in scope when its range contains `pc` and its function
    /// is active there. Of several locals with one name, the one with the
    /// smallest range wins.
    fn scoped_local_indices(&self, pc: u32) -> Vec<usize> {
        let mut by_name: HashMap<&str, usize> = HashMap::new();
        for (i, local) in self.variables.locals.iter().enumerate() {
            if !local.range.contains(pc) {
                continue;
            }
            let active = local
                .function
                .and_then(|f| self.functions.get(f))
                .map_or(true, |f| f.contains(pc));
            if !active {
                continue;
            }
            by_name
                .entry(local.variable.name.as_str())
                .and_modify(|best| {
                    if local.range.size() < self.variables.locals[*best].range.size() {
                        *best = i;
                    }
                })
                .or_insert(i);
        }
        let mut indices: Vec<usize> = by_name.into_values().collect();
        indices.sort_unstable();
        indices
    }

    /// Locals in scope at `pc`, deduplicated by name
    pub fn locals_in_scope(&self, pc: u32) -> Vec<&SourceVariableLocal> {
        self.scoped_local_indices(pc)
            .into_iter()
            .map(|i| &self.variables.locals[i])
            .collect()
    }

    /// Re-evaluate the locals in scope at the current program counter;
    /// called on every yield or breakpoint
    ///
    /// Locals that were in scope at the previous call and no longer are get
    /// marked out of scope.
    pub fn update_local_variables(&self, coproc: &dyn Coprocessor) -> Vec<&SourceVariableLocal> {
        let env = self.env(coproc);
        let indices = self.scoped_local_indices(env.pc);

        for &i in &indices {
            let local = &self.variables.locals[i];
            let frame_base = local
                .function
                .and_then(|f| self.functions.get(f))
                .and_then(|f| f.frame_base_at(env.pc));
            local.variable.update(&env.with_frame_base(frame_base));
        }

        let previous = match self.active_locals.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, indices.clone()),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), indices.clone()),
        };
        for i in previous {
            if indices.binary_search(&i).is_err() {
                self.variables.locals[i].variable.mark_out_of_scope();
            }
        }

        indices
            .into_iter()
            .map(|i| &self.variables.locals[i])
            .collect()
    }

    /// Frame base of the function executing at the current program counter
    pub fn frame_base(&self, coproc: &dyn Coprocessor) -> std::result::Result<u32, LocError> {
        let pc = coproc
            .register(self.config.pc_register)
            .ok_or(LocError::RegisterUnavailable(self.config.pc_register))?;
        let location = self
            .function_at(pc)
            .and_then(|f| f.frame_base_at(pc))
            .ok_or(LocError::NoFrameBase)?;
        let env = EvalEnv::new(coproc, pc).with_frame(self.frame.as_ref());
        match location.evaluate(&env)? {
            LocResult::Address(address) => Ok(address),
            LocResult::Value(value) => Ok(value),
            LocResult::Pieces(_) => Err(LocError::Unsupported("split frame base".to_string())),
        }
    }

    /// Count one execution of the instruction at `address`
    pub fn record_execution(&self, address: u32, cycles: u64) {
        let Some(line) = self.line_for_profiling(address) else {
            return;
        };
        line.stats.record(cycles);
        if let Some(stats) = self.function_stats(line.function) {
            stats.record(cycles);
        }
    }

    /// Zero every line and function counter
    pub fn reset_statistics(&self) {
        for line in &self.lines {
            line.stats.reset();
        }
        for stats in &self.function_stats {
            stats.reset();
        }
    }

    /// Counts describing the model
    pub fn summary(&self) -> BuildSummary {
        let stub_functions = self.functions.iter().filter(|(_, f)| f.stub).count();
        BuildSummary {
            units: self.units,
            files: self.files.iter().filter(|f| !f.synthetic).count(),
            lines_with_code: self.lines.iter().filter(|l| l.has_code()).count(),
            instructions: self.instructions.len(),
            functions: self.functions.len() - stub_functions,
            stub_functions,
            types: self.types.len(),
            globals: self.variables.globals.len(),
            locals: self.variables.locals.len(),
        }
    }
}
