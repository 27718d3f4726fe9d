//! Sorted views over lines and functions

use super::source::SourceLine;
use super::SourceModel;
use crate::dwarf::{FunctionId, SourceFunction};
use std::cmp::Ordering;

/// Sort key for lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineSort {
    /// File path, then line number
    #[default]
    File,
    /// Owning function name, then file and line
    Function,
    /// Line number, then file
    Number,
    /// Recorded executions
    Executions,
    /// Recorded cycles
    Cycles,
}

/// Sort key for functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunctionSort {
    /// Function name
    #[default]
    Name,
    /// Declaring file, then declaring line
    File,
    /// Recorded executions
    Executions,
    /// Recorded cycles
    Cycles,
}

impl SourceModel {
    /// Lines that carry code, sorted by `key`
    pub fn sorted_lines(&self, key: LineSort, descending: bool) -> Vec<&SourceLine> {
        let mut lines: Vec<&SourceLine> = self.lines().filter(|l| l.has_code()).collect();
        let by_location = |a: &SourceLine, b: &SourceLine| {
            self.file_path(a)
                .cmp(self.file_path(b))
                .then(a.number.cmp(&b.number))
        };
        lines.sort_by(|a, b| {
            let order = match key {
                LineSort::File => by_location(a, b),
                LineSort::Function => self
                    .function_name(a.function)
                    .cmp(self.function_name(b.function))
                    .then_with(|| by_location(a, b)),
                LineSort::Number => a
                    .number
                    .cmp(&b.number)
                    .then(self.file_path(a).cmp(self.file_path(b))),
                LineSort::Executions => a
                    .stats
                    .executions()
                    .cmp(&b.stats.executions())
                    .then_with(|| by_location(a, b)),
                LineSort::Cycles => a
                    .stats
                    .cycles()
                    .cmp(&b.stats.cycles())
                    .then_with(|| by_location(a, b)),
            };
            directed(order, descending)
        });
        lines
    }

    /// Functions sorted by `key`
    pub fn sorted_functions(
        &self,
        key: FunctionSort,
        descending: bool,
    ) -> Vec<(FunctionId, &SourceFunction)> {
        let mut functions: Vec<(FunctionId, &SourceFunction)> = self.functions().iter().collect();
        functions.sort_by(|(a_id, a), (b_id, b)| {
            let order = match key {
                FunctionSort::Name => a.name.cmp(&b.name),
                FunctionSort::File => a
                    .decl_file
                    .cmp(&b.decl_file)
                    .then(a.decl_line.cmp(&b.decl_line))
                    .then_with(|| a.name.cmp(&b.name)),
                FunctionSort::Executions => self
                    .function_stats(*a_id)
                    .map(|s| s.executions())
                    .cmp(&self.function_stats(*b_id).map(|s| s.executions()))
                    .then_with(|| a.name.cmp(&b.name)),
                FunctionSort::Cycles => self
                    .function_stats(*a_id)
                    .map(|s| s.cycles())
                    .cmp(&self.function_stats(*b_id).map(|s| s.cycles()))
                    .then_with(|| a.name.cmp(&b.name)),
            };
            directed(order, descending)
        });
        functions
    }

    fn file_path(&self, line: &SourceLine) -> &str {
        self.file(line.file).map(|f| f.path.as_str()).unwrap_or("")
    }

    fn function_name(&self, id: FunctionId) -> &str {
        self.functions()
            .get(id)
            .map(|f| f.name.as_str())
            .unwrap_or("")
    }
}

fn directed(order: Ordering, descending: bool) -> Ordering {
    if descending {
        order.reverse()
    } else {
        order
    }
}
