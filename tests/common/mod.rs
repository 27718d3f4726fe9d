//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use builders::{cie, fde, line_program, list_end, loc_entry, Die, Value};
use coproc_source::dwarf::{BinarySections, ElfSymbol, ExecutableSection};
use gimli::RunTimeEndian;
use std::collections::HashMap;

/// In-memory binary with hand-assembled sections
#[derive(Debug, Clone, Default)]
pub struct FakeSections {
    sections: HashMap<String, Vec<u8>>,
    symbols: Vec<ElfSymbol>,
    executable: Vec<ExecutableSection>,
}

impl FakeSections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_section(mut self, name: &str, data: Vec<u8>) -> Self {
        self.sections.insert(name.to_string(), data);
        self
    }

    pub fn without_section(mut self, name: &str) -> Self {
        self.sections.remove(name);
        self
    }

    pub fn with_symbol(mut self, symbol: ElfSymbol) -> Self {
        self.symbols.push(symbol);
        self
    }

    /// Add an executable section of Thumb `nop`s
    pub fn with_code(mut self, name: &str, origin: u32, size: usize) -> Self {
        let data = [0xc0, 0x46].repeat(size / 2);
        self.executable.push(ExecutableSection {
            name: name.to_string(),
            origin,
            data,
        });
        self
    }

    pub fn section_mut(&mut self, name: &str) -> Option<&mut Vec<u8>> {
        self.sections.get_mut(name)
    }
}

impl BinarySections for FakeSections {
    fn section(&self, name: &str) -> Option<&[u8]> {
        self.sections.get(name).map(Vec::as_slice)
    }

    fn endian(&self) -> RunTimeEndian {
        RunTimeEndian::Little
    }

    fn symbols(&self) -> &[ElfSymbol] {
        &self.symbols
    }

    fn executable_sections(&self) -> &[ExecutableSection] {
        &self.executable
    }
}

pub fn uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn sleb(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// First address of the fixture's code
pub const CODE_START: u32 = 0x1000;
/// Bytes of code in the fixture
pub const CODE_SIZE: u32 = 0x50;
/// Initial stack pointer used by fixture tests
pub const STACK: u32 = 0x2000_1000;

pub const COUNTER_ADDR: u32 = 0x2000_0000;
pub const POSITION_ADDR: u32 = 0x2000_0010;
pub const TABLE_ADDR: u32 = 0x2000_0020;

fn addr_expr(address: u32) -> Vec<u8> {
    let mut expr = vec![0x03];
    expr.extend_from_slice(&address.to_le_bytes());
    expr
}

/// Debug info of a small firmware image, one unit `main.c`:
///
/// ```text
/// 0x1000..0x1010  foo(n)          n at fbreg -4, frame base r13
/// 0x1010..0x1040  main            frame base is the CFA
///   i               r0 until 0x1020, then [r13 + 8]
///   0x1020..0x1030  block         const limit = 5
///   0x1024..0x102c  inlined foo   const n = 7
/// 0x1040..0x1048  helper_asm      symbol only
/// 0x1048..0x1050  no symbol
/// ```
pub fn firmware_unit() -> Die {
    use gimli::constants::*;

    let int = Die::new(DW_TAG_base_type)
        .label("int")
        .name("int")
        .attr(DW_AT_byte_size, Value::Data1(4))
        .attr(DW_AT_encoding, Value::Data1(DW_ATE_signed.0));
    let pos = Die::new(DW_TAG_structure_type)
        .label("pos")
        .name("pos")
        .attr(DW_AT_byte_size, Value::Data1(8))
        .child(
            Die::new(DW_TAG_member)
                .name("x")
                .type_ref("int")
                .attr(DW_AT_data_member_location, Value::Data1(0)),
        )
        .child(
            Die::new(DW_TAG_member)
                .name("y")
                .type_ref("int")
                .attr(DW_AT_data_member_location, Value::Data1(4)),
        );
    let table = Die::new(DW_TAG_array_type)
        .label("table_t")
        .type_ref("int")
        .child(Die::new(DW_TAG_subrange_type).attr(DW_AT_count, Value::Data1(4)));

    let foo_abstract = Die::new(DW_TAG_subprogram)
        .label("foo")
        .name("foo")
        .attr(DW_AT_decl_file, Value::Data1(1))
        .attr(DW_AT_decl_line, Value::Data1(3))
        .attr(DW_AT_inline, Value::Data1(DW_INL_inlined.0))
        .child(
            Die::new(DW_TAG_formal_parameter)
                .label("foo_n")
                .name("n")
                .type_ref("int")
                .attr(DW_AT_decl_file, Value::Data1(1))
                .attr(DW_AT_decl_line, Value::Data1(3)),
        );
    let foo_concrete = Die::new(DW_TAG_subprogram)
        .attr(DW_AT_abstract_origin, Value::Ref("foo"))
        .code(0x1000, 0x10)
        .attr(DW_AT_frame_base, Value::Expr(vec![0x7d, 0x00]))
        .child(
            Die::new(DW_TAG_formal_parameter)
                .attr(DW_AT_abstract_origin, Value::Ref("foo_n"))
                .location(vec![0x91, 0x7c]),
        );
    let main = Die::new(DW_TAG_subprogram)
        .name("main")
        .attr(DW_AT_external, Value::Flag)
        .attr(DW_AT_decl_file, Value::Data1(1))
        .attr(DW_AT_decl_line, Value::Data1(9))
        .code(0x1010, 0x30)
        .attr(DW_AT_frame_base, Value::Expr(vec![0x9c]))
        .child(
            Die::new(DW_TAG_variable)
                .name("i")
                .type_ref("int")
                .attr(DW_AT_location, Value::SecOffset(0)),
        )
        .child(
            Die::new(DW_TAG_lexical_block).code(0x1020, 0x10).child(
                Die::new(DW_TAG_variable)
                    .name("limit")
                    .type_ref("int")
                    .attr(DW_AT_const_value, Value::Data1(5)),
            ),
        )
        .child(
            Die::new(DW_TAG_inlined_subroutine)
                .attr(DW_AT_abstract_origin, Value::Ref("foo"))
                .code(0x1024, 0x08)
                .attr(DW_AT_call_file, Value::Data1(1))
                .attr(DW_AT_call_line, Value::Data1(11))
                .child(
                    Die::new(DW_TAG_formal_parameter)
                        .attr(DW_AT_abstract_origin, Value::Ref("foo_n"))
                        .attr(DW_AT_const_value, Value::Data1(7)),
                ),
        );

    Die::new(DW_TAG_compile_unit)
        .name("main.c")
        .attr(DW_AT_comp_dir, Value::Str("/build".to_string()))
        .code(CODE_START, CODE_SIZE)
        .attr(DW_AT_stmt_list, Value::SecOffset(0))
        .child(int)
        .child(pos)
        .child(table)
        .child(foo_abstract)
        .child(foo_concrete)
        .child(main)
        .child(
            Die::new(DW_TAG_variable)
                .name("counter")
                .type_ref("int")
                .attr(DW_AT_external, Value::Flag)
                .location(addr_expr(COUNTER_ADDR)),
        )
        .child(
            Die::new(DW_TAG_variable)
                .name("position")
                .type_ref("pos")
                .location(addr_expr(POSITION_ADDR)),
        )
        .child(
            Die::new(DW_TAG_variable)
                .name("table")
                .type_ref("table_t")
                .location(addr_expr(TABLE_ADDR)),
        )
}

/// Line rows of `main.c`; line 4 is reached from `foo` and from the
/// inlined copy in `main`
pub const LINE_ROWS: &[(u32, u32)] = &[
    (0x1000, 3),
    (0x1008, 4),
    (0x1010, 10),
    (0x1020, 11),
    (0x1024, 4),
    (0x102c, 12),
    (0x1030, 13),
];

/// `.debug_frame`: the CFA is r13 on entry and r13 + 8 after main's push
pub fn firmware_frame(cie_version: u8) -> Vec<u8> {
    let mut frame = Vec::new();
    cie(&mut frame, cie_version, &[0x0c, 0x0d, 0x00]);
    fde(&mut frame, 0, 0x1010, 0x30, &[0x44, 0x0e, 0x08]);
    frame
}

/// `.debug_loc` for `i`, offsets relative to the unit base
pub fn firmware_locs() -> Vec<u8> {
    let mut locs = Vec::new();
    loc_entry(&mut locs, 0x10, 0x20, &[0x50]);
    loc_entry(&mut locs, 0x20, 0x40, &[0x7d, 0x08]);
    list_end(&mut locs);
    locs
}

/// The complete fixture binary
pub fn firmware() -> FakeSections {
    let unit = builders::assemble_unit(&firmware_unit());
    FakeSections::new()
        .with_section(".debug_info", unit.info)
        .with_section(".debug_abbrev", unit.abbrev)
        .with_section(
            ".debug_line",
            line_program("main.c", LINE_ROWS, CODE_START + 0x40),
        )
        .with_section(".debug_loc", firmware_locs())
        .with_section(".debug_frame", firmware_frame(1))
        .with_code(".text", CODE_START, CODE_SIZE as usize)
        .with_symbol(ElfSymbol::function("foo", 0x1000, 0x10))
        .with_symbol(ElfSymbol::function("main", 0x1010, 0x30))
        .with_symbol(ElfSymbol::function("helper_asm", 0x1040, 0x08))
}

/// Config for fixture builds; the fixture's paths do not exist on disk
pub fn test_config() -> coproc_source::BuildConfig {
    coproc_source::BuildConfig::default().without_source_text()
}

/// Build the fixture model
pub fn firmware_model() -> coproc_source::SourceModel {
    coproc_source::SourceModel::build(
        &firmware(),
        &coproc_source::coproc::HalfwordDisassembler,
        test_config(),
    )
    .expect("fixture builds")
}

/// Follow `WithContext` wrappers to the underlying error
pub fn root_cause(error: &coproc_source::SourceError) -> &coproc_source::SourceError {
    match error {
        coproc_source::SourceError::WithContext { source, .. } => root_cause(source),
        other => other,
    }
}
