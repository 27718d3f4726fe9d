//! Integration tests for the source model
//!
//! These tests build a model from a hand-assembled DWARF 4 image
//! (see `common::firmware`) and exercise:
//! - Function, type and variable resolution end to end
//! - Instruction to line mapping and stub functions
//! - Live variable updates and scope changes
//! - Frame base computation through the call frame information
//! - Execution statistics and sorted views
//! - Build failures for unsupported input

mod common;

use common::*;
use coproc_source::{
    coproc::{HalfwordDisassembler, SnapshotCoprocessor},
    dwarf::{FrameError, LocError, Resolution, SourceRange},
    model::{FunctionSort, LineSort},
    BuildConfig, SourceError, SourceModel,
};

fn coproc_at(pc: u32) -> SnapshotCoprocessor {
    SnapshotCoprocessor::new()
        .with_register(15, pc)
        .with_register(13, STACK)
}

// ============================================================================
// Build and resolution
// ============================================================================

#[test]
fn test_build_summary() {
    let model = firmware_model();
    let summary = model.summary();

    assert_eq!(summary.units, 1);
    assert_eq!(summary.files, 1);
    assert_eq!(summary.instructions, (CODE_SIZE / 2) as usize);
    assert_eq!(summary.functions, 2);
    assert_eq!(summary.stub_functions, 2);
    assert_eq!(summary.globals, 3);
    assert_eq!(summary.locals, 5);
    // Six rows of main.c plus one stub line each for helper_asm and the driver
    assert_eq!(summary.lines_with_code, 8);

    assert!(summary.to_string().contains("3 globals, 5 locals"));
}

#[test]
fn test_abstract_and_inlined_functions_merge() {
    let model = firmware_model();
    let foo = model.function_by_name("foo").expect("foo resolved");

    assert_eq!(
        foo.ranges,
        vec![
            SourceRange::new(0x1000, 0x100f),
            SourceRange::new(0x1024, 0x102b).inlined(),
        ]
    );
    assert_eq!(foo.decl_file.as_deref(), Some("/build/main.c"));
    assert_eq!(foo.decl_line, Some(3));
    assert!(foo.frame_base.is_some());
    assert!(!foo.stub);

    let main = model.function_by_name("main").expect("main resolved");
    assert_eq!(main.ranges, vec![SourceRange::new(0x1010, 0x103f)]);
    assert_eq!(main.decl_line, Some(9));
}

#[test]
fn test_stub_functions_from_symbols_and_driver() {
    let model = firmware_model();

    let helper = model.function_by_name("helper_asm").expect("stub added");
    assert!(helper.stub);
    assert_eq!(helper.ranges, vec![SourceRange::new(0x1040, 0x1047)]);

    let driver = model.functions().get(model.driver()).expect("driver exists");
    assert_eq!(driver.name, "<driver>");
    assert!(driver.stub);
    assert_eq!(driver.ranges, vec![SourceRange::new(0x1048, 0x104f)]);

    // Symbols already described by DWARF do not get stubs
    assert_eq!(
        model.functions().iter().filter(|(_, f)| f.name == "foo").count(),
        1
    );
}

#[test]
fn test_types_resolved() {
    let model = firmware_model();
    let types = model.types();

    let pos = types
        .find_by_name("pos")
        .and_then(|id| types.get(id))
        .expect("pos resolved");
    assert_eq!(pos.size, 8);
    let names: Vec<&str> = pos.members().iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["x", "y"]);

    let table = model.global("table").expect("table resolved");
    let table_type = types.get(table.type_id).expect("table type");
    assert_eq!(table_type.size, 16);
    assert_eq!(table.children().len(), 4);
}

#[test]
fn test_globals_and_locals_classified() {
    let model = firmware_model();

    let globals: Vec<&str> = model.globals().iter().map(|v| v.name.as_str()).collect();
    assert_eq!(globals, vec!["counter", "position", "table"]);

    let mut locals: Vec<(&str, u32, u32)> = model
        .locals()
        .iter()
        .map(|l| (l.variable.name.as_str(), l.range.start, l.range.end))
        .collect();
    locals.sort();
    assert_eq!(
        locals,
        vec![
            ("i", 0x1010, 0x101f),
            ("i", 0x1020, 0x103f),
            ("limit", 0x1020, 0x102f),
            ("n", 0x1000, 0x100f),
            ("n", 0x1024, 0x102b),
        ]
    );

    // Parameters declared through an abstract origin inherit its declaration
    let n = model
        .locals()
        .iter()
        .find(|l| l.variable.name == "n")
        .expect("n resolved");
    assert_eq!(n.variable.decl_file.as_deref(), Some("/build/main.c"));
}

// ============================================================================
// Line mapping
// ============================================================================

#[test]
fn test_every_instruction_maps_to_a_line_that_lists_it() {
    let model = firmware_model();

    for address in (CODE_START..CODE_START + CODE_SIZE).step_by(2) {
        let instruction = model.instruction_at(address).expect("instruction exists");
        assert_eq!(instruction.address, address);
        let line = model.line_at(address).expect("every instruction has a line");
        assert!(
            line.instructions.contains(&address),
            "line {} does not list 0x{:x}",
            line.number,
            address
        );
    }
}

#[test]
fn test_every_function_address_maps_back_to_its_function() {
    let model = firmware_model();

    for (_, function) in model.functions().iter() {
        for range in &function.ranges {
            for address in (range.start..=range.end).step_by(2) {
                let owner = model
                    .function_at(address)
                    .unwrap_or_else(|| panic!("0x{:x} in {} has no function", address, function.name));
                assert!(
                    owner.contains(address),
                    "{} owns 0x{:x} without covering it",
                    owner.name,
                    address
                );
            }
        }
    }
}

#[test]
fn test_line_owners() {
    let model = firmware_model();
    let file = model.file_by_path("/build/main.c").expect("main.c mapped");
    assert_eq!(model.file(file).map(|f| f.short_path.as_str()), Some("main.c"));
    assert_eq!(model.file_by_path("main.c"), Some(file));

    let name_of = |number: u32| {
        let line = model.line_in_file(file, number).expect("line exists");
        model
            .functions()
            .get(line.function)
            .map(|f| f.name.clone())
            .unwrap_or_default()
    };
    assert_eq!(name_of(3), "foo");
    assert_eq!(name_of(4), "foo");
    assert_eq!(name_of(10), "main");
    assert_eq!(name_of(13), "main");

    // Line 4 is reached from foo and from its inlined copy
    let line4 = model.line_in_file(file, 4).expect("line 4");
    assert_eq!(
        line4.instructions,
        vec![0x1008, 0x100a, 0x100c, 0x100e, 0x1024, 0x1026, 0x1028, 0x102a]
    );

    // The last row ends at the next symbol
    assert_eq!(model.line_at(0x103e).map(|l| l.number), Some(13));
}

#[test]
fn test_uncovered_code_gets_synthetic_stub_lines() {
    let model = firmware_model();

    let helper_line = model.line_at(0x1044).expect("stub line");
    assert!(helper_line.stub);
    assert_eq!(helper_line.number, 1);
    let helper_file = model.file(helper_line.file).expect("stub file");
    assert!(helper_file.synthetic);
    assert_eq!(helper_file.path, "helper_asm");
    assert_eq!(model.function_at(0x1044).map(|f| f.name.as_str()), Some("helper_asm"));

    let driver_line = model.line_at(0x104a).expect("driver line");
    assert_eq!(driver_line.function, model.driver());
    assert_eq!(driver_line.instructions, vec![0x1048, 0x104a, 0x104c, 0x104e]);

    // Addresses outside any code still profile against the driver
    assert!(model.line_at(0x9000).is_none());
    let fallback = model.line_for_profiling(0x9000).expect("driver fallback");
    assert_eq!(fallback.function, model.driver());
    assert!(fallback.stub);
    // The same line the driver's own code maps to
    let driver_line = model.line_at(0x1048).expect("driver code has a line");
    assert!(std::ptr::eq(fallback, driver_line));
    assert!(std::ptr::eq(
        model.line_for_profiling(0xffff_fff0).expect("driver fallback"),
        fallback
    ));
}

#[test]
fn test_source_text_loaded_from_search_path() {
    let dir = tempfile::tempdir().expect("temp dir");
    let text: String = (1..=14).map(|i| format!("// line {}\n", i)).collect();
    std::fs::write(dir.path().join("main.c"), text).expect("write source");

    let config = BuildConfig {
        source_search_paths: vec![dir.path().to_path_buf()],
        ..BuildConfig::default()
    };
    let model = SourceModel::build(&firmware(), &HalfwordDisassembler, config).expect("builds");

    let file = model.file_by_path("/build/main.c").expect("main.c mapped");
    assert!(model.file(file).is_some_and(|f| f.loaded));

    let first = model.line_in_file(file, 1).expect("text-only line");
    assert_eq!(first.text, "// line 1");
    assert!(!first.has_code());
    assert_eq!(first.function, model.driver());

    let code = model.line_in_file(file, 3).expect("code line");
    assert_eq!(code.text, "// line 3");
    assert!(code.has_code());

    // Text-only lines do not show up in the code views
    assert_eq!(model.summary().lines_with_code, 8);
    assert_eq!(model.sorted_lines(LineSort::File, false).len(), 8);
}

// ============================================================================
// Live variables
// ============================================================================

#[test]
fn test_update_global_variables() {
    let model = firmware_model();
    let coproc = coproc_at(0x1010)
        .with_word(COUNTER_ADDR, 0xffff_fffe)
        .with_word(POSITION_ADDR, 3)
        .with_word(POSITION_ADDR + 4, 4)
        .with_word(TABLE_ADDR, 10)
        .with_word(TABLE_ADDR + 4, 20)
        .with_word(TABLE_ADDR + 8, 30)
        .with_word(TABLE_ADDR + 12, 40);

    let counter = model.global("counter").expect("counter");
    assert_eq!(*counter.snapshot(), Resolution::Pending);
    assert_eq!(counter.static_address(), Some(COUNTER_ADDR));

    model.update_global_variables(&coproc);

    assert_eq!(counter.address(), Some(COUNTER_ADDR));
    assert_eq!(counter.value(), Some(0xffff_fffe));
    let int = model.types().get(counter.type_id).expect("int");
    assert_eq!(int.format_value(0xffff_fffe), "-2");

    let position = model.global("position").expect("position");
    let y = position.child_path(&["y"]).expect("member y");
    assert_eq!(y.address(), Some(POSITION_ADDR + 4));
    assert_eq!(y.value(), Some(4));

    let table = model.global("table").expect("table");
    assert_eq!(table.child_path(&["[2]"]).and_then(|v| v.value()), Some(30));

    assert_eq!(model.global_at(POSITION_ADDR + 6).map(|v| v.name.as_str()), Some("position"));
    assert!(model.global_at(TABLE_ADDR + 16).is_none());
}

#[test]
fn test_unreadable_global_resolves_without_value() {
    let model = firmware_model();
    model.update_global_variables(&coproc_at(0x1010));

    let counter = model.global("counter").expect("counter");
    assert_eq!(
        *counter.snapshot(),
        Resolution::Resolved {
            address: Some(COUNTER_ADDR),
            value: None
        }
    );
}

#[test]
fn test_locals_in_scope_inside_inlined_call() {
    let model = firmware_model();

    let mut names: Vec<&str> = model
        .locals_in_scope(0x1028)
        .iter()
        .map(|l| l.variable.name.as_str())
        .collect();
    names.sort();
    assert_eq!(names, vec!["i", "limit", "n"]);

    let names: Vec<&str> = model
        .locals_in_scope(0x1004)
        .iter()
        .map(|l| l.variable.name.as_str())
        .collect();
    assert_eq!(names, vec!["n"]);

    assert!(model.locals_in_scope(0x1044).is_empty());
}

#[test]
fn test_update_local_variables_follows_scope() {
    let model = firmware_model();

    let coproc = coproc_at(0x1028).with_word(STACK + 8, 42);
    let updated = model.update_local_variables(&coproc);
    assert_eq!(updated.len(), 3);
    let value_of = |name: &str| {
        updated
            .iter()
            .find(|l| l.variable.name == name)
            .and_then(|l| l.variable.value())
    };
    assert_eq!(value_of("i"), Some(42));
    assert_eq!(value_of("limit"), Some(5));
    assert_eq!(value_of("n"), Some(7));

    // i lives in r0 before the block
    let coproc = coproc_at(0x1018).with_register(0, 99);
    let updated = model.update_local_variables(&coproc);
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].variable.name, "i");
    assert_eq!(updated[0].variable.value(), Some(99));

    let stale = |name: &str, start: u32| {
        model
            .locals()
            .iter()
            .find(|l| l.variable.name == name && l.range.start == start)
            .map(|l| l.variable.snapshot())
            .expect("local exists")
    };
    assert_eq!(*stale("i", 0x1020), Resolution::OutOfScope);
    assert_eq!(*stale("limit", 0x1020), Resolution::OutOfScope);
    assert_eq!(*stale("n", 0x1024), Resolution::OutOfScope);
}

#[test]
fn test_parameter_through_frame_base() {
    let model = firmware_model();
    let coproc = coproc_at(0x1004).with_word(STACK - 4, 9);

    let updated = model.update_local_variables(&coproc);
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].variable.address(), Some(STACK - 4));
    assert_eq!(updated[0].variable.value(), Some(9));
}

// ============================================================================
// Frame base
// ============================================================================

#[test]
fn test_frame_base_follows_call_frame_information() {
    let model = firmware_model();
    assert_eq!(model.frame_section().map(|f| f.fde_count()), Some(1));

    // Before and after main's push
    assert_eq!(model.frame_base(&coproc_at(0x1010)), Ok(STACK));
    assert_eq!(model.frame_base(&coproc_at(0x1020)), Ok(STACK + 8));

    // foo uses r13 directly
    assert_eq!(model.frame_base(&coproc_at(0x1004)), Ok(STACK));

    // The copy of foo inlined into main runs in main's frame
    assert_eq!(model.function_at(0x1024).map(|f| f.name.as_str()), Some("foo"));
    assert_eq!(model.frame_base(&coproc_at(0x1024)), Ok(STACK + 8));
}

#[test]
fn test_frame_base_errors() {
    let model = firmware_model();

    let no_pc = SnapshotCoprocessor::new().with_register(13, STACK);
    assert_eq!(
        model.frame_base(&no_pc),
        Err(LocError::RegisterUnavailable(15))
    );

    // Stubs have no frame base
    assert_eq!(model.frame_base(&coproc_at(0x1044)), Err(LocError::NoFrameBase));

    let no_sp = SnapshotCoprocessor::new().with_register(15, 0x1020);
    assert_eq!(
        model.frame_base(&no_sp),
        Err(LocError::Frame(FrameError::RegisterUnavailable(13)))
    );
}

#[test]
fn test_frame_base_without_frame_section() {
    let sections = firmware().without_section(".debug_frame");
    let model = SourceModel::build(&sections, &HalfwordDisassembler, test_config())
        .expect("builds without CFI");

    assert!(model.frame_section().is_none());
    assert_eq!(
        model.frame_base(&coproc_at(0x1020)),
        Err(LocError::NoFrameSection)
    );
}

// ============================================================================
// Statistics
// ============================================================================

#[test]
fn test_execution_statistics() {
    let model = firmware_model();
    let foo = model
        .functions()
        .by_name("foo")
        .expect("foo resolved");

    model.record_execution(0x1028, 3);
    model.record_execution(0x100a, 1);
    model.record_execution(0x104a, 2);
    model.record_execution(0x9000, 5);

    let line4 = model.line_at(0x1008).expect("line 4");
    assert_eq!(line4.stats.executions(), 2);
    assert_eq!(line4.stats.cycles(), 4);
    assert_eq!(model.function_stats(foo).map(|s| s.executions()), Some(2));

    let driver_stats = model.function_stats(model.driver()).expect("driver stats");
    assert_eq!(driver_stats.executions(), 2);
    assert_eq!(driver_stats.cycles(), 7);

    let by_cycles = model.sorted_functions(FunctionSort::Cycles, true);
    assert_eq!(by_cycles[0].0, model.driver());
    assert_eq!(by_cycles[1].0, foo);

    let lines = model.sorted_lines(LineSort::Cycles, true);
    assert_eq!(lines[0].function, model.driver());
    assert_eq!(lines[1].number, 4);

    model.reset_statistics();
    assert_eq!(line4.stats.executions(), 0);
    assert_eq!(model.function_stats(foo).map(|s| s.cycles()), Some(0));
}

#[test]
fn test_sorted_views() {
    let model = firmware_model();

    let names: Vec<&str> = model
        .sorted_functions(FunctionSort::Name, false)
        .into_iter()
        .map(|(_, f)| f.name.as_str())
        .collect();
    assert_eq!(names, vec!["<driver>", "foo", "helper_asm", "main"]);

    let numbers: Vec<u32> = model
        .sorted_lines(LineSort::Number, true)
        .into_iter()
        .map(|l| l.number)
        .collect();
    assert_eq!(numbers.first(), Some(&13));

    let by_function: Vec<&str> = model
        .sorted_lines(LineSort::Function, false)
        .into_iter()
        .filter_map(|l| model.functions().get(l.function))
        .map(|f| f.name.as_str())
        .collect();
    assert_eq!(by_function.first(), Some(&"<driver>"));
    assert_eq!(by_function.last(), Some(&"main"));
}

#[test]
fn test_model_shared_across_threads() {
    let model = firmware_model();
    let coproc = coproc_at(0x1010).with_word(COUNTER_ADDR, 7);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..100 {
                model.update_global_variables(&coproc);
                model.record_execution(0x1000, 1);
            }
        });
        scope.spawn(|| {
            for _ in 0..100 {
                let snapshot = model.global("counter").map(|v| v.snapshot());
                assert!(matches!(
                    snapshot.as_deref(),
                    Some(Resolution::Pending) | Some(Resolution::Resolved { .. })
                ));
            }
        });
    });

    assert_eq!(model.global("counter").and_then(|v| v.value()), Some(7));
    assert_eq!(model.line_at(0x1000).map(|l| l.stats.executions()), Some(100));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_custom_driver_name() {
    let config = BuildConfig {
        driver_name: "<boot>".to_string(),
        ..test_config()
    };
    let model = SourceModel::build(&firmware(), &HalfwordDisassembler, config).expect("builds");
    assert_eq!(
        model.functions().get(model.driver()).map(|f| f.name.as_str()),
        Some("<boot>")
    );
    assert_eq!(
        model.line_at(0x104a).and_then(|l| model.file(l.file)).map(|f| f.path.as_str()),
        Some("<boot>")
    );
}

#[test]
fn test_without_symbols_driver_claims_trailing_code() {
    let unit = common::builders::assemble_unit(&firmware_unit());
    let sections = FakeSections::new()
        .with_section(".debug_info", unit.info)
        .with_section(".debug_abbrev", unit.abbrev)
        .with_section(
            ".debug_line",
            common::builders::line_program("main.c", LINE_ROWS, CODE_START + 0x40),
        )
        .with_code(".text", CODE_START, CODE_SIZE as usize);

    let model = SourceModel::build(&sections, &HalfwordDisassembler, test_config())
        .expect("builds");
    let driver = model.functions().get(model.driver()).expect("driver");
    assert_eq!(driver.ranges, vec![SourceRange::new(0x1040, 0x104f)]);
    assert_eq!(model.summary().stub_functions, 1);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_unsupported_dwarf_version_rejected() {
    let mut sections = firmware();
    let info = sections.section_mut(".debug_info").expect("info present");
    info[4..6].copy_from_slice(&2u16.to_le_bytes());

    let err = SourceModel::build(&sections, &HalfwordDisassembler, test_config())
        .expect_err("DWARF 2 rejected");
    assert!(matches!(
        root_cause(&err),
        SourceError::UnsupportedDwarfVersion {
            version: 2,
            offset: 0
        }
    ));
}

#[test]
fn test_missing_line_table_rejected() {
    let sections = firmware().without_section(".debug_line");
    let err = SourceModel::build(&sections, &HalfwordDisassembler, test_config())
        .expect_err("line table is mandatory");
    assert!(matches!(
        root_cause(&err),
        SourceError::MissingSection(".debug_line")
    ));
}

#[test]
fn test_malformed_frame_rejected() {
    let sections = firmware().with_section(".debug_frame", firmware_frame(3));
    let err = SourceModel::build(&sections, &HalfwordDisassembler, test_config())
        .expect_err("CIE version 3 rejected");
    assert!(matches!(
        root_cause(&err),
        SourceError::MalformedFrame(FrameError::UnsupportedCieVersion(3))
    ));
}

#[test]
fn test_invalid_config_rejected() {
    let config = BuildConfig {
        min_line_bytes: 0,
        ..test_config()
    };
    let err = SourceModel::build(&firmware(), &HalfwordDisassembler, config)
        .expect_err("config validated");
    assert!(matches!(err, SourceError::Config(_)));
}
