//! Coprocessor source model inspector
//!
//! Loads an ELF, builds the source model and prints what it found.
//!
//! ```text
//! coproc-source <ELF> [CONFIG]
//! ```

use anyhow::Context;
use clap::Parser;
use coproc_source::{
    coproc::{HalfwordDisassembler, LinkedAddresses},
    dwarf::ElfSections,
    model::FunctionSort,
    BuildConfig, SourceModel,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "coproc-source")]
#[command(about = "Build the source model of a coprocessor ELF and print what it found")]
struct Args {
    /// ELF file with DWARF 4 debug information
    elf: PathBuf,

    /// Build configuration (TOML)
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,coproc_source=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => BuildConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => BuildConfig::default(),
    };

    let sections = ElfSections::load(&args.elf, &LinkedAddresses)
        .with_context(|| format!("Failed to load {}", args.elf.display()))?;
    let model = SourceModel::build(&sections, &HalfwordDisassembler, config)
        .context("Failed to build source model")?;

    println!("{}", model.summary());

    println!("\nfunctions:");
    for (_, function) in model.sorted_functions(FunctionSort::File, false) {
        let ranges: Vec<String> = function.ranges.iter().map(ToString::to_string).collect();
        let location = match (&function.decl_file, function.decl_line) {
            (Some(file), Some(line)) => format!("{}:{}", file, line),
            _ if function.stub => "(stub)".to_string(),
            _ => String::new(),
        };
        println!("  {:<32} {:<40} {}", function.name, location, ranges.join(" "));
    }

    println!("\nglobals:");
    for global in model.globals() {
        let type_name = model
            .types()
            .get(global.type_id)
            .map(|t| t.name.as_str())
            .unwrap_or("?");
        let address = global
            .static_address()
            .map(|a| format!("0x{:08x}", a))
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<32} {:<24} {}", global.name, type_name, address);
    }

    Ok(())
}
