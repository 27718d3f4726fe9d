//! Error handling for the source model
//!
//! This module defines the build-fatal error type and a Result alias used
//! throughout the crate. Entity-local failures (a single variable or frame
//! that cannot be resolved) use the narrower error types in
//! [`crate::dwarf::loclist`] and [`crate::dwarf::frame`] and never surface here.

use crate::dwarf::frame::FrameError;
use thiserror::Error;

/// Main error type for source model construction
#[derive(Error, Debug)]
pub enum SourceError {
    /// Errors related to ELF container parsing
    #[error("ELF error: {0}")]
    Elf(String),

    /// Errors reported by the object crate
    #[error("Object error: {0}")]
    Object(#[from] object::Error),

    /// Errors reported while decoding DWARF data
    #[error("DWARF error: {0}")]
    Dwarf(#[from] gimli::Error),

    /// A compile unit was not emitted with the supported DWARF version
    #[error("Unsupported DWARF version {version} in unit at offset 0x{offset:x}")]
    UnsupportedDwarfVersion { version: u16, offset: usize },

    /// The binary uses a feature outside the supported subset
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A mandatory section is absent from the binary
    #[error("Missing section: {0}")]
    MissingSection(&'static str),

    /// The call frame section could not be parsed
    #[error("Malformed call frame information: {0}")]
    MalformedFrame(#[from] FrameError),

    /// An entry references a compile unit that was never indexed
    #[error("Entry at offset 0x{offset:x} references unknown compile unit {unit}")]
    UnknownCompileUnit { offset: usize, unit: usize },

    /// Errors related to configuration loading
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<SourceError>,
    },
}

impl SourceError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        SourceError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for source model operations
pub type Result<T> = std::result::Result<T, SourceError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<SourceError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
