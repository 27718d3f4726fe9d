//! Configuration for source model construction
//!
//! The defaults match what the GCC builds for embedded ARM coprocessors
//! need, so most callers can use [`BuildConfig::default()`]. A configuration
//! can also be loaded from a TOML file:
//!
//! ```toml
//! type_passes = 3
//! max_child_depth = 4
//! load_source_text = true
//! source_search_paths = ["../firmware/src"]
//! ```
//!
//! Every field is optional; missing fields take their default value.

use crate::error::{Result, SourceError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of typedef/pointer/composite/array/const passes
pub const DEFAULT_TYPE_PASSES: usize = 3;

/// Default minimum extent (in bytes) of a line that ends at a sequence boundary
pub const DEFAULT_MIN_LINE_BYTES: u32 = 4;

/// Default depth bound for eager child variable synthesis
pub const DEFAULT_MAX_CHILD_DEPTH: usize = 4;

/// Register holding the program counter on ARM
pub const DEFAULT_PC_REGISTER: u16 = 15;

/// Name of the stub function that absorbs code never claimed by a symbol
pub const DEFAULT_DRIVER_NAME: &str = "<driver>";

/// Options controlling how the source model is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Number of repeated type resolution passes after base types
    pub type_passes: usize,

    /// Minimum byte extent of a line whose end falls on a sequence boundary
    pub min_line_bytes: u32,

    /// Depth bound for synthesized child variables (array elements,
    /// struct members, pointer targets)
    pub max_child_depth: usize,

    /// Tag types whose name contains "float" for IEEE-754 formatting
    pub float_name_heuristic: bool,

    /// Read physical source files so code-less lines are present
    pub load_source_text: bool,

    /// Extra directories searched for source files named in the line table
    pub source_search_paths: Vec<PathBuf>,

    /// Coprocessor register holding the program counter
    pub pc_register: u16,

    /// Name of the catch-all stub function
    pub driver_name: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            type_passes: DEFAULT_TYPE_PASSES,
            min_line_bytes: DEFAULT_MIN_LINE_BYTES,
            max_child_depth: DEFAULT_MAX_CHILD_DEPTH,
            float_name_heuristic: true,
            load_source_text: true,
            source_search_paths: Vec::new(),
            pc_register: DEFAULT_PC_REGISTER,
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
        }
    }
}

impl BuildConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BuildConfig = toml::from_str(content)
            .map_err(|e| SourceError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SourceError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SourceError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Check that the values are usable
    pub fn validate(&self) -> Result<()> {
        if self.type_passes == 0 {
            return Err(SourceError::Config(
                "type_passes must be at least 1".to_string(),
            ));
        }
        if self.min_line_bytes == 0 {
            return Err(SourceError::Config(
                "min_line_bytes must be at least 1".to_string(),
            ));
        }
        if self.driver_name.is_empty() {
            return Err(SourceError::Config("driver_name is empty".to_string()));
        }
        Ok(())
    }

    /// Disable reading source files from disk
    pub fn without_source_text(mut self) -> Self {
        self.load_source_text = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = BuildConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.type_passes, 3);
        assert_eq!(config.pc_register, 15);
        assert_eq!(config.driver_name, "<driver>");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = BuildConfig::from_toml_str("max_child_depth = 2\n").unwrap();
        assert_eq!(config.max_child_depth, 2);
        assert_eq!(config.type_passes, DEFAULT_TYPE_PASSES);
        assert!(config.float_name_heuristic);
    }

    #[test]
    fn test_zero_passes_rejected() {
        let err = BuildConfig::from_toml_str("type_passes = 0\n").unwrap_err();
        assert!(matches!(err, SourceError::Config(_)));
    }

    #[test]
    fn test_config_roundtrip_through_file() {
        let config = BuildConfig {
            source_search_paths: vec![PathBuf::from("/tmp/src")],
            ..BuildConfig::default()
        }
        .without_source_text();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = BuildConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = BuildConfig::load("/nonexistent/coproc.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
