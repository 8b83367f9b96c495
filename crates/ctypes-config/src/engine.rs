//! Engine Configuration (ctypes.toml / ~/.ctypes/config.toml)
//!
//! Both the project file and the global file share this schema; the loader
//! merges them.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Engine configuration from a ctypes.toml file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Platform data model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformConfig>,

    /// Library loading
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<LibraryConfig>,

    /// Foreign memory policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryConfig>,

    /// Function signature declarations, keyed by binding name
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub functions: BTreeMap<String, FunctionDecl>,
}

/// Platform data model settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    /// Integer data model ("native", "lp64", "llp64", "ilp32")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_model: Option<DataModelName>,

    /// Size of wchar_t in bytes (2 or 4)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wchar_size: Option<usize>,
}

/// Integer data model names accepted in configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataModelName {
    /// Whatever the host compiler uses
    #[default]
    Native,
    /// long and pointers are 64-bit (Linux, macOS)
    Lp64,
    /// long is 32-bit, pointers 64-bit (64-bit Windows)
    Llp64,
    /// int, long and pointers are 32-bit
    Ilp32,
}

/// Library search settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LibraryConfig {
    /// Extra directories searched before the platform defaults
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,
}

/// Foreign memory policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Grant the unsafe foreign-read capability to pointers returned by calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_foreign_reads: Option<bool>,
}

/// Calling convention names accepted in configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConventionName {
    #[default]
    #[serde(alias = "cdecl")]
    Default,
    Stdcall,
}

/// A declared native function signature
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FunctionDecl {
    /// Library the symbol lives in (None = the running process)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,

    /// Symbol name when it differs from the binding name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,

    /// Fixed argument type names
    #[serde(default)]
    pub args: Vec<String>,

    /// Return type name (default: "void")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,

    /// Calling convention
    #[serde(default)]
    pub convention: ConventionName,

    /// Accepts trailing variadic arguments
    #[serde(default)]
    pub variadic: bool,
}

impl FunctionDecl {
    /// Symbol to resolve for the binding called `name`
    pub fn symbol_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.symbol.as_deref().unwrap_or(name)
    }

    /// Return type name, defaulting to void
    pub fn return_type(&self) -> &str {
        self.returns.as_deref().unwrap_or("void")
    }
}

impl EngineConfig {
    /// Load engine configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        Self::from_toml_str(&content, path)
    }

    /// Parse engine configuration; `file` is only used for error reporting
    pub fn from_toml_str(content: &str, file: &Path) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::TomlParseError {
            file: file.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(platform) = &self.platform {
            if let Some(size) = platform.wchar_size {
                if size != 2 && size != 4 {
                    return Err(ConfigError::InvalidValue {
                        field: "platform.wchar_size".to_string(),
                        reason: format!("must be 2 or 4, got {}", size),
                    });
                }
            }
        }

        for (name, decl) in &self.functions {
            if name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "function declarations need a non-empty name".to_string(),
                ));
            }
            if let Some(position) = decl.args.iter().position(|a| a.trim().is_empty()) {
                return Err(ConfigError::InvalidValue {
                    field: format!("functions.{}.args[{}]", name, position),
                    reason: "type name is empty".to_string(),
                });
            }
            if decl.return_type().trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("functions.{}.returns", name),
                    reason: "type name is empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Get the global config file path (~/.ctypes/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".ctypes").join("config.toml"))
    }

    /// Effective data model
    pub fn data_model(&self) -> DataModelName {
        self.platform
            .as_ref()
            .and_then(|p| p.data_model)
            .unwrap_or_default()
    }

    /// Explicit wchar_t size, if configured
    pub fn wchar_size(&self) -> Option<usize> {
        self.platform.as_ref().and_then(|p| p.wchar_size)
    }

    /// Configured library search paths, highest priority first
    pub fn search_paths(&self) -> &[PathBuf] {
        self.library
            .as_ref()
            .map(|l| l.search_paths.as_slice())
            .unwrap_or(&[])
    }

    /// Whether returned pointers may be read without an explicit grant
    pub fn allow_foreign_reads(&self) -> bool {
        self.memory
            .as_ref()
            .and_then(|m| m.allow_foreign_reads)
            .unwrap_or(false)
    }

    /// Merge another config into this one
    ///
    /// Scalar settings from `other` win when present. Search paths from
    /// `other` are placed before the existing ones. Function declarations
    /// from `other` replace same-named ones.
    pub fn merge(&mut self, other: &EngineConfig) {
        if let Some(platform) = &other.platform {
            let mine = self.platform.get_or_insert_with(Default::default);
            if platform.data_model.is_some() {
                mine.data_model = platform.data_model;
            }
            if platform.wchar_size.is_some() {
                mine.wchar_size = platform.wchar_size;
            }
        }

        if let Some(library) = &other.library {
            let mine = self.library.get_or_insert_with(Default::default);
            let mut paths = library.search_paths.clone();
            paths.extend(mine.search_paths.drain(..));
            mine.search_paths = paths;
        }

        if let Some(memory) = &other.memory {
            if memory.allow_foreign_reads.is_some() {
                self.memory
                    .get_or_insert_with(Default::default)
                    .allow_foreign_reads = memory.allow_foreign_reads;
            }
        }

        for (name, decl) in &other.functions {
            self.functions.insert(name.clone(), decl.clone());
        }
    }
}
