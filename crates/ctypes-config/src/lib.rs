//! ctypes Configuration System
//!
//! Provides configuration management for the ctypes engine:
//! - Platform data model (the `long`-family size table)
//! - Library search paths
//! - Foreign memory access policy
//! - Function signature declarations
//!
//! # Precedence
//!
//! Sources are merged lowest first:
//! 1. Global config (~/.ctypes/config.toml)
//! 2. Project config (./ctypes.toml, searched upwards)
//! 3. Environment variables (CTYPES_*)
//!
//! # Example
//!
//! ```no_run
//! use ctypes_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("data model: {:?}", config.engine.data_model());
//! ```

pub mod engine;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub use engine::{
    ConventionName, DataModelName, EngineConfig, FunctionDecl, LibraryConfig, MemoryConfig,
    PlatformConfig,
};
pub use loader::{Config, ConfigLoader};
