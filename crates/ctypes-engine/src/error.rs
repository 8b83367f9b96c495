//! Engine error taxonomy
//!
//! Every variant names the operation that failed and, for call-related
//! failures, the function and 1-based argument position.

use thiserror::Error;

/// Boxed error raised by host code (errcheck hooks, callback bodies)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the engine
#[derive(Error, Debug)]
pub enum FfiError {
    #[error("unsupported type '{name}': {reason}")]
    UnsupportedType { name: String, reason: String },

    #[error("invalid field '{field}' in '{composite}': {reason}")]
    InvalidField {
        composite: String,
        field: String,
        reason: String,
    },

    #[error("{operation}: {len} bytes at offset {offset} exceed a region of {size} bytes")]
    OutOfBounds {
        operation: &'static str,
        offset: isize,
        len: usize,
        size: usize,
    },

    #[error("{operation}: null pointer dereference (target type {target})")]
    NullDereference {
        operation: &'static str,
        target: String,
    },

    #[error("{operation}: value is not addressable: {reason}")]
    NotAddressable {
        operation: &'static str,
        reason: String,
    },

    #[error("{function}: argument {position}: expected {expected}, got {found}")]
    ArgumentType {
        function: String,
        position: usize,
        expected: String,
        found: String,
    },

    #[error("symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound { library: String, symbol: String },

    #[error("library not found: {name}")]
    LibraryNotFound { name: String },

    #[error("failed to load library '{name}': {reason}")]
    LibraryLoad { name: String, reason: String },

    #[error("{function}: calling convention '{convention}' is unsupported: {reason}")]
    UnsupportedConvention {
        function: String,
        convention: String,
        reason: String,
    },

    #[error("{operation}: cannot store {found} into {expected}")]
    TypeMismatch {
        operation: &'static str,
        expected: String,
        found: String,
    },

    #[error("{operation}: foreign address {address:#x} requires the unsafe foreign-access capability")]
    ForeignAccessDenied {
        operation: &'static str,
        address: usize,
    },

    #[error("invalid string: {0}")]
    InvalidString(String),

    #[error("callback '{callback}' failed: {reason}")]
    Callback { callback: String, reason: String },

    #[error("{function}: errcheck hook failed: {source}")]
    ErrCheck {
        function: String,
        #[source]
        source: BoxError,
    },
}

/// Result type for engine operations
pub type FfiResult<T> = Result<T, FfiError>;

impl FfiError {
    pub(crate) fn unsupported(name: impl Into<String>, reason: impl Into<String>) -> Self {
        FfiError::UnsupportedType {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(
        operation: &'static str,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        FfiError::TypeMismatch {
            operation,
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Rewrite a marshaling failure so it names the call and argument position
    pub(crate) fn at_argument(self, function: &str, position: usize) -> Self {
        match self {
            FfiError::TypeMismatch {
                expected, found, ..
            } => FfiError::ArgumentType {
                function: function.to_string(),
                position,
                expected,
                found,
            },
            FfiError::InvalidString(reason) => FfiError::ArgumentType {
                function: function.to_string(),
                position,
                expected: "string without interior NUL".to_string(),
                found: reason,
            },
            other => other,
        }
    }

    /// The host failure carried by an `ErrCheck` error
    pub fn hook_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            FfiError::ErrCheck { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
