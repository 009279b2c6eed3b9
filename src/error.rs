//! Error types for native calls and native memory
//!
//! Every failure raised by the marshaller, the memory subsystem or the
//! conversion registry is an [`FfiError`]. Errors raised before a native
//! call is issued guarantee that no native code ran.

use std::fmt;
use thiserror::Error;

/// Where in a call or structure a type problem was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypePosition {
    Parameter(usize),
    Return,
    Field(String),
}

impl fmt::Display for TypePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypePosition::Parameter(index) => write!(f, "parameter {}", index),
            TypePosition::Return => write!(f, "return value"),
            TypePosition::Field(name) => write!(f, "field '{}'", name),
        }
    }
}

/// Errors raised by the native call and memory layers
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FfiError {
    #[error("Cannot allocate {size} bytes of native memory")]
    Allocation { size: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Bounds exceeds available space: offset {offset} + {size} bytes, view size {limit}")]
    Bounds {
        offset: usize,
        size: usize,
        limit: usize,
    },

    #[error("Native memory at 0x{address:x} has already been disposed")]
    StaleHandle { address: usize },

    #[error("Unsupported {position} type {type_name} in {function}")]
    UnsupportedType {
        function: String,
        position: TypePosition,
        type_name: String,
    },

    #[error("Maximum argument count is {limit}, got {count}")]
    TooManyArguments { count: usize, limit: usize },

    #[error("Native call to {function} failed with last error {code}")]
    LastError { function: String, code: i32 },

    #[error("Symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound { symbol: String, library: String },

    #[error("Failed to load library '{library}': {reason}")]
    LibraryLoad { library: String, reason: String },

    #[error("Cannot convert {position} of {function}: {reason}")]
    Conversion {
        function: String,
        position: TypePosition,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for native call and memory operations
pub type FfiResult<T> = Result<T, FfiError>;

impl FfiError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn bounds(offset: usize, size: usize, limit: usize) -> Self {
        Self::Bounds { offset, size, limit }
    }

    pub fn unsupported_type(function: &str, position: TypePosition, type_name: &str) -> Self {
        Self::UnsupportedType {
            function: function.to_string(),
            position,
            type_name: type_name.to_string(),
        }
    }

    pub fn conversion(function: &str, position: TypePosition, reason: &str) -> Self {
        Self::Conversion {
            function: function.to_string(),
            position,
            reason: reason.to_string(),
        }
    }

    pub fn symbol_not_found(symbol: &str, library: &str) -> Self {
        Self::SymbolNotFound {
            symbol: symbol.to_string(),
            library: library.to_string(),
        }
    }

    pub fn library_load(library: &str, reason: &str) -> Self {
        Self::LibraryLoad {
            library: library.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for errors that are raised before any native code executes.
    pub fn is_pre_call(&self) -> bool {
        !matches!(self, FfiError::LastError { .. })
    }
}
