//! Flux native interface
//!
//! This crate lets managed code call arbitrary native functions without
//! compile-time bindings. It provides owned and borrowed native memory,
//! a type conversion registry, structure layout and codecs, and a call
//! marshaller that converts arguments, invokes the function through libffi,
//! converts the result and synchronizes by-reference arguments afterwards.

pub mod config;
pub mod error;
pub mod ffi;
pub mod memory;
pub mod weak_identity;

// Re-export core types for convenience
pub use config::MarshalConfig;
pub use error::{FfiError, FfiResult, TypePosition};
pub use ffi::{
    CallFlags, CallState, Function, Marshaller, NativeLibrary, NativeType, StructType, Structure,
    TypeMapper, Value,
};
pub use memory::{MemoryView, NativeBuffer};
pub use weak_identity::IdentityWeakCache;
