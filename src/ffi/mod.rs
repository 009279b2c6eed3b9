//! Dynamic native function calls
//!
//! This module turns managed [`Value`]s into native arguments, calls an
//! arbitrary native function address through libffi, converts the result
//! back, and synchronizes by-reference arguments after the call.

pub mod c_types;
pub mod call;
pub mod callback;
pub mod invoker;
pub mod last_error;
pub mod library;
pub mod marshaling;
pub mod safety;
pub mod structure;
pub mod type_mapper;
pub mod value;

use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

pub use structure::StructType;
pub use value::TypeKey;

/// Hard limit on the number of arguments of one call
pub const MAX_ARGUMENTS: usize = 256;

bitflags! {
    /// Per-function call options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CallFlags: u32 {
        /// Alternate calling convention (stdcall on 32-bit Windows)
        const ALT_CONVENTION = 1;
        /// Clear the last error before the call and fail if it is set after
        const THROW_LAST_ERROR = 1 << 2;
    }
}

impl CallFlags {
    /// Standard C calling convention
    pub const C_CONVENTION: CallFlags = CallFlags::empty();

    const MASK_CC: u32 = 0x3;

    pub fn convention(self) -> CallingConvention {
        if self.bits() & Self::MASK_CC == CallFlags::ALT_CONVENTION.bits() {
            CallingConvention::Alt
        } else {
            CallingConvention::C
        }
    }
}

/// Native calling conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    C,
    Alt,
}

/// Declared native type of a call result, or of a converter's native side
#[derive(Debug, Clone)]
pub enum NativeType {
    Void,
    /// Native `int`, nonzero is true
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Pointer,
    /// `char*`
    String,
    /// `wchar_t*`
    WString,
    /// Sized integer, returned as [`value::IntegerType`]
    Integer { size: usize, unsigned: bool },
    /// Structure returned in registers or memory by value
    StructByValue(Arc<StructType>),
    /// Pointer to a structure, wrapped without copying
    StructByRef(Arc<StructType>),
    /// Function pointer
    Callback,
    /// Null-terminated `void**`
    PointerArray,
    /// Null-terminated `char**`
    StringArray,
    /// Null-terminated `wchar_t**`
    WStringArray,
    /// Managed type resolved through the type mapper
    Custom(TypeKey),
    /// Self-mapped managed type; the prototype names its native form and
    /// rebuilds values from it
    Mapped(MappedType),
}

impl NativeType {
    /// True for types whose native value is an address.
    pub fn is_pointer_like(&self) -> bool {
        matches!(
            self,
            NativeType::Pointer
                | NativeType::String
                | NativeType::WString
                | NativeType::StructByRef(_)
                | NativeType::Callback
                | NativeType::PointerArray
                | NativeType::StringArray
                | NativeType::WStringArray
        )
    }
}

impl PartialEq for NativeType {
    fn eq(&self, other: &Self) -> bool {
        use NativeType::*;
        match (self, other) {
            (StructByValue(a), StructByValue(b)) | (StructByRef(a), StructByRef(b)) => {
                Arc::ptr_eq(a, b) || a == b
            }
            (
                Integer { size: a, unsigned: ua },
                Integer { size: b, unsigned: ub },
            ) => a == b && ua == ub,
            (Custom(a), Custom(b)) => a == b,
            (Mapped(a), Mapped(b)) => Arc::ptr_eq(a, b),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeType::Void => write!(f, "void"),
            NativeType::Bool => write!(f, "bool"),
            NativeType::I8 => write!(f, "int8"),
            NativeType::I16 => write!(f, "int16"),
            NativeType::I32 => write!(f, "int32"),
            NativeType::I64 => write!(f, "int64"),
            NativeType::F32 => write!(f, "float"),
            NativeType::F64 => write!(f, "double"),
            NativeType::Pointer => write!(f, "pointer"),
            NativeType::String => write!(f, "char*"),
            NativeType::WString => write!(f, "wchar_t*"),
            NativeType::Integer { size, unsigned } => {
                write!(f, "{}int{}", if *unsigned { "u" } else { "" }, size * 8)
            }
            NativeType::StructByValue(t) => write!(f, "struct {}", t.name()),
            NativeType::StructByRef(t) => write!(f, "struct {}*", t.name()),
            NativeType::Callback => write!(f, "callback"),
            NativeType::PointerArray => write!(f, "void**"),
            NativeType::StringArray => write!(f, "char**"),
            NativeType::WStringArray => write!(f, "wchar_t**"),
            NativeType::Custom(key) => write!(f, "{}", key),
            NativeType::Mapped(proto) => write!(f, "mapped {}", proto.native_type()),
        }
    }
}

// Re-export key types from submodules
pub use call::{CallState, Function, Marshaller};
pub use callback::{Callback, CallbackRegistry, SharedCallbacks, Trampoline, TrampolineFactory};
pub use invoker::{FfiInvoker, NativeArg, NativeInvoker, RawCall, RawReturn, RawType, RawValue};
pub use library::{NativeLibrary, SymbolResolver};
pub use structure::{FieldType, StructRef, Structure, StructureCodec};
pub use type_mapper::{
    Conversion, FromNativeContext, FromNativeConverter, ToNativeContext, ToNativeConverter,
    TypeMapper,
};
pub use value::{
    ElementKind, IntegerType, ManagedArray, ManagedObject, MappedType, NativeMapped, Value, WString,
};
