//! Registry of custom type conversions
//!
//! A [`TypeMapper`] maps managed types to converters. Lookups try the exact
//! type first, then each of the value's capabilities in order, then fall
//! back to the built-in conversions of the marshaller. The registry is
//! populated once and then shared read-only, typically behind an `Arc`.

use crate::error::FfiResult;
use crate::ffi::call::Function;
use crate::ffi::value::{TypeKey, Value};
use crate::ffi::{NativeType, StructType};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Where a to-native conversion is happening
#[derive(Debug, Clone, Copy)]
pub enum ToNativeContext<'a> {
    /// Argument `index` of a call to `function`
    Argument {
        function: &'a Function,
        index: usize,
        args: &'a [Value],
    },
    /// A field of a structure being written
    Field {
        structure: &'a StructType,
        field: &'a str,
    },
}

/// Where a from-native conversion is happening
#[derive(Debug, Clone, Copy)]
pub enum FromNativeContext<'a> {
    /// The result of a call to `function`
    Result {
        function: &'a Function,
        args: &'a [Value],
    },
    /// A field of a structure being read
    Field {
        structure: &'a StructType,
        field: &'a str,
    },
}

/// Converts a managed value into its native representation
pub trait ToNativeConverter: Send + Sync {
    /// The native type produced by [`to_native`](Self::to_native).
    fn native_type(&self) -> NativeType;

    fn to_native(&self, value: &Value, context: &ToNativeContext<'_>) -> FfiResult<Value>;
}

/// Converts a native value back into its managed representation
pub trait FromNativeConverter: Send + Sync {
    /// The native type consumed by [`from_native`](Self::from_native).
    fn native_type(&self) -> NativeType;

    fn from_native(&self, value: Value, context: &FromNativeContext<'_>) -> FfiResult<Value>;
}

type ToNativeFn = dyn Fn(&Value, &ToNativeContext<'_>) -> FfiResult<Value> + Send + Sync;
type FromNativeFn = dyn Fn(Value, &FromNativeContext<'_>) -> FfiResult<Value> + Send + Sync;

struct FnToNative {
    native_type: NativeType,
    convert: Box<ToNativeFn>,
}

impl ToNativeConverter for FnToNative {
    fn native_type(&self) -> NativeType {
        self.native_type.clone()
    }

    fn to_native(&self, value: &Value, context: &ToNativeContext<'_>) -> FfiResult<Value> {
        (self.convert)(value, context)
    }
}

struct FnFromNative {
    native_type: NativeType,
    convert: Box<FromNativeFn>,
}

impl FromNativeConverter for FnFromNative {
    fn native_type(&self) -> NativeType {
        self.native_type.clone()
    }

    fn from_native(&self, value: Value, context: &FromNativeContext<'_>) -> FfiResult<Value> {
        (self.convert)(value, context)
    }
}

/// How one managed type crosses the native boundary
#[derive(Clone)]
pub struct Conversion {
    pub native_type: NativeType,
    pub to_native: Option<Arc<dyn ToNativeConverter>>,
    pub from_native: Option<Arc<dyn FromNativeConverter>>,
}

impl Conversion {
    /// True when the marshaller handles this type without a converter.
    pub fn is_builtin(&self) -> bool {
        self.to_native.is_none() && self.from_native.is_none()
    }
}

impl fmt::Debug for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversion")
            .field("native_type", &self.native_type)
            .field("to_native", &self.to_native.is_some())
            .field("from_native", &self.from_native.is_some())
            .finish()
    }
}

/// Converter registry, one entry per managed type and direction
#[derive(Default, Clone)]
pub struct TypeMapper {
    to_native: IndexMap<TypeKey, Arc<dyn ToNativeConverter>>,
    from_native: IndexMap<TypeKey, Arc<dyn FromNativeConverter>>,
}

impl TypeMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the to-native converter for `key`, replacing any previous one.
    pub fn register_to_native(&mut self, key: TypeKey, converter: Arc<dyn ToNativeConverter>) {
        self.to_native.insert(key, converter);
    }

    /// Register the from-native converter for `key`, replacing any previous one.
    pub fn register_from_native(&mut self, key: TypeKey, converter: Arc<dyn FromNativeConverter>) {
        self.from_native.insert(key, converter);
    }

    /// Register one object for both directions.
    pub fn register_converter<C>(&mut self, key: TypeKey, converter: Arc<C>)
    where
        C: ToNativeConverter + FromNativeConverter + 'static,
    {
        self.to_native.insert(key.clone(), converter.clone());
        self.from_native.insert(key, converter);
    }

    /// Register a closure as the to-native converter for `key`.
    pub fn add_to_native<F>(&mut self, key: TypeKey, native_type: NativeType, convert: F)
    where
        F: Fn(&Value, &ToNativeContext<'_>) -> FfiResult<Value> + Send + Sync + 'static,
    {
        self.register_to_native(
            key,
            Arc::new(FnToNative {
                native_type,
                convert: Box::new(convert),
            }),
        );
    }

    /// Register a closure as the from-native converter for `key`.
    pub fn add_from_native<F>(&mut self, key: TypeKey, native_type: NativeType, convert: F)
    where
        F: Fn(Value, &FromNativeContext<'_>) -> FfiResult<Value> + Send + Sync + 'static,
    {
        self.register_from_native(
            key,
            Arc::new(FnFromNative {
                native_type,
                convert: Box::new(convert),
            }),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.to_native.is_empty() && self.from_native.is_empty()
    }

    /// To-native converter for a value: its exact type, then its capabilities.
    pub fn to_native_converter(&self, value: &Value) -> Option<Arc<dyn ToNativeConverter>> {
        let exact = value.type_key()?;
        std::iter::once(exact)
            .chain(value.capabilities())
            .find_map(|key| self.to_native.get(&key).cloned())
    }

    /// From-native converter for a managed type: exact, then its supertypes.
    pub fn from_native_converter(&self, key: &TypeKey) -> Option<Arc<dyn FromNativeConverter>> {
        if let Some(converter) = self.from_native.get(key) {
            return Some(converter.clone());
        }
        key.supertypes()
            .iter()
            .find_map(|key| self.from_native.get(key).cloned())
    }

    /// Resolve how `key` is marshalled.
    ///
    /// Registered converters win; otherwise the built-in category is
    /// returned. `None` means the type cannot cross the boundary, and the
    /// caller reports it with the parameter index and function.
    pub fn resolve(&self, key: &TypeKey) -> Option<Conversion> {
        let to_native = std::iter::once(key.clone())
            .chain(key.supertypes())
            .find_map(|k| self.to_native.get(&k).cloned());
        let from_native = self.from_native_converter(key);

        let native_type = match (&to_native, &from_native) {
            (Some(c), _) => c.native_type(),
            (None, Some(c)) => c.native_type(),
            (None, None) => {
                return builtin_native_type(key).map(|native_type| Conversion {
                    native_type,
                    to_native: None,
                    from_native: None,
                })
            }
        };

        Some(Conversion {
            native_type,
            to_native,
            from_native,
        })
    }
}

/// Native category of the types the marshaller converts on its own.
///
/// Structures cross by reference unless a by-value descriptor says
/// otherwise, so their category here is a pointer. Capability keys and
/// named types have no built-in form.
pub fn builtin_native_type(key: &TypeKey) -> Option<NativeType> {
    Some(match key {
        TypeKey::Bool => NativeType::Bool,
        TypeKey::I8 => NativeType::I8,
        TypeKey::I16 => NativeType::I16,
        TypeKey::I32 => NativeType::I32,
        TypeKey::I64 => NativeType::I64,
        TypeKey::F32 => NativeType::F32,
        TypeKey::F64 => NativeType::F64,
        TypeKey::Pointer => NativeType::Pointer,
        TypeKey::String => NativeType::String,
        TypeKey::WString => NativeType::WString,
        TypeKey::Callback | TypeKey::Function => NativeType::Callback,
        TypeKey::Array => NativeType::PointerArray,
        TypeKey::Integer { size, unsigned } => NativeType::Integer {
            size: *size,
            unsigned: *unsigned,
        },
        TypeKey::Structure(_) => NativeType::Pointer,
        TypeKey::Number | TypeKey::CharSequence | TypeKey::Named(_) => return None,
    })
}

impl fmt::Debug for TypeMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMapper")
            .field("to_native", &self.to_native.keys().collect::<Vec<_>>())
            .field("from_native", &self.from_native.keys().collect::<Vec<_>>())
            .finish()
    }
}
