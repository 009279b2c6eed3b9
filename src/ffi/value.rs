//! Managed values exchanged with native code

use crate::error::{FfiError, FfiResult};
use crate::ffi::call::Function;
use crate::ffi::callback::Callback;
use crate::ffi::structure::{StructRef, StructType};
use crate::ffi::NativeType;
use crate::memory::MemoryView;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Managed type identity used to look up converters
///
/// `Number` and `CharSequence` are capability keys: they are never the exact
/// type of a value, but appear in the supertype list of the types that have
/// them, so a converter registered for `Number` applies to every integer and
/// floating point value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKey {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Sized integer of `size` bytes
    Integer { size: usize, unsigned: bool },
    Pointer,
    String,
    WString,
    Structure(String),
    Array,
    Callback,
    Function,
    Number,
    CharSequence,
    Named(String),
}

impl TypeKey {
    /// Built-in capabilities of this type, most specific first.
    pub fn supertypes(&self) -> Vec<TypeKey> {
        match self {
            TypeKey::I8
            | TypeKey::I16
            | TypeKey::I32
            | TypeKey::I64
            | TypeKey::F32
            | TypeKey::F64
            | TypeKey::Integer { .. } => vec![TypeKey::Number],
            TypeKey::String | TypeKey::WString => vec![TypeKey::CharSequence],
            _ => Vec::new(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        TypeKey::Named(name.into())
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKey::Integer { size, unsigned: false } => write!(f, "Integer({})", size),
            TypeKey::Integer { size, unsigned: true } => write!(f, "UnsignedInteger({})", size),
            TypeKey::Structure(name) => write!(f, "Structure({})", name),
            TypeKey::Named(name) => write!(f, "{}", name),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A string passed as `wchar_t*`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WString(String);

impl WString {
    pub fn new(s: impl Into<String>) -> Self {
        WString(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An integer with an explicit native width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntegerType {
    size: usize,
    value: i64,
    unsigned: bool,
}

impl IntegerType {
    /// Signed-or-unsigned integer of `size` bytes; the value must fit either
    /// interpretation of that width.
    pub fn new(size: usize, value: i64) -> FfiResult<Self> {
        Self::build(size, value, false)
    }

    /// Unsigned integer of `size` bytes; reads back as a non-negative value.
    pub fn new_unsigned(size: usize, value: i64) -> FfiResult<Self> {
        Self::build(size, value, true)
    }

    /// Integer with the width of the platform C `long`.
    pub fn c_long(value: i64) -> FfiResult<Self> {
        Self::new(crate::ffi::c_types::c_long_size(), value)
    }

    fn build(size: usize, value: i64, unsigned: bool) -> FfiResult<Self> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(FfiError::invalid_argument(format!(
                "Unsupported integer size {}",
                size
            )));
        }
        if size < 8 {
            let bits = size * 8;
            let min = -(1i64 << (bits - 1));
            let max_unsigned = (1i64 << bits) - 1;
            if value < min || value > max_unsigned {
                return Err(FfiError::invalid_argument(format!(
                    "Argument value 0x{:x} exceeds native capacity ({} bytes)",
                    value, size
                )));
            }
        }
        let mut integer = Self { size, value, unsigned };
        integer.value = integer.normalized(value);
        Ok(integer)
    }

    fn normalized(&self, raw: i64) -> i64 {
        if self.size == 8 {
            return raw;
        }
        let bits = self.size * 8;
        let mask = (1i64 << bits) - 1;
        if self.unsigned {
            raw & mask
        } else {
            raw
        }
    }

    /// Rebuild from the raw bits of a native value of `size` bytes.
    pub fn from_native(size: usize, unsigned: bool, raw: i64) -> FfiResult<Self> {
        let truncated = match size {
            1 => raw as i8 as i64,
            2 => raw as i16 as i64,
            4 => raw as i32 as i64,
            8 => raw,
            _ => {
                return Err(FfiError::invalid_argument(format!(
                    "Unsupported integer size {}",
                    size
                )))
            }
        };
        Self::build(size, truncated, unsigned)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn is_unsigned(&self) -> bool {
        self.unsigned
    }

    /// The fixed-width value passed to native code.
    pub fn to_native(&self) -> Value {
        match self.size {
            1 => Value::I8(self.value as i8),
            2 => Value::I16(self.value as i16),
            4 => Value::I32(self.value as i32),
            _ => Value::I64(self.value),
        }
    }
}

/// A value that converts itself to and from native form
///
/// Self-mapped values take priority over any converter in the type mapper.
/// For results and array elements there is no value yet, so a prototype
/// instance stands for the type: its [`native_type`](Self::native_type)
/// decides the native layout and [`from_native`](Self::from_native) builds
/// the managed value.
pub trait NativeMapped: fmt::Debug {
    fn native_type(&self) -> NativeType;

    fn to_native(&self) -> FfiResult<Value>;

    /// Managed value for `native`, which has the form of `native_type()`.
    fn from_native(&self, native: Value) -> FfiResult<Value>;
}

/// Prototype of a self-mapped type, used in return and array descriptors
pub type MappedType = Arc<dyn NativeMapped + Send + Sync>;

/// A user-defined managed object
pub trait ManagedObject: Any + fmt::Debug {
    fn type_key(&self) -> TypeKey;

    /// Declared capabilities, checked in order when no converter is
    /// registered for the exact type.
    fn capabilities(&self) -> Vec<TypeKey> {
        Vec::new()
    }

    fn as_native_mapped(&self) -> Option<&dyn NativeMapped> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Element type of a managed array
#[derive(Debug, Clone)]
pub enum ElementKind {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Pointer,
    String,
    WString,
    Structure {
        ty: Arc<StructType>,
        by_reference: bool,
    },
    /// Self-mapped objects, packed in the prototype's native form and
    /// rebuilt through it after the call
    Mapped(MappedType),
}

impl ElementKind {
    fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ElementKind::I8, Value::I8(_))
            | (ElementKind::I16, Value::I16(_))
            | (ElementKind::I32, Value::I32(_))
            | (ElementKind::I64, Value::I64(_))
            | (ElementKind::F32, Value::F32(_))
            | (ElementKind::F64, Value::F64(_))
            | (ElementKind::Pointer, Value::Pointer(_))
            | (ElementKind::String, Value::String(_))
            | (ElementKind::WString, Value::WString(_)) => true,
            (ElementKind::Pointer | ElementKind::String | ElementKind::WString, Value::Null) => {
                true
            }
            (ElementKind::Structure { by_reference, .. }, Value::Null) => *by_reference,
            (ElementKind::Structure { ty, .. }, Value::Structure(s)) => {
                s.borrow().struct_type().name() == ty.name()
            }
            (ElementKind::Mapped(_), Value::Object(o)) => o.as_native_mapped().is_some(),
            _ => false,
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            ElementKind::I8
                | ElementKind::I16
                | ElementKind::I32
                | ElementKind::I64
                | ElementKind::F32
                | ElementKind::F64
        )
    }
}

/// A typed managed array
#[derive(Debug, Clone)]
pub struct ManagedArray {
    kind: ElementKind,
    items: Vec<Value>,
}

impl ManagedArray {
    pub fn new(kind: ElementKind, items: Vec<Value>) -> FfiResult<Self> {
        if let Some((index, bad)) = items.iter().enumerate().find(|(_, v)| !kind.accepts(v)) {
            return Err(FfiError::invalid_argument(format!(
                "array element {} has type {}, expected {:?}",
                index,
                bad.type_name(),
                kind
            )));
        }
        Ok(Self { kind, items })
    }

    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn set(&mut self, index: usize, value: Value) -> FfiResult<()> {
        if !self.kind.accepts(&value) {
            return Err(FfiError::invalid_argument(format!(
                "cannot store {} in array of {:?}",
                value.type_name(),
                self.kind
            )));
        }
        let len = self.items.len();
        let slot = self.items.get_mut(index).ok_or_else(|| {
            FfiError::invalid_argument(format!("index {} out of range for length {}", index, len))
        })?;
        *slot = value;
        Ok(())
    }
}

pub type ArrayRef = Rc<RefCell<ManagedArray>>;

/// A managed value
#[derive(Clone)]
pub enum Value {
    /// Absent value, null pointer
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Integer(IntegerType),
    Pointer(MemoryView),
    String(String),
    WString(WString),
    Structure(StructRef),
    Array(ArrayRef),
    Callback(Rc<dyn Callback>),
    Function(Rc<Function>),
    Object(Rc<dyn ManagedObject>),
}

impl Value {
    pub fn array(kind: ElementKind, items: Vec<Value>) -> FfiResult<Value> {
        Ok(Value::Array(Rc::new(RefCell::new(ManagedArray::new(kind, items)?))))
    }

    pub fn wide(s: impl Into<String>) -> Value {
        Value::WString(WString::new(s))
    }

    pub fn object(object: impl ManagedObject) -> Value {
        Value::Object(Rc::new(object))
    }

    /// Exact managed type.
    pub fn type_key(&self) -> Option<TypeKey> {
        Some(match self {
            Value::Null => return None,
            Value::Bool(_) => TypeKey::Bool,
            Value::I8(_) => TypeKey::I8,
            Value::I16(_) => TypeKey::I16,
            Value::I32(_) => TypeKey::I32,
            Value::I64(_) => TypeKey::I64,
            Value::F32(_) => TypeKey::F32,
            Value::F64(_) => TypeKey::F64,
            Value::Integer(v) => TypeKey::Integer {
                size: v.size(),
                unsigned: v.is_unsigned(),
            },
            Value::Pointer(_) => TypeKey::Pointer,
            Value::String(_) => TypeKey::String,
            Value::WString(_) => TypeKey::WString,
            Value::Structure(s) => TypeKey::Structure(s.borrow().struct_type().name().to_string()),
            Value::Array(_) => TypeKey::Array,
            Value::Callback(_) => TypeKey::Callback,
            Value::Function(_) => TypeKey::Function,
            Value::Object(o) => o.type_key(),
        })
    }

    /// Capabilities to try, in order, after the exact type.
    pub fn capabilities(&self) -> Vec<TypeKey> {
        match self {
            Value::Object(o) => o.capabilities(),
            other => other.type_key().map(|k| k.supertypes()).unwrap_or_default(),
        }
    }

    pub fn type_name(&self) -> String {
        match self.type_key() {
            Some(key) => key.to_string(),
            None => "null".to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Any integer value widened to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I8(v) => Some(*v as i64),
            Value::I16(v) => Some(*v as i64),
            Value::I32(v) => Some(*v as i64),
            Value::I64(v) => Some(*v),
            Value::Integer(v) => Some(v.value()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F32(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::WString(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<&MemoryView> {
        match self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&StructRef> {
        match self {
            Value::Structure(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::WString(a), Value::WString(b)) => a == b,
            (Value::Structure(a), Value::Structure(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Callback(a), Value::Callback(b)) => {
                Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
            }
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::I8(v) => write!(f, "I8({})", v),
            Value::I16(v) => write!(f, "I16({})", v),
            Value::I32(v) => write!(f, "I32({})", v),
            Value::I64(v) => write!(f, "I64({})", v),
            Value::F32(v) => write!(f, "F32({})", v),
            Value::F64(v) => write!(f, "F64({})", v),
            Value::Integer(v) => write!(f, "{:?}", v),
            Value::Pointer(p) => write!(f, "Pointer({:?})", p),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::WString(s) => write!(f, "WString({:?})", s.as_str()),
            Value::Structure(s) => match s.try_borrow() {
                Ok(s) => write!(f, "Structure({})", s.struct_type().name()),
                Err(_) => write!(f, "Structure(<borrowed>)"),
            },
            Value::Array(a) => match a.try_borrow() {
                Ok(a) => write!(f, "Array({:?}; {})", a.kind(), a.len()),
                Err(_) => write!(f, "Array(<borrowed>)"),
            },
            Value::Callback(c) => write!(f, "Callback({:p})", Rc::as_ptr(c) as *const ()),
            Value::Function(func) => write!(f, "Function({})", func),
            Value::Object(o) => write!(f, "Object({:?})", o),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<MemoryView> for Value {
    fn from(v: MemoryView) -> Self {
        Value::Pointer(v)
    }
}
