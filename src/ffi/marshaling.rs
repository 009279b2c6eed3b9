//! Argument and result marshalling
//!
//! A [`MarshalingContext`] lives for one call. It converts managed arguments
//! to [`NativeArg`]s in parameter order, owns the scratch memory those
//! arguments point into, records what must be read back after the call, and
//! converts the raw result according to the declared return type.

use crate::error::{FfiError, FfiResult, TypePosition};
use crate::ffi::call::Function;
use crate::ffi::callback::CallbackRegistry;
use crate::ffi::invoker::{NativeArg, RawType, RawValue};
use crate::ffi::safety::SafetyChecker;
use crate::ffi::structure::{StructRef, StructType, Structure};
use crate::ffi::type_mapper::{
    FromNativeContext, FromNativeConverter, ToNativeContext, TypeMapper,
};
use crate::ffi::value::{ArrayRef, ElementKind, IntegerType, MappedType, TypeKey, Value};
use crate::ffi::NativeType;
use crate::memory::strings;
use crate::memory::{MemoryView, NarrowEncoding, NativeBuffer, StringFlavor, POINTER_SIZE};
use std::cell::RefCell;
use std::sync::Arc;

/// Work to do after the call for one argument
enum SyncAction {
    /// Structure passed by reference
    ReadStructure(StructRef),
    /// Primitive array copied to `view`
    ReadPrimitives { array: ArrayRef, view: MemoryView },
    /// Pointer array packed into `view`
    ReadPointers { array: ArrayRef, view: MemoryView },
    /// Structure-by-reference array packed into `view`
    ResolveStructures {
        array: ArrayRef,
        view: MemoryView,
        ty: Arc<StructType>,
    },
    /// Structures written contiguously
    ReadStructures(ArrayRef),
    /// Self-mapped objects packed as `element`s into `view`
    ReadMapped {
        array: ArrayRef,
        view: MemoryView,
        proto: MappedType,
        element: ElementKind,
    },
}

/// How the raw result is obtained and turned into a managed value
pub struct ReturnPlan {
    raw: RawType,
    native: NativeType,
    converter: Option<Arc<dyn FromNativeConverter>>,
    mapped: Option<MappedType>,
}

impl ReturnPlan {
    pub fn raw_type(&self) -> &RawType {
        &self.raw
    }
}

/// Per-call marshalling state
pub struct MarshalingContext<'a> {
    function: &'a Function,
    args: &'a [Value],
    mapper: Option<&'a TypeMapper>,
    callbacks: &'a RefCell<CallbackRegistry>,
    safety: &'a SafetyChecker,
    encoding: NarrowEncoding,
    zeroed: bool,
    scratch: Vec<NativeBuffer>,
    sync: Vec<SyncAction>,
}

impl<'a> MarshalingContext<'a> {
    pub fn new(
        function: &'a Function,
        args: &'a [Value],
        mapper: Option<&'a TypeMapper>,
        callbacks: &'a RefCell<CallbackRegistry>,
        safety: &'a SafetyChecker,
    ) -> Self {
        Self {
            function,
            args,
            mapper,
            callbacks,
            safety,
            encoding: NarrowEncoding::Utf8,
            zeroed: true,
            scratch: Vec::new(),
            sync: Vec::new(),
        }
    }

    pub fn with_encoding(mut self, encoding: NarrowEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_zeroed_allocations(mut self, zeroed: bool) -> Self {
        self.zeroed = zeroed;
        self
    }

    /// Number of scratch blocks allocated so far.
    pub fn scratch_count(&self) -> usize {
        self.scratch.len()
    }

    fn unsupported(&self, index: usize, value: &Value) -> FfiError {
        FfiError::unsupported_type(
            &self.function.to_string(),
            TypePosition::Parameter(index),
            &value.type_name(),
        )
    }

    fn allocate(&mut self, size: usize) -> FfiResult<MemoryView> {
        let buffer = NativeBuffer::allocate_with(size.max(1), self.zeroed)?;
        let view = buffer.view();
        self.scratch.push(buffer);
        Ok(view)
    }

    fn native_string(&mut self, index: usize, text: &str, flavor: StringFlavor) -> FfiResult<usize> {
        self.safety.check_string(self.function, index, text)?;
        let buffer = NativeBuffer::from_bytes(&strings::encode(text, flavor, self.encoding))?;
        let address = buffer.address();
        self.scratch.push(buffer);
        Ok(address)
    }

    /// Convert argument `index`.
    ///
    /// Self-mapping values convert themselves; otherwise a registered
    /// converter applies; the result then goes through the built-in rules.
    pub fn marshal_argument(&mut self, index: usize) -> FfiResult<NativeArg> {
        let args = self.args;
        let value = &args[index];

        if let Value::Object(object) = value {
            if let Some(mapped) = object.as_native_mapped() {
                let native = mapped.to_native()?;
                return self.marshal_builtin(index, &native);
            }
        }

        if let Some(converter) = self.mapper.and_then(|m| m.to_native_converter(value)) {
            let context = ToNativeContext::Argument {
                function: self.function,
                index,
                args,
            };
            let native = converter.to_native(value, &context)?;
            return self.marshal_builtin(index, &native);
        }

        self.marshal_builtin(index, value)
    }

    fn marshal_builtin(&mut self, index: usize, value: &Value) -> FfiResult<NativeArg> {
        Ok(match value {
            Value::Null => NativeArg::Pointer(0),
            Value::Bool(b) => NativeArg::I32(if *b { -1 } else { 0 }),
            Value::I8(v) => NativeArg::I8(*v),
            Value::I16(v) => NativeArg::I16(*v),
            Value::I32(v) => NativeArg::I32(*v),
            Value::I64(v) => NativeArg::I64(*v),
            Value::F32(v) => NativeArg::F32(*v),
            Value::F64(v) => NativeArg::F64(*v),
            Value::Integer(v) => return self.marshal_builtin(index, &v.to_native()),
            Value::Pointer(p) => NativeArg::Pointer(p.address()),
            Value::String(s) => NativeArg::Pointer(self.native_string(index, s, StringFlavor::Narrow)?),
            Value::WString(s) => {
                NativeArg::Pointer(self.native_string(index, s.as_str(), StringFlavor::Wide)?)
            }
            Value::Structure(s) => self.marshal_structure(index, s)?,
            Value::Array(a) => NativeArg::Pointer(self.marshal_array(index, a)?),
            Value::Callback(cb) => NativeArg::Pointer(self.callbacks.borrow_mut().pointer_for(cb)?),
            Value::Function(f) => NativeArg::Pointer(f.address()),
            Value::Object(_) => return Err(self.unsupported(index, value)),
        })
    }

    fn marshal_structure(&mut self, index: usize, structure: &StructRef) -> FfiResult<NativeArg> {
        let mut s = structure.try_borrow_mut().map_err(|_| {
            FfiError::conversion(
                &self.function.to_string(),
                TypePosition::Parameter(index),
                "structure is already borrowed",
            )
        })?;
        if s.auto_synch() {
            s.write()?;
        }
        if s.is_by_value() {
            return Ok(NativeArg::Struct {
                address: s.address(),
                ty: s.struct_type().clone(),
            });
        }
        if s.auto_synch() {
            self.sync.push(SyncAction::ReadStructure(structure.clone()));
        }
        Ok(NativeArg::Pointer(s.address()))
    }

    fn marshal_array(&mut self, index: usize, array: &ArrayRef) -> FfiResult<usize> {
        let guard = array.borrow();
        let kind = guard.kind().clone();
        let len = guard.len();

        match kind {
            ElementKind::Structure { ty, by_reference: false } => {
                if len == 0 {
                    return Err(FfiError::invalid_argument(format!(
                        "Structure array argument {} of {} must have at least one element",
                        index, self.function
                    )));
                }
                let block = self.allocate(ty.size() * len)?;
                for (i, item) in guard.items().iter().enumerate() {
                    let slot = block.share(i * ty.size(), ty.size())?;
                    if let Value::Structure(s) = item {
                        let mut s = s.borrow_mut();
                        s.use_memory(slot)?;
                        s.write()?;
                    }
                }
                drop(guard);
                self.sync.push(SyncAction::ReadStructures(array.clone()));
                Ok(block.address())
            }
            ElementKind::Structure { ty, by_reference: true } => {
                let slots = self.allocate((len + 1) * POINTER_SIZE)?;
                for (i, item) in guard.items().iter().enumerate() {
                    let address = match item {
                        Value::Structure(s) => {
                            let mut s = s.borrow_mut();
                            if s.auto_synch() {
                                s.write()?;
                            }
                            s.address()
                        }
                        _ => 0,
                    };
                    slots.write_address(i * POINTER_SIZE, address)?;
                }
                slots.write_address(len * POINTER_SIZE, 0)?;
                drop(guard);
                self.sync.push(SyncAction::ResolveStructures {
                    array: array.clone(),
                    view: slots.clone(),
                    ty,
                });
                Ok(slots.address())
            }
            ElementKind::String | ElementKind::WString => {
                let flavor = if matches!(kind, ElementKind::WString) {
                    StringFlavor::Wide
                } else {
                    StringFlavor::Narrow
                };
                let items: Vec<Value> = guard.items().to_vec();
                drop(guard);
                let slots = self.allocate((len + 1) * POINTER_SIZE)?;
                for (i, item) in items.iter().enumerate() {
                    let address = match item.as_str() {
                        Some(text) => self.native_string(index, text, flavor)?,
                        None => 0,
                    };
                    slots.write_address(i * POINTER_SIZE, address)?;
                }
                slots.write_address(len * POINTER_SIZE, 0)?;
                Ok(slots.address())
            }
            ElementKind::Pointer => {
                let slots = self.allocate((len + 1) * POINTER_SIZE)?;
                for (i, item) in guard.items().iter().enumerate() {
                    let address = item.as_pointer().map_or(0, MemoryView::address);
                    slots.write_address(i * POINTER_SIZE, address)?;
                }
                slots.write_address(len * POINTER_SIZE, 0)?;
                drop(guard);
                self.sync.push(SyncAction::ReadPointers {
                    array: array.clone(),
                    view: slots.clone(),
                });
                Ok(slots.address())
            }
            ElementKind::Mapped(proto) => {
                let native = proto.native_type();
                let element = mapped_element(&native).ok_or_else(|| {
                    FfiError::unsupported_type(
                        &self.function.to_string(),
                        TypePosition::Parameter(index),
                        &format!("array of {}", native),
                    )
                })?;
                let size = element_size(&element);
                let items: Vec<Value> = guard.items().to_vec();
                drop(guard);
                let block = self.allocate(size * len)?;
                for (i, item) in items.iter().enumerate() {
                    let mapped = match item {
                        Value::Object(o) => o.as_native_mapped(),
                        _ => None,
                    }
                    .ok_or_else(|| self.unsupported(index, item))?;
                    let raw = mapped.to_native()?;
                    let value = coerce_element(&element, &raw).ok_or_else(|| {
                        FfiError::conversion(
                            &self.function.to_string(),
                            TypePosition::Parameter(index),
                            &format!("element {} converted to {}, expected {}", i, raw.type_name(), native),
                        )
                    })?;
                    write_element(&block, i * size, &value)?;
                }
                self.sync.push(SyncAction::ReadMapped {
                    array: array.clone(),
                    view: block.clone(),
                    proto,
                    element,
                });
                Ok(block.address())
            }
            primitive => {
                let size = element_size(&primitive);
                let block = self.allocate(size * len)?;
                for (i, item) in guard.items().iter().enumerate() {
                    write_element(&block, i * size, item)?;
                }
                drop(guard);
                self.sync.push(SyncAction::ReadPrimitives {
                    array: array.clone(),
                    view: block.clone(),
                });
                Ok(block.address())
            }
        }
    }

    /// Decide the raw return type for `ret`, before anything is invoked.
    ///
    /// A self-mapped return takes its native form from the prototype and
    /// ignores the type mapper.
    pub fn plan_return(&self, ret: &NativeType) -> FfiResult<ReturnPlan> {
        let unsupported = |native: &NativeType| {
            FfiError::unsupported_type(
                &self.function.to_string(),
                TypePosition::Return,
                &native.to_string(),
            )
        };

        if let NativeType::Mapped(proto) = ret {
            let native = proto.native_type();
            let raw = raw_type(&native).ok_or_else(|| unsupported(ret))?;
            return Ok(ReturnPlan {
                raw,
                native,
                converter: None,
                mapped: Some(proto.clone()),
            });
        }

        let converter = managed_key(ret).and_then(|key| {
            self.mapper.and_then(|m| m.from_native_converter(&key))
        });

        let native = match (&converter, ret) {
            (Some(c), _) => c.native_type(),
            (None, NativeType::Custom(key)) => {
                return Err(FfiError::unsupported_type(
                    &self.function.to_string(),
                    TypePosition::Return,
                    &key.to_string(),
                ))
            }
            (None, other) => other.clone(),
        };

        let raw = raw_type(&native).ok_or_else(|| unsupported(&native))?;

        Ok(ReturnPlan {
            raw,
            native,
            converter,
            mapped: None,
        })
    }

    /// Convert the raw result according to `plan`.
    pub fn unmarshal_return(&self, plan: &ReturnPlan, raw: RawValue) -> FfiResult<Value> {
        let value = self.builtin_result(&plan.native, raw)?;
        if let Some(proto) = &plan.mapped {
            return proto.from_native(value);
        }
        match &plan.converter {
            Some(converter) => {
                let context = FromNativeContext::Result {
                    function: self.function,
                    args: self.args,
                };
                converter.from_native(value, &context)
            }
            None => Ok(value),
        }
    }

    fn builtin_result(&self, native: &NativeType, raw: RawValue) -> FfiResult<Value> {
        let mismatch = || {
            FfiError::conversion(
                &self.function.to_string(),
                TypePosition::Return,
                &format!("raw result does not match declared type {}", native),
            )
        };
        let address = |raw: &RawValue| match raw {
            RawValue::Pointer(a) => Ok(*a),
            _ => Err(mismatch()),
        };

        Ok(match native {
            NativeType::Void => Value::Null,
            NativeType::Bool => Value::Bool(raw.as_i64().ok_or_else(mismatch)? as i32 != 0),
            NativeType::I8 => Value::I8(raw.as_i64().ok_or_else(mismatch)? as i8),
            NativeType::I16 => Value::I16(raw.as_i64().ok_or_else(mismatch)? as i16),
            NativeType::I32 => Value::I32(raw.as_i64().ok_or_else(mismatch)? as i32),
            NativeType::I64 => Value::I64(raw.as_i64().ok_or_else(mismatch)?),
            NativeType::F32 => match raw {
                RawValue::F32(v) => Value::F32(v),
                _ => return Err(mismatch()),
            },
            NativeType::F64 => match raw {
                RawValue::F64(v) => Value::F64(v),
                _ => return Err(mismatch()),
            },
            NativeType::Integer { size, unsigned } => Value::Integer(IntegerType::from_native(
                *size,
                *unsigned,
                raw.as_i64().ok_or_else(mismatch)?,
            )?),
            NativeType::Pointer => {
                MemoryView::external_unchecked(address(&raw)?, None).map_or(Value::Null, Value::Pointer)
            }
            NativeType::String | NativeType::WString => {
                let flavor = if matches!(native, NativeType::WString) {
                    StringFlavor::Wide
                } else {
                    StringFlavor::Narrow
                };
                match MemoryView::external_unchecked(address(&raw)?, None) {
                    None => Value::Null,
                    Some(p) => {
                        let text = p.read_string(0, flavor, self.encoding)?;
                        match flavor {
                            StringFlavor::Wide => Value::wide(text),
                            StringFlavor::Narrow => Value::String(text),
                        }
                    }
                }
            }
            NativeType::StructByValue(ty) => match raw {
                RawValue::Struct(buffer) => {
                    let structure = {
                        let mut s = Structure::over(ty, buffer.share(0, ty.size())?)?.by_value();
                        s.load()?;
                        s
                    };
                    Value::Structure(structure.into_ref())
                }
                _ => return Err(mismatch()),
            },
            NativeType::StructByRef(ty) => {
                match MemoryView::external_unchecked(address(&raw)?, Some(ty.size())) {
                    None => Value::Null,
                    Some(view) => Value::Structure(read_structure_at(ty, view)?),
                }
            }
            NativeType::Callback => self
                .callbacks
                .borrow_mut()
                .resolve(address(&raw)?, self.function.flags()),
            NativeType::PointerArray => match MemoryView::external_unchecked(address(&raw)?, None) {
                None => Value::Null,
                Some(p) => {
                    let items = p
                        .read_address_array(0)?
                        .into_iter()
                        .filter_map(|a| MemoryView::external_unchecked(a, None))
                        .map(Value::Pointer)
                        .collect();
                    Value::array(ElementKind::Pointer, items)?
                }
            },
            NativeType::StringArray | NativeType::WStringArray => {
                let (flavor, kind) = if matches!(native, NativeType::WStringArray) {
                    (StringFlavor::Wide, ElementKind::WString)
                } else {
                    (StringFlavor::Narrow, ElementKind::String)
                };
                match MemoryView::external_unchecked(address(&raw)?, None) {
                    None => Value::Null,
                    Some(p) => {
                        // The returned array is covered by the function's
                        // signature contract.
                        let items = unsafe { p.read_string_array(0, flavor, self.encoding)? }
                            .into_iter()
                            .map(|s| match flavor {
                                StringFlavor::Wide => Value::wide(s),
                                StringFlavor::Narrow => Value::String(s),
                            })
                            .collect();
                        Value::array(kind, items)?
                    }
                }
            }
            NativeType::Custom(key) => {
                return Err(FfiError::unsupported_type(
                    &self.function.to_string(),
                    TypePosition::Return,
                    &key.to_string(),
                ))
            }
            NativeType::Mapped(_) => return Err(mismatch()),
        })
    }

    /// Read back by-reference arguments in parameter order.
    ///
    /// Stops at the first failure.
    pub fn synchronize(self) -> FfiResult<()> {
        for action in self.sync {
            match action {
                SyncAction::ReadStructure(s) => s.borrow_mut().load()?,
                SyncAction::ReadPrimitives { array, view } => {
                    let mut array = array.borrow_mut();
                    let size = element_size(array.kind());
                    for i in 0..array.len() {
                        let value = read_element(&view, i * size, array.kind())?;
                        array.set(i, value)?;
                    }
                }
                SyncAction::ReadPointers { array, view } => {
                    let mut array = array.borrow_mut();
                    for i in 0..array.len() {
                        let address = view.read_address(i * POINTER_SIZE)?;
                        let unchanged = array
                            .get(i)
                            .and_then(Value::as_pointer)
                            .map_or(false, |p| p.address() == address);
                        if !unchanged {
                            let value = MemoryView::external_unchecked(address, None)
                                .map_or(Value::Null, Value::Pointer);
                            array.set(i, value)?;
                        }
                    }
                }
                SyncAction::ResolveStructures { array, view, ty } => {
                    let len = array.borrow().len();
                    for i in 0..len {
                        let address = view.read_address(i * POINTER_SIZE)?;
                        let current = array.borrow().get(i).cloned().unwrap_or(Value::Null);
                        let resolved = match (&current, address) {
                            (_, 0) => Value::Null,
                            (Value::Structure(s), a) if s.borrow().address() == a => {
                                if s.borrow().auto_synch() {
                                    s.borrow_mut().load()?;
                                }
                                current.clone()
                            }
                            (_, a) => match MemoryView::external_unchecked(a, Some(ty.size())) {
                                Some(view) => Value::Structure(read_structure_at(&ty, view)?),
                                None => Value::Null,
                            },
                        };
                        array.borrow_mut().set(i, resolved)?;
                    }
                }
                SyncAction::ReadStructures(array) => {
                    for item in array.borrow().items() {
                        if let Value::Structure(s) = item {
                            s.borrow_mut().load()?;
                        }
                    }
                }
                SyncAction::ReadMapped {
                    array,
                    view,
                    proto,
                    element,
                } => {
                    let native = proto.native_type();
                    let size = element_size(&element);
                    let len = array.borrow().len();
                    for i in 0..len {
                        let raw = element_as(&native, read_element(&view, i * size, &element)?)?;
                        let value = proto.from_native(raw)?;
                        array.borrow_mut().set(i, value)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Wrap native memory at a returned or substituted address as a structure.
fn read_structure_at(ty: &Arc<StructType>, view: MemoryView) -> FfiResult<StructRef> {
    let mut s = Structure::over(ty, view)?;
    s.load()?;
    Ok(s.into_ref())
}

/// The managed type whose from-native converter governs a declared return.
fn managed_key(ret: &NativeType) -> Option<TypeKey> {
    Some(match ret {
        NativeType::Void | NativeType::Callback | NativeType::Mapped(_) => return None,
        NativeType::Bool => TypeKey::Bool,
        NativeType::I8 => TypeKey::I8,
        NativeType::I16 => TypeKey::I16,
        NativeType::I32 => TypeKey::I32,
        NativeType::I64 => TypeKey::I64,
        NativeType::F32 => TypeKey::F32,
        NativeType::F64 => TypeKey::F64,
        NativeType::Pointer => TypeKey::Pointer,
        NativeType::String => TypeKey::String,
        NativeType::WString => TypeKey::WString,
        NativeType::Integer { size, unsigned } => TypeKey::Integer {
            size: *size,
            unsigned: *unsigned,
        },
        NativeType::StructByValue(ty) | NativeType::StructByRef(ty) => {
            TypeKey::Structure(ty.name().to_string())
        }
        NativeType::PointerArray | NativeType::StringArray | NativeType::WStringArray => {
            TypeKey::Array
        }
        NativeType::Custom(key) => key.clone(),
    })
}

fn raw_type(native: &NativeType) -> Option<RawType> {
    Some(match native {
        NativeType::Void => RawType::Void,
        NativeType::Bool | NativeType::I32 => RawType::I32,
        NativeType::I8 => RawType::I8,
        NativeType::I16 => RawType::I16,
        NativeType::I64 => RawType::I64,
        NativeType::F32 => RawType::F32,
        NativeType::F64 => RawType::F64,
        NativeType::Integer { size, .. } => match size {
            1 => RawType::I8,
            2 => RawType::I16,
            4 => RawType::I32,
            8 => RawType::I64,
            _ => return None,
        },
        NativeType::StructByValue(ty) => RawType::Struct(ty.clone()),
        NativeType::Pointer
        | NativeType::String
        | NativeType::WString
        | NativeType::StructByRef(_)
        | NativeType::Callback
        | NativeType::PointerArray
        | NativeType::StringArray
        | NativeType::WStringArray => RawType::Pointer,
        NativeType::Custom(_) | NativeType::Mapped(_) => return None,
    })
}

fn element_size(kind: &ElementKind) -> usize {
    match kind {
        ElementKind::I8 => 1,
        ElementKind::I16 => 2,
        ElementKind::I32 | ElementKind::F32 => 4,
        ElementKind::I64 | ElementKind::F64 => 8,
        ElementKind::Pointer | ElementKind::String | ElementKind::WString => POINTER_SIZE,
        ElementKind::Structure { ty, by_reference } => {
            if *by_reference {
                POINTER_SIZE
            } else {
                ty.size()
            }
        }
        ElementKind::Mapped(proto) => {
            mapped_element(&proto.native_type()).map_or(POINTER_SIZE, |e| element_size(&e))
        }
    }
}

/// Primitive slot layout of a self-mapped type's native form.
fn mapped_element(native: &NativeType) -> Option<ElementKind> {
    Some(match native {
        NativeType::I8 => ElementKind::I8,
        NativeType::I16 => ElementKind::I16,
        NativeType::Bool | NativeType::I32 => ElementKind::I32,
        NativeType::I64 => ElementKind::I64,
        NativeType::F32 => ElementKind::F32,
        NativeType::F64 => ElementKind::F64,
        NativeType::Integer { size, .. } => match size {
            1 => ElementKind::I8,
            2 => ElementKind::I16,
            4 => ElementKind::I32,
            8 => ElementKind::I64,
            _ => return None,
        },
        _ => return None,
    })
}

/// `value` as a slot of `element`, or `None` if it has no such form.
fn coerce_element(element: &ElementKind, value: &Value) -> Option<Value> {
    let bits = match value {
        Value::Bool(b) => Some(if *b { -1 } else { 0 }),
        other => other.as_i64(),
    };
    Some(match element {
        ElementKind::I8 => Value::I8(bits? as i8),
        ElementKind::I16 => Value::I16(bits? as i16),
        ElementKind::I32 => Value::I32(bits? as i32),
        ElementKind::I64 => Value::I64(bits?),
        ElementKind::F32 => Value::F32(value.as_f64()? as f32),
        ElementKind::F64 => Value::F64(value.as_f64()?),
        _ => return None,
    })
}

/// Reshape a slot read back from native memory into the form `native` names.
fn element_as(native: &NativeType, slot: Value) -> FfiResult<Value> {
    Ok(match native {
        NativeType::Bool => Value::Bool(slot.as_i64().map_or(false, |v| v != 0)),
        NativeType::Integer { size, unsigned } => Value::Integer(IntegerType::from_native(
            *size,
            *unsigned,
            slot.as_i64().unwrap_or_default(),
        )?),
        _ => slot,
    })
}

fn write_element(view: &MemoryView, offset: usize, value: &Value) -> FfiResult<()> {
    match value {
        Value::I8(v) => view.write_i8(offset, *v),
        Value::I16(v) => view.write_i16(offset, *v),
        Value::I32(v) => view.write_i32(offset, *v),
        Value::I64(v) => view.write_i64(offset, *v),
        Value::F32(v) => view.write_f32(offset, *v),
        Value::F64(v) => view.write_f64(offset, *v),
        other => Err(FfiError::invalid_argument(format!(
            "{} is not a primitive array element",
            other.type_name()
        ))),
    }
}

fn read_element(view: &MemoryView, offset: usize, kind: &ElementKind) -> FfiResult<Value> {
    Ok(match kind {
        ElementKind::I8 => Value::I8(view.read_i8(offset)?),
        ElementKind::I16 => Value::I16(view.read_i16(offset)?),
        ElementKind::I32 => Value::I32(view.read_i32(offset)?),
        ElementKind::I64 => Value::I64(view.read_i64(offset)?),
        ElementKind::F32 => Value::F32(view.read_f32(offset)?),
        ElementKind::F64 => Value::F64(view.read_f64(offset)?),
        other => {
            return Err(FfiError::invalid_argument(format!(
                "{:?} is not a primitive element kind",
                other
            )))
        }
    })
}
