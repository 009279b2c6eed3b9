//! Structured records laid out in native memory
//!
//! A [`StructType`] is an explicitly ordered list of fields with C layout:
//! each field sits at the next offset aligned to its natural alignment, and
//! the total size is rounded up to the widest field alignment. A
//! [`Structure`] is one instance of such a type, bound to a block of native
//! memory; [`StructureCodec`] moves field values between the managed side
//! and that memory.

use crate::error::{FfiError, FfiResult, TypePosition};
use crate::ffi::c_types::{align_up, CType};
use crate::ffi::type_mapper::{
    FromNativeContext, FromNativeConverter, ToNativeContext, ToNativeConverter, TypeMapper,
};
use crate::ffi::value::{ElementKind, IntegerType, ManagedArray, TypeKey, Value};
use crate::ffi::NativeType;
use crate::memory::{MemoryView, NarrowEncoding, NativeBuffer, StringFlavor, POINTER_SIZE};
use libffi::middle::Type as FfiType;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Declared type of a structure field
#[derive(Debug, Clone)]
pub enum FieldType {
    /// Native `int`, -1 for true unless a converter says otherwise
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Pointer,
    /// `char*` owned by the structure while it is set
    String,
    /// `wchar_t*` owned by the structure while it is set
    WString,
    Integer { size: usize, unsigned: bool },
    /// Nested structure stored inline
    Struct(Arc<StructType>),
    /// Fixed-size inline array
    Array(Box<FieldType>, usize),
    /// Managed type converted through the structure's type mapper
    Custom(TypeKey),
}

impl FieldType {
    /// Byte size of the native representation.
    pub fn size(&self) -> usize {
        match self {
            FieldType::Bool => CType::I32.size(),
            FieldType::I8 => CType::I8.size(),
            FieldType::I16 => CType::I16.size(),
            FieldType::I32 => CType::I32.size(),
            FieldType::I64 => CType::I64.size(),
            FieldType::F32 => CType::F32.size(),
            FieldType::F64 => CType::F64.size(),
            FieldType::Pointer | FieldType::String | FieldType::WString => POINTER_SIZE,
            FieldType::Integer { size, .. } => *size,
            FieldType::Struct(ty) => ty.size(),
            FieldType::Array(inner, len) => inner.size() * len,
            FieldType::Custom(_) => 0,
        }
    }

    pub fn alignment(&self) -> usize {
        match self {
            FieldType::Bool => CType::I32.alignment(),
            FieldType::I8 => CType::I8.alignment(),
            FieldType::I16 => CType::I16.alignment(),
            FieldType::I32 => CType::I32.alignment(),
            FieldType::I64 => CType::I64.alignment(),
            FieldType::F32 => CType::F32.alignment(),
            FieldType::F64 => CType::F64.alignment(),
            FieldType::Pointer | FieldType::String | FieldType::WString => {
                CType::Pointer.alignment()
            }
            FieldType::Integer { size, .. } => CType::integer(*size).map_or(1, CType::alignment),
            FieldType::Struct(ty) => ty.alignment(),
            FieldType::Array(inner, _) => inner.alignment(),
            FieldType::Custom(_) => 1,
        }
    }

    fn push_ffi_types(&self, out: &mut Vec<FfiType>) {
        match self {
            FieldType::Bool => out.push(CType::I32.to_ffi_type()),
            FieldType::I8 => out.push(CType::I8.to_ffi_type()),
            FieldType::I16 => out.push(CType::I16.to_ffi_type()),
            FieldType::I32 => out.push(CType::I32.to_ffi_type()),
            FieldType::I64 => out.push(CType::I64.to_ffi_type()),
            FieldType::F32 => out.push(CType::F32.to_ffi_type()),
            FieldType::F64 => out.push(CType::F64.to_ffi_type()),
            FieldType::Pointer | FieldType::String | FieldType::WString | FieldType::Custom(_) => {
                out.push(CType::Pointer.to_ffi_type())
            }
            FieldType::Integer { size, .. } => {
                out.push(CType::integer(*size).unwrap_or(CType::I64).to_ffi_type())
            }
            FieldType::Struct(ty) => out.push(ty.ffi_type()),
            FieldType::Array(inner, len) => {
                for _ in 0..*len {
                    inner.push_ffi_types(out);
                }
            }
        }
    }

    /// Field layout for the native side of a converter.
    fn from_native_type(native: &NativeType) -> Option<FieldType> {
        Some(match native {
            NativeType::Bool => FieldType::Bool,
            NativeType::I8 => FieldType::I8,
            NativeType::I16 => FieldType::I16,
            NativeType::I32 => FieldType::I32,
            NativeType::I64 => FieldType::I64,
            NativeType::F32 => FieldType::F32,
            NativeType::F64 => FieldType::F64,
            NativeType::Pointer => FieldType::Pointer,
            NativeType::String => FieldType::String,
            NativeType::WString => FieldType::WString,
            NativeType::Integer { size, unsigned } => FieldType::Integer {
                size: *size,
                unsigned: *unsigned,
            },
            NativeType::StructByValue(ty) => FieldType::Struct(ty.clone()),
            _ => return None,
        })
    }

    fn element_kind(&self) -> Option<ElementKind> {
        Some(match self {
            FieldType::I8 => ElementKind::I8,
            FieldType::I16 => ElementKind::I16,
            FieldType::I32 => ElementKind::I32,
            FieldType::I64 => ElementKind::I64,
            FieldType::F32 => ElementKind::F32,
            FieldType::F64 => ElementKind::F64,
            FieldType::Pointer => ElementKind::Pointer,
            FieldType::Struct(ty) => ElementKind::Structure {
                ty: ty.clone(),
                by_reference: false,
            },
            _ => return None,
        })
    }
}

/// A laid-out field
#[derive(Clone)]
pub struct Field {
    name: String,
    declared: FieldType,
    layout: FieldType,
    offset: usize,
    to_native: Option<Arc<dyn ToNativeConverter>>,
    from_native: Option<Arc<dyn FromNativeConverter>>,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The type the field was declared with.
    pub fn declared_type(&self) -> &FieldType {
        &self.declared
    }

    /// The native representation actually stored.
    pub fn layout(&self) -> &FieldType {
        &self.layout
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("offset", &self.offset)
            .field("converted", &self.to_native.is_some())
            .finish()
    }
}

/// Layout of a structured record
pub struct StructType {
    name: String,
    fields: Vec<Field>,
    size: usize,
    alignment: usize,
    encoding: NarrowEncoding,
}

impl StructType {
    pub fn builder(name: impl Into<String>) -> StructTypeBuilder {
        StructTypeBuilder {
            name: name.into(),
            fields: Vec::new(),
            mapper: None,
            encoding: NarrowEncoding::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// libffi description of the record, with inline arrays expanded.
    pub fn ffi_type(&self) -> FfiType {
        let mut elements = Vec::new();
        for field in &self.fields {
            field.layout.push_ffi_types(&mut elements);
        }
        FfiType::structure(elements)
    }
}

impl PartialEq for StructType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.size == other.size
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(a, b)| a.name == b.name && a.offset == b.offset)
    }
}

impl fmt::Debug for StructType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructType")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Builds a [`StructType`] from an explicit field order
pub struct StructTypeBuilder {
    name: String,
    fields: Vec<(String, FieldType)>,
    mapper: Option<Arc<TypeMapper>>,
    encoding: NarrowEncoding,
}

impl StructTypeBuilder {
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push((name.into(), ty));
        self
    }

    /// Converters for `Custom` and `Bool` fields.
    pub fn type_mapper(mut self, mapper: Arc<TypeMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Encoding of narrow string fields.
    pub fn encoding(mut self, encoding: NarrowEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn build(self) -> FfiResult<Arc<StructType>> {
        if self.fields.is_empty() {
            return Err(FfiError::invalid_argument(format!(
                "Structure {} has no fields",
                self.name
            )));
        }

        let mut fields: Vec<Field> = Vec::with_capacity(self.fields.len());
        let mut offset = 0usize;
        let mut alignment = 1usize;

        for (name, declared) in self.fields {
            if fields.iter().any(|f| f.name == name) {
                return Err(FfiError::invalid_argument(format!(
                    "Duplicate field '{}' in structure {}",
                    name, self.name
                )));
            }

            let (layout, to_native, from_native) =
                resolve_field(&self.name, &name, &declared, self.mapper.as_deref())?;

            let field_alignment = layout.alignment();
            offset = align_up(offset, field_alignment);
            alignment = alignment.max(field_alignment);

            let size = layout.size();
            fields.push(Field {
                name,
                declared,
                layout,
                offset,
                to_native,
                from_native,
            });
            offset += size;
        }

        let size = align_up(offset, alignment);
        log::trace!("laid out structure {} ({} bytes, align {})", self.name, size, alignment);

        Ok(Arc::new(StructType {
            name: self.name,
            fields,
            size,
            alignment,
            encoding: self.encoding,
        }))
    }
}

type FieldConverters = (
    FieldType,
    Option<Arc<dyn ToNativeConverter>>,
    Option<Arc<dyn FromNativeConverter>>,
);

fn resolve_field(
    structure: &str,
    name: &str,
    declared: &FieldType,
    mapper: Option<&TypeMapper>,
) -> FfiResult<FieldConverters> {
    let unsupported = |type_name: String| {
        FfiError::unsupported_type(structure, TypePosition::Field(name.to_string()), &type_name)
    };

    let key = match declared {
        FieldType::Custom(key) => Some(key.clone()),
        FieldType::Bool => Some(TypeKey::Bool),
        _ => None,
    };

    if let Some(key) = key {
        let conversion = mapper
            .and_then(|m| m.resolve(&key))
            .filter(|c| !c.is_builtin());
        match conversion {
            Some(conversion) => {
                let layout = FieldType::from_native_type(&conversion.native_type)
                    .ok_or_else(|| unsupported(conversion.native_type.to_string()))?;
                return Ok((layout, conversion.to_native, conversion.from_native));
            }
            None if matches!(declared, FieldType::Custom(_)) => {
                return Err(unsupported(key.to_string()))
            }
            None => return Ok((FieldType::Bool, None, None)),
        }
    }

    match declared {
        FieldType::Integer { size, .. } if CType::integer(*size).is_none() => Err(
            FfiError::invalid_argument(format!("Unsupported integer size {} for field '{}'", size, name)),
        ),
        FieldType::Array(_, 0) => Err(FfiError::invalid_argument(format!(
            "Inline array field '{}' must have a positive length",
            name
        ))),
        FieldType::Array(inner, _) if inner.element_kind().is_none() => {
            Err(unsupported(format!("{:?}[]", inner)))
        }
        other => Ok((other.clone(), None, None)),
    }
}

pub type StructRef = Rc<RefCell<Structure>>;

/// An instance of a [`StructType`] bound to native memory
pub struct Structure {
    ty: Arc<StructType>,
    values: Vec<Value>,
    memory: MemoryView,
    strings: HashMap<usize, NativeBuffer>,
    by_value: bool,
    auto_synch: bool,
}

impl Structure {
    /// A zeroed instance in freshly allocated memory.
    pub fn new(ty: &Arc<StructType>) -> FfiResult<Structure> {
        let buffer = NativeBuffer::allocate(ty.size())?;
        Self::over(ty, buffer.view())
    }

    /// An instance bound to existing memory. Field values start at their
    /// defaults; call [`read`](Self::read) to load them.
    pub fn over(ty: &Arc<StructType>, memory: MemoryView) -> FfiResult<Structure> {
        if let Some(size) = memory.size() {
            if size < ty.size() {
                return Err(FfiError::bounds(0, ty.size(), size));
            }
        }
        let values = ty
            .fields
            .iter()
            .map(|field| default_value(&field.declared, &memory, field.offset))
            .collect::<FfiResult<Vec<_>>>()?;
        Ok(Structure {
            ty: ty.clone(),
            values,
            memory,
            strings: HashMap::new(),
            by_value: false,
            auto_synch: true,
        })
    }

    /// Mark this instance to be passed inline rather than by pointer.
    pub fn by_value(mut self) -> Self {
        self.by_value = true;
        self
    }

    pub fn is_by_value(&self) -> bool {
        self.by_value
    }

    /// Whether the marshaller writes before and reads after each call.
    pub fn set_auto_synch(&mut self, enabled: bool) {
        self.auto_synch = enabled;
    }

    pub fn auto_synch(&self) -> bool {
        self.auto_synch
    }

    pub fn into_ref(self) -> StructRef {
        Rc::new(RefCell::new(self))
    }

    pub fn struct_type(&self) -> &Arc<StructType> {
        &self.ty
    }

    pub fn memory(&self) -> &MemoryView {
        &self.memory
    }

    pub fn address(&self) -> usize {
        self.memory.address()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.ty.field_index(name).map(|i| &self.values[i])
    }

    /// Set a field's managed value. Native memory is updated on the next write.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> FfiResult<()> {
        let index = self.ty.field_index(name).ok_or_else(|| {
            FfiError::invalid_argument(format!("No field '{}' in structure {}", name, self.ty.name))
        })?;
        self.values[index] = value.into();
        Ok(())
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Rebind to other memory, as when a native call hands back a new address.
    pub fn use_memory(&mut self, memory: MemoryView) -> FfiResult<()> {
        if let Some(size) = memory.size() {
            if size < self.ty.size() {
                return Err(FfiError::bounds(0, self.ty.size(), size));
            }
        }
        self.memory = memory;
        Ok(())
    }

    /// Write all fields to the bound memory.
    pub fn write(&mut self) -> FfiResult<()> {
        StructureCodec::write_values(&self.ty, &self.values, &mut self.strings, &self.memory)
    }

    /// Load all fields from the bound memory.
    ///
    /// # Safety
    ///
    /// Pointer, string and by-reference fields in the bound memory must hold
    /// null or addresses that stay valid while the loaded values are used.
    /// String fields are dereferenced right away.
    pub unsafe fn read(&mut self) -> FfiResult<()> {
        self.load()
    }

    /// Load for memory the marshaller has vouched for.
    pub(crate) fn load(&mut self) -> FfiResult<()> {
        StructureCodec::read_values(&self.ty, &mut self.values, &self.memory)
    }
}

impl fmt::Debug for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(&self.ty.name);
        for (field, value) in self.ty.fields.iter().zip(&self.values) {
            s.field(&field.name, value);
        }
        s.finish()
    }
}

fn default_value(declared: &FieldType, memory: &MemoryView, offset: usize) -> FfiResult<Value> {
    Ok(match declared {
        FieldType::Bool => Value::Bool(false),
        FieldType::I8 => Value::I8(0),
        FieldType::I16 => Value::I16(0),
        FieldType::I32 => Value::I32(0),
        FieldType::I64 => Value::I64(0),
        FieldType::F32 => Value::F32(0.0),
        FieldType::F64 => Value::F64(0.0),
        FieldType::Pointer | FieldType::String | FieldType::WString | FieldType::Custom(_) => {
            Value::Null
        }
        FieldType::Integer { size, unsigned } => {
            Value::Integer(IntegerType::from_native(*size, *unsigned, 0)?)
        }
        FieldType::Struct(ty) => {
            let nested = Structure::over(ty, memory.share(offset, ty.size())?)?;
            Value::Structure(nested.into_ref())
        }
        FieldType::Array(inner, len) => {
            let kind = inner
                .element_kind()
                .ok_or_else(|| FfiError::invalid_argument("unsupported inline array element"))?;
            let step = inner.size();
            let items = (0..*len)
                .map(|i| default_value(inner, memory, offset + i * step))
                .collect::<FfiResult<Vec<_>>>()?;
            Value::Array(Rc::new(RefCell::new(ManagedArray::new(kind, items)?)))
        }
    })
}

/// Field-by-field transfer between managed records and native memory
pub struct StructureCodec;

impl StructureCodec {
    /// Serialize `structure`'s fields into `target` in declared order.
    pub fn write(structure: &mut Structure, target: &MemoryView) -> FfiResult<()> {
        Self::write_values(&structure.ty, &structure.values, &mut structure.strings, target)
    }

    /// Build an instance of `ty` bound to `target` and load it.
    ///
    /// # Safety
    ///
    /// Same contract as [`Structure::read`].
    pub unsafe fn read(target: &MemoryView, ty: &Arc<StructType>) -> FfiResult<Structure> {
        Self::load(target, ty)
    }

    pub(crate) fn load(target: &MemoryView, ty: &Arc<StructType>) -> FfiResult<Structure> {
        let mut structure = Structure::over(ty, target.clone())?;
        structure.load()?;
        Ok(structure)
    }

    fn write_values(
        ty: &StructType,
        values: &[Value],
        strings: &mut HashMap<usize, NativeBuffer>,
        target: &MemoryView,
    ) -> FfiResult<()> {
        for (index, (field, value)) in ty.fields.iter().zip(values).enumerate() {
            let native = match (&field.to_native, value) {
                (Some(converter), v) if !v.is_null() => {
                    let context = ToNativeContext::Field {
                        structure: ty,
                        field: &field.name,
                    };
                    converter.to_native(v, &context)?
                }
                _ => value.clone(),
            };

            if matches!(field.layout, FieldType::String | FieldType::WString) {
                write_string_field(ty, field, &native, target, strings, index)?;
                continue;
            }
            if native.is_null() && !matches!(field.layout, FieldType::Pointer) {
                target.write_bytes(field.offset, &vec![0u8; field.size()])?;
                continue;
            }
            write_field(ty, field, &field.layout, &native, target, field.offset)?;
        }
        Ok(())
    }

    fn read_values(ty: &StructType, values: &mut [Value], source: &MemoryView) -> FfiResult<()> {
        for (field, slot) in ty.fields.iter().zip(values.iter_mut()) {
            let native = read_field(ty, &field.layout, source, field.offset, slot)?;
            *slot = match &field.from_native {
                Some(converter) => {
                    let context = FromNativeContext::Field {
                        structure: ty,
                        field: &field.name,
                    };
                    converter.from_native(native, &context)?
                }
                // A bool stored through a to-native converter alone still
                // reads back as a bool.
                None if matches!(field.declared, FieldType::Bool) => {
                    match (native.as_i64(), native.as_f64()) {
                        (Some(v), _) => Value::Bool(v != 0),
                        (_, Some(v)) => Value::Bool(v != 0.0),
                        _ => native,
                    }
                }
                None => native,
            };
        }
        Ok(())
    }
}

fn mismatch(ty: &StructType, field: &Field, expected: &FieldType, value: &Value) -> FfiError {
    FfiError::conversion(
        &ty.name,
        TypePosition::Field(field.name.clone()),
        &format!("expected {:?}, got {}", expected, value.type_name()),
    )
}

fn write_string_field(
    ty: &StructType,
    field: &Field,
    value: &Value,
    target: &MemoryView,
    strings: &mut HashMap<usize, NativeBuffer>,
    index: usize,
) -> FfiResult<()> {
    let flavor = match field.layout {
        FieldType::WString => StringFlavor::Wide,
        _ => StringFlavor::Narrow,
    };
    let text = match value {
        Value::Null => {
            strings.remove(&index);
            return target.write_address(field.offset, 0);
        }
        Value::String(s) => s.as_str(),
        Value::WString(s) => s.as_str(),
        other => return Err(mismatch(ty, field, &field.layout, other)),
    };

    // Keep the current buffer when the text is unchanged so native code
    // holding the old pointer stays valid.
    if let Some(existing) = strings.get(&index) {
        let current = existing.view().read_string(0, flavor, ty.encoding)?;
        if current == text && target.read_address(field.offset)? == existing.address() {
            return Ok(());
        }
    }

    let buffer = NativeBuffer::from_bytes(&crate::memory::strings::encode(text, flavor, ty.encoding))?;
    target.write_address(field.offset, buffer.address())?;
    strings.insert(index, buffer);
    Ok(())
}

fn write_field(
    ty: &StructType,
    field: &Field,
    layout: &FieldType,
    value: &Value,
    target: &MemoryView,
    offset: usize,
) -> FfiResult<()> {
    let integer = || value.as_i64().ok_or_else(|| mismatch(ty, field, layout, value));
    match layout {
        FieldType::Bool => match value {
            Value::Bool(b) => target.write_i32(offset, if *b { -1 } else { 0 }),
            other => Err(mismatch(ty, field, layout, other)),
        },
        FieldType::I8 => target.write_i8(offset, integer()? as i8),
        FieldType::I16 => target.write_i16(offset, integer()? as i16),
        FieldType::I32 => target.write_i32(offset, integer()? as i32),
        FieldType::I64 => target.write_i64(offset, integer()?),
        FieldType::Integer { size, .. } => write_sized(target, offset, *size, integer()?),
        FieldType::F32 => {
            let v = value.as_f64().ok_or_else(|| mismatch(ty, field, layout, value))?;
            target.write_f32(offset, v as f32)
        }
        FieldType::F64 => {
            let v = value.as_f64().ok_or_else(|| mismatch(ty, field, layout, value))?;
            target.write_f64(offset, v)
        }
        FieldType::Pointer => {
            let address = match value {
                Value::Null => 0,
                Value::Pointer(p) => p.address(),
                Value::Function(f) => f.address(),
                other => return Err(mismatch(ty, field, layout, other)),
            };
            target.write_address(offset, address)
        }
        FieldType::Struct(nested_ty) => {
            let sub = target.share(offset, nested_ty.size())?;
            match value {
                Value::Null => sub.clear(),
                Value::Structure(s) => {
                    let mut guard = s.try_borrow_mut().map_err(|_| {
                        FfiError::conversion(
                            &ty.name,
                            TypePosition::Field(field.name.clone()),
                            "nested structure is already borrowed",
                        )
                    })?;
                    let nested = &mut *guard;
                    StructureCodec::write_values(
                        &nested.ty,
                        &nested.values,
                        &mut nested.strings,
                        &sub,
                    )
                }
                other => Err(mismatch(ty, field, layout, other)),
            }
        }
        FieldType::Array(inner, len) => {
            let array = match value {
                Value::Array(a) => a.borrow(),
                other => return Err(mismatch(ty, field, layout, other)),
            };
            if array.len() != *len {
                return Err(FfiError::conversion(
                    &ty.name,
                    TypePosition::Field(field.name.clone()),
                    &format!("expected {} elements, got {}", len, array.len()),
                ));
            }
            let step = inner.size();
            for (i, item) in array.items().iter().enumerate() {
                write_field(ty, field, inner, item, target, offset + i * step)?;
            }
            Ok(())
        }
        FieldType::String | FieldType::WString | FieldType::Custom(_) => {
            Err(mismatch(ty, field, layout, value))
        }
    }
}

fn write_sized(target: &MemoryView, offset: usize, size: usize, value: i64) -> FfiResult<()> {
    match size {
        1 => target.write_i8(offset, value as i8),
        2 => target.write_i16(offset, value as i16),
        4 => target.write_i32(offset, value as i32),
        _ => target.write_i64(offset, value),
    }
}

fn read_sized(source: &MemoryView, offset: usize, size: usize) -> FfiResult<i64> {
    Ok(match size {
        1 => source.read_i8(offset)? as i64,
        2 => source.read_i16(offset)? as i64,
        4 => source.read_i32(offset)? as i64,
        _ => source.read_i64(offset)?,
    })
}

fn read_field(
    ty: &StructType,
    layout: &FieldType,
    source: &MemoryView,
    offset: usize,
    current: &Value,
) -> FfiResult<Value> {
    Ok(match layout {
        FieldType::Bool => Value::Bool(source.read_i32(offset)? != 0),
        FieldType::I8 => Value::I8(source.read_i8(offset)?),
        FieldType::I16 => Value::I16(source.read_i16(offset)?),
        FieldType::I32 => Value::I32(source.read_i32(offset)?),
        FieldType::I64 => Value::I64(source.read_i64(offset)?),
        FieldType::F32 => Value::F32(source.read_f32(offset)?),
        FieldType::F64 => Value::F64(source.read_f64(offset)?),
        FieldType::Integer { size, unsigned } => {
            Value::Integer(IntegerType::from_native(*size, *unsigned, read_sized(source, offset, *size)?)?)
        }
        FieldType::Pointer => {
            let address = source.read_address(offset)?;
            match current {
                // An unchanged slot keeps the view it was written from, so an
                // owned block still reports disposal through it.
                Value::Pointer(p) if p.address() == address => current.clone(),
                _ => MemoryView::external_unchecked(address, None).map_or(Value::Null, Value::Pointer),
            }
        }
        FieldType::String | FieldType::WString => {
            let flavor = match layout {
                FieldType::WString => StringFlavor::Wide,
                _ => StringFlavor::Narrow,
            };
            match MemoryView::external_unchecked(source.read_address(offset)?, None) {
                None => Value::Null,
                Some(p) => {
                    let text = p.read_string(0, flavor, ty.encoding)?;
                    match flavor {
                        StringFlavor::Wide => Value::wide(text),
                        StringFlavor::Narrow => Value::String(text),
                    }
                }
            }
        }
        FieldType::Struct(nested_ty) => {
            let sub = source.share(offset, nested_ty.size())?;
            if let Some(existing) = current.as_structure() {
                if let Ok(mut nested) = existing.try_borrow_mut() {
                    if nested.ty.name == nested_ty.name {
                        nested.use_memory(sub.clone())?;
                        nested.load()?;
                        return Ok(current.clone());
                    }
                }
            }
            Value::Structure(StructureCodec::load(&sub, nested_ty)?.into_ref())
        }
        FieldType::Array(inner, len) => {
            let kind = inner
                .element_kind()
                .ok_or_else(|| FfiError::invalid_argument("unsupported inline array element"))?;
            let step = inner.size();
            let previous = current.as_array().map(|a| a.borrow().items().to_vec());
            let items = (0..*len)
                .map(|i| {
                    let prior = previous
                        .as_ref()
                        .and_then(|p| p.get(i).cloned())
                        .unwrap_or(Value::Null);
                    read_field(ty, inner, source, offset + i * step, &prior)
                })
                .collect::<FfiResult<Vec<_>>>()?;
            match current.as_array() {
                Some(array) => {
                    *array.borrow_mut() = ManagedArray::new(kind, items)?;
                    current.clone()
                }
                None => Value::Array(Rc::new(RefCell::new(ManagedArray::new(kind, items)?))),
            }
        }
        FieldType::Custom(_) => Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> Arc<StructType> {
        StructType::builder("Point")
            .field("x", FieldType::I32)
            .field("y", FieldType::I32)
            .build()
            .unwrap()
    }

    #[test]
    fn test_natural_alignment() {
        let ty = StructType::builder("Mixed")
            .field("a", FieldType::I8)
            .field("b", FieldType::I64)
            .field("c", FieldType::I16)
            .build()
            .unwrap();
        let offsets: Vec<_> = ty.fields().iter().map(Field::offset).collect();
        assert_eq!(offsets, vec![0, 8, 16]);
        assert_eq!(ty.size(), 24);
        assert_eq!(ty.alignment(), 8);
    }

    #[test]
    fn test_nested_and_array_layout() {
        let outer = StructType::builder("Line")
            .field("tag", FieldType::I8)
            .field("from", FieldType::Struct(point()))
            .field("pad", FieldType::Array(Box::new(FieldType::I16), 3))
            .build()
            .unwrap();
        assert_eq!(outer.field("from").unwrap().offset(), 4);
        assert_eq!(outer.field("pad").unwrap().offset(), 12);
        assert_eq!(outer.size(), 20);
    }

    #[test]
    fn test_empty_and_duplicate_rejected() {
        assert!(StructType::builder("Empty").build().is_err());
        assert!(StructType::builder("Dup")
            .field("a", FieldType::I32)
            .field("a", FieldType::I32)
            .build()
            .is_err());
    }

    #[test]
    fn test_custom_field_without_mapper() {
        let result = StructType::builder("Holder")
            .field("w", FieldType::Custom(TypeKey::named("Widget")))
            .build();
        assert!(matches!(
            result,
            Err(FfiError::UnsupportedType { position: TypePosition::Field(_), .. })
        ));
    }

    #[test]
    fn test_write_read_round_trip() {
        let ty = point();
        let mut s = Structure::new(&ty).unwrap();
        s.set("x", 3).unwrap();
        s.set("y", -4).unwrap();
        s.write().unwrap();
        assert_eq!(s.memory().read_i32(4).unwrap(), -4);

        let copy = unsafe { StructureCodec::read(s.memory(), &ty) }.unwrap();
        assert_eq!(copy.get("x"), Some(&Value::I32(3)));
        assert_eq!(copy.get("y"), Some(&Value::I32(-4)));
    }

    #[test]
    fn test_default_bool_is_minus_one() {
        let ty = StructType::builder("Flag")
            .field("on", FieldType::Bool)
            .build()
            .unwrap();
        let mut s = Structure::new(&ty).unwrap();
        s.set("on", true).unwrap();
        s.write().unwrap();
        assert_eq!(s.memory().read_i32(0).unwrap(), -1);
        s.load().unwrap();
        assert_eq!(s.get("on"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_string_field() {
        let ty = StructType::builder("Named")
            .field("name", FieldType::String)
            .build()
            .unwrap();
        let mut s = Structure::new(&ty).unwrap();
        s.set("name", "hello").unwrap();
        s.write().unwrap();
        let address = s.memory().read_address(0).unwrap();
        assert_ne!(address, 0);
        s.write().unwrap();
        assert_eq!(s.memory().read_address(0).unwrap(), address);
        unsafe { s.read() }.unwrap();
        assert_eq!(s.get("name"), Some(&Value::String("hello".into())));
    }

    #[test]
    fn test_nested_write_goes_inline() {
        let outer = StructType::builder("Box")
            .field("id", FieldType::I32)
            .field("origin", FieldType::Struct(point()))
            .build()
            .unwrap();
        let mut s = Structure::new(&outer).unwrap();
        if let Some(Value::Structure(origin)) = s.get("origin") {
            origin.borrow_mut().set("y", 9).unwrap();
        }
        s.write().unwrap();
        assert_eq!(s.memory().read_i32(8).unwrap(), 9);
    }

    #[test]
    fn test_unchanged_pointer_field_goes_stale_with_its_block() {
        let ty = StructType::builder("Holder")
            .field("target", FieldType::Pointer)
            .build()
            .unwrap();
        let target = NativeBuffer::allocate(8).unwrap();
        target.view().write_i32(0, 17).unwrap();

        let mut s = Structure::new(&ty).unwrap();
        s.set("target", Value::Pointer(target.view())).unwrap();
        s.write().unwrap();
        s.load().unwrap();

        let alias = s.get("target").and_then(Value::as_pointer).cloned().unwrap();
        assert!(!alias.is_external());
        assert_eq!(alias.read_i32(0).unwrap(), 17);

        target.dispose();
        assert!(matches!(alias.read_i32(0), Err(FfiError::StaleHandle { .. })));
    }

    #[test]
    fn test_bool_field_with_only_to_native_reads_bool() {
        let mut mapper = TypeMapper::new();
        mapper.add_to_native(TypeKey::Bool, NativeType::I8, |value, _| {
            Ok(Value::I8(if value.as_bool() == Some(true) { 1 } else { 0 }))
        });
        let ty = StructType::builder("Flag")
            .field("on", FieldType::Bool)
            .type_mapper(Arc::new(mapper))
            .build()
            .unwrap();
        assert!(matches!(ty.field("on").unwrap().layout(), FieldType::I8));

        let mut s = Structure::new(&ty).unwrap();
        s.set("on", true).unwrap();
        s.write().unwrap();
        assert_eq!(s.memory().read_i8(0).unwrap(), 1);

        s.load().unwrap();
        assert_eq!(s.get("on"), Some(&Value::Bool(true)));
        s.memory().write_i8(0, 0).unwrap();
        s.load().unwrap();
        assert_eq!(s.get("on"), Some(&Value::Bool(false)));
    }
}
