//! End-to-end native calls through libffi
//!
//! The native side of every call is an `extern "C"` function defined in this
//! file, so the tests need no external library.

use flux_native::ffi::*;
use flux_native::memory::{MemoryView, NativeBuffer, POINTER_SIZE};
use flux_native::{FfiError, FfiResult};
use std::ffi::c_void;
use std::os::raw::c_char;
use std::rc::Rc;
use std::sync::Arc;

#[repr(C)]
#[derive(Clone, Copy)]
struct Point {
    x: i32,
    y: i32,
}

extern "C" fn echo_int(value: i32) -> i32 {
    value
}

extern "C" fn add_doubles(a: f64, b: f64) -> f64 {
    a + b
}

extern "C" fn point_sum(p: Point) -> i32 {
    p.x + p.y
}

extern "C" fn make_point(x: i32, y: i32) -> Point {
    Point { x, y }
}

extern "C" fn scale_point(p: *mut Point, factor: i32) {
    if let Some(p) = unsafe { p.as_mut() } {
        p.x *= factor;
        p.y *= factor;
    }
}

extern "C" fn string_length(s: *const c_char) -> i32 {
    if s.is_null() {
        return -1;
    }
    unsafe { std::ffi::CStr::from_ptr(s) }.to_bytes().len() as i32
}

extern "C" fn greeting() -> *const c_char {
    b"hello from native\0".as_ptr() as *const c_char
}

extern "C" fn wide_length(s: *const libc::wchar_t) -> i32 {
    let mut len = 0;
    unsafe {
        while *s.add(len) != 0 {
            len += 1;
        }
    }
    len as i32
}

extern "C" fn swap_first_two(slots: *mut *mut c_void) {
    unsafe { std::ptr::swap(slots, slots.add(1)) }
}

extern "C" fn double_all(values: *mut i32, len: i32) {
    for i in 0..len as usize {
        unsafe { *values.add(i) *= 2 }
    }
}

extern "C" fn fail_with(code: i32) -> i32 {
    flux_native::ffi::last_error::set(code);
    code
}

extern "C" fn null_pointer() -> *mut c_void {
    std::ptr::null_mut()
}

extern "C" fn identity_pointer(p: *mut c_void) -> *mut c_void {
    p
}

extern "C" fn replace_second(slots: *mut *mut Point, replacement: *mut Point) {
    unsafe { *slots.add(1) = replacement }
}

extern "C" fn all_ones() -> u32 {
    u32::MAX
}

extern "C" fn fruit_names() -> *const *const c_char {
    let names = Box::leak(Box::new([
        b"apple\0".as_ptr() as *const c_char,
        b"pear\0".as_ptr() as *const c_char,
        std::ptr::null(),
    ]));
    names.as_ptr()
}

extern "C" fn wide_names() -> *const *const libc::wchar_t {
    let encode = |text: &str| -> *const libc::wchar_t {
        let units: Vec<libc::wchar_t> = text
            .chars()
            .map(|c| c as libc::wchar_t)
            .chain(std::iter::once(0))
            .collect();
        Box::leak(units.into_boxed_slice()).as_ptr()
    };
    let names = Box::leak(Box::new([encode("north"), encode("south"), std::ptr::null()]));
    names.as_ptr()
}

extern "C" fn point_slots() -> *const *const Point {
    let points: &'static [Point; 2] = Box::leak(Box::new([Point { x: 1, y: 2 }, Point { x: 3, y: 4 }]));
    let slots = Box::leak(Box::new([
        &points[0] as *const Point,
        &points[1] as *const Point,
        std::ptr::null(),
    ]));
    slots.as_ptr()
}

thread_local! {
    static REENTRANT: Marshaller = Marshaller::new();
}

/// Calls back into the marshaller that is running the outer call.
extern "C" fn echo_plus_one(value: i32) -> i32 {
    REENTRANT.with(|marshaller| {
        native(echo_int as usize)
            .invoke_int(marshaller, &[Value::I32(value + 1)])
            .unwrap_or(-1)
    })
}

extern "C" fn scale_via_marshaller(p: *mut Point, factor: i32) {
    REENTRANT.with(|marshaller| {
        let target = unsafe { MemoryView::external(p as usize) }.map_or(Value::Null, Value::Pointer);
        let _ = native(scale_point as usize).invoke_void(marshaller, &[target, Value::I32(factor)]);
    })
}

fn native(address: usize) -> Function {
    unsafe { Function::from_address(address, CallFlags::C_CONVENTION) }
}

fn point_type() -> Arc<StructType> {
    StructType::builder("Point")
        .field("x", FieldType::I32)
        .field("y", FieldType::I32)
        .build()
        .unwrap()
}

fn point(ty: &Arc<StructType>, x: i32, y: i32) -> Structure {
    let mut p = Structure::new(ty).unwrap();
    p.set("x", x).unwrap();
    p.set("y", y).unwrap();
    p
}

#[test]
fn test_primitive_calls() {
    let marshaller = Marshaller::new();
    let echo = native(echo_int as usize);
    assert_eq!(echo.invoke_int(&marshaller, &[Value::I32(-42)]).unwrap(), -42);

    let add = native(add_doubles as usize);
    let sum = add
        .invoke_double(&marshaller, &[Value::F64(1.25), Value::F64(2.5)])
        .unwrap();
    assert_eq!(sum, 3.75);
}

#[test]
fn test_custom_bool_conversion_round_trip() {
    const TRUE_MAGIC: i32 = 0xABEDCF23u32 as i32;

    let mut mapper = TypeMapper::new();
    mapper.add_to_native(TypeKey::Bool, NativeType::I32, |value, _| {
        Ok(Value::I32(if value.as_bool() == Some(true) { TRUE_MAGIC } else { 0 }))
    });
    mapper.add_from_native(TypeKey::Bool, NativeType::I32, |value, _| {
        Ok(Value::Bool(value.as_i64() == Some(TRUE_MAGIC as i64)))
    });

    let marshaller = Marshaller::new();
    let echo = native(echo_int as usize);
    let result = marshaller
        .invoke(&echo, &NativeType::Bool, &[Value::Bool(true)], Some(&mapper))
        .unwrap();
    assert_eq!(result, Value::Bool(true));

    // Without the mapper a true argument is -1 on the native side.
    let raw = echo.invoke_int(&marshaller, &[Value::Bool(true)]).unwrap();
    assert_eq!(raw, -1);
}

#[test]
fn test_structure_by_value() {
    let marshaller = Marshaller::new();
    let ty = point_type();

    let arg = point(&ty, 3, 4).by_value().into_ref();
    let sum = native(point_sum as usize)
        .invoke_int(&marshaller, &[Value::Structure(arg)])
        .unwrap();
    assert_eq!(sum, 7);

    let returned = native(make_point as usize)
        .invoke(&marshaller, &NativeType::StructByValue(ty), &[Value::I32(5), Value::I32(6)])
        .unwrap();
    let returned = returned.as_structure().unwrap().borrow();
    assert!(returned.is_by_value());
    assert_eq!(returned.get("x"), Some(&Value::I32(5)));
    assert_eq!(returned.get("y"), Some(&Value::I32(6)));
}

#[test]
fn test_structure_by_reference_is_synchronized() {
    let marshaller = Marshaller::new();
    let p = point(&point_type(), 2, -3).into_ref();
    native(scale_point as usize)
        .invoke_void(&marshaller, &[Value::Structure(p.clone()), Value::I32(10)])
        .unwrap();
    assert_eq!(p.borrow().get("x"), Some(&Value::I32(20)));
    assert_eq!(p.borrow().get("y"), Some(&Value::I32(-30)));
}

#[test]
fn test_structure_without_auto_synch_is_left_alone() {
    let marshaller = Marshaller::new();
    let mut p = point(&point_type(), 1, 1);
    p.write().unwrap();
    p.set_auto_synch(false);
    let p = p.into_ref();

    native(scale_point as usize)
        .invoke_void(&marshaller, &[Value::Structure(p.clone()), Value::I32(5)])
        .unwrap();

    // Native memory changed, the managed fields did not.
    assert_eq!(p.borrow().memory().read_i32(0).unwrap(), 5);
    assert_eq!(p.borrow().get("x"), Some(&Value::I32(1)));
}

#[test]
fn test_strings_in_and_out() {
    let marshaller = Marshaller::new();
    let len = native(string_length as usize);
    assert_eq!(len.invoke_int(&marshaller, &[Value::from("twelve chars")]).unwrap(), 12);
    assert_eq!(len.invoke_int(&marshaller, &[Value::Null]).unwrap(), -1);

    let text = native(greeting as usize)
        .invoke_string(&marshaller, &[], false)
        .unwrap();
    assert_eq!(text.as_deref(), Some("hello from native"));

    let wide = native(wide_length as usize)
        .invoke_int(&marshaller, &[Value::wide("wide \u{e9}")])
        .unwrap();
    assert_eq!(wide, 6);
}

#[test]
fn test_pointer_array_reflects_native_changes() {
    let marshaller = Marshaller::new();
    let first = NativeBuffer::allocate(8).unwrap();
    let second = NativeBuffer::allocate(8).unwrap();
    let array = Value::array(
        ElementKind::Pointer,
        vec![Value::Pointer(first.view()), Value::Pointer(second.view())],
    )
    .unwrap();

    native(swap_first_two as usize)
        .invoke_void(&marshaller, &[array.clone()])
        .unwrap();

    let array = array.as_array().unwrap().borrow();
    let addresses: Vec<usize> = array
        .items()
        .iter()
        .map(|v| v.as_pointer().map_or(0, MemoryView::address))
        .collect();
    assert_eq!(addresses, vec![second.address(), first.address()]);
}

#[test]
fn test_primitive_array_copied_back() {
    let marshaller = Marshaller::new();
    let array = Value::array(
        ElementKind::I32,
        vec![Value::I32(1), Value::I32(2), Value::I32(3)],
    )
    .unwrap();
    native(double_all as usize)
        .invoke_void(&marshaller, &[array.clone(), Value::I32(3)])
        .unwrap();
    assert_eq!(
        array.as_array().unwrap().borrow().items(),
        &[Value::I32(2), Value::I32(4), Value::I32(6)]
    );
}

#[test]
fn test_last_error_flag() {
    let marshaller = Marshaller::new();
    let unchecked = native(fail_with as usize);
    assert_eq!(unchecked.invoke_int(&marshaller, &[Value::I32(22)]).unwrap(), 22);

    let checked = unsafe { Function::from_address(fail_with as usize, CallFlags::THROW_LAST_ERROR) };
    match checked.invoke_int(&marshaller, &[Value::I32(22)]) {
        Err(FfiError::LastError { code, .. }) => assert_eq!(code, 22),
        other => panic!("unexpected {:?}", other),
    }
    assert!(checked.invoke_int(&marshaller, &[Value::I32(0)]).is_ok());
}

#[test]
fn test_null_results() {
    let marshaller = Marshaller::new();
    let null = native(null_pointer as usize);
    assert!(null.invoke_pointer(&marshaller, &[]).unwrap().is_none());
    assert!(null.invoke_string(&marshaller, &[], false).unwrap().is_none());
    assert!(null.invoke_string(&marshaller, &[], true).unwrap().is_none());
    assert_eq!(
        null.invoke(&marshaller, &NativeType::StructByRef(point_type()), &[]).unwrap(),
        Value::Null
    );
    assert_eq!(null.invoke(&marshaller, &NativeType::Callback, &[]).unwrap(), Value::Null);
    assert_eq!(null.invoke(&marshaller, &NativeType::StringArray, &[]).unwrap(), Value::Null);
}

struct Doubler;

impl Callback for Doubler {
    fn parameter_types(&self) -> Vec<NativeType> {
        vec![NativeType::I32]
    }

    fn return_type(&self) -> NativeType {
        NativeType::I32
    }

    fn call(&self, args: &[Value]) -> FfiResult<Value> {
        Ok(Value::I32(args[0].as_i64().unwrap_or(0) as i32 * 2))
    }
}

/// Hands out a distinct heap address per callback.
struct MarkerTrampolines;

impl TrampolineFactory for MarkerTrampolines {
    fn create(&self, _callback: &Rc<dyn Callback>) -> FfiResult<Trampoline> {
        let marker = Box::new(0u64);
        let address = &*marker as *const u64 as usize;
        Ok(Trampoline::new(address, Some(marker)))
    }
}

#[test]
fn test_callback_pointer_round_trip() {
    let marshaller = Marshaller::new()
        .with_callbacks(CallbackRegistry::with_factory(Box::new(MarkerTrampolines)).into_shared());
    let callback: Rc<dyn Callback> = Rc::new(Doubler);
    let identity = native(identity_pointer as usize);

    let returned = identity
        .invoke(&marshaller, &NativeType::Callback, &[Value::Callback(callback.clone())])
        .unwrap();
    assert_eq!(returned, Value::Callback(callback.clone()));
    assert_eq!(marshaller.callbacks().borrow_mut().len(), 1);

    // Passing it again reuses the same trampoline.
    let first = marshaller.callbacks().borrow_mut().pointer_for(&callback).unwrap();
    let second = marshaller.callbacks().borrow_mut().pointer_for(&callback).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_foreign_function_pointer_is_callable() {
    let marshaller = Marshaller::new();
    let identity = native(identity_pointer as usize);
    let echo_address = echo_int as usize;
    let echo = native(echo_address);

    let returned = identity
        .invoke(&marshaller, &NativeType::Callback, &[Value::Function(Rc::new(echo))])
        .unwrap();
    let Value::Function(function) = returned else {
        panic!("expected a function, got {:?}", returned);
    };
    assert_eq!(function.address(), echo_address);
    assert_eq!(function.invoke_int(&marshaller, &[Value::I32(9)]).unwrap(), 9);

    let again = identity
        .invoke(&marshaller, &NativeType::Callback, &[Value::Function(function.clone())])
        .unwrap();
    match again {
        Value::Function(same) => assert!(Rc::ptr_eq(&same, &function)),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_structure_reference_array_slot_substitution() {
    let marshaller = Marshaller::new();
    let ty = point_type();
    let first = point(&ty, 1, 2).into_ref();
    let second = point(&ty, 3, 4).into_ref();
    let array = Value::array(
        ElementKind::Structure {
            ty: ty.clone(),
            by_reference: true,
        },
        vec![Value::Structure(first.clone()), Value::Structure(second.clone())],
    )
    .unwrap();

    let replacement = NativeBuffer::allocate(ty.size()).unwrap();
    replacement.view().write_i32(0, 7).unwrap();
    replacement.view().write_i32(4, 8).unwrap();

    native(replace_second as usize)
        .invoke_void(&marshaller, &[array.clone(), Value::Pointer(replacement.view())])
        .unwrap();

    let array = array.as_array().unwrap().borrow();
    assert_eq!(array.get(0), Some(&Value::Structure(first)));
    let substituted = array.get(1).and_then(Value::as_structure).unwrap();
    assert!(!Rc::ptr_eq(substituted, &second));
    assert_eq!(substituted.borrow().address(), replacement.address());
    assert_eq!(substituted.borrow().get("x"), Some(&Value::I32(7)));
    assert_eq!(substituted.borrow().get("y"), Some(&Value::I32(8)));
}

#[test]
fn test_contiguous_structure_array() {
    let marshaller = Marshaller::new();
    let ty = point_type();
    let points: Vec<Value> = (1..=2)
        .map(|i| Value::Structure(point(&ty, i, i).into_ref()))
        .collect();
    let array = Value::array(
        ElementKind::Structure {
            ty: ty.clone(),
            by_reference: false,
        },
        points,
    )
    .unwrap();

    // Four i32s laid out back to back.
    native(double_all as usize)
        .invoke_void(&marshaller, &[array.clone(), Value::I32(4)])
        .unwrap();

    let array = array.as_array().unwrap().borrow();
    let second = array.get(1).and_then(Value::as_structure).unwrap().borrow();
    assert_eq!(second.get("x"), Some(&Value::I32(4)));
    let first = array.get(0).and_then(Value::as_structure).unwrap().borrow();
    assert_eq!(second.address() - first.address(), ty.size());
}

#[test]
fn test_sized_integer_return() {
    let marshaller = Marshaller::new();
    let value = native(all_ones as usize)
        .invoke(&marshaller, &NativeType::Integer { size: 4, unsigned: true }, &[])
        .unwrap();
    match value {
        Value::Integer(integer) => {
            assert_eq!(integer.value(), u32::MAX as i64);
            assert!(integer.is_unsigned());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_string_array_argument() {
    extern "C" fn count_strings(strings: *const *const c_char) -> i32 {
        let mut count = 0;
        unsafe {
            while !(*strings.add(count)).is_null() {
                count += 1;
            }
        }
        count as i32
    }

    let marshaller = Marshaller::new();
    let array = Value::array(
        ElementKind::String,
        vec!["a".into(), "bb".into(), "ccc".into()],
    )
    .unwrap();
    let count = native(count_strings as usize)
        .invoke_int(&marshaller, &[array])
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(POINTER_SIZE, std::mem::size_of::<usize>());
}

#[test]
fn test_array_results() {
    let marshaller = Marshaller::new();

    let names = native(fruit_names as usize)
        .invoke(&marshaller, &NativeType::StringArray, &[])
        .unwrap();
    assert_eq!(
        names.as_array().unwrap().borrow().items(),
        &[Value::from("apple"), Value::from("pear")]
    );

    let wide = native(wide_names as usize)
        .invoke(&marshaller, &NativeType::WStringArray, &[])
        .unwrap();
    assert_eq!(
        wide.as_array().unwrap().borrow().items(),
        &[Value::wide("north"), Value::wide("south")]
    );

    let slots = native(point_slots as usize)
        .invoke(&marshaller, &NativeType::PointerArray, &[])
        .unwrap();
    let slots = slots.as_array().unwrap().borrow();
    assert_eq!(slots.len(), 2);
    let ys: Vec<i32> = slots
        .items()
        .iter()
        .map(|slot| slot.as_pointer().unwrap().read_i32(4).unwrap())
        .collect();
    assert_eq!(ys, vec![2, 4]);
}

#[test]
fn test_nested_call_on_same_marshaller() {
    REENTRANT.with(|marshaller| {
        let outer = native(echo_plus_one as usize);
        assert_eq!(outer.invoke_int(marshaller, &[Value::I32(41)]).unwrap(), 42);
        assert_eq!(marshaller.last_state(), CallState::Done);

        let p = point(&point_type(), 2, 5).into_ref();
        native(scale_via_marshaller as usize)
            .invoke_void(marshaller, &[Value::Structure(p.clone()), Value::I32(3)])
            .unwrap();
        assert_eq!(p.borrow().get("x"), Some(&Value::I32(6)));
        assert_eq!(p.borrow().get("y"), Some(&Value::I32(15)));
        assert_eq!(marshaller.last_state(), CallState::Done);
    });
}

#[test]
fn test_callback_identity_across_marshallers() {
    CallbackRegistry::shared()
        .borrow_mut()
        .set_factory(Box::new(MarkerTrampolines));
    let first = Marshaller::new();
    let second = Marshaller::new();
    let callback: Rc<dyn Callback> = Rc::new(Doubler);
    let identity = native(identity_pointer as usize);

    let address = first.callbacks().borrow_mut().pointer_for(&callback).unwrap();
    assert_eq!(second.callbacks().borrow_mut().pointer_for(&callback).unwrap(), address);

    // An address produced for `first` comes back through `second` as the
    // same callback, not as a foreign function.
    let target = unsafe { MemoryView::external(address) }.unwrap();
    let returned = identity
        .invoke(&second, &NativeType::Callback, &[Value::Pointer(target)])
        .unwrap();
    assert_eq!(returned, Value::Callback(callback));
}

#[derive(Debug)]
struct Celsius(i32);

impl NativeMapped for Celsius {
    fn native_type(&self) -> NativeType {
        NativeType::I32
    }

    fn to_native(&self) -> FfiResult<Value> {
        Ok(Value::I32(self.0))
    }

    fn from_native(&self, native: Value) -> FfiResult<Value> {
        let degrees = native
            .as_i64()
            .ok_or_else(|| FfiError::invalid_argument("expected an integer"))?;
        Ok(Value::object(Celsius(degrees as i32)))
    }
}

impl ManagedObject for Celsius {
    fn type_key(&self) -> TypeKey {
        TypeKey::named("Celsius")
    }

    fn as_native_mapped(&self) -> Option<&dyn NativeMapped> {
        Some(self)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn degrees(value: &Value) -> Option<i32> {
    match value {
        Value::Object(o) => o.as_any().downcast_ref::<Celsius>().map(|c| c.0),
        _ => None,
    }
}

#[test]
fn test_self_mapped_return_and_array() {
    let marshaller = Marshaller::new();
    let proto: MappedType = Arc::new(Celsius(0));

    let echoed = native(echo_int as usize)
        .invoke(&marshaller, &NativeType::Mapped(proto.clone()), &[Value::object(Celsius(21))])
        .unwrap();
    assert_eq!(degrees(&echoed), Some(21));

    let readings = Value::array(
        ElementKind::Mapped(proto),
        vec![Value::object(Celsius(-4)), Value::object(Celsius(15))],
    )
    .unwrap();
    native(double_all as usize)
        .invoke_void(&marshaller, &[readings.clone(), Value::I32(2)])
        .unwrap();
    let doubled: Vec<Option<i32>> = readings
        .as_array()
        .unwrap()
        .borrow()
        .items()
        .iter()
        .map(degrees)
        .collect();
    assert_eq!(doubled, vec![Some(-8), Some(30)]);
}
