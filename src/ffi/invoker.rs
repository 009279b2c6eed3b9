//! The raw invoke primitive
//!
//! A [`NativeInvoker`] calls a native address with already-converted
//! arguments and hands back the raw result. [`FfiInvoker`] does this with
//! libffi; tests substitute their own implementations to observe calls.

use crate::error::{FfiError, FfiResult};
use crate::ffi::c_types::CType;
use crate::ffi::last_error;
use crate::ffi::{CallingConvention, StructType};
use crate::memory::NativeBuffer;
use libffi::middle::{Cif, CodePtr, Type as FfiType};
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

/// An argument in native form
#[derive(Debug, Clone)]
pub enum NativeArg {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(usize),
    /// Structure passed inline; its bytes are read from `address`
    Struct { address: usize, ty: Arc<StructType> },
}

impl NativeArg {
    pub fn raw_type(&self) -> RawType {
        match self {
            NativeArg::I8(_) => RawType::I8,
            NativeArg::I16(_) => RawType::I16,
            NativeArg::I32(_) => RawType::I32,
            NativeArg::I64(_) => RawType::I64,
            NativeArg::F32(_) => RawType::F32,
            NativeArg::F64(_) => RawType::F64,
            NativeArg::Pointer(_) => RawType::Pointer,
            NativeArg::Struct { ty, .. } => RawType::Struct(ty.clone()),
        }
    }

    /// Pointer to the argument's bytes, as libffi expects in `avalue`.
    fn value_ptr(&self) -> *mut c_void {
        match self {
            NativeArg::I8(v) => v as *const i8 as *mut c_void,
            NativeArg::I16(v) => v as *const i16 as *mut c_void,
            NativeArg::I32(v) => v as *const i32 as *mut c_void,
            NativeArg::I64(v) => v as *const i64 as *mut c_void,
            NativeArg::F32(v) => v as *const f32 as *mut c_void,
            NativeArg::F64(v) => v as *const f64 as *mut c_void,
            NativeArg::Pointer(v) => v as *const usize as *mut c_void,
            NativeArg::Struct { address, .. } => *address as *mut c_void,
        }
    }
}

/// Native type of a raw result
#[derive(Debug, Clone, PartialEq)]
pub enum RawType {
    Void,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Pointer,
    Struct(Arc<StructType>),
}

impl RawType {
    fn ffi_type(&self) -> FfiType {
        match self {
            RawType::Void => FfiType::void(),
            RawType::I8 => CType::I8.to_ffi_type(),
            RawType::I16 => CType::I16.to_ffi_type(),
            RawType::I32 => CType::I32.to_ffi_type(),
            RawType::I64 => CType::I64.to_ffi_type(),
            RawType::F32 => CType::F32.to_ffi_type(),
            RawType::F64 => CType::F64.to_ffi_type(),
            RawType::Pointer => CType::Pointer.to_ffi_type(),
            RawType::Struct(ty) => ty.ffi_type(),
        }
    }
}

/// A raw native result
pub enum RawValue {
    Void,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(usize),
    /// Bytes of a structure returned by value
    Struct(NativeBuffer),
}

impl RawValue {
    /// Integer results widened to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RawValue::I8(v) => Some(*v as i64),
            RawValue::I16(v) => Some(*v as i64),
            RawValue::I32(v) => Some(*v as i64),
            RawValue::I64(v) => Some(*v),
            RawValue::Pointer(v) => Some(*v as i64),
            _ => None,
        }
    }
}

impl fmt::Debug for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Void => write!(f, "void"),
            RawValue::I8(v) => write!(f, "{}i8", v),
            RawValue::I16(v) => write!(f, "{}i16", v),
            RawValue::I32(v) => write!(f, "{}i32", v),
            RawValue::I64(v) => write!(f, "{}i64", v),
            RawValue::F32(v) => write!(f, "{}f32", v),
            RawValue::F64(v) => write!(f, "{}f64", v),
            RawValue::Pointer(v) => write!(f, "0x{:x}", v),
            RawValue::Struct(b) => write!(f, "struct {:?}", b),
        }
    }
}

/// Result of one raw call
#[derive(Debug)]
pub struct RawReturn {
    pub value: RawValue,
    /// Last error observed right after the call, when requested
    pub last_error: Option<i32>,
}

/// One native call, fully converted
#[derive(Debug)]
pub struct RawCall<'a> {
    pub address: usize,
    pub convention: CallingConvention,
    pub args: &'a [NativeArg],
    pub ret: RawType,
    /// Clear the last error before the call and report it after
    pub capture_last_error: bool,
}

/// Calls native code
pub trait NativeInvoker {
    /// Perform the call.
    ///
    /// # Safety
    ///
    /// `call.address` must be a function whose signature matches the
    /// argument and return types, and every pointer argument must be valid
    /// for the accesses that function makes.
    unsafe fn invoke(&self, call: &RawCall<'_>) -> FfiResult<RawReturn>;
}

/// libffi-backed invoker
#[derive(Debug, Default, Clone, Copy)]
pub struct FfiInvoker;

impl FfiInvoker {
    pub fn new() -> Self {
        FfiInvoker
    }

    fn cif(call: &RawCall<'_>) -> Cif {
        let arg_types: Vec<FfiType> = call.args.iter().map(|a| a.raw_type().ffi_type()).collect();
        #[allow(unused_mut)]
        let mut cif = Cif::new(arg_types, call.ret.ffi_type());

        match call.convention {
            CallingConvention::C => {}
            #[cfg(all(windows, target_arch = "x86"))]
            CallingConvention::Alt => cif.set_abi(libffi::raw::ffi_abi_FFI_STDCALL),
            // Only 32-bit Windows distinguishes the alternate convention.
            #[cfg(not(all(windows, target_arch = "x86")))]
            CallingConvention::Alt => {}
        }
        cif
    }
}

impl NativeInvoker for FfiInvoker {
    unsafe fn invoke(&self, call: &RawCall<'_>) -> FfiResult<RawReturn> {
        if call.address == 0 {
            return Err(FfiError::invalid_argument("cannot call the null address"));
        }

        let cif = Self::cif(call);
        let code = CodePtr::from_ptr(call.address as *const c_void);
        let target = *code.as_fun();
        let mut avalue: Vec<*mut c_void> = call.args.iter().map(NativeArg::value_ptr).collect();

        // Integral results narrower than a register are widened to ffi_arg,
        // so the slot is always at least 8 bytes.
        let mut slot = [0u64; 2];
        let struct_buffer = match &call.ret {
            RawType::Struct(ty) => Some(NativeBuffer::allocate(ty.size().max(16))?),
            _ => None,
        };
        let rvalue = match (&call.ret, &struct_buffer) {
            (RawType::Void, _) => std::ptr::null_mut(),
            (_, Some(buffer)) => buffer.address() as *mut c_void,
            _ => slot.as_mut_ptr() as *mut c_void,
        };

        if call.capture_last_error {
            last_error::set(0);
        }
        libffi::raw::ffi_call(cif.as_raw_ptr(), Some(target), rvalue, avalue.as_mut_ptr());
        let last_error = call.capture_last_error.then(last_error::get);

        let widened = slot[0];
        let value = match &call.ret {
            RawType::Void => RawValue::Void,
            RawType::I8 => RawValue::I8(widened as i8),
            RawType::I16 => RawValue::I16(widened as i16),
            RawType::I32 => RawValue::I32(widened as i32),
            RawType::I64 => RawValue::I64(widened as i64),
            RawType::F32 => RawValue::F32(std::ptr::read(slot.as_ptr() as *const f32)),
            RawType::F64 => RawValue::F64(f64::from_bits(widened)),
            RawType::Pointer => RawValue::Pointer(widened as usize),
            RawType::Struct(_) => match struct_buffer {
                Some(buffer) => RawValue::Struct(buffer),
                None => return Err(FfiError::Allocation { size: 0 }),
            },
        };

        Ok(RawReturn { value, last_error })
    }
}
