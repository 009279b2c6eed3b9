//! Native function handles and the call marshaller
//!
//! A call moves through `Idle → ArgumentsConverting → Invoking →
//! ResultConverting → Synchronizing → Done`, or ends in `Failed` from any
//! step. Conversion errors stop the call before anything native runs. A
//! last-error failure is reported after the native code has already run.

use crate::config::MarshalConfig;
use crate::error::{FfiError, FfiResult};
use crate::ffi::callback::{CallbackRegistry, SharedCallbacks};
use crate::ffi::invoker::{FfiInvoker, NativeInvoker, RawCall};
use crate::ffi::marshaling::MarshalingContext;
use crate::ffi::safety::SafetyChecker;
use crate::ffi::type_mapper::TypeMapper;
use crate::ffi::value::Value;
use crate::ffi::{CallFlags, CallingConvention, NativeType};
use crate::memory::MemoryView;
use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A native function address with its calling options
#[derive(Clone)]
pub struct Function {
    address: usize,
    name: Option<String>,
    library: Option<String>,
    flags: CallFlags,
}

impl Function {
    /// Wrap a raw function address.
    ///
    /// # Safety
    ///
    /// `address` must be a native function that stays loaded while this
    /// handle is used, and every call made through it must match that
    /// function's real signature.
    pub unsafe fn from_address(address: usize, flags: CallFlags) -> Self {
        Self::foreign(address, flags)
    }

    /// A pointer handed to us by native code.
    pub(crate) fn foreign(address: usize, flags: CallFlags) -> Self {
        Self {
            address,
            name: None,
            library: None,
            flags,
        }
    }

    pub(crate) fn with_name(
        address: usize,
        name: &str,
        library: Option<&str>,
        flags: CallFlags,
    ) -> Self {
        Self {
            address,
            name: Some(name.to_string()),
            library: library.map(str::to_string),
            flags,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn library(&self) -> Option<&str> {
        self.library.as_deref()
    }

    pub fn flags(&self) -> CallFlags {
        self.flags
    }

    pub fn convention(&self) -> CallingConvention {
        self.flags.convention()
    }

    /// Call with an explicit return type.
    pub fn invoke(&self, marshaller: &Marshaller, ret: &NativeType, args: &[Value]) -> FfiResult<Value> {
        marshaller.invoke(self, ret, args, None)
    }

    pub fn invoke_void(&self, marshaller: &Marshaller, args: &[Value]) -> FfiResult<()> {
        self.invoke(marshaller, &NativeType::Void, args).map(|_| ())
    }

    pub fn invoke_int(&self, marshaller: &Marshaller, args: &[Value]) -> FfiResult<i32> {
        let value = self.invoke(marshaller, &NativeType::I32, args)?;
        self.expect(value.as_i64().map(|v| v as i32), &value)
    }

    pub fn invoke_long(&self, marshaller: &Marshaller, args: &[Value]) -> FfiResult<i64> {
        let value = self.invoke(marshaller, &NativeType::I64, args)?;
        self.expect(value.as_i64(), &value)
    }

    pub fn invoke_float(&self, marshaller: &Marshaller, args: &[Value]) -> FfiResult<f32> {
        let value = self.invoke(marshaller, &NativeType::F32, args)?;
        self.expect(value.as_f64().map(|v| v as f32), &value)
    }

    pub fn invoke_double(&self, marshaller: &Marshaller, args: &[Value]) -> FfiResult<f64> {
        let value = self.invoke(marshaller, &NativeType::F64, args)?;
        self.expect(value.as_f64(), &value)
    }

    /// A null result is `None`.
    pub fn invoke_pointer(
        &self,
        marshaller: &Marshaller,
        args: &[Value],
    ) -> FfiResult<Option<MemoryView>> {
        match self.invoke(marshaller, &NativeType::Pointer, args)? {
            Value::Null => Ok(None),
            Value::Pointer(p) => Ok(Some(p)),
            other => self.expect(None, &other),
        }
    }

    /// A null result is `None`.
    pub fn invoke_string(
        &self,
        marshaller: &Marshaller,
        args: &[Value],
        wide: bool,
    ) -> FfiResult<Option<String>> {
        let ret = if wide { NativeType::WString } else { NativeType::String };
        match self.invoke(marshaller, &ret, args)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            Value::WString(s) => Ok(Some(s.as_str().to_string())),
            other => self.expect(None, &other),
        }
    }

    fn expect<T>(&self, converted: Option<T>, value: &Value) -> FfiResult<T> {
        converted.ok_or_else(|| {
            FfiError::conversion(
                &self.to_string(),
                crate::error::TypePosition::Return,
                &format!("unexpected {} result", value.type_name()),
            )
        })
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.flags == other.flags
    }
}

impl Eq for Function {}

impl Hash for Function {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.flags.hash(state);
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.library) {
            (Some(name), Some(library)) => {
                write!(f, "native function {}({})@0x{:x}", name, library, self.address)
            }
            (Some(name), None) => write!(f, "native function {}@0x{:x}", name, self.address),
            _ => write!(f, "native function@0x{:x}", self.address),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:?}]", self, self.flags)
    }
}

/// Progress of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    ArgumentsConverting,
    Invoking,
    ResultConverting,
    Synchronizing,
    Done,
    Failed,
}

/// Bookkeeping for one invocation
struct CallFrame<'a> {
    function: &'a Function,
    state: CallState,
}

impl<'a> CallFrame<'a> {
    fn new(function: &'a Function) -> Self {
        Self {
            function,
            state: CallState::Idle,
        }
    }

    fn transition(&mut self, next: CallState) {
        log::trace!("{}: {:?} -> {:?}", self.function, self.state, next);
        self.state = next;
    }
}

/// Performs native calls
///
/// The marshaller holds no borrow across the native call itself, so native
/// code may call back into managed code that invokes through the same
/// marshaller. Callback identity lives in the thread's shared registry.
pub struct Marshaller {
    invoker: Box<dyn NativeInvoker>,
    callbacks: SharedCallbacks,
    config: MarshalConfig,
    safety: SafetyChecker,
    last_state: Cell<CallState>,
}

impl Marshaller {
    /// A libffi-backed marshaller with default settings.
    pub fn new() -> Self {
        Self::with_config(MarshalConfig::default())
    }

    pub fn with_config(config: MarshalConfig) -> Self {
        Self::with_invoker(Box::new(FfiInvoker::new()), config)
    }

    pub fn with_invoker(invoker: Box<dyn NativeInvoker>, config: MarshalConfig) -> Self {
        let safety = SafetyChecker::new(&config);
        Self {
            invoker,
            callbacks: CallbackRegistry::shared(),
            config,
            safety,
            last_state: Cell::new(CallState::Idle),
        }
    }

    /// Use `callbacks` instead of the thread's shared registry.
    pub fn with_callbacks(mut self, callbacks: SharedCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn config(&self) -> &MarshalConfig {
        &self.config
    }

    pub fn callbacks(&self) -> &SharedCallbacks {
        &self.callbacks
    }

    /// Final state of the most recently completed call on this marshaller.
    pub fn last_state(&self) -> CallState {
        self.last_state.get()
    }

    /// Call `function` with `args` and convert its result as `ret`.
    ///
    /// `mapper` supplies custom conversions for this call; arguments are
    /// converted left to right and read back in the same order afterwards.
    pub fn invoke(
        &self,
        function: &Function,
        ret: &NativeType,
        args: &[Value],
        mapper: Option<&TypeMapper>,
    ) -> FfiResult<Value> {
        let mut frame = CallFrame::new(function);
        log::debug!("invoking {} with {} arguments", function, args.len());

        let result = self.run(&mut frame, ret, args, mapper);
        match &result {
            Ok(_) => frame.transition(CallState::Done),
            Err(e) => {
                log::debug!("{} failed: {}", function, e);
                frame.transition(CallState::Failed);
            }
        }
        self.last_state.set(frame.state);
        result
    }

    fn run(
        &self,
        frame: &mut CallFrame<'_>,
        ret: &NativeType,
        args: &[Value],
        mapper: Option<&TypeMapper>,
    ) -> FfiResult<Value> {
        let function = frame.function;
        self.safety.check_call(function, args)?;

        frame.transition(CallState::ArgumentsConverting);
        let mut context = MarshalingContext::new(function, args, mapper, &self.callbacks, &self.safety)
            .with_encoding(self.config.strings.encoding)
            .with_zeroed_allocations(self.config.memory.zero_allocations);
        let native_args = (0..args.len())
            .map(|index| context.marshal_argument(index))
            .collect::<FfiResult<Vec<_>>>()?;
        let plan = context.plan_return(ret)?;

        frame.transition(CallState::Invoking);
        let throw_last_error = function.flags().contains(CallFlags::THROW_LAST_ERROR);
        let call = RawCall {
            address: function.address(),
            convention: function.convention(),
            args: &native_args,
            ret: plan.raw_type().clone(),
            capture_last_error: throw_last_error,
        };
        // Function handles are only created for addresses vouched for by
        // their constructor, and the arguments were just converted.
        let raw = unsafe { self.invoker.invoke(&call)? };

        if throw_last_error {
            if let Some(code) = raw.last_error.filter(|code| *code != 0) {
                return Err(FfiError::LastError {
                    function: function.to_string(),
                    code,
                });
            }
        }

        frame.transition(CallState::ResultConverting);
        let value = context.unmarshal_return(&plan, raw.value)?;

        frame.transition(CallState::Synchronizing);
        context.synchronize()?;
        Ok(value)
    }
}

impl Default for Marshaller {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Marshaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marshaller")
            .field("config", &self.config)
            .field("last_state", &self.last_state.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_display() {
        let anonymous = unsafe { Function::from_address(0x1234, CallFlags::C_CONVENTION) };
        assert_eq!(anonymous.to_string(), "native function@0x1234");
        let named = Function::with_name(0x10, "frob", Some("libfrob.so"), CallFlags::C_CONVENTION);
        assert_eq!(named.to_string(), "native function frob(libfrob.so)@0x10");
    }

    #[test]
    fn test_function_equality_is_address_and_flags() {
        let a = Function::with_name(0x10, "a", None, CallFlags::C_CONVENTION);
        let b = Function::with_name(0x10, "b", Some("lib"), CallFlags::C_CONVENTION);
        let c = Function::with_name(0x10, "a", None, CallFlags::THROW_LAST_ERROR);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_marshallers_share_thread_callbacks() {
        let a = Marshaller::new();
        let b = Marshaller::with_config(MarshalConfig::default());
        assert!(std::rc::Rc::ptr_eq(a.callbacks(), b.callbacks()));

        let private = CallbackRegistry::new().into_shared();
        let c = Marshaller::new().with_callbacks(private.clone());
        assert!(std::rc::Rc::ptr_eq(c.callbacks(), &private));
    }

    #[test]
    fn test_failed_call_state() {
        let marshaller = Marshaller::new();
        let function = unsafe { Function::from_address(0x10, CallFlags::C_CONVENTION) };
        let args = vec![Value::I32(0); 300];
        assert!(marshaller.invoke(&function, &NativeType::Void, &args, None).is_err());
        assert_eq!(marshaller.last_state(), CallState::Failed);
    }
}
