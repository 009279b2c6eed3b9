//! Identity between managed callbacks and native function pointers
//!
//! Each live callback object maps to exactly one trampoline address for as
//! long as the object lives, and an incoming function pointer maps back to
//! the callback that produced it. Pointers we did not produce are wrapped in
//! one [`Function`] per address while that wrapper is alive.
//!
//! Marshallers on one thread share [`CallbackRegistry::shared`] unless they
//! are handed a registry explicitly, so the identity holds across them.

use crate::error::{FfiError, FfiResult};
use crate::ffi::call::Function;
use crate::ffi::value::Value;
use crate::ffi::{CallFlags, NativeType};
use crate::weak_identity::IdentityWeakCache;
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Managed code callable from native code
pub trait Callback {
    fn parameter_types(&self) -> Vec<NativeType>;

    fn return_type(&self) -> NativeType;

    fn call(&self, args: &[Value]) -> FfiResult<Value>;
}

/// A native entry point standing in for a callback
pub struct Trampoline {
    address: usize,
    /// Keeps whatever backs `address` (closure memory, thunk) alive.
    _handle: Option<Box<dyn Any>>,
}

impl Trampoline {
    pub fn new(address: usize, handle: Option<Box<dyn Any>>) -> Self {
        Self {
            address,
            _handle: handle,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trampoline@0x{:x}", self.address)
    }
}

/// Produces trampolines for callbacks
pub trait TrampolineFactory {
    fn create(&self, callback: &Rc<dyn Callback>) -> FfiResult<Trampoline>;
}

/// Factory used when no dispatch mechanism has been installed.
struct NoTrampolines;

impl TrampolineFactory for NoTrampolines {
    fn create(&self, _callback: &Rc<dyn Callback>) -> FfiResult<Trampoline> {
        Err(FfiError::invalid_argument(
            "no trampoline factory installed; callbacks cannot be passed to native code",
        ))
    }
}

/// A registry shared between marshallers
pub type SharedCallbacks = Rc<RefCell<CallbackRegistry>>;

thread_local! {
    static THREAD_CALLBACKS: SharedCallbacks = Rc::new(RefCell::new(CallbackRegistry::new()));
}

/// Callback and function pointer wrappers, one per identity
pub struct CallbackRegistry {
    trampolines: IdentityWeakCache<dyn Callback, Trampoline>,
    functions: HashMap<usize, Weak<Function>>,
    factory: Box<dyn TrampolineFactory>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::with_factory(Box::new(NoTrampolines))
    }

    pub fn with_factory(factory: Box<dyn TrampolineFactory>) -> Self {
        Self {
            trampolines: IdentityWeakCache::new(),
            functions: HashMap::new(),
            factory,
        }
    }

    /// The registry every marshaller on this thread uses by default.
    pub fn shared() -> SharedCallbacks {
        THREAD_CALLBACKS.with(Rc::clone)
    }

    pub fn into_shared(self) -> SharedCallbacks {
        Rc::new(RefCell::new(self))
    }

    /// Install the factory used for callbacks that have no trampoline yet.
    pub fn set_factory(&mut self, factory: Box<dyn TrampolineFactory>) {
        self.factory = factory;
    }

    /// The native address for `callback`, created on first use.
    pub fn pointer_for(&mut self, callback: &Rc<dyn Callback>) -> FfiResult<usize> {
        if let Some(trampoline) = self.trampolines.get(callback) {
            return Ok(trampoline.address());
        }
        let trampoline = self.factory.create(callback)?;
        let address = trampoline.address();
        log::debug!("created trampoline at 0x{:x}", address);
        self.trampolines.put(callback, trampoline);
        Ok(address)
    }

    /// The live callback whose trampoline is at `address`.
    pub fn callback_for(&mut self, address: usize) -> Option<Rc<dyn Callback>> {
        self.trampolines.find_key(|t| t.address() == address)
    }

    /// The wrapper for a foreign function pointer, reused while it is alive.
    pub fn function_for(&mut self, address: usize, flags: CallFlags) -> Rc<Function> {
        self.functions.retain(|_, f| f.strong_count() > 0);
        if let Some(existing) = self.functions.get(&address).and_then(Weak::upgrade) {
            if existing.flags() == flags {
                return existing;
            }
        }
        let function = Rc::new(Function::foreign(address, flags));
        self.functions.insert(address, Rc::downgrade(&function));
        function
    }

    /// Managed form of a function pointer returned by native code.
    pub fn resolve(&mut self, address: usize, flags: CallFlags) -> Value {
        if address == 0 {
            return Value::Null;
        }
        match self.callback_for(address) {
            Some(callback) => Value::Callback(callback),
            None => Value::Function(self.function_for(address, flags)),
        }
    }

    /// Forget the trampoline of `callback`; returns false if it had none.
    pub fn release(&mut self, callback: &Rc<dyn Callback>) -> bool {
        self.trampolines.remove(callback).is_some()
    }

    /// Number of live callbacks with a trampoline.
    pub fn len(&mut self) -> usize {
        self.trampolines.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("trampolines", &self.trampolines)
            .field("functions", &self.functions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Nop;

    impl Callback for Nop {
        fn parameter_types(&self) -> Vec<NativeType> {
            Vec::new()
        }

        fn return_type(&self) -> NativeType {
            NativeType::Void
        }

        fn call(&self, _args: &[Value]) -> FfiResult<Value> {
            Ok(Value::Null)
        }
    }

    struct CountingFactory {
        next: Cell<usize>,
    }

    impl TrampolineFactory for CountingFactory {
        fn create(&self, _callback: &Rc<dyn Callback>) -> FfiResult<Trampoline> {
            let address = self.next.get();
            self.next.set(address + 0x10);
            Ok(Trampoline::new(address, None))
        }
    }

    fn registry() -> CallbackRegistry {
        CallbackRegistry::with_factory(Box::new(CountingFactory { next: Cell::new(0x1000) }))
    }

    #[test]
    fn test_one_trampoline_per_callback() {
        let mut registry = registry();
        let a: Rc<dyn Callback> = Rc::new(Nop);
        let b: Rc<dyn Callback> = Rc::new(Nop);
        let pa = registry.pointer_for(&a).unwrap();
        assert_eq!(registry.pointer_for(&a).unwrap(), pa);
        assert_ne!(registry.pointer_for(&b).unwrap(), pa);
        assert!(Rc::ptr_eq(&registry.callback_for(pa).unwrap(), &a));
    }

    #[test]
    fn test_dropped_callback_is_forgotten() {
        let mut registry = registry();
        let a: Rc<dyn Callback> = Rc::new(Nop);
        let pa = registry.pointer_for(&a).unwrap();
        drop(a);
        assert!(registry.callback_for(pa).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_foreign_pointer_wrapper_is_cached() {
        let mut registry = registry();
        let first = registry.function_for(0x4000, CallFlags::C_CONVENTION);
        let second = registry.function_for(0x4000, CallFlags::C_CONVENTION);
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(registry.resolve(0, CallFlags::C_CONVENTION), Value::Null);
    }

    #[test]
    fn test_thread_registry_is_shared() {
        let a = CallbackRegistry::shared();
        let b = CallbackRegistry::shared();
        assert!(Rc::ptr_eq(&a, &b));

        let other = std::thread::spawn(|| Rc::as_ptr(&CallbackRegistry::shared()) as usize)
            .join()
            .unwrap();
        assert_ne!(other, Rc::as_ptr(&a) as usize);
    }

    #[test]
    fn test_installed_factory_applies_to_new_callbacks() {
        let mut registry = CallbackRegistry::new();
        let a: Rc<dyn Callback> = Rc::new(Nop);
        assert!(registry.pointer_for(&a).is_err());
        registry.set_factory(Box::new(CountingFactory { next: Cell::new(0x2000) }));
        assert_eq!(registry.pointer_for(&a).unwrap(), 0x2000);
    }

    #[test]
    fn test_default_factory_refuses() {
        let mut registry = CallbackRegistry::new();
        let a: Rc<dyn Callback> = Rc::new(Nop);
        assert!(registry.pointer_for(&a).is_err());
    }
}
