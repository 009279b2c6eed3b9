//! Native library loading and symbol resolution

use crate::error::{FfiError, FfiResult};
use crate::ffi::call::Function;
use crate::ffi::CallFlags;
use libloading::Library;
use std::path::Path;

/// Resolves symbol names to native addresses
pub trait SymbolResolver {
    /// Name used in diagnostics and in [`Function`] display.
    fn name(&self) -> &str;

    fn resolve_symbol(&self, symbol: &str) -> FfiResult<usize>;
}

/// A loaded native library
pub struct NativeLibrary {
    library: Library,
    name: String,
}

impl NativeLibrary {
    /// Load a library from a path or a name the platform loader can find.
    pub fn open(path: impl AsRef<Path>) -> FfiResult<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let library = unsafe { Library::new(path) }
            .map_err(|e| FfiError::library_load(&name, &e.to_string()))?;
        log::debug!("loaded native library {}", name);
        Ok(Self { library, name })
    }

    /// The symbols already linked into the running process.
    #[cfg(unix)]
    pub fn current_process() -> FfiResult<Self> {
        let library: Library = libloading::os::unix::Library::this().into();
        Ok(Self {
            library,
            name: "<process>".to_string(),
        })
    }

    #[cfg(windows)]
    pub fn current_process() -> FfiResult<Self> {
        let library: Library = libloading::os::windows::Library::this()
            .map_err(|e| FfiError::library_load("<process>", &e.to_string()))?
            .into();
        Ok(Self {
            library,
            name: "<process>".to_string(),
        })
    }

    /// Look up `symbol` and wrap it as a callable function.
    ///
    /// # Safety
    ///
    /// The library must stay loaded while the function is used, and calls
    /// through it must match the symbol's real signature.
    pub unsafe fn function(&self, symbol: &str, flags: CallFlags) -> FfiResult<Function> {
        let address = self.resolve_symbol(symbol)?;
        Ok(Function::with_name(address, symbol, Some(&self.name), flags))
    }
}

impl SymbolResolver for NativeLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve_symbol(&self, symbol: &str) -> FfiResult<usize> {
        let address = unsafe {
            self.library
                .get::<unsafe extern "C" fn()>(symbol.as_bytes())
                .map(|s| *s as usize)
        }
        .map_err(|_| FfiError::symbol_not_found(symbol, &self.name))?;
        if address == 0 {
            return Err(FfiError::symbol_not_found(symbol, &self.name));
        }
        Ok(address)
    }
}

impl std::fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeLibrary({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library() {
        let result = NativeLibrary::open("/nonexistent/libnothing_here.so");
        assert!(matches!(result, Err(FfiError::LibraryLoad { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_from_process() {
        let process = NativeLibrary::current_process().unwrap();
        assert!(process.resolve_symbol("strlen").is_ok());
        let strlen = unsafe { process.function("strlen", CallFlags::C_CONVENTION) }.unwrap();
        assert_eq!(strlen.name(), Some("strlen"));
        assert!(strlen.to_string().starts_with("native function strlen(<process>)@0x"));
        assert!(matches!(
            process.resolve_symbol("no_such_symbol_anywhere_42"),
            Err(FfiError::SymbolNotFound { .. })
        ));
    }
}
