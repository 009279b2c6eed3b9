//! Pre-call checks
//!
//! Everything here runs before any argument is converted or any native code
//! executes, so a failed check never leaves a half-issued call behind.

use crate::config::MarshalConfig;
use crate::error::{FfiError, FfiResult, TypePosition};
use crate::ffi::call::Function;
use crate::ffi::value::Value;
use crate::ffi::MAX_ARGUMENTS;

/// Validates calls against the configured limits
#[derive(Debug, Clone)]
pub struct SafetyChecker {
    max_arguments: usize,
    reject_interior_nul: bool,
}

impl SafetyChecker {
    pub fn new(config: &MarshalConfig) -> Self {
        Self {
            max_arguments: config.max_arguments(),
            reject_interior_nul: config.strings.reject_interior_nul,
        }
    }

    pub fn max_arguments(&self) -> usize {
        self.max_arguments
    }

    /// Checks that need only the call shape.
    pub fn check_call(&self, function: &Function, args: &[Value]) -> FfiResult<()> {
        if args.len() > self.max_arguments {
            return Err(FfiError::TooManyArguments {
                count: args.len(),
                limit: self.max_arguments,
            });
        }
        if function.address() == 0 {
            return Err(FfiError::invalid_argument(format!(
                "{} has a null address",
                function
            )));
        }
        Ok(())
    }

    /// A string is about to be copied to native memory as argument `index`.
    pub fn check_string(&self, function: &Function, index: usize, value: &str) -> FfiResult<()> {
        if self.reject_interior_nul && value.contains('\0') {
            return Err(FfiError::conversion(
                &function.to_string(),
                TypePosition::Parameter(index),
                "string contains an interior NUL and would be truncated",
            ));
        }
        Ok(())
    }
}

impl Default for SafetyChecker {
    fn default() -> Self {
        Self {
            max_arguments: MAX_ARGUMENTS,
            reject_interior_nul: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::CallFlags;

    fn function() -> Function {
        unsafe { Function::from_address(0x1000, CallFlags::C_CONVENTION) }
    }

    #[test]
    fn test_argument_limit() {
        let checker = SafetyChecker::default();
        let args = vec![Value::I32(0); 257];
        assert_eq!(
            checker.check_call(&function(), &args),
            Err(FfiError::TooManyArguments { count: 257, limit: 256 })
        );
        assert!(checker.check_call(&function(), &args[..256]).is_ok());
    }

    #[test]
    fn test_configured_limit() {
        let config = MarshalConfig::from_toml("[calls]\nmax_arguments = 2\n").unwrap();
        let checker = SafetyChecker::new(&config);
        assert!(checker.check_call(&function(), &vec![Value::I32(0); 3]).is_err());
    }

    #[test]
    fn test_interior_nul() {
        let checker = SafetyChecker::default();
        assert!(checker.check_string(&function(), 0, "a\0b").is_err());
        assert!(checker.check_string(&function(), 0, "ab").is_ok());

        let config = MarshalConfig::from_toml("[strings]\nreject_interior_nul = false\n").unwrap();
        assert!(SafetyChecker::new(&config).check_string(&function(), 0, "a\0b").is_ok());
    }
}
