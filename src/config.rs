//! Marshalling configuration loaded from TOML
//!
//! ```toml
//! [calls]
//! max_arguments = 64
//! convention = "c"
//! throw_last_error = true
//!
//! [strings]
//! encoding = "latin-1"
//! reject_interior_nul = true
//!
//! [memory]
//! zero_allocations = true
//! ```
//!
//! Every key is optional.

use crate::error::{FfiError, FfiResult};
use crate::ffi::{CallFlags, MAX_ARGUMENTS};
use crate::memory::NarrowEncoding;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Settings applied by a [`Marshaller`](crate::ffi::Marshaller)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarshalConfig {
    pub calls: CallConfig,
    pub strings: StringConfig,
    pub memory: MemoryConfig,
}

/// `[calls]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallConfig {
    /// Argument limit, at most the hard limit of 256
    pub max_arguments: usize,
    /// Default convention for functions created from this config
    pub convention: ConventionName,
    /// Check the last error after every call by default
    pub throw_last_error: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_arguments: MAX_ARGUMENTS,
            convention: ConventionName::C,
            throw_last_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConventionName {
    #[default]
    C,
    Alt,
}

/// `[strings]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StringConfig {
    pub encoding: NarrowEncoding,
    /// Fail a call whose string argument contains NUL
    pub reject_interior_nul: bool,
}

impl Default for StringConfig {
    fn default() -> Self {
        Self {
            encoding: NarrowEncoding::Utf8,
            reject_interior_nul: true,
        }
    }
}

/// `[memory]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    /// Zero scratch buffers allocated for arguments
    pub zero_allocations: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            zero_allocations: true,
        }
    }
}

impl MarshalConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> FfiResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| FfiError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> FfiResult<Self> {
        let config: MarshalConfig =
            toml::from_str(content).map_err(|e| FfiError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> FfiResult<String> {
        toml::to_string_pretty(self).map_err(|e| FfiError::Config(e.to_string()))
    }

    pub fn validate(&self) -> FfiResult<()> {
        if self.calls.max_arguments > MAX_ARGUMENTS {
            return Err(FfiError::Config(format!(
                "calls.max_arguments is {}, the limit is {}",
                self.calls.max_arguments, MAX_ARGUMENTS
            )));
        }
        Ok(())
    }

    /// Call flags for functions created with this configuration.
    pub fn default_flags(&self) -> CallFlags {
        let mut flags = match self.calls.convention {
            ConventionName::C => CallFlags::C_CONVENTION,
            ConventionName::Alt => CallFlags::ALT_CONVENTION,
        };
        if self.calls.throw_last_error {
            flags |= CallFlags::THROW_LAST_ERROR;
        }
        flags
    }

    /// Effective argument limit.
    pub fn max_arguments(&self) -> usize {
        self.calls.max_arguments.min(MAX_ARGUMENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = MarshalConfig::from_toml("").unwrap();
        assert_eq!(config, MarshalConfig::default());
        assert_eq!(config.max_arguments(), 256);
        assert!(config.strings.reject_interior_nul);
    }

    #[test]
    fn test_sections() {
        let config = MarshalConfig::from_toml(
            r#"
            [calls]
            max_arguments = 8
            convention = "alt"
            throw_last_error = true

            [strings]
            encoding = "latin-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_arguments(), 8);
        assert_eq!(
            config.default_flags(),
            CallFlags::ALT_CONVENTION | CallFlags::THROW_LAST_ERROR
        );
        assert_eq!(config.strings.encoding, NarrowEncoding::Latin1);
        assert!(config.memory.zero_allocations);
    }

    #[test]
    fn test_limit_enforced() {
        let result = MarshalConfig::from_toml("[calls]\nmax_arguments = 257\n");
        assert!(matches!(result, Err(FfiError::Config(_))));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(MarshalConfig::from_toml("[calls]\nretries = 3\n").is_err());
    }
}
