//! Tests for loading marshaller configuration from disk

use flux_native::ffi::{CallFlags, Function, Marshaller, NativeType, Value};
use flux_native::memory::NarrowEncoding;
use flux_native::{FfiError, MarshalConfig};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[calls]
max_arguments = 4
throw_last_error = true

[strings]
encoding = "latin-1"
reject_interior_nul = false
"#
    )
    .unwrap();

    let config = MarshalConfig::from_file(file.path()).unwrap();
    assert_eq!(config.max_arguments(), 4);
    assert_eq!(config.strings.encoding, NarrowEncoding::Latin1);
    assert!(config.default_flags().contains(CallFlags::THROW_LAST_ERROR));

    let round_trip = MarshalConfig::from_toml(&config.to_toml().unwrap()).unwrap();
    assert_eq!(round_trip, config);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = MarshalConfig::from_file(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(FfiError::Config(_))));
}

#[test]
fn test_malformed_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[calls\nmax_arguments = ").unwrap();
    assert!(matches!(
        MarshalConfig::from_file(file.path()),
        Err(FfiError::Config(_))
    ));
}

#[test]
fn test_marshaller_uses_configured_limit() {
    let config = MarshalConfig::from_toml("[calls]\nmax_arguments = 1\n").unwrap();
    let marshaller = Marshaller::with_config(config);
    let function = unsafe { Function::from_address(0x1000, CallFlags::C_CONVENTION) };
    let result = marshaller.invoke(
        &function,
        &NativeType::Void,
        &[Value::I32(1), Value::I32(2)],
        None,
    );
    assert!(matches!(
        result,
        Err(FfiError::TooManyArguments { count: 2, limit: 1 })
    ));
}
