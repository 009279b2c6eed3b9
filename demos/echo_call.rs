//! Calls a few C library functions found in the running process.
//!
//! Run with `RUST_LOG=debug` to see the marshaller at work.

use anyhow::{Context, Result};
use flux_native::ffi::{CallFlags, NativeLibrary, NativeType, TypeKey, TypeMapper, Value};
use flux_native::{MarshalConfig, Marshaller};

fn main() -> Result<()> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => MarshalConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => MarshalConfig::default(),
    };
    let flags = config.default_flags();
    let marshaller = Marshaller::with_config(config);
    let process = NativeLibrary::current_process().context("opening the current process")?;

    let strlen = unsafe { process.function("strlen", flags)? };
    let length = strlen.invoke_long(&marshaller, &[Value::from("hello, native world")])?;
    println!("{} -> {}", strlen, length);

    let abs = unsafe { process.function("abs", flags)? };
    println!("{} -> {}", abs, abs.invoke_int(&marshaller, &[Value::I32(-17)])?);

    // Managed booleans travel as C ints through a registered converter.
    let mut mapper = TypeMapper::new();
    mapper.add_from_native(TypeKey::Bool, NativeType::I32, |value, _| {
        Ok(Value::Bool(value.as_i64().map_or(false, |v| v != 0)))
    });
    let isdigit = unsafe { process.function("isdigit", CallFlags::C_CONVENTION)? };
    for c in ['7', 'x'] {
        let result = marshaller.invoke(
            &isdigit,
            &NativeType::Bool,
            &[Value::I32(c as i32)],
            Some(&mapper),
        )?;
        println!("isdigit('{}') -> {:?}", c, result.as_bool());
    }

    Ok(())
}
