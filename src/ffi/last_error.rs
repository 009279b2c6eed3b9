//! Per-thread platform error state (`errno`, `GetLastError`)

#[cfg(any(target_os = "linux", target_os = "android", target_os = "emscripten"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno()
}

/// The calling thread's last error code.
#[cfg(unix)]
pub fn get() -> i32 {
    unsafe { *errno_location() }
}

/// Overwrite the calling thread's last error code.
#[cfg(unix)]
pub fn set(code: i32) {
    unsafe { *errno_location() = code }
}

#[cfg(windows)]
pub fn get() -> i32 {
    unsafe { winapi::um::errhandlingapi::GetLastError() as i32 }
}

#[cfg(windows)]
pub fn set(code: i32) {
    unsafe { winapi::um::errhandlingapi::SetLastError(code as winapi::shared::minwindef::DWORD) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        set(17);
        assert_eq!(get(), 17);
        set(0);
        assert_eq!(get(), 0);
    }
}
