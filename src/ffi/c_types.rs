//! Native scalar representations, their sizes and alignment

use libffi::middle::Type as FfiType;
use std::mem::{align_of, size_of};
use std::os::raw::c_long;

/// The scalar categories native code can receive or return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Pointer,
}

impl CType {
    /// Signed integer type of the given byte width.
    pub fn integer(size: usize) -> Option<CType> {
        match size {
            1 => Some(CType::I8),
            2 => Some(CType::I16),
            4 => Some(CType::I32),
            8 => Some(CType::I64),
            _ => None,
        }
    }

    pub fn size(self) -> usize {
        match self {
            CType::I8 => 1,
            CType::I16 => 2,
            CType::I32 => 4,
            CType::I64 => 8,
            CType::F32 => 4,
            CType::F64 => 8,
            CType::Pointer => size_of::<*const ()>(),
        }
    }

    /// Natural alignment on the target, as the C compiler lays it out.
    pub fn alignment(self) -> usize {
        match self {
            CType::I8 => align_of::<i8>(),
            CType::I16 => align_of::<i16>(),
            CType::I32 => align_of::<i32>(),
            CType::I64 => align_of::<i64>(),
            CType::F32 => align_of::<f32>(),
            CType::F64 => align_of::<f64>(),
            CType::Pointer => align_of::<*const ()>(),
        }
    }

    pub fn to_ffi_type(self) -> FfiType {
        match self {
            CType::I8 => FfiType::i8(),
            CType::I16 => FfiType::i16(),
            CType::I32 => FfiType::i32(),
            CType::I64 => FfiType::i64(),
            CType::F32 => FfiType::f32(),
            CType::F64 => FfiType::f64(),
            CType::Pointer => FfiType::pointer(),
        }
    }
}

/// Width of the platform C `long`
pub fn c_long_size() -> usize {
    size_of::<c_long>()
}

/// Round `offset` up to a multiple of `alignment`.
pub fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) / alignment * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_sizes() {
        assert_eq!(CType::I8.size(), 1);
        assert_eq!(CType::I32.size(), 4);
        assert_eq!(CType::F64.size(), 8);
        assert_eq!(CType::Pointer.size(), size_of::<usize>());
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(CType::integer(2), Some(CType::I16));
        assert_eq!(CType::integer(3), None);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(12, 8), 16);
    }
}
