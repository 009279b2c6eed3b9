//! Bounds-checked windows onto native memory
//!
//! A [`MemoryView`] is either carved out of a [`NativeBuffer`] (it then keeps
//! the block alive and knows its size) or wraps an external address handed
//! out by native code. External views are trusted: they are unbounded unless
//! a size was supplied when they were created. Turning an address read out
//! of memory back into a view is `unsafe` for the same reason creating an
//! external view is.
//!
//! [`NativeBuffer`]: crate::memory::NativeBuffer

use crate::error::{FfiError, FfiResult};
use crate::memory::buffer::Allocation;
use crate::memory::strings::{self, NarrowEncoding, StringFlavor};
use std::fmt;
use std::mem::size_of;
use std::ptr;
use std::rc::Rc;

/// Size of a native pointer slot
pub const POINTER_SIZE: usize = size_of::<usize>();

#[derive(Clone)]
enum Backing {
    Owned {
        allocation: Rc<Allocation>,
        offset: usize,
    },
    External {
        address: usize,
    },
}

/// A window onto native memory
#[derive(Clone)]
pub struct MemoryView {
    backing: Backing,
    size: Option<usize>,
}

macro_rules! scalar_accessors {
    ($($read:ident, $write:ident => $t:ty;)*) => {
        $(
            pub fn $read(&self, offset: usize) -> FfiResult<$t> {
                let p = self.checked(offset, size_of::<$t>())?;
                Ok(unsafe { ptr::read_unaligned(p as *const $t) })
            }

            pub fn $write(&self, offset: usize, value: $t) -> FfiResult<()> {
                let p = self.checked(offset, size_of::<$t>())?;
                unsafe { ptr::write_unaligned(p as *mut $t, value) };
                Ok(())
            }
        )*
    };
}

impl MemoryView {
    pub(crate) fn owned(allocation: Rc<Allocation>, offset: usize, size: usize) -> Self {
        Self {
            backing: Backing::Owned { allocation, offset },
            size: Some(size),
        }
    }

    /// Wrap memory owned by someone else. Returns `None` for the null address.
    ///
    /// # Safety
    ///
    /// `address` must stay valid for every access made through the view.
    pub unsafe fn external(address: usize) -> Option<Self> {
        Self::external_unchecked(address, None)
    }

    /// Wrap `size` bytes of memory owned by someone else.
    ///
    /// # Safety
    ///
    /// `[address, address + size)` must stay valid for every access made
    /// through the view.
    pub unsafe fn external_sized(address: usize, size: usize) -> Option<Self> {
        Self::external_unchecked(address, Some(size))
    }

    pub(crate) fn external_unchecked(address: usize, size: Option<usize>) -> Option<Self> {
        if address == 0 {
            return None;
        }
        Some(Self {
            backing: Backing::External { address },
            size,
        })
    }

    /// Native address of offset 0.
    pub fn address(&self) -> usize {
        match &self.backing {
            Backing::Owned { allocation, offset } => allocation.address() + offset,
            Backing::External { address } => *address,
        }
    }

    /// Size of the window, `None` for unbounded external memory.
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// True when the view does not own (or keep alive) its memory.
    pub fn is_external(&self) -> bool {
        matches!(self.backing, Backing::External { .. })
    }

    /// True when both views are windows onto the same owned block.
    pub fn shares_allocation(&self, other: &MemoryView) -> bool {
        match (&self.backing, &other.backing) {
            (Backing::Owned { allocation: a, .. }, Backing::Owned { allocation: b, .. }) => {
                Rc::ptr_eq(a, b)
            }
            _ => false,
        }
    }

    fn base(&self) -> FfiResult<*mut u8> {
        match &self.backing {
            Backing::Owned { allocation, offset } => {
                Ok(unsafe { allocation.base()?.add(*offset) })
            }
            Backing::External { address } => Ok(*address as *mut u8),
        }
    }

    /// Pointer to `len` bytes at `offset`, after the bounds and liveness checks.
    fn checked(&self, offset: usize, len: usize) -> FfiResult<*mut u8> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| FfiError::bounds(offset, len, self.size.unwrap_or(usize::MAX)))?;
        if let Some(limit) = self.size {
            if end > limit {
                return Err(FfiError::bounds(offset, len, limit));
            }
        }
        let base = self.base()?;
        Ok(unsafe { base.add(offset) })
    }

    /// A sub-window of `size` bytes at `offset`.
    pub fn share(&self, offset: usize, size: usize) -> FfiResult<MemoryView> {
        let end = offset.checked_add(size);
        match (end, self.size) {
            (None, _) => {
                return Err(FfiError::invalid_argument(format!(
                    "share of {} bytes at offset {} overflows",
                    size, offset
                )))
            }
            (Some(end), Some(limit)) if end > limit => {
                return Err(FfiError::invalid_argument(format!(
                    "share of {} bytes at offset {} exceeds view size {}",
                    size, offset, limit
                )))
            }
            _ => {}
        }
        Ok(self.rebased(offset, Some(size)))
    }

    /// A sub-window from `offset` to the end of this view.
    pub fn share_from(&self, offset: usize) -> FfiResult<MemoryView> {
        match self.size {
            Some(limit) if offset > limit => Err(FfiError::invalid_argument(format!(
                "share offset {} exceeds view size {}",
                offset, limit
            ))),
            Some(limit) => Ok(self.rebased(offset, Some(limit - offset))),
            None => Ok(self.rebased(offset, None)),
        }
    }

    fn rebased(&self, delta: usize, size: Option<usize>) -> MemoryView {
        let backing = match &self.backing {
            Backing::Owned { allocation, offset } => Backing::Owned {
                allocation: Rc::clone(allocation),
                offset: offset + delta,
            },
            Backing::External { address } => Backing::External {
                address: address + delta,
            },
        };
        MemoryView { backing, size }
    }

    /// A view whose address is a multiple of `boundary`.
    ///
    /// An already aligned view is returned unchanged.
    pub fn align(&self, boundary: usize) -> FfiResult<MemoryView> {
        if boundary == 0 || !boundary.is_power_of_two() {
            return Err(FfiError::invalid_argument(format!(
                "Byte boundary must be a positive power of two, got {}",
                boundary
            )));
        }

        let address = self.address();
        let delta = (boundary - address % boundary) % boundary;
        if delta == 0 {
            return Ok(self.clone());
        }

        match self.size {
            Some(limit) if delta >= limit => Err(FfiError::invalid_argument(format!(
                "Insufficient memory to align to {} byte boundary",
                boundary
            ))),
            Some(limit) => Ok(self.rebased(delta, Some(limit - delta))),
            None => Ok(self.rebased(delta, None)),
        }
    }

    scalar_accessors! {
        read_i8, write_i8 => i8;
        read_i16, write_i16 => i16;
        read_i32, write_i32 => i32;
        read_i64, write_i64 => i64;
        read_f32, write_f32 => f32;
        read_f64, write_f64 => f64;
        read_address, write_address => usize;
    }

    /// Follow a pointer slot; a null slot reads as `None`.
    ///
    /// Use [`read_address`](Self::read_address) to look at the slot without
    /// following it.
    ///
    /// # Safety
    ///
    /// The slot must hold null or an address that stays valid for every
    /// access made through the returned view. Nothing ties the returned view
    /// to the block the address came from, so it does not go stale when that
    /// block is disposed.
    pub unsafe fn read_pointer(&self, offset: usize) -> FfiResult<Option<MemoryView>> {
        let address = self.read_address(offset)?;
        Ok(MemoryView::external_unchecked(address, None))
    }

    /// Write a pointer slot; `None` writes null.
    pub fn write_pointer(&self, offset: usize, value: Option<&MemoryView>) -> FfiResult<()> {
        self.write_address(offset, value.map_or(0, MemoryView::address))
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> FfiResult<Vec<u8>> {
        let p = self.checked(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe { ptr::copy_nonoverlapping(p, out.as_mut_ptr(), len) };
        Ok(out)
    }

    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> FfiResult<()> {
        let p = self.checked(offset, bytes.len())?;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len()) };
        Ok(())
    }

    /// Zero the whole window. Unbounded views cannot be cleared.
    pub fn clear(&self) -> FfiResult<()> {
        let size = self
            .size
            .ok_or_else(|| FfiError::invalid_argument("cannot clear unbounded memory"))?;
        let p = self.checked(0, size)?;
        unsafe { ptr::write_bytes(p, 0, size) };
        Ok(())
    }

    /// Read a NUL-terminated string starting at `offset`.
    ///
    /// A bounded view without a terminator inside the window is a bounds error.
    pub fn read_string(
        &self,
        offset: usize,
        flavor: StringFlavor,
        encoding: NarrowEncoding,
    ) -> FfiResult<String> {
        let unit = flavor.unit_size();
        let mut len = 0usize;
        loop {
            let p = self.checked(offset + len, unit)?;
            let bytes = unsafe { std::slice::from_raw_parts(p, unit) };
            if bytes.iter().all(|&b| b == 0) {
                break;
            }
            len += unit;
        }
        let body = self.read_bytes(offset, len)?;
        Ok(match flavor {
            StringFlavor::Narrow => strings::decode_narrow(&body, encoding),
            StringFlavor::Wide => strings::decode_wide(&body),
        })
    }

    /// Write `value` with its terminator at `offset`.
    pub fn write_string(
        &self,
        offset: usize,
        value: &str,
        flavor: StringFlavor,
        encoding: NarrowEncoding,
    ) -> FfiResult<()> {
        self.write_bytes(offset, &strings::encode(value, flavor, encoding))
    }

    /// Read pointer slots from `offset` up to (not including) the first null.
    pub fn read_address_array(&self, offset: usize) -> FfiResult<Vec<usize>> {
        let mut out = Vec::new();
        let mut slot = offset;
        loop {
            let address = self.read_address(slot)?;
            if address == 0 {
                return Ok(out);
            }
            out.push(address);
            slot += POINTER_SIZE;
        }
    }

    /// Read the strings referenced by a null-terminated pointer array.
    ///
    /// # Safety
    ///
    /// Every slot before the terminator must point at a readable
    /// NUL-terminated string.
    pub unsafe fn read_string_array(
        &self,
        offset: usize,
        flavor: StringFlavor,
        encoding: NarrowEncoding,
    ) -> FfiResult<Vec<String>> {
        self.read_address_array(offset)?
            .into_iter()
            .map(|address| {
                // Non-null by construction of read_address_array.
                let view = MemoryView::external_unchecked(address, None)
                    .ok_or_else(|| FfiError::invalid_argument("null string slot"))?;
                view.read_string(0, flavor, encoding)
            })
            .collect()
    }
}

impl PartialEq for MemoryView {
    fn eq(&self, other: &Self) -> bool {
        let same_backing = match (&self.backing, &other.backing) {
            (Backing::External { .. }, Backing::External { .. }) => true,
            _ => self.shares_allocation(other),
        };
        same_backing && self.address() == other.address() && self.size == other.size
    }
}

impl fmt::Debug for MemoryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.backing, self.size) {
            (Backing::Owned { .. }, Some(size)) => {
                write!(f, "allocated@0x{:x} ({} bytes)", self.address(), size)
            }
            (_, Some(size)) => write!(f, "native@0x{:x} ({} bytes)", self.address(), size),
            (_, None) => write!(f, "native@0x{:x}", self.address()),
        }
    }
}
